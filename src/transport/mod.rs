//! Transport module - moving live sockets between endpoints and processes.
//!
//! Provides:
//! - [`TransferableHandle`]: descriptor inheritance (Unix) or socket
//!   duplication (Windows)
//! - [`DetachedClient`]: a connection taken out of an endpoint, attachable once
//! - [`bootstrap`]: spawning a child process that owns a pre-made socket

pub mod bootstrap;
mod detached;
mod handle;

pub use detached::DetachedClient;
pub use handle::{ExportedHandle, TransferableHandle};

#[cfg(windows)]
pub use handle::TICKET_SIZE;

pub(crate) use detached::Session;

use std::net::Ipv4Addr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Two connected loopback sockets.
pub(crate) async fn loopback_pair() -> Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    let (connected, (accepted, _)) =
        tokio::try_join!(TcpStream::connect(addr), listener.accept())?;
    Ok((connected, accepted))
}

/// Turn a socket from a bundle back into a tokio stream.
pub(crate) fn into_tokio(socket: std::net::TcpStream) -> Result<TcpStream> {
    socket.set_nonblocking(true)?;
    Ok(TcpStream::from_std(socket)?)
}
