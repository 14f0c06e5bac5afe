//! Hand a socket to a freshly spawned child process.
//!
//! The parent calls [`spawn_with_socket`] with a bundle from
//! [`IoServer::create_detached_client_socket`](crate::IoServer::create_detached_client_socket);
//! the child calls [`inherited_client_socket`] and builds its client on the
//! returned socket.
//!
//! - Unix: the descriptor is inherited, its number follows [`SOCKET_ARG`]
//! - Windows: the duplication ticket is written to the child's stdin and
//!   read in full before the child goes on

use std::process::{Child, Command};

use super::detached::DetachedClient;
use crate::error::{IoServiceError, Result};

/// Command line flag that precedes the inherited descriptor number.
pub const SOCKET_ARG: &str = "--ioservice-socket";

/// A child started by [`spawn_with_socket`].
#[derive(Debug)]
pub struct HandOff {
    pub child: Child,
    /// Parent copy of the socket where the platform needs it kept open.
    source: Option<std::net::TcpStream>,
}

impl HandOff {
    /// Close the parent copy once the child confirmed it took over.
    pub fn release_source(&mut self) {
        self.source.take();
    }
}

#[cfg(unix)]
pub fn spawn_with_socket(mut command: Command, detached: &DetachedClient) -> Result<HandOff> {
    use std::os::fd::AsRawFd;

    let socket = detached.take_bootstrap_socket()?;
    let fd = socket.as_raw_fd();
    super::handle::set_inheritable(fd)?;

    command.arg(SOCKET_ARG).arg(fd.to_string());
    let child = command.spawn()?;
    tracing::debug!("Spawned child {} with inherited socket {}", child.id(), fd);

    // The child holds its own copy now
    drop(socket);
    Ok(HandOff {
        child,
        source: None,
    })
}

#[cfg(windows)]
pub fn spawn_with_socket(mut command: Command, detached: &DetachedClient) -> Result<HandOff> {
    use super::handle::TransferableHandle;
    use std::io::Write;
    use std::process::Stdio;

    let socket = detached.take_bootstrap_socket()?;
    command.stdin(Stdio::piped());
    let mut child = command.spawn()?;

    let exported = socket.export_for(child.id())?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or(IoServiceError::InvalidState("child stdin is not piped"))?;
    stdin.write_all(&exported.ticket)?;
    stdin.flush()?;
    tracing::debug!("Spawned child {} with duplicated socket", child.id());

    Ok(HandOff {
        child,
        source: exported.source,
    })
}

/// Recover the socket handed over by [`spawn_with_socket`].
#[cfg(unix)]
pub fn inherited_client_socket() -> Result<std::net::TcpStream> {
    socket_from_args(std::env::args())
}

/// Recover the socket handed over by [`spawn_with_socket`].
#[cfg(windows)]
pub fn inherited_client_socket() -> Result<std::net::TcpStream> {
    use super::handle::{TransferableHandle, TICKET_SIZE};
    use std::io::Read;

    let mut ticket = vec![0u8; TICKET_SIZE];
    std::io::stdin().lock().read_exact(&mut ticket)?;
    std::net::TcpStream::import_ticket(&ticket)
}

/// Find [`SOCKET_ARG`] in `args` and reopen the descriptor after it.
#[cfg(unix)]
pub fn socket_from_args<I>(args: I) -> Result<std::net::TcpStream>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == SOCKET_ARG {
            let fd = args
                .next()
                .and_then(|value| value.trim().parse().ok())
                .ok_or_else(|| {
                    IoServiceError::InvalidBundle(format!("{} without a descriptor", SOCKET_ARG))
                })?;
            return super::handle::adopt_inherited(fd);
        }
    }
    Err(IoServiceError::InvalidBundle(format!(
        "no {} argument",
        SOCKET_ARG
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::detached::Session;
    use crate::routing::RoutingTable;
    use crate::sender::{SenderHandle, SenderType};
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::IntoRawFd;

    fn socket() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    #[test]
    fn test_socket_from_args() {
        let (a, _b) = socket();
        let fd = a.into_raw_fd();
        let args = vec![
            "child".to_string(),
            SOCKET_ARG.to_string(),
            fd.to_string(),
        ];
        assert!(socket_from_args(args).is_ok());
    }

    #[test]
    fn test_socket_from_args_missing() {
        assert!(socket_from_args(vec!["child".to_string()]).is_err());
        assert!(socket_from_args(vec![SOCKET_ARG.to_string()]).is_err());
        assert!(socket_from_args(vec![SOCKET_ARG.to_string(), "x".to_string()]).is_err());
    }

    #[test]
    fn test_spawn_refuses_established_session() {
        let (a, _b) = socket();
        let detached = DetachedClient::new(
            a,
            Some(Session {
                handle: SenderHandle::generate(),
                sender_type: SenderType::IoClient,
                process_id: 1,
                routing_table: RoutingTable::default(),
                pending: bytes::Bytes::new(),
                additional: None,
            }),
        );
        let result = spawn_with_socket(Command::new("true"), &detached);
        assert!(matches!(result, Err(IoServiceError::InvalidBundle(_))));
        assert!(!detached.is_consumed());
    }
}
