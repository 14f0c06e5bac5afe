//! # ioservice
//!
//! Package-oriented request/response transport over TCP.
//!
//! Endpoints exchange [`Package`]s: a typed header plus ordered, typed
//! buffers. Every send returns a [`SendJob`] that tracks delivery and,
//! separately, the correlated response.
//!
//! ## Architecture
//!
//! - **Endpoints**: [`IoClient`] keeps one connection, [`IoServer`] accepts
//!   many and tracks each by [`SenderHandle`]
//! - **Proxy relay**: [`ProxyRelay`] joins servers and clients that cannot
//!   reach each other directly
//! - **Hand-off**: a live client connection can be detached from one server
//!   and attached to another, in this process or in a child process
//!   ([`DetachedClient`], [`transport::bootstrap`])
//!
//! ## Example
//!
//! ```ignore
//! use ioservice::{ClientBuilder, Package, ResponseResult, ServerBuilder, ServerEvent, State};
//!
//! #[tokio::main]
//! async fn main() -> ioservice::Result<()> {
//!     let (server, mut server_events) = ServerBuilder::new()
//!         .listen_on("127.0.0.1:0".parse().unwrap())
//!         .build();
//!     let addr = server.listen().await?;
//!
//!     let (client, _client_events) = ClientBuilder::new().direct(addr).build()?;
//!     client.connect(None).await?;
//!
//!     let job = client.send_package(Package::create_instance(100, 0));
//!     while let Some(event) = server_events.recv().await {
//!         if let ServerEvent::PackageReceived { handle, package } = event {
//!             server.send_package(&handle, Package::create_response(101, 0, &package));
//!             break;
//!         }
//!     }
//!     assert_eq!(job.wait_for_response(None).await, ResponseResult::Success);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod protocol;
pub mod routing;
pub mod sender;
pub mod transport;

mod backpressure;
mod client;
mod connection;
mod control;
mod proxy;
mod server;
mod writer;

pub use client::{ClientBuilder, IoClient};
pub use config::{EndpointConfig, SendRetryPolicy};
pub use error::{IoServiceError, Result};
pub use events::{ClientEvent, ServerEvent};
pub use job::{Response, ResponseResult, SendJob, SendResult};
pub use protocol::{Encoding, Package};
pub use proxy::{ProxyConfig, ProxyRelay};
pub use routing::{Route, RouteKind, RoutingTable};
pub use sender::{ConnectionMode, SenderHandle, SenderType, State};
pub use server::{IoServer, ServerBuilder};
pub use transport::DetachedClient;
