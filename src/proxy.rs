//! Proxy relay for servers that clients cannot reach directly.
//!
//! Both sides dial the relay. A server keeps one control link per routing
//! uuid; for each client the relay asks that server for a fresh data link
//! and splices the two sockets together.
//!
//! ```text
//! server ──ServerControl──► relay ◄──Client── client
//!        ◄─ConnectRequest──         (waits for the data link)
//! server ──ServerData(session)──► relay ══ copy_bidirectional ══ client
//! ```
//!
//! Above the transport nothing changes: the handshake and every package
//! pass through untouched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::control::{
    control_package, parse_control, read_package, write_package, ProxyConnectRequest, ProxyHello,
    ProxyHelloAck, ProxyRole,
};
use crate::error::{IoServiceError, Result};
use crate::protocol::{mng, FrameBuffer};

/// Default time a client waits for its server-data link.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay tuning.
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    /// Time allowed for the `ProxyHello` on a fresh link.
    pub hello_timeout: Duration,
    /// Time a client waits for the server to dial its data link.
    pub pair_timeout: Duration,
    /// Connect requests buffered per server control link.
    pub request_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hello_timeout: crate::config::DEFAULT_HANDSHAKE_TIMEOUT,
            pair_timeout: DEFAULT_PAIR_TIMEOUT,
            request_capacity: 64,
        }
    }
}

type DataLink = (TcpStream, BytesMut);

static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

/// A server control link, fed with connect requests.
struct Registration {
    id: u64,
    requests: mpsc::Sender<Uuid>,
}

struct RelayState {
    config: ProxyConfig,
    /// Control links by routing uuid.
    servers: Mutex<HashMap<Uuid, Registration>>,
    /// Clients waiting for their data link, by session.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<DataLink>>>,
}

impl RelayState {
    fn servers(&self) -> MutexGuard<'_, HashMap<Uuid, Registration>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<DataLink>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A running relay. Dropping it stops accepting links.
pub struct ProxyRelay {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    acceptor: JoinHandle<()>,
}

impl ProxyRelay {
    /// Bind with the default configuration.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with(addr, ProxyConfig::default()).await
    }

    pub async fn bind_with(addr: SocketAddr, config: ProxyConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(RelayState {
            config,
            servers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });
        let acceptor = tokio::spawn(accept_loop(listener, state.clone()));
        tracing::debug!("Proxy relay listening on {}", local_addr);
        Ok(Self {
            local_addr,
            state,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of registered server control links.
    pub fn count_servers(&self) -> usize {
        self.state.servers().len()
    }

    /// Stop accepting and close every control link.
    ///
    /// Relayed connections that are already spliced keep running.
    pub fn shutdown(&self) {
        self.acceptor.abort();
        self.state.servers().clear();
        self.state.pending().clear();
    }
}

impl Drop for ProxyRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<RelayState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_link(stream, &state).await {
                        tracing::debug!("Proxy link from {} ended: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Proxy accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_link(mut stream: TcpStream, state: &RelayState) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut decoder = FrameBuffer::new();
    let hello: ProxyHello = tokio::time::timeout(state.config.hello_timeout, async {
        let package = read_package(&mut stream, &mut decoder).await?;
        parse_control::<ProxyHello>(&package, mng::PROXY_HELLO)
    })
    .await
    .map_err(|_| IoServiceError::Timeout("proxy hello"))??;

    match hello.role {
        ProxyRole::ServerControl => serve_control(stream, state, hello.routing_uuid).await,
        ProxyRole::ServerData => {
            let session = hello
                .session
                .ok_or_else(|| IoServiceError::Protocol("data link without a session".into()))?;
            let waiter = state.pending().remove(&session);
            match waiter {
                Some(waiter) => {
                    // Client gave up in the meantime: the link is dropped
                    let _ = waiter.send((stream, decoder.take_remaining()));
                    Ok(())
                }
                None => {
                    tracing::debug!("Data link for unknown session {}", session);
                    Ok(())
                }
            }
        }
        ProxyRole::Client => relay_client(stream, decoder, state, hello.routing_uuid).await,
    }
}

async fn serve_control(stream: TcpStream, state: &RelayState, routing_uuid: Uuid) -> Result<()> {
    let (tx, mut requests) = mpsc::channel(state.config.request_capacity.max(1));
    let registration = NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed);
    let previous = state.servers().insert(
        routing_uuid,
        Registration {
            id: registration,
            requests: tx,
        },
    );
    if previous.is_some() {
        tracing::warn!("Server {} registered again, replacing its control link", routing_uuid);
    }

    let (mut reader, mut writer) = stream.into_split();
    write_package(
        &mut writer,
        &control_package(mng::PROXY_HELLO_ACK, &ProxyHelloAck::accepted())?,
    )
    .await?;
    tracing::debug!("Server {} registered at proxy", routing_uuid);

    // Ends when the server closes or the registration is dropped
    let result = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(session) = request else {
                    break Ok(());
                };
                let sent = match control_package(
                    mng::PROXY_CONNECT_REQUEST,
                    &ProxyConnectRequest { session },
                ) {
                    Ok(package) => write_package(&mut writer, &package).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    break Err(e);
                }
            }
            closed = wait_closed(&mut reader) => break closed,
        }
    };

    let mut servers = state.servers();
    if servers
        .get(&routing_uuid)
        .is_some_and(|current| current.id == registration)
    {
        servers.remove(&routing_uuid);
    }
    tracing::debug!("Server {} left the proxy", routing_uuid);
    result
}

/// Resolve once the peer closes. Stray bytes on a control link are ignored.
async fn wait_closed(reader: &mut OwnedReadHalf) -> Result<()> {
    let mut scratch = [0u8; 256];
    loop {
        if reader.read(&mut scratch).await? == 0 {
            return Ok(());
        }
    }
}

async fn relay_client(
    mut client: TcpStream,
    mut client_rest: FrameBuffer,
    state: &RelayState,
    routing_uuid: Uuid,
) -> Result<()> {
    let control = state
        .servers()
        .get(&routing_uuid)
        .map(|r| r.requests.clone());
    let Some(control) = control else {
        return refuse(&mut client, format!("no server registered as {}", routing_uuid)).await;
    };

    let session = Uuid::new_v4();
    let (tx, rx) = oneshot::channel();
    state.pending().insert(session, tx);

    if control.send(session).await.is_err() {
        state.pending().remove(&session);
        return refuse(&mut client, "server control link is gone".into()).await;
    }
    let (mut server, server_rest) = match tokio::time::timeout(state.config.pair_timeout, rx).await
    {
        Ok(Ok(data_link)) => data_link,
        _ => {
            state.pending().remove(&session);
            return refuse(&mut client, "server did not open a data link".into()).await;
        }
    };

    write_package(
        &mut client,
        &control_package(mng::PROXY_HELLO_ACK, &ProxyHelloAck::accepted())?,
    )
    .await?;
    let client_rest = client_rest.take_remaining();
    if !client_rest.is_empty() {
        server.write_all(&client_rest).await?;
    }
    if !server_rest.is_empty() {
        client.write_all(&server_rest).await?;
    }

    tracing::debug!("Relaying session {} to server {}", session, routing_uuid);
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut server).await?;
    tracing::debug!(
        "Session {} finished ({} bytes up, {} bytes down)",
        session,
        up,
        down
    );
    Ok(())
}

async fn refuse(client: &mut TcpStream, reason: String) -> Result<()> {
    tracing::debug!("Refusing proxy client: {}", reason);
    write_package(
        client,
        &control_package(mng::PROXY_HELLO_ACK, &ProxyHelloAck::refused(reason.clone()))?,
    )
    .await?;
    Err(IoServiceError::HandshakeRejected(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn hello(
        relay: SocketAddr,
        role: ProxyRole,
        routing_uuid: Uuid,
    ) -> (TcpStream, FrameBuffer) {
        let mut stream = TcpStream::connect(relay).await.unwrap();
        let hello = ProxyHello {
            role,
            routing_uuid,
            session: None,
        };
        write_package(
            &mut stream,
            &control_package(mng::PROXY_HELLO, &hello).unwrap(),
        )
        .await
        .unwrap();
        (stream, FrameBuffer::new())
    }

    async fn ack(stream: &mut TcpStream, decoder: &mut FrameBuffer) -> ProxyHelloAck {
        let package = read_package(stream, decoder).await.unwrap();
        parse_control(&package, mng::PROXY_HELLO_ACK).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_routing_uuid_is_refused() {
        let relay = ProxyRelay::bind(local()).await.unwrap();
        let (mut client, mut decoder) =
            hello(relay.local_addr(), ProxyRole::Client, Uuid::new_v4()).await;
        let reply = ack(&mut client, &mut decoder).await;
        assert!(!reply.accepted);
        assert!(reply.reason.unwrap().contains("no server"));
    }

    #[tokio::test]
    async fn test_control_link_registers_and_unregisters() {
        let relay = ProxyRelay::bind(local()).await.unwrap();
        let routing = Uuid::new_v4();
        let (mut control, mut decoder) =
            hello(relay.local_addr(), ProxyRole::ServerControl, routing).await;
        assert!(ack(&mut control, &mut decoder).await.accepted);
        assert_eq!(relay.count_servers(), 1);

        drop(control);
        for _ in 0..100 {
            if relay.count_servers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relay.count_servers(), 0);
    }

    #[tokio::test]
    async fn test_missing_data_link_times_out() {
        let config = ProxyConfig {
            pair_timeout: Duration::from_millis(50),
            ..ProxyConfig::default()
        };
        let relay = ProxyRelay::bind_with(local(), config).await.unwrap();
        let routing = Uuid::new_v4();
        let (mut control, mut control_decoder) =
            hello(relay.local_addr(), ProxyRole::ServerControl, routing).await;
        assert!(ack(&mut control, &mut control_decoder).await.accepted);

        let (mut client, mut decoder) = hello(relay.local_addr(), ProxyRole::Client, routing).await;

        // The server sees the request but never dials back
        let request = read_package(&mut control, &mut control_decoder).await.unwrap();
        let request: ProxyConnectRequest =
            parse_control(&request, mng::PROXY_CONNECT_REQUEST).unwrap();
        assert!(!request.session.is_nil());

        let reply = ack(&mut client, &mut decoder).await;
        assert!(!reply.accepted);
    }

    #[tokio::test]
    async fn test_sessions_are_spliced() {
        let relay = ProxyRelay::bind(local()).await.unwrap();
        let routing = Uuid::new_v4();
        let (mut control, mut control_decoder) =
            hello(relay.local_addr(), ProxyRole::ServerControl, routing).await;
        assert!(ack(&mut control, &mut control_decoder).await.accepted);

        let (mut client, mut decoder) = hello(relay.local_addr(), ProxyRole::Client, routing).await;
        let request = read_package(&mut control, &mut control_decoder).await.unwrap();
        let request: ProxyConnectRequest =
            parse_control(&request, mng::PROXY_CONNECT_REQUEST).unwrap();

        let mut data = TcpStream::connect(relay.local_addr()).await.unwrap();
        let data_hello = ProxyHello {
            role: ProxyRole::ServerData,
            routing_uuid: routing,
            session: Some(request.session),
        };
        write_package(
            &mut data,
            &control_package(mng::PROXY_HELLO, &data_hello).unwrap(),
        )
        .await
        .unwrap();

        assert!(ack(&mut client, &mut decoder).await.accepted);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        data.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        data.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
