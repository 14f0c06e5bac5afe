//! Client builder and endpoint.
//!
//! The [`ClientBuilder`] configures identity, routing and transport; the
//! [`IoClient`] manages one logical connection:
//! 1. Open the socket (direct, through a proxy relay, or a handed-over one)
//! 2. Handshake: send `Hello`, receive the assigned sender handle
//! 3. Spawn the link and report packages through [`ClientEvent`]s
//!
//! # Example
//!
//! ```ignore
//! use ioservice::{ClientBuilder, Package, ResponseResult, State};
//!
//! #[tokio::main]
//! async fn main() -> ioservice::Result<()> {
//!     let (client, mut events) = ClientBuilder::new()
//!         .direct("127.0.0.1:4000".parse().unwrap())
//!         .build()?;
//!
//!     client.connect_client(None)?;
//!     assert_eq!(client.wait_for_connection(None).await, State::Connected);
//!
//!     let job = client.send_package(Package::create_instance(100, 0));
//!     if job.wait_for_response(None).await == ResponseResult::Success {
//!         let response = job.take_response();
//!     }
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::{EndpointConfig, SendRetryPolicy};
use crate::connection::{Link, LinkInput, LinkSetup, PeerInfo};
use crate::control::{
    control_package, parse_control, read_package, write_package, Hello, HelloAck, ProxyHello,
    ProxyHelloAck, ProxyRole,
};
use crate::error::{IoServiceError, Result};
use crate::events::ClientEvent;
use crate::job::{submit_with_retry, SendJob};
use crate::protocol::{mng, FrameBuffer, Package};
use crate::routing::RoutingTable;
use crate::sender::{ConnectionMode, SenderHandle, SenderType, State};
use crate::transport::{into_tokio, DetachedClient};

enum Target {
    Mode(ConnectionMode),
    /// Handed over by a parent process; usable for one connection.
    Socket(Option<std::net::TcpStream>),
}

/// Builder for configuring and creating an [`IoClient`].
pub struct ClientBuilder {
    sender_type: SenderType,
    routing_table: RoutingTable,
    resume_handle: Option<SenderHandle>,
    config: EndpointConfig,
    target: Option<Target>,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            sender_type: SenderType::IoClient,
            routing_table: RoutingTable::default(),
            resume_handle: None,
            config: EndpointConfig::default(),
            target: None,
        }
    }

    /// Sender type announced in the handshake.
    ///
    /// Default: `IoClient`
    pub fn sender_type(mut self, sender_type: SenderType) -> Self {
        self.sender_type = sender_type;
        self
    }

    /// Routing table proposed to the server.
    pub fn routing_table(mut self, table: RoutingTable) -> Self {
        self.routing_table = table;
        self
    }

    /// Ask the server to keep an identity from an earlier session.
    pub fn resume_handle(mut self, handle: SenderHandle) -> Self {
        self.resume_handle = Some(handle);
        self
    }

    /// Replace the whole endpoint configuration.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum queued packages.
    ///
    /// Default: 1024
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the heartbeat interval; `None` disables heartbeats.
    ///
    /// Default: 5 seconds
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Default: 30 seconds
    pub fn peer_timeout(mut self, timeout: Duration) -> Self {
        self.config.peer_timeout = timeout;
        self
    }

    /// Default: 30 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Default: 10 seconds
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: SendRetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the event channel capacity.
    ///
    /// Default: 256
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Connect straight to a listening server.
    pub fn direct(mut self, addr: SocketAddr) -> Self {
        self.target = Some(Target::Mode(ConnectionMode::Direct(addr)));
        self
    }

    /// Connect through a proxy relay to the server registered as `routing_uuid`.
    pub fn via_proxy(mut self, relay: SocketAddr, routing_uuid: Uuid) -> Self {
        self.target = Some(Target::Mode(ConnectionMode::Proxy {
            relay,
            routing_uuid,
        }));
        self
    }

    /// Use a socket handed over by a parent process.
    pub fn from_socket(mut self, socket: std::net::TcpStream) -> Self {
        self.target = Some(Target::Socket(Some(socket)));
        self
    }

    /// Use the socket of a bundle made by
    /// [`IoServer::create_detached_client_socket`](crate::IoServer::create_detached_client_socket).
    pub fn from_detached(self, detached: &DetachedClient) -> Result<Self> {
        let socket = detached.take_bootstrap_socket()?;
        Ok(self.from_socket(socket))
    }

    /// Build the client and its event receiver. Nothing connects yet.
    pub fn build(self) -> Result<(IoClient, mpsc::Receiver<ClientEvent>)> {
        let target = self
            .target
            .ok_or(IoServiceError::InvalidState("no connection target configured"))?;
        let (events, events_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let (state, _) = watch::channel(State::Disconnected);

        let inner = Arc::new(ClientInner {
            sender_type: self.sender_type,
            routing_table: self.routing_table,
            config: self.config,
            target: Mutex::new(target),
            resume_handle: Mutex::new(self.resume_handle),
            events,
            state,
            session: Mutex::new(None),
        });

        Ok((IoClient { inner }, events_rx))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What the server told us during the handshake.
struct ClientSession {
    link: Arc<Link>,
    handle: SenderHandle,
    server_uuid: Uuid,
    server_type: SenderType,
    routing_table: RoutingTable,
}

struct ClientInner {
    sender_type: SenderType,
    routing_table: RoutingTable,
    config: EndpointConfig,
    target: Mutex<Target>,
    resume_handle: Mutex<Option<SenderHandle>>,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<State>,
    session: Mutex<Option<ClientSession>>,
}

/// One logical connection to a server.
///
/// Dropping the client closes the connection without a `Disconnected` event.
pub struct IoClient {
    inner: Arc<ClientInner>,
}

impl IoClient {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Start connecting in the background.
    ///
    /// `timeout` bounds the whole attempt, handshake included. Use
    /// [`IoClient::wait_for_connection`] to learn the outcome.
    pub fn connect_client(&self, timeout: Option<Duration>) -> Result<()> {
        self.begin_connect()?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.establish(timeout).await {
                tracing::warn!("Connection attempt failed: {}", e);
                inner.state.send_replace(State::Disconnected);
            }
        });
        Ok(())
    }

    /// Connect and wait for the outcome, reporting why it failed.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<SenderHandle> {
        self.begin_connect()?;
        match self.inner.establish(timeout).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.inner.state.send_replace(State::Disconnected);
                Err(e)
            }
        }
    }

    fn begin_connect(&self) -> Result<()> {
        let mut refused = None;
        self.inner.state.send_if_modified(|state| match state {
            State::Disconnected => {
                *state = State::Connecting;
                true
            }
            State::Connecting => {
                refused = Some("connection attempt already running");
                false
            }
            State::Connected => {
                refused = Some("client is already connected");
                false
            }
        });
        match refused {
            Some(reason) => Err(IoServiceError::InvalidState(reason)),
            None => Ok(()),
        }
    }

    /// Wait until a connection attempt finishes.
    ///
    /// Returns the state when the timeout elapses, which may still be
    /// `Connecting`.
    pub async fn wait_for_connection(&self, timeout: Option<Duration>) -> State {
        let mut rx = self.inner.state.subscribe();
        let wait = rx.wait_for(|s| *s != State::Connecting);
        let outcome = match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.ok(),
            None => Some(wait.await),
        };
        match outcome {
            Some(Ok(state)) => *state,
            _ => self.state(),
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    /// Handle assigned by the server. `None` before the first connection.
    pub fn sender_handle(&self) -> Option<SenderHandle> {
        self.inner.lock_session().as_ref().map(|s| s.handle.clone())
    }

    /// Sender type the server announced.
    pub fn server_sender_type(&self) -> Option<SenderType> {
        self.inner.lock_session().as_ref().map(|s| s.server_type)
    }

    /// Endpoint uuid the server stamps into its packages.
    pub fn server_uuid(&self) -> Option<Uuid> {
        self.inner.lock_session().as_ref().map(|s| s.server_uuid)
    }

    /// Routing table negotiated with the server.
    pub fn routing_table(&self) -> Option<RoutingTable> {
        self.inner
            .lock_session()
            .as_ref()
            .map(|s| s.routing_table.clone())
    }

    /// Queue a package for the server. Never waits.
    ///
    /// Without a connection the returned job already reads `Fail`.
    pub fn send_package(&self, package: Package) -> SendJob {
        self.inner.submit(package)
    }

    /// Queue a package, resubmitting while the queue is full.
    pub async fn send_package_with_retry(&self, package: Package) -> SendJob {
        let policy = self.inner.config.retry;
        submit_with_retry(package, policy, |p| self.inner.submit(p)).await
    }

    /// Close the connection. Outstanding jobs fail.
    pub async fn disconnect_client(&self) {
        let session = self.inner.lock_session().take();
        if let Some(session) = session {
            session.link.close().await;
            tracing::debug!("Client {} disconnected", session.handle);
            let _ = self.inner.events.send(ClientEvent::Disconnected).await;
        }
        self.inner.state.send_replace(State::Disconnected);
    }
}

impl ClientInner {
    fn lock_session(&self) -> MutexGuard<'_, Option<ClientSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, package: Package) -> SendJob {
        let link = self.lock_session().as_ref().map(|s| s.link.clone());
        match link {
            Some(link) => link.submit(package),
            None => SendJob::failed(Arc::new(package)),
        }
    }

    async fn establish(self: &Arc<Self>, timeout: Option<Duration>) -> Result<SenderHandle> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.open_session())
                .await
                .map_err(|_| IoServiceError::Timeout("connect"))?,
            None => self.open_session().await,
        }
    }

    async fn open_session(self: &Arc<Self>) -> Result<SenderHandle> {
        let mut decoder = FrameBuffer::with_max_payload(self.config.max_package_size);
        let mut stream = self.open_stream(&mut decoder).await?;

        let hello = Hello {
            sender_type: self.sender_type,
            routing_table: self.routing_table.clone(),
            process_id: std::process::id(),
            resume_handle: self
                .resume_handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        let ack: HelloAck = tokio::time::timeout(self.config.handshake_timeout, async {
            write_package(&mut stream, &control_package(mng::HANDSHAKE, &hello)?).await?;
            let reply = read_package(&mut stream, &mut decoder).await?;
            parse_control::<HelloAck>(&reply, mng::HANDSHAKE_ACK)
        })
        .await
        .map_err(|_| IoServiceError::Timeout("handshake"))??;

        if !ack.accepted {
            return Err(IoServiceError::HandshakeRejected(
                ack.reason.unwrap_or_else(|| "no reason given".into()),
            ));
        }
        let handle = ack
            .sender_handle
            .ok_or_else(|| IoServiceError::Protocol("handshake ack without a handle".into()))?;
        let routing_table = ack
            .routing_table
            .unwrap_or_else(|| self.routing_table.clone());

        let (inbox, inbox_rx) = mpsc::channel(self.config.event_capacity.max(1));
        let link = Link::spawn(
            stream,
            decoder,
            LinkSetup {
                handle: handle.clone(),
                local_uuid: handle.as_uuid().unwrap_or_default(),
                peer: PeerInfo {
                    sender_type: ack.server_sender_type,
                    process_id: ack.server_process_id,
                    routing_table: routing_table.clone(),
                },
                greeting: Some(LinkInput::Opened {
                    handle: handle.clone(),
                    sender_type: ack.server_sender_type,
                }),
            },
            &self.config,
            inbox,
        );
        tokio::spawn(dispatch(Arc::downgrade(self), inbox_rx, self.events.clone()));

        *self.lock_session() = Some(ClientSession {
            link: link.clone(),
            handle: handle.clone(),
            server_uuid: ack.server_uuid,
            server_type: ack.server_sender_type,
            routing_table,
        });
        *self
            .resume_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        self.state.send_replace(State::Connected);
        link.start();

        tracing::debug!("Connected as {}", handle);
        Ok(handle)
    }

    /// Socket to handshake on. Proxy mode also completes the relay exchange.
    async fn open_stream(&self, decoder: &mut FrameBuffer) -> Result<TcpStream> {
        let mode = {
            let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *target {
                Target::Mode(mode) => *mode,
                Target::Socket(socket) => {
                    let socket = socket.take().ok_or(IoServiceError::InvalidState(
                        "handed-over socket was already used",
                    ))?;
                    return into_tokio(socket);
                }
            }
        };

        match mode {
            ConnectionMode::Direct(addr) => self.dial(addr).await,
            ConnectionMode::Proxy {
                relay,
                routing_uuid,
            } => {
                let mut stream = self.dial(relay).await?;
                let hello = ProxyHello {
                    role: ProxyRole::Client,
                    routing_uuid,
                    session: None,
                };
                write_package(&mut stream, &control_package(mng::PROXY_HELLO, &hello)?).await?;
                let reply = read_package(&mut stream, decoder).await?;
                let ack: ProxyHelloAck = parse_control(&reply, mng::PROXY_HELLO_ACK)?;
                if !ack.accepted {
                    return Err(IoServiceError::HandshakeRejected(
                        ack.reason.unwrap_or_else(|| "proxy refused".into()),
                    ));
                }
                Ok(stream)
            }
        }
    }

    async fn dial(&self, addr: SocketAddr) -> Result<TcpStream> {
        tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| IoServiceError::Timeout("tcp connect"))?
            .map_err(Into::into)
    }

    /// The link of `link_id` died on its own.
    async fn link_closed(&self, link_id: u64) {
        let session = {
            let mut session = self.lock_session();
            match &*session {
                Some(s) if s.link.id() == link_id => session.take(),
                _ => None,
            }
        };
        if let Some(session) = session {
            tracing::debug!("Client {} lost its connection", session.handle);
            session.link.close().await;
            self.state.send_replace(State::Disconnected);
            let _ = self.events.send(ClientEvent::Disconnected).await;
        }
    }
}

/// Turn link inputs into client events.
async fn dispatch(
    inner: Weak<ClientInner>,
    mut inbox: mpsc::Receiver<LinkInput>,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(input) = inbox.recv().await {
        let event = match input {
            LinkInput::Opened { handle, .. } => ClientEvent::Connected { handle },
            LinkInput::Package { package, .. } => ClientEvent::PackageReceived { package },
            LinkInput::Response {
                job_uuid, package, ..
            } => ClientEvent::ResponsePackageReceived { job_uuid, package },
            LinkInput::DetachedClient { package, .. } => match import_detached(&package) {
                Ok(detached) => ClientEvent::DetachedClientReceived {
                    package,
                    detached: Arc::new(detached),
                },
                Err(e) => {
                    tracing::warn!("Dropping unusable detached client: {}", e);
                    continue;
                }
            },
            LinkInput::Closed { link_id, .. } => {
                if let Some(inner) = inner.upgrade() {
                    inner.link_closed(link_id).await;
                }
                continue;
            }
            LinkInput::Attached { .. }
            | LinkInput::Detached { .. }
            | LinkInput::Disconnected { .. } => continue,
        };
        // Receiver dropped: events are discarded
        let _ = events.send(event).await;
    }
}

/// Rebuild the bundle carried by a `DetachedClient` management package.
pub(crate) fn import_detached(package: &Package) -> Result<DetachedClient> {
    let buffer = package.get_buffer(0)?;
    DetachedClient::import(&buffer.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_target() {
        assert!(matches!(
            ClientBuilder::new().build(),
            Err(IoServiceError::InvalidState(_))
        ));
    }

    #[test]
    fn test_builder_configuration() {
        let builder = IoClient::builder()
            .sender_type(SenderType::Vm)
            .queue_capacity(8)
            .heartbeat_interval(None)
            .event_capacity(4)
            .retry_policy(SendRetryPolicy {
                max_attempts: 3,
                interval: Duration::from_millis(5),
            });

        assert_eq!(builder.sender_type, SenderType::Vm);
        assert_eq!(builder.config.queue_capacity, 8);
        assert_eq!(builder.config.heartbeat_interval, None);
        assert_eq!(builder.config.event_capacity, 4);
        assert_eq!(builder.config.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (client, _events) = ClientBuilder::new()
            .direct("127.0.0.1:9".parse().unwrap())
            .build()
            .unwrap();

        assert_eq!(client.state(), State::Disconnected);
        assert!(client.sender_handle().is_none());

        let job = client.send_package(Package::create_instance(1, 0));
        assert_eq!(job.send_result(), crate::job::SendResult::Fail);
    }

    #[tokio::test]
    async fn test_connect_refused_collapses_to_disconnected() {
        // Bind and drop to get a port nobody listens on
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (client, _events) = ClientBuilder::new().direct(addr).build().unwrap();

        client.connect_client(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(
            client.wait_for_connection(Some(Duration::from_secs(5))).await,
            State::Disconnected
        );
    }

    #[tokio::test]
    async fn test_handed_over_socket_is_used_once() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (client, _events) = ClientBuilder::new()
            .from_socket(socket)
            .handshake_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        // Nobody answers the handshake on the accepting side
        assert!(matches!(
            client.connect(None).await,
            Err(IoServiceError::Timeout(_))
        ));
        assert!(matches!(
            client.connect(None).await,
            Err(IoServiceError::InvalidState(_))
        ));
    }
}
