//! Server builder and endpoint.
//!
//! An [`IoServer`] accepts many clients, either on its own listening socket
//! or through data links it dials to a proxy relay. Every client gets a
//! [`SenderHandle`] during the handshake; all per-client operations take
//! that handle.
//!
//! # Hand-off
//!
//! ```text
//! server A: detach_client(h) ──► ServerEvent::ClientDetached { detached }
//!                                          │ (in process, or exported)
//! server B: attach_client(&detached) ◄─────┘  same handle, same socket
//! ```
//!
//! The remote client does not notice the move.
//!
//! # Example
//!
//! ```ignore
//! use ioservice::{ServerBuilder, ServerEvent};
//!
//! let (server, mut events) = ServerBuilder::new()
//!     .listen_on("127.0.0.1:4000".parse().unwrap())
//!     .build()?;
//! server.listen().await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ServerEvent::PackageReceived { handle, package } = event {
//!         let mut reply = Package::create_instance(101, 0);
//!         reply.make_direct_response(&package);
//!         server.send_package(&handle, reply);
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::import_detached;
use crate::config::{EndpointConfig, SendRetryPolicy};
use crate::connection::{Link, LinkInput, LinkSetup, PeerInfo};
use crate::control::{
    control_package, parse_control, read_package, write_package, Hello, HelloAck,
    ProxyConnectRequest, ProxyHello, ProxyHelloAck, ProxyRole,
};
use crate::error::{IoServiceError, Result};
use crate::events::ServerEvent;
use crate::job::{submit_with_retry, SendJob};
use crate::protocol::{mng, Encoding, FrameBuffer, Package};
use crate::routing::RoutingTable;
use crate::sender::{ConnectionMode, SenderHandle, SenderType, State};
use crate::transport::{into_tokio, loopback_pair, DetachedClient, Session};

/// Builder for configuring and creating an [`IoServer`].
pub struct ServerBuilder {
    sender_type: SenderType,
    routing_table: RoutingTable,
    accepted_types: Option<Vec<SenderType>>,
    config: EndpointConfig,
    mode: Option<ConnectionMode>,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            sender_type: SenderType::Dispatcher,
            routing_table: RoutingTable::default(),
            accepted_types: None,
            config: EndpointConfig::default(),
            mode: None,
        }
    }

    /// Sender type announced to clients.
    ///
    /// Default: `Dispatcher`
    pub fn sender_type(mut self, sender_type: SenderType) -> Self {
        self.sender_type = sender_type;
        self
    }

    /// Routing table every client table is negotiated against.
    pub fn routing_table(mut self, table: RoutingTable) -> Self {
        self.routing_table = table;
        self
    }

    /// Refuse clients whose sender type is not listed.
    pub fn accept_sender_types(mut self, types: impl IntoIterator<Item = SenderType>) -> Self {
        self.accepted_types = Some(types.into_iter().collect());
        self
    }

    /// Replace the whole endpoint configuration.
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum queued packages per client.
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

    /// Accept clients on `addr`. Port 0 picks a free port.
    pub fn listen_on(mut self, addr: SocketAddr) -> Self {
        self.mode = Some(ConnectionMode::Direct(addr));
        self
    }

    /// Register at a proxy relay under `routing_uuid` instead of listening.
    pub fn via_proxy(mut self, relay: SocketAddr, routing_uuid: Uuid) -> Self {
        self.mode = Some(ConnectionMode::Proxy {
            relay,
            routing_uuid,
        });
        self
    }

    /// Build the server and its event receiver.
    ///
    /// Must be called from within a Tokio runtime. Without `listen_on` or
    /// `via_proxy` the server only serves attached and bootstrap clients.
    pub fn build(self) -> (IoServer, mpsc::Receiver<ServerEvent>) {
        let capacity = self.config.event_capacity.max(1);
        let (events, events_rx) = mpsc::channel(capacity);
        let (inbox, inbox_rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(State::Disconnected);

        let inner = Arc::new(ServerInner {
            uuid: Uuid::new_v4(),
            sender_type: self.sender_type,
            routing_table: self.routing_table,
            accepted_types: self.accepted_types,
            config: self.config,
            mode: self.mode,
            clients: RwLock::new(HashMap::new()),
            inbox,
            state,
            local_addr: Mutex::new(None),
            background: Mutex::new(None),
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), inbox_rx, events));

        (IoServer { inner }, events_rx)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    /// Stamped into `sender_uuid` of packages this server sends.
    uuid: Uuid,
    sender_type: SenderType,
    routing_table: RoutingTable,
    accepted_types: Option<Vec<SenderType>>,
    config: EndpointConfig,
    mode: Option<ConnectionMode>,
    clients: RwLock<HashMap<SenderHandle, Arc<Link>>>,
    inbox: mpsc::Sender<LinkInput>,
    /// `Connected` while listening or registered at the proxy.
    state: watch::Sender<State>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Accept loop or proxy control link.
    background: Mutex<Option<JoinHandle<()>>>,
}

/// Endpoint serving many clients.
///
/// Dropping the server stops accepting and closes every client link.
pub struct IoServer {
    inner: Arc<ServerInner>,
}

impl IoServer {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Start accepting clients.
    ///
    /// In direct mode this binds the listening socket and returns its
    /// address. In proxy mode it starts registering at the relay and returns
    /// the relay address; see [`IoServer::wait_for_proxy_connection`].
    pub async fn listen(&self) -> Result<SocketAddr> {
        let mode = self
            .inner
            .mode
            .ok_or(IoServiceError::InvalidState("no listen address or proxy configured"))?;
        match mode {
            ConnectionMode::Direct(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                *self.inner.lock_local_addr() = Some(local);
                let task = tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener));
                self.inner.set_background(task);
                self.inner.state.send_replace(State::Connected);
                tracing::debug!("Server {} listening on {}", self.inner.uuid, local);
                Ok(local)
            }
            ConnectionMode::Proxy {
                relay,
                routing_uuid,
            } => {
                self.inner.state.send_replace(State::Connecting);
                let task = tokio::spawn(proxy_control(
                    Arc::downgrade(&self.inner),
                    relay,
                    routing_uuid,
                ));
                self.inner.set_background(task);
                Ok(relay)
            }
        }
    }

    /// Wait until the control link to the proxy is acknowledged.
    ///
    /// Returns the state when the timeout elapses.
    pub async fn wait_for_proxy_connection(&self, timeout: Option<Duration>) -> State {
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

    /// Bound address in direct mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.lock_local_addr()
    }

    /// Endpoint uuid stamped into outgoing packages.
    pub fn server_uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Snapshot of the connected handles.
    pub fn get_clients_handles(&self) -> Vec<SenderHandle> {
        self.inner.read_clients().keys().cloned().collect()
    }

    pub fn count_clients(&self) -> usize {
        self.inner.read_clients().len()
    }

    /// Sender type a client announced in its handshake.
    pub fn client_sender_type(&self, handle: &SenderHandle) -> Option<SenderType> {
        self.inner.link(handle).map(|l| l.peer().sender_type)
    }

    /// Routing table negotiated with a client.
    pub fn client_routing_table(&self, handle: &SenderHandle) -> Option<RoutingTable> {
        self.inner
            .link(handle)
            .map(|l| l.peer().routing_table.clone())
    }

    /// Queue a package for one client. Never waits.
    ///
    /// For an unknown or detached handle the job already reads `Fail`.
    pub fn send_package(&self, handle: &SenderHandle, package: Package) -> SendJob {
        self.inner.submit(handle, package)
    }

    /// Queue a package, resubmitting while the client's queue is full.
    pub async fn send_package_with_retry(&self, handle: &SenderHandle, package: Package) -> SendJob {
        let policy = self.inner.config.retry;
        submit_with_retry(package, policy, |p| self.inner.submit(handle, p)).await
    }

    /// Send a copy of `package` to every connected client.
    ///
    /// Each copy gets its own uuid, so every client's response correlates
    /// to its own job.
    pub fn broadcast_package(&self, package: &Package) -> Vec<(SenderHandle, SendJob)> {
        let links: Vec<Arc<Link>> = self.inner.read_clients().values().cloned().collect();
        links
            .into_iter()
            .map(|link| {
                let mut copy = package.duplicate(false);
                copy.set_uuid(Uuid::new_v4());
                (link.handle().clone(), link.submit(copy))
            })
            .collect()
    }

    /// Take a client out of this server without disconnecting it.
    ///
    /// Sends on `handle` fail from now on. The bundle is also reported as
    /// [`ServerEvent::ClientDetached`]. `additional` travels with it and is
    /// reported by the attaching server.
    pub async fn detach_client(
        &self,
        handle: &SenderHandle,
        additional: Option<Package>,
    ) -> Result<Arc<DetachedClient>> {
        let link = self
            .inner
            .write_clients()
            .remove(handle)
            .ok_or_else(|| IoServiceError::UnknownHandle(handle.to_string()))?;

        let (socket, pending) = link.detach().await?;
        let peer = link.peer().clone();
        let detached = Arc::new(DetachedClient::new(
            socket,
            Some(Session {
                handle: handle.clone(),
                sender_type: peer.sender_type,
                process_id: peer.process_id,
                routing_table: peer.routing_table,
                pending: pending.freeze(),
                additional,
            }),
        ));

        tracing::debug!("Detached client {}", handle);
        self.inner
            .notify(LinkInput::Detached {
                handle: handle.clone(),
                detached: detached.clone(),
            });
        Ok(detached)
    }

    /// Resume a detached client here, under its original handle.
    ///
    /// Fails with `AlreadyAttached` if the bundle was used before.
    pub fn attach_client(&self, detached: &DetachedClient) -> Result<SenderHandle> {
        if let Some(handle) = detached.handle() {
            if self.inner.link(&handle).is_some() {
                return Err(IoServiceError::InvalidState("handle is already connected"));
            }
        }
        let (socket, session) = detached.take_session()?;
        let stream = into_tokio(socket)?;

        let mut decoder = FrameBuffer::with_max_payload(self.inner.config.max_package_size);
        decoder.extend(&session.pending);
        let handle = session.handle.clone();

        let link = Link::spawn(
            stream,
            decoder,
            LinkSetup {
                handle: handle.clone(),
                local_uuid: self.inner.uuid,
                peer: PeerInfo {
                    sender_type: session.sender_type,
                    process_id: session.process_id,
                    routing_table: session.routing_table,
                },
                greeting: Some(LinkInput::Attached {
                    handle: handle.clone(),
                    additional: session.additional.map(Arc::new),
                }),
            },
            &self.inner.config,
            self.inner.inbox.clone(),
        );
        self.inner.publish(link);

        tracing::debug!("Attached client {}", handle);
        Ok(handle)
    }

    /// Pass a detached client to the peer behind `handle`.
    ///
    /// The bundle is exported for the peer's process. With `request` the
    /// package answers that request, so the peer's job receives it.
    pub fn send_detached_client(
        &self,
        handle: &SenderHandle,
        detached: &DetachedClient,
        request: Option<&Package>,
    ) -> SendJob {
        let mut package = Package::create_instance(mng::DETACHED_CLIENT, 1);
        if let Some(request) = request {
            package.make_direct_response(request);
        }

        let Some(link) = self.inner.link(handle) else {
            return SendJob::failed(Arc::new(package));
        };
        let filled = detached
            .export(link.peer().process_id)
            .and_then(|bytes| package.fill_buffer_bytes(0, Encoding::Raw, bytes.into()));
        if let Err(e) = filled {
            tracing::warn!("Cannot send detached client to {}: {}", handle, e);
            return SendJob::failed(Arc::new(package));
        }
        link.submit_control(package)
    }

    /// Make a socket for a child process that does not exist yet.
    ///
    /// This server keeps one end and treats it as an accepted connection;
    /// the other end comes back as a bundle for
    /// [`bootstrap::spawn_with_socket`](crate::transport::bootstrap::spawn_with_socket).
    pub async fn create_detached_client_socket(&self) -> Result<DetachedClient> {
        let (ours, theirs) = loopback_pair().await?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.admit(ours).await {
                tracing::debug!("Bootstrap client was not admitted: {}", e);
            }
        });
        Ok(DetachedClient::new(theirs.into_std()?, None))
    }

    /// Close one client.
    pub async fn disconnect_client(&self, handle: &SenderHandle) -> Result<()> {
        let link = self
            .inner
            .write_clients()
            .remove(handle)
            .ok_or_else(|| IoServiceError::UnknownHandle(handle.to_string()))?;
        link.close().await;
        self.inner
            .notify(LinkInput::Disconnected {
                handle: handle.clone(),
            });
        Ok(())
    }

    /// Stop accepting and close every client. Their outstanding jobs fail.
    pub async fn disconnect_server(&self) {
        let background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = background {
            task.abort();
        }
        *self.inner.lock_local_addr() = None;

        let links: Vec<Arc<Link>> = self.inner.write_clients().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
            self.inner
                .notify(LinkInput::Disconnected {
                    handle: link.handle().clone(),
                });
        }
        self.inner.state.send_replace(State::Disconnected);
        tracing::debug!("Server {} disconnected", self.inner.uuid);
    }
}

impl Drop for IoServer {
    fn drop(&mut self) {
        if let Some(task) = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl ServerInner {
    fn read_clients(&self) -> RwLockReadGuard<'_, HashMap<SenderHandle, Arc<Link>>> {
        self.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_clients(&self) -> RwLockWriteGuard<'_, HashMap<SenderHandle, Arc<Link>>> {
        self.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_local_addr(&self) -> std::sync::MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_background(&self, task: JoinHandle<()>) {
        let previous = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn link(&self, handle: &SenderHandle) -> Option<Arc<Link>> {
        self.read_clients().get(handle).cloned()
    }

    fn submit(&self, handle: &SenderHandle, package: Package) -> SendJob {
        match self.link(handle) {
            Some(link) => link.submit(package),
            None => {
                tracing::debug!("Send to unknown client {}", handle);
                SendJob::failed(Arc::new(package))
            }
        }
    }

    /// Queue an endpoint notice behind the link traffic already queued.
    ///
    /// Never waits, so callers inside the event loop cannot stall on a
    /// full inbox.
    fn notify(&self, input: LinkInput) {
        match self.inbox.try_send(input) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(input)) => {
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    let _ = inbox.send(input).await;
                });
            }
        }
    }

    /// Add a spawned link to the client map and let it run.
    fn publish(&self, link: Arc<Link>) {
        let previous = self
            .write_clients()
            .insert(link.handle().clone(), link.clone());
        if let Some(previous) = previous {
            tracing::warn!("Replacing link {} of {}", previous.id(), link.handle());
        }
        link.start();
    }

    /// Run the server side of the handshake on a fresh socket.
    async fn admit(self: &Arc<Self>, mut stream: TcpStream) -> Result<SenderHandle> {
        let mut decoder = FrameBuffer::with_max_payload(self.config.max_package_size);
        let hello: Hello = tokio::time::timeout(self.config.handshake_timeout, async {
            let package = read_package(&mut stream, &mut decoder).await?;
            parse_control::<Hello>(&package, mng::HANDSHAKE)
        })
        .await
        .map_err(|_| IoServiceError::Timeout("handshake"))??;

        if let Some(types) = &self.accepted_types {
            if !types.contains(&hello.sender_type) {
                let reason = format!("sender type {:?} is not accepted", hello.sender_type);
                return self.refuse(&mut stream, reason).await;
            }
        }
        let Some(routing_table) = self.routing_table.accept(&hello.routing_table) else {
            return self
                .refuse(&mut stream, "routing tables are incompatible".into())
                .await;
        };

        let handle = match hello.resume_handle {
            Some(handle) if self.link(&handle).is_none() => handle,
            _ => SenderHandle::generate(),
        };
        let ack = HelloAck {
            accepted: true,
            reason: None,
            sender_handle: Some(handle.clone()),
            server_sender_type: self.sender_type,
            server_uuid: self.uuid,
            server_process_id: std::process::id(),
            routing_table: Some(routing_table.clone()),
        };
        write_package(&mut stream, &control_package(mng::HANDSHAKE_ACK, &ack)?).await?;

        let link = Link::spawn(
            stream,
            decoder,
            LinkSetup {
                handle: handle.clone(),
                local_uuid: self.uuid,
                peer: PeerInfo {
                    sender_type: hello.sender_type,
                    process_id: hello.process_id,
                    routing_table,
                },
                greeting: Some(LinkInput::Opened {
                    handle: handle.clone(),
                    sender_type: hello.sender_type,
                }),
            },
            &self.config,
            self.inbox.clone(),
        );
        self.publish(link);

        tracing::debug!("Client {} connected ({:?})", handle, hello.sender_type);
        Ok(handle)
    }

    async fn refuse(&self, stream: &mut TcpStream, reason: String) -> Result<SenderHandle> {
        tracing::debug!("Refusing client: {}", reason);
        let ack = HelloAck::refused(reason.clone(), self.sender_type, self.uuid);
        write_package(stream, &control_package(mng::HANDSHAKE_ACK, &ack)?).await?;
        Err(IoServiceError::HandshakeRejected(reason))
    }

    /// A link died on its own. Returns whether it was still registered.
    fn remove_closed(&self, handle: &SenderHandle, link_id: u64) -> Option<Arc<Link>> {
        let mut clients = self.write_clients();
        match clients.get(handle) {
            Some(link) if link.id() == link_id => clients.remove(handle),
            _ => None,
        }
    }
}

/// Turn link inputs into server events.
async fn dispatch(
    inner: Weak<ServerInner>,
    mut inbox: mpsc::Receiver<LinkInput>,
    events: mpsc::Sender<ServerEvent>,
) {
    while let Some(input) = inbox.recv().await {
        let event = match input {
            LinkInput::Opened {
                handle,
                sender_type,
            } => ServerEvent::ClientConnected {
                handle,
                sender_type,
            },
            LinkInput::Attached { handle, additional } => {
                ServerEvent::ClientAttached { handle, additional }
            }
            LinkInput::Package { handle, package } => {
                ServerEvent::PackageReceived { handle, package }
            }
            LinkInput::Response {
                handle,
                job_uuid,
                package,
            } => ServerEvent::ResponsePackageReceived {
                handle,
                job_uuid,
                package,
            },
            LinkInput::DetachedClient { handle, package } => match import_detached(&package) {
                Ok(detached) => ServerEvent::DetachedClientReceived {
                    handle,
                    package,
                    detached: Arc::new(detached),
                },
                Err(e) => {
                    tracing::warn!("Dropping unusable detached client from {}: {}", handle, e);
                    continue;
                }
            },
            LinkInput::Closed { handle, link_id } => {
                let Some(inner) = inner.upgrade() else {
                    continue;
                };
                let Some(link) = inner.remove_closed(&handle, link_id) else {
                    continue;
                };
                link.close().await;
                ServerEvent::ClientDisconnected { handle }
            }
            LinkInput::Detached { handle, detached } => {
                ServerEvent::ClientDetached { handle, detached }
            }
            LinkInput::Disconnected { handle } => ServerEvent::ClientDisconnected { handle },
        };
        // Receiver dropped: events are discarded
        let _ = events.send(event).await;
    }
}

async fn accept_loop(inner: Weak<ServerInner>, listener: TcpListener) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = inner.admit(stream).await {
                tracing::debug!("Client from {} not admitted: {}", addr, e);
            }
        });
    }
}

/// Keep the control link to the relay and dial a data link per request.
async fn proxy_control(inner: Weak<ServerInner>, relay: SocketAddr, routing_uuid: Uuid) {
    let result = run_proxy_control(&inner, relay, routing_uuid).await;
    if let Some(inner) = inner.upgrade() {
        if let Err(e) = result {
            tracing::warn!("Proxy control link to {} ended: {}", relay, e);
        }
        inner.state.send_replace(State::Disconnected);
    }
}

async fn run_proxy_control(
    inner: &Weak<ServerInner>,
    relay: SocketAddr,
    routing_uuid: Uuid,
) -> Result<()> {
    let (connect_timeout, handshake_timeout) = match inner.upgrade() {
        Some(inner) => (inner.config.connect_timeout, inner.config.handshake_timeout),
        None => return Ok(()),
    };

    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(relay))
        .await
        .map_err(|_| IoServiceError::Timeout("proxy connect"))??;
    let mut decoder = FrameBuffer::new();
    let hello = ProxyHello {
        role: ProxyRole::ServerControl,
        routing_uuid,
        session: None,
    };
    let ack: ProxyHelloAck = tokio::time::timeout(handshake_timeout, async {
        write_package(&mut stream, &control_package(mng::PROXY_HELLO, &hello)?).await?;
        let reply = read_package(&mut stream, &mut decoder).await?;
        parse_control::<ProxyHelloAck>(&reply, mng::PROXY_HELLO_ACK)
    })
    .await
    .map_err(|_| IoServiceError::Timeout("proxy handshake"))??;

    if !ack.accepted {
        return Err(IoServiceError::HandshakeRejected(
            ack.reason.unwrap_or_else(|| "proxy refused".into()),
        ));
    }
    match inner.upgrade() {
        Some(inner) => inner.state.send_replace(State::Connected),
        None => return Ok(()),
    };
    tracing::debug!("Registered at proxy {} as {}", relay, routing_uuid);

    loop {
        let package = read_package(&mut stream, &mut decoder).await?;
        let request: ProxyConnectRequest = parse_control(&package, mng::PROXY_CONNECT_REQUEST)?;
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };
        tokio::spawn(async move {
            if let Err(e) = dial_data_link(&inner, relay, routing_uuid, request.session).await {
                tracing::warn!("Proxy data link {} failed: {}", request.session, e);
            }
        });
    }
}

async fn dial_data_link(
    inner: &Arc<ServerInner>,
    relay: SocketAddr,
    routing_uuid: Uuid,
    session: Uuid,
) -> Result<()> {
    let mut stream = tokio::time::timeout(inner.config.connect_timeout, TcpStream::connect(relay))
        .await
        .map_err(|_| IoServiceError::Timeout("proxy connect"))??;
    let hello = ProxyHello {
        role: ProxyRole::ServerData,
        routing_uuid,
        session: Some(session),
    };
    write_package(&mut stream, &control_package(mng::PROXY_HELLO, &hello)?).await?;
    inner.admit(stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_local_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_listen_requires_mode() {
        let (server, _events) = ServerBuilder::new().build();
        assert!(matches!(
            server.listen().await,
            Err(IoServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let (server, _events) = ServerBuilder::new().listen_on(any_local_port()).build();
        server.listen().await.unwrap();

        let handle = SenderHandle::generate();
        let job = server.send_package(&handle, Package::create_instance(1, 0));
        assert_eq!(job.send_result(), crate::job::SendResult::Fail);
        assert!(server.client_sender_type(&handle).is_none());
        assert!(matches!(
            server.detach_client(&handle, None).await,
            Err(IoServiceError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_reports_bound_address() {
        let (server, _events) = ServerBuilder::new().listen_on(any_local_port()).build();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.state(), State::Connected);

        server.disconnect_server().await;
        assert_eq!(server.local_addr(), None);
        assert_eq!(server.state(), State::Disconnected);
    }
}
