//! One live link between two endpoints.
//!
//! A link owns three tasks on one TCP socket:
//!
//! ```text
//!             ┌─► Reader Task ──► correlate ──► LinkInput ──► endpoint dispatch
//! Socket ─────┤                      │
//!             │                      └─► SendJob::complete_response
//!             └─◄ Writer Task ◄── submit / heartbeat
//! ```
//!
//! Both the reader and the writer can be stopped without closing the
//! socket. The reader hands back its read half together with every byte it
//! has not turned into a package yet, the writer flushes its queue and hands
//! back the write half. [`Link::detach`] reunites the two into a socket that
//! another endpoint can resume.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::EndpointConfig;
use crate::control::control_package;
use crate::error::{IoServiceError, Result};
use crate::job::{JobTable, SendJob, SendResult};
use crate::protocol::{mng, FrameBuffer, Package};
use crate::routing::RoutingTable;
use crate::sender::{SenderHandle, SenderType};
use crate::transport::DetachedClient;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Socket read size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// What a link reports to the endpoint that owns it.
///
/// Endpoints push their own notices through the same channel so observers
/// see them in order with the link traffic.
#[derive(Debug)]
pub(crate) enum LinkInput {
    /// First input of a link that finished a handshake.
    Opened {
        handle: SenderHandle,
        sender_type: SenderType,
    },
    /// First input of a link resumed from a detached client.
    Attached {
        handle: SenderHandle,
        additional: Option<Arc<Package>>,
    },
    /// Application package that answers no live job.
    Package {
        handle: SenderHandle,
        package: Arc<Package>,
    },
    /// Response already handed to its job.
    Response {
        handle: SenderHandle,
        job_uuid: Uuid,
        package: Arc<Package>,
    },
    /// Management package carrying an exported detached client.
    DetachedClient {
        handle: SenderHandle,
        package: Arc<Package>,
    },
    /// The socket closed or the peer went silent.
    Closed { handle: SenderHandle, link_id: u64 },
    /// The endpoint took the link out for a hand-off.
    Detached {
        handle: SenderHandle,
        detached: Arc<DetachedClient>,
    },
    /// The endpoint closed the link itself.
    Disconnected { handle: SenderHandle },
}

/// What the handshake told us about the other side.
#[derive(Debug, Clone)]
pub(crate) struct PeerInfo {
    pub sender_type: SenderType,
    pub process_id: u32,
    pub routing_table: RoutingTable,
}

/// Identity of a link being spawned.
pub(crate) struct LinkSetup {
    pub handle: SenderHandle,
    /// Stamped into `sender_uuid` of outgoing packages that left it empty.
    pub local_uuid: Uuid,
    pub peer: PeerInfo,
    /// Forwarded before any package of the link.
    pub greeting: Option<LinkInput>,
}

struct LinkTasks {
    start: Option<oneshot::Sender<()>>,
    reader_stop: oneshot::Sender<()>,
    writer_stop: oneshot::Sender<()>,
    reader: JoinHandle<Result<(OwnedReadHalf, BytesMut)>>,
    writer: JoinHandle<Result<OwnedWriteHalf>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// A running link. Shared between the endpoint and its callers.
pub(crate) struct Link {
    id: u64,
    handle: SenderHandle,
    /// Stamped into `sender_uuid` of outgoing packages that left it empty.
    local_uuid: Uuid,
    peer: PeerInfo,
    writer: WriterHandle,
    jobs: Arc<JobTable>,
    tasks: Mutex<Option<LinkTasks>>,
}

impl Link {
    /// Spawn the link tasks on an established, handshaken socket.
    ///
    /// Nothing is read until [`Link::start`], so the owner can publish the
    /// link first. `decoder` may already hold bytes read during the
    /// handshake or carried over from a detach.
    pub(crate) fn spawn(
        stream: TcpStream,
        decoder: FrameBuffer,
        setup: LinkSetup,
        config: &EndpointConfig,
        inbox: mpsc::Sender<LinkInput>,
    ) -> Arc<Self> {
        let LinkSetup {
            handle,
            local_uuid,
            peer,
            greeting,
        } = setup;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();

        let (writer_stop, writer_stop_rx) = oneshot::channel();
        let (writer, writer_task) =
            spawn_writer_task(write_half, config.writer_config(), writer_stop_rx);

        let jobs = Arc::new(JobTable::new());
        let (start, start_rx) = oneshot::channel();
        let (reader_stop, reader_stop_rx) = oneshot::channel();
        let ctx = ReaderContext {
            link_id: id,
            handle: handle.clone(),
            jobs: jobs.clone(),
            inbox,
            peer_timeout: config.heartbeat_interval.map(|_| config.peer_timeout),
        };
        let reader_task = tokio::spawn(reader_loop(
            read_half,
            decoder,
            ctx,
            greeting,
            start_rx,
            reader_stop_rx,
        ));

        let heartbeat = config
            .heartbeat_interval
            .map(|interval| spawn_heartbeat(writer.clone(), interval));

        tracing::debug!("Link {} up for {} ({:?})", id, handle, peer.sender_type);

        Arc::new(Self {
            id,
            handle,
            local_uuid,
            peer,
            writer,
            jobs,
            tasks: Mutex::new(Some(LinkTasks {
                start: Some(start),
                reader_stop,
                writer_stop,
                reader: reader_task,
                writer: writer_task,
                heartbeat,
            })),
        })
    }

    /// Let the reader go.
    pub(crate) fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(start) = tasks.as_mut().and_then(|t| t.start.take()) {
            let _ = start.send(());
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn handle(&self) -> &SenderHandle {
        &self.handle
    }

    pub(crate) fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Queue an application package and return its job. Never waits.
    ///
    /// Types in the management range belong to the transport; such a
    /// package is refused and its job fails.
    pub(crate) fn submit(&self, package: Package) -> SendJob {
        if package.is_management() {
            tracing::warn!(
                "Refusing package {} with reserved type 0x{:08x}",
                package.uuid(),
                package.package_type()
            );
            return SendJob::failed(Arc::new(package));
        }
        self.enqueue(package)
    }

    /// Queue a management package built by the endpoint itself.
    pub(crate) fn submit_control(&self, package: Package) -> SendJob {
        self.enqueue(package)
    }

    fn enqueue(&self, mut package: Package) -> SendJob {
        if package.sender_uuid().is_nil() {
            package.set_sender_uuid(self.local_uuid);
        }
        let package = Arc::new(package);
        let job = SendJob::new(package.clone());

        let frame = match OutboundFrame::from_package(&package, Some(job.clone())) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to encode package {}: {}", package.uuid(), e);
                job.fail();
                return job;
            }
        };

        // Registered first so a fast response always finds its job
        self.jobs.register(&job);
        match self.writer.try_send(frame) {
            Ok(()) => {}
            Err(IoServiceError::SendQueueFull) => {
                tracing::debug!(
                    "Send queue of link {} full ({}/{})",
                    self.id,
                    self.writer.pending_count(),
                    self.writer.queue_capacity()
                );
                job.set_send_result(SendResult::SendQueueIsFull);
                job.fail();
            }
            Err(e) => {
                tracing::debug!("Submit on link {} failed: {}", self.id, e);
                job.fail();
            }
        }
        job
    }

    /// Stop both tasks and recover the socket plus every unconsumed byte.
    ///
    /// Jobs still waiting for a response on this link fail.
    pub(crate) async fn detach(&self) -> Result<(std::net::TcpStream, BytesMut)> {
        let tasks = self
            .take_tasks()
            .ok_or(IoServiceError::InvalidState("link already stopped"))?;
        if let Some(heartbeat) = &tasks.heartbeat {
            heartbeat.abort();
        }

        let _ = tasks.reader_stop.send(());
        let _ = tasks.writer_stop.send(());
        let reader = tasks.reader.await?;
        let writer = tasks.writer.await?;
        let outstanding = self.jobs.len();
        self.jobs.fail_all();

        let (read_half, pending) = reader?;
        let write_half = writer?;
        let stream = read_half
            .reunite(write_half)
            .map_err(|_| IoServiceError::InvalidState("socket halves do not match"))?;

        tracing::debug!(
            "Link {} detached with {} unconsumed bytes, {} jobs failed",
            self.id,
            pending.len(),
            outstanding
        );
        Ok((stream.into_std()?, pending))
    }

    /// Flush queued packages and close the socket.
    pub(crate) async fn close(&self) {
        let Some(tasks) = self.take_tasks() else {
            return;
        };
        if let Some(heartbeat) = &tasks.heartbeat {
            heartbeat.abort();
        }
        let _ = tasks.reader_stop.send(());
        let _ = tasks.writer_stop.send(());
        let _ = tasks.writer.await;
        let _ = tasks.reader.await;
        self.jobs.fail_all();
        tracing::debug!("Link {} closed", self.id);
    }

    fn take_tasks(&self) -> Option<LinkTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(tasks) = self.take_tasks() {
            if let Some(heartbeat) = tasks.heartbeat {
                heartbeat.abort();
            }
            tasks.reader.abort();
            tasks.writer.abort();
            self.jobs.fail_all();
        }
    }
}

struct ReaderContext {
    link_id: u64,
    handle: SenderHandle,
    jobs: Arc<JobTable>,
    inbox: mpsc::Sender<LinkInput>,
    peer_timeout: Option<Duration>,
}

/// The reader was stopped while the endpoint was not taking input.
struct Interrupted {
    /// Package that neither a job nor the endpoint has seen.
    unseen: Option<Arc<Package>>,
}

impl ReaderContext {
    async fn deliver(
        &self,
        package: Package,
        stop: &mut oneshot::Receiver<()>,
    ) -> std::result::Result<(), Interrupted> {
        if package.is_management() {
            match package.package_type() {
                mng::HEART_BEAT => {}
                mng::DETACHED_CLIENT => {
                    let package = Arc::new(package);
                    let job = self.jobs.find(&package.parent_uuid());
                    if let Some(job) = &job {
                        job.complete_response(package.clone(), self.handle.clone());
                    }
                    let input = LinkInput::DetachedClient {
                        handle: self.handle.clone(),
                        package: package.clone(),
                    };
                    if self.forward(input, stop).await.is_err() {
                        return Err(Interrupted {
                            unseen: job.is_none().then_some(package),
                        });
                    }
                }
                other => {
                    tracing::debug!(
                        "Ignoring management package 0x{:08x} on link {}",
                        other,
                        self.link_id
                    );
                }
            }
            return Ok(());
        }

        let package = Arc::new(package);
        match self.jobs.find(&package.parent_uuid()) {
            Some(job) => {
                job.complete_response(package.clone(), self.handle.clone());
                let input = LinkInput::Response {
                    handle: self.handle.clone(),
                    job_uuid: job.job_uuid(),
                    package,
                };
                // The job holds the response already
                self.forward(input, stop)
                    .await
                    .map_err(|_| Interrupted { unseen: None })
            }
            None => {
                let input = LinkInput::Package {
                    handle: self.handle.clone(),
                    package: package.clone(),
                };
                self.forward(input, stop).await.map_err(|_| Interrupted {
                    unseen: Some(package),
                })
            }
        }
    }

    /// Hand `input` to the endpoint unless the reader is stopped first.
    ///
    /// `stop` must not be polled again after this returns `Err`.
    async fn forward(
        &self,
        input: LinkInput,
        stop: &mut oneshot::Receiver<()>,
    ) -> std::result::Result<(), LinkInput> {
        tokio::select! {
            biased;
            permit = self.inbox.reserve() => {
                // Endpoint gone: nobody left to tell
                if let Ok(permit) = permit {
                    permit.send(input);
                }
                Ok(())
            }
            _ = stop => Err(input),
        }
    }
}

/// Read loop. Returns the read half and the undecoded tail when stopped.
async fn reader_loop(
    mut reader: OwnedReadHalf,
    mut decoder: FrameBuffer,
    ctx: ReaderContext,
    greeting: Option<LinkInput>,
    start: oneshot::Receiver<()>,
    mut stop: oneshot::Receiver<()>,
) -> Result<(OwnedReadHalf, BytesMut)> {
    tokio::select! {
        biased;
        _ = &mut stop => return Ok((reader, decoder.take_remaining())),
        _ = start => {}
    }
    if let Some(greeting) = greeting {
        if ctx.forward(greeting, &mut stop).await.is_err() {
            return Ok((reader, decoder.take_remaining()));
        }
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let error = 'link: loop {
        loop {
            match decoder.try_extract_one() {
                Ok(Some(package)) => {
                    if let Err(interrupted) = ctx.deliver(package, &mut stop).await {
                        let mut tail = BytesMut::new();
                        if let Some(package) = interrupted.unseen {
                            tail.extend_from_slice(&package.to_bytes()?);
                        }
                        tail.extend_from_slice(&decoder.take_remaining());
                        return Ok((reader, tail));
                    }
                }
                Ok(None) => break,
                Err(e) => break 'link e,
            }
        }

        let read = tokio::select! {
            biased;
            _ = &mut stop => return Ok((reader, decoder.take_remaining())),
            read = read_some(&mut reader, &mut buf, ctx.peer_timeout) => read,
        };

        match read {
            Ok(0) => break IoServiceError::ConnectionClosed,
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => break e,
        }
    };

    match &error {
        IoServiceError::ConnectionClosed => {
            tracing::debug!("Link {} closed by peer", ctx.link_id)
        }
        e => tracing::warn!("Link {} failed: {}", ctx.link_id, e),
    }
    ctx.jobs.fail_all();
    let closed = LinkInput::Closed {
        handle: ctx.handle.clone(),
        link_id: ctx.link_id,
    };
    let _ = ctx.forward(closed, &mut stop).await;
    Err(error)
}

async fn read_some(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    peer_timeout: Option<Duration>,
) -> Result<usize> {
    match peer_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(read) => Ok(read?),
            Err(_) => Err(IoServiceError::Timeout("peer sent nothing within the peer timeout")),
        },
        None => Ok(reader.read(buf).await?),
    }
}

/// Keep the link alive while the application is quiet.
fn spawn_heartbeat(writer: WriterHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let frame = match control_package(mng::HEART_BEAT, &())
                .and_then(|p| OutboundFrame::from_package(&p, None))
            {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!("Failed to build heartbeat: {}", e);
                    return;
                }
            };
            match writer.try_send(frame) {
                // A full queue means traffic is flowing anyway
                Ok(()) | Err(IoServiceError::SendQueueFull) => {}
                Err(_) => return,
            }
        }
    })
}
