//! Dedicated writer task for one link.
//!
//! Every link owns a writer task that receives encoded packages via an mpsc
//! channel, writes them in batches with vectored I/O and then resolves the
//! send half of each package's job.
//!
//! # Architecture
//!
//! ```text
//! send_package ─┐
//! heartbeat    ─┼─► WriterHandle::try_send ─► mpsc ─► Writer Task ─► Socket
//! responses    ─┘        (reserve slot)                  │
//!                                                        └─► job: Success | Fail
//! ```
//!
//! The task can be stopped without closing the socket: it flushes what is
//! already queued and hands the write half back. A detach uses that to
//! recover the socket intact.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backpressure::{BackpressureController, DEFAULT_QUEUE_CAPACITY};
use crate::error::{IoServiceError, Result};
use crate::job::{SendJob, SendResult};
use crate::protocol::{Package, HEADER_SIZE};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// An encoded package ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Encoded buffers.
    pub payload: Bytes,
    /// Job to resolve once written. `None` for transport traffic.
    pub job: Option<SendJob>,
}

impl OutboundFrame {
    /// Encode `package` for writing.
    pub fn from_package(package: &Package, job: Option<SendJob>) -> Result<Self> {
        let (header, payload) = package.encode()?;
        Ok(Self {
            header,
            payload,
            job,
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    fn resolve(&self, result: SendResult) {
        if let Some(job) = &self.job {
            job.set_send_result(result);
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued packages before submissions are refused.
    pub queue_capacity: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for queueing frames on a writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Queue a frame without waiting.
    ///
    /// Returns `Err(SendQueueFull)` immediately if at capacity and
    /// `Err(ConnectionClosed)` once the writer task is gone.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        let guard = self.backpressure.try_reserve()?;

        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IoServiceError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => IoServiceError::ConnectionClosed,
        })?;

        guard.disarm();
        Ok(())
    }

    /// Get current queued frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Maximum queued frames before submissions are refused.
    #[inline]
    pub fn queue_capacity(&self) -> usize {
        self.backpressure.capacity()
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The task ends when `stop` fires or every handle is dropped, and returns
/// the writer after flushing whatever was already queued.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    stop: oneshot::Receiver<()>,
) -> (WriterHandle, JoinHandle<Result<W>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure = BackpressureController::new(config.queue_capacity);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };

    let task = tokio::spawn(writer_loop(rx, writer, backpressure, stop));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the socket.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backpressure: BackpressureController,
    mut stop: oneshot::Receiver<()>,
) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = rx.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        flush_batch(&mut writer, batch, &backpressure, &mut rx).await?;
    }

    // Frames accepted before the stop still belong to this peer
    rx.close();
    let mut remaining = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        remaining.push(frame);
    }
    for chunk in chunked(remaining) {
        flush_batch(&mut writer, chunk, &backpressure, &mut rx).await?;
    }

    Ok(writer)
}

fn chunked(frames: Vec<OutboundFrame>) -> Vec<Vec<OutboundFrame>> {
    let mut chunks = Vec::new();
    let mut iter = frames.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(MAX_BATCH_SIZE).collect());
    }
    chunks
}

/// Write one batch and resolve its jobs. On failure every queued job fails too.
async fn flush_batch<W>(
    writer: &mut W,
    batch: Vec<OutboundFrame>,
    backpressure: &BackpressureController,
    rx: &mut mpsc::Receiver<OutboundFrame>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = write_batch(writer, &batch).await;
    backpressure.release_many(batch.len());

    match result {
        Ok(()) => {
            for frame in &batch {
                frame.resolve(SendResult::Success);
            }
            Ok(())
        }
        Err(e) => {
            tracing::debug!("Writer failed, failing {} queued frames: {}", batch.len(), e);
            for frame in &batch {
                frame.resolve(SendResult::Fail);
            }
            rx.close();
            while let Ok(frame) = rx.try_recv() {
                backpressure.release_many(1);
                frame.resolve(SendResult::Fail);
            }
            Err(e)
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(IoServiceError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}
