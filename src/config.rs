//! Endpoint configuration.
//!
//! Defaults suit a local dispatcher talking to a handful of peers; every
//! value can be changed through the client and server builders.

use std::time::Duration;

use crate::backpressure::DEFAULT_QUEUE_CAPACITY;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY};

/// Default TCP connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for the handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between heartbeats on an idle link.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default silence after which a peer is considered dead.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the observer event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Resubmission policy for packages refused with `SendQueueIsFull`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRetryPolicy {
    /// Total submission attempts, the first one included.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub interval: Duration,
}

impl Default for SendRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            interval: Duration::from_millis(200),
        }
    }
}

/// Settings shared by client and server endpoints.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum queued packages per link.
    pub queue_capacity: usize,
    /// Writer channel capacity.
    pub channel_capacity: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// `None` disables heartbeats and the peer timeout.
    pub heartbeat_interval: Option<Duration>,
    pub peer_timeout: Duration,
    /// Largest accepted package payload.
    pub max_package_size: u32,
    pub event_capacity: usize,
    pub retry: SendRetryPolicy,
}

impl EndpointConfig {
    pub(crate) fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            queue_capacity: self.queue_capacity,
            channel_capacity: self.channel_capacity,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            max_package_size: DEFAULT_MAX_PAYLOAD_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            retry: SendRetryPolicy::default(),
        }
    }
}
