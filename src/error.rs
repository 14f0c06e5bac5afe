//! Error types for ioservice.

use thiserror::Error;

/// Main error type for all ioservice operations.
///
/// Transport failures that happen inside an endpoint's own tasks never
/// surface through this type; they end up as terminal job states instead.
#[derive(Debug, Error)]
pub enum IoServiceError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (management messages, JSON buffers).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (bad magic, checksum mismatch, oversized package, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Buffer index is outside the package's buffer count.
    #[error("Buffer index {index} out of range (package has {count} buffers)")]
    BufferOutOfRange { index: u32, count: u32 },

    /// Buffer holds a different encoding than the one requested.
    #[error("Buffer {index} has encoding {actual:?}, expected {expected:?}")]
    EncodingMismatch {
        index: u32,
        expected: crate::protocol::Encoding,
        actual: crate::protocol::Encoding,
    },

    /// Sender handle is not connected to this endpoint.
    #[error("Unknown sender handle: {0}")]
    UnknownHandle(String),

    /// Detached client bundle was already consumed by an attach.
    #[error("Detached client was already attached")]
    AlreadyAttached,

    /// Detached client bundle is malformed or empty.
    #[error("Invalid detached client: {0}")]
    InvalidBundle(String),

    /// Peer refused the handshake.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Endpoint is not in a state that allows the operation.
    #[error("Invalid endpoint state: {0}")]
    InvalidState(&'static str),

    /// Operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An endpoint task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Outbound queue is at capacity.
    #[error("Send queue is full")]
    SendQueueFull,
}

/// Result type alias using IoServiceError.
pub type Result<T> = std::result::Result<T, IoServiceError>;
