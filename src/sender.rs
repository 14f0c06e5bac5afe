//! Endpoint identity: sender handles, sender types and connection state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of one logical connection.
///
/// Assigned by the server during the handshake and kept across a
/// detach/attach, so the same peer keeps the same handle in the process
/// that attaches it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderHandle(Arc<str>);

impl SenderHandle {
    /// Create a fresh handle.
    pub fn generate() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// Handle for a known uuid.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(Arc::from(uuid.hyphenated().to_string()))
    }

    /// Parse the uuid back out. `None` for foreign handles.
    pub fn as_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SenderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Class of endpoint announced during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderType {
    Unknown,
    Dispatcher,
    Vm,
    IoClient,
    Proxy,
}

/// Connection state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// How an endpoint reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP to the peer's listening address.
    Direct(SocketAddr),
    /// Through a proxy relay, paired by a shared routing uuid.
    Proxy {
        relay: SocketAddr,
        routing_uuid: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        let handle = SenderHandle::from_uuid(uuid);
        assert_eq!(handle.as_uuid(), Some(uuid));
        assert_eq!(handle.to_string(), uuid.hyphenated().to_string());
    }

    #[test]
    fn test_generated_handles_differ() {
        assert_ne!(SenderHandle::generate(), SenderHandle::generate());
    }

    #[test]
    fn test_handle_serde() {
        let handle = SenderHandle::generate();
        let json = serde_json::to_string(&handle).unwrap();
        let back: SenderHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
    }
}
