//! Handshake messages exchanged right after a link is established.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routing::RoutingTable;
use crate::sender::{SenderHandle, SenderType};

/// Client hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub sender_type: SenderType,
    pub routing_table: RoutingTable,
    /// Lets the server export detached clients for this process.
    pub process_id: u32,
    /// Handle from an earlier session the client wants back.
    pub resume_handle: Option<SenderHandle>,
}

/// Server answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub accepted: bool,
    pub reason: Option<String>,
    pub sender_handle: Option<SenderHandle>,
    pub server_sender_type: SenderType,
    pub server_uuid: Uuid,
    pub server_process_id: u32,
    /// Merged routing table both sides use from now on.
    pub routing_table: Option<RoutingTable>,
}

impl HelloAck {
    pub(crate) fn refused(
        reason: impl Into<String>,
        server_sender_type: SenderType,
        server_uuid: Uuid,
    ) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            sender_handle: None,
            server_sender_type,
            server_uuid,
            server_process_id: std::process::id(),
            routing_table: None,
        }
    }
}
