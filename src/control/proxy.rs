//! Messages spoken on links to a proxy relay.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of a relayed connection a link belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyRole {
    /// Long-lived link a server uses to receive connect requests.
    ServerControl,
    /// Link a server dials for one relayed client.
    ServerData,
    /// Client asking to reach a server.
    Client,
}

/// First package on every link to a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHello {
    pub role: ProxyRole,
    pub routing_uuid: Uuid,
    /// Set on `ServerData` links, echoing the connect request.
    pub session: Option<Uuid>,
}

/// Proxy answer to a hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHelloAck {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl ProxyHelloAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Sent to a server control link when a client shows up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConnectRequest {
    pub session: Uuid,
}
