//! Observer events.
//!
//! Endpoints report connection lifecycle and unsolicited traffic through a
//! bounded channel returned by their builder. Events of one link arrive in
//! that link's wire order. Dropping the receiver discards further events.

use std::sync::Arc;

use uuid::Uuid;

use crate::protocol::Package;
use crate::sender::{SenderHandle, SenderType};
use crate::transport::DetachedClient;

/// Events emitted by an [`IoServer`](crate::IoServer).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client finished the handshake.
    ClientConnected {
        handle: SenderHandle,
        sender_type: SenderType,
    },
    /// A client link closed. Its outstanding jobs already read `Fail`.
    ClientDisconnected { handle: SenderHandle },
    /// A package that does not answer any live job.
    PackageReceived {
        handle: SenderHandle,
        package: Arc<Package>,
    },
    /// A response correlated to a job of this server.
    ResponsePackageReceived {
        handle: SenderHandle,
        job_uuid: Uuid,
        package: Arc<Package>,
    },
    /// A client was taken out of this server. Hand `detached` to the
    /// endpoint that should take over.
    ClientDetached {
        handle: SenderHandle,
        detached: Arc<DetachedClient>,
    },
    /// A detached client was attached here.
    ClientAttached {
        handle: SenderHandle,
        additional: Option<Arc<Package>>,
    },
    /// A peer sent us a detached client.
    DetachedClientReceived {
        handle: SenderHandle,
        package: Arc<Package>,
        detached: Arc<DetachedClient>,
    },
}

/// Events emitted by an [`IoClient`](crate::IoClient).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { handle: SenderHandle },
    Disconnected,
    PackageReceived { package: Arc<Package> },
    ResponsePackageReceived { job_uuid: Uuid, package: Arc<Package> },
    DetachedClientReceived {
        package: Arc<Package>,
        detached: Arc<DetachedClient>,
    },
}
