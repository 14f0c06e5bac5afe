//! Detached clients: a live connection taken out of one endpoint.
//!
//! A [`DetachedClient`] owns the socket, the session negotiated during the
//! handshake and every inbound byte the old endpoint had not consumed yet.
//! It can be attached exactly once, either in this process or, after
//! [`DetachedClient::export`], in the process the export names. The
//! exported bytes open the connection once; a replayed copy is refused.
//!
//! # Export format
//!
//! ```text
//! ┌──────────────┬─────────────────────┬──────────────────┐
//! │ meta len u32 │ meta (JSON)         │ platform ticket  │
//! └──────────────┴─────────────────────┴──────────────────┘
//! ```

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::handle::{can_export_to, TransferableHandle};
use crate::error::{IoServiceError, Result};
use crate::protocol::Package;
use crate::routing::RoutingTable;
use crate::sender::{SenderHandle, SenderType};

/// What the detaching endpoint knew about the peer.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub handle: SenderHandle,
    pub sender_type: SenderType,
    pub process_id: u32,
    pub routing_table: RoutingTable,
    /// Inbound bytes not yet decoded, starting at a package boundary.
    pub pending: Bytes,
    pub additional: Option<Package>,
}

#[derive(Debug)]
pub(crate) struct Contents {
    pub socket: std::net::TcpStream,
    /// `None` for a socket whose peer has not handshaken yet.
    pub session: Option<Session>,
}

#[derive(Debug)]
enum Slot {
    Ready(Contents),
    /// Serialized. Where the platform duplicates the socket the local
    /// copy stays open until [`DetachedClient::release_source`].
    Exported { source: Option<std::net::TcpStream> },
    Consumed,
}

/// A connection waiting to be attached somewhere.
pub struct DetachedClient {
    slot: Mutex<Slot>,
}

#[derive(Serialize, Deserialize)]
struct BundleMeta {
    /// Process allowed to import the bundle.
    target_pid: u32,
    session: Option<SessionMeta>,
}

#[derive(Serialize, Deserialize)]
struct SessionMeta {
    handle: SenderHandle,
    sender_type: SenderType,
    process_id: u32,
    routing_table: RoutingTable,
    pending: Vec<u8>,
    additional: Option<Vec<u8>>,
}

impl DetachedClient {
    pub(crate) fn new(socket: std::net::TcpStream, session: Option<Session>) -> Self {
        Self {
            slot: Mutex::new(Slot::Ready(Contents { socket, session })),
        }
    }

    /// Handle of the detached peer. `None` for a bootstrap socket or once consumed.
    pub fn handle(&self) -> Option<SenderHandle> {
        match &*self.lock() {
            Slot::Ready(contents) => contents.session.as_ref().map(|s| s.handle.clone()),
            _ => None,
        }
    }

    /// Whether an attach, export or spawn already took the connection.
    pub fn is_consumed(&self) -> bool {
        !matches!(&*self.lock(), Slot::Ready(_))
    }

    /// Take socket and session of an attachable bundle. Succeeds once.
    pub(crate) fn take_session(&self) -> Result<(std::net::TcpStream, Session)> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Ready(contents) if contents.session.is_none() => {
                return Err(IoServiceError::InvalidBundle(
                    "bundle carries no session, hand it to a new client instead".into(),
                ))
            }
            Slot::Ready(_) => {}
            _ => return Err(IoServiceError::AlreadyAttached),
        }
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Ready(Contents {
                socket,
                session: Some(session),
            }) => Ok((socket, session)),
            _ => Err(IoServiceError::AlreadyAttached),
        }
    }

    /// Take the contents. Succeeds once.
    pub(crate) fn take(&self) -> Result<Contents> {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Ready(contents) => Ok(contents),
            other => {
                *slot = other;
                Err(IoServiceError::AlreadyAttached)
            }
        }
    }

    /// Take the socket of a bundle without a session, leaving any other
    /// bundle untouched.
    pub(crate) fn take_bootstrap_socket(&self) -> Result<std::net::TcpStream> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Ready(contents) if contents.session.is_some() => {
                return Err(IoServiceError::InvalidBundle(
                    "bundle carries an established session, attach it instead".into(),
                ))
            }
            Slot::Ready(_) => {}
            _ => return Err(IoServiceError::AlreadyAttached),
        }
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Ready(contents) => Ok(contents.socket),
            _ => Err(IoServiceError::AlreadyAttached),
        }
    }

    /// Serialize the bundle for `target_pid`. Consumes the connection.
    ///
    /// On unix the target must be this process; a child process gets its
    /// socket through [`bootstrap`](super::bootstrap). A refused export
    /// leaves the bundle untouched.
    pub fn export(&self, target_pid: u32) -> Result<Vec<u8>> {
        if !can_export_to(target_pid) {
            return Err(IoServiceError::InvalidBundle(format!(
                "cannot export to running process {} on this platform",
                target_pid
            )));
        }
        let Contents { socket, session } = self.take()?;

        let session = match session {
            Some(s) => Some(SessionMeta {
                handle: s.handle,
                sender_type: s.sender_type,
                process_id: s.process_id,
                routing_table: s.routing_table,
                pending: s.pending.to_vec(),
                additional: s.additional.as_ref().map(Package::to_bytes).transpose()?,
            }),
            None => None,
        };
        let meta = serde_json::to_vec(&BundleMeta {
            target_pid,
            session,
        })?;

        let exported = socket.export_for(target_pid)?;
        *self.lock() = Slot::Exported {
            source: exported.source,
        };

        let mut bytes = Vec::with_capacity(4 + meta.len() + exported.ticket.len());
        bytes.extend_from_slice(&(meta.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&meta);
        bytes.extend_from_slice(&exported.ticket);
        Ok(bytes)
    }

    /// Close the local copy of an exported socket once the target has
    /// taken over. Does nothing for other bundles.
    pub fn release_source(&self) {
        if let Slot::Exported { source } = &mut *self.lock() {
            source.take();
        }
    }

    /// Rebuild a bundle exported for this process. Succeeds once per export.
    pub fn import(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(IoServiceError::InvalidBundle(format!(
                "{} bytes is too short",
                bytes.len()
            )));
        }
        let meta_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let rest = &bytes[4..];
        if rest.len() <= meta_len {
            return Err(IoServiceError::InvalidBundle("truncated bundle".into()));
        }
        let (meta, ticket) = rest.split_at(meta_len);
        let meta: BundleMeta = serde_json::from_slice(meta)?;
        if meta.target_pid != std::process::id() {
            return Err(IoServiceError::InvalidBundle(format!(
                "bundle was exported for process {}",
                meta.target_pid
            )));
        }

        let session = match meta.session {
            Some(s) => Some(Session {
                handle: s.handle,
                sender_type: s.sender_type,
                process_id: s.process_id,
                routing_table: s.routing_table,
                pending: Bytes::from(s.pending),
                additional: s.additional.as_deref().map(Package::from_bytes).transpose()?,
            }),
            None => None,
        };

        let socket = std::net::TcpStream::import_ticket(ticket)?;
        Ok(Self::new(socket, session))
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DetachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.lock() {
            Slot::Ready(_) => "ready",
            Slot::Exported { source: Some(_) } => "exported, source held",
            Slot::Exported { source: None } => "exported",
            Slot::Consumed => "consumed",
        };
        f.debug_struct("DetachedClient")
            .field("handle", &self.handle())
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Encoding;
    use std::net::{TcpListener, TcpStream};

    fn socket() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let a = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (b, _) = listener.accept().unwrap();
        (a, b)
    }

    fn session() -> Session {
        let mut additional = Package::create_instance(9, 1);
        additional.fill_buffer(0, Encoding::Raw, b"why").unwrap();
        Session {
            handle: SenderHandle::generate(),
            sender_type: SenderType::Vm,
            process_id: 4242,
            routing_table: RoutingTable::default(),
            pending: Bytes::from_static(b"partial"),
            additional: Some(additional),
        }
    }

    #[test]
    fn test_take_once() {
        let (a, _b) = socket();
        let detached = DetachedClient::new(a, Some(session()));
        assert!(detached.handle().is_some());

        assert!(detached.take().is_ok());
        assert!(detached.is_consumed());
        assert!(matches!(detached.take(), Err(IoServiceError::AlreadyAttached)));
        assert!(detached.handle().is_none());
    }

    #[test]
    fn test_import_rejects_short_bundles() {
        assert!(matches!(
            DetachedClient::import(&[]),
            Err(IoServiceError::InvalidBundle(_))
        ));
        assert!(matches!(
            DetachedClient::import(&[0, 0, 0, 10, b'{']),
            Err(IoServiceError::InvalidBundle(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_export_import_in_process() {
        let (a, _b) = socket();
        let original = session();
        let detached = DetachedClient::new(a, Some(original.clone()));

        let bytes = detached.export(std::process::id()).unwrap();
        assert!(detached.is_consumed());
        assert!(detached.export(std::process::id()).is_err());

        let imported = DetachedClient::import(&bytes).unwrap();
        let contents = imported.take().unwrap();
        let session = contents.session.unwrap();
        assert_eq!(session.handle, original.handle);
        assert_eq!(session.sender_type, SenderType::Vm);
        assert_eq!(&session.pending[..], b"partial");
        let additional = session.additional.unwrap();
        assert_eq!(additional.uuid(), original.additional.unwrap().uuid());
    }

    #[cfg(unix)]
    #[test]
    fn test_import_of_same_bytes_succeeds_once() {
        let (a, _b) = socket();
        let detached = DetachedClient::new(a, Some(session()));
        let bytes = detached.export(std::process::id()).unwrap();

        let first = DetachedClient::import(&bytes).unwrap();
        assert!(!first.is_consumed());
        assert!(matches!(
            DetachedClient::import(&bytes),
            Err(IoServiceError::InvalidBundle(_))
        ));
        assert!(first.take_session().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_export_to_other_process_leaves_bundle() {
        let (a, _b) = socket();
        let detached = DetachedClient::new(a, Some(session()));

        let other = std::process::id().wrapping_add(1);
        assert!(matches!(
            detached.export(other),
            Err(IoServiceError::InvalidBundle(_))
        ));
        assert!(!detached.is_consumed());
        assert!(detached.handle().is_some());
    }

    #[test]
    fn test_import_refuses_other_target() {
        let meta = serde_json::to_vec(&BundleMeta {
            target_pid: std::process::id().wrapping_add(1),
            session: None,
        })
        .unwrap();
        let mut bytes = (meta.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&meta);
        bytes.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            DetachedClient::import(&bytes),
            Err(IoServiceError::InvalidBundle(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_release_source_keeps_exported_state() {
        let (a, _b) = socket();
        let detached = DetachedClient::new(a, None);
        let _bytes = detached.export(std::process::id()).unwrap();

        detached.release_source();
        assert!(detached.is_consumed());
        assert!(format!("{:?}", detached).contains("exported"));
    }
}
