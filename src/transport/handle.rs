//! Platform-specific socket hand-over.
//!
//! - Unix: descriptors cannot be duplicated into a running process, so an
//!   export parks the socket in a process-local table and the ticket is a
//!   one-time key into it. Child processes get their socket by inheritance
//!   through [`bootstrap`](super::bootstrap) instead.
//! - Windows: `WSADuplicateSocketW` produces a fixed-size protocol info
//!   blob that the target process turns back into a socket
//!
//! # Example
//!
//! ```ignore
//! use ioservice::transport::TransferableHandle;
//!
//! let exported = socket.export_for(std::process::id())?;
//! let socket = std::net::TcpStream::import_ticket(&exported.ticket)?;
//! // A second import of the same ticket fails
//! ```

use crate::error::Result;

/// A socket that can be described to another process.
pub trait TransferableHandle: Sized {
    /// Make the handle usable by `target_pid` and describe it as bytes.
    fn export_for(self, target_pid: u32) -> Result<ExportedHandle<Self>>;

    /// Rebuild the handle from a ticket produced for this process.
    ///
    /// A ticket opens its handle at most once.
    fn import_ticket(ticket: &[u8]) -> Result<Self>;
}

/// Result of [`TransferableHandle::export_for`].
#[derive(Debug)]
pub struct ExportedHandle<T> {
    pub ticket: Vec<u8>,
    /// Local handle that must stay open until the target took over.
    /// `None` where the ticket itself owns the handle.
    pub source: Option<T>,
}

/// Whether a handle can be exported for `target_pid` on this platform.
pub(crate) fn can_export_to(target_pid: u32) -> bool {
    cfg!(windows) || target_pid == std::process::id()
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use crate::error::IoServiceError;
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::collections::HashMap;
    use std::net::TcpStream;
    use std::os::fd::{FromRawFd, RawFd};
    use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
    use uuid::Uuid;

    /// Sockets exported within this process, waiting for their import.
    static PARKED: OnceLock<Mutex<HashMap<Uuid, TcpStream>>> = OnceLock::new();

    fn parked() -> MutexGuard<'static, HashMap<Uuid, TcpStream>> {
        PARKED
            .get_or_init(Mutex::default)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear close-on-exec so a spawned child inherits `fd`.
    pub(crate) fn set_inheritable(fd: RawFd) -> Result<()> {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Adopt a descriptor this process inherited from its parent.
    pub(crate) fn adopt_inherited(fd: RawFd) -> Result<TcpStream> {
        if fd < 0 {
            return Err(IoServiceError::InvalidBundle(format!("bad descriptor {}", fd)));
        }
        // The descriptor must be open in this process
        fcntl(fd, FcntlArg::F_GETFD).map_err(std::io::Error::from)?;

        // SAFETY: the parent handed this descriptor to us on the command
        // line and nothing else in this process owns it.
        Ok(unsafe { TcpStream::from_raw_fd(fd) })
    }

    impl TransferableHandle for TcpStream {
        fn export_for(self, target_pid: u32) -> Result<ExportedHandle<Self>> {
            if !can_export_to(target_pid) {
                return Err(IoServiceError::InvalidBundle(format!(
                    "cannot hand a descriptor to running process {}, spawn it with bootstrap instead",
                    target_pid
                )));
            }
            let key = Uuid::new_v4();
            parked().insert(key, self);
            Ok(ExportedHandle {
                ticket: key.as_bytes().to_vec(),
                source: None,
            })
        }

        fn import_ticket(ticket: &[u8]) -> Result<Self> {
            let key = Uuid::from_slice(ticket)
                .map_err(|_| IoServiceError::InvalidBundle("bad descriptor ticket".into()))?;
            parked().remove(&key).ok_or_else(|| {
                IoServiceError::InvalidBundle("descriptor ticket already used or unknown".into())
            })
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::error::IoServiceError;
    use std::net::TcpStream;
    use std::os::windows::io::{AsRawSocket, FromRawSocket, RawSocket};
    use windows_sys::Win32::Networking::WinSock::{
        WSADuplicateSocketW, WSAGetLastError, WSASocketW, WSAStartup, FROM_PROTOCOL_INFO,
        INVALID_SOCKET, SOCKET, WSADATA, WSAPROTOCOL_INFOW, WSA_FLAG_OVERLAPPED,
    };

    /// Size of a duplication ticket.
    pub const TICKET_SIZE: usize = std::mem::size_of::<WSAPROTOCOL_INFOW>();

    fn last_error() -> IoServiceError {
        // SAFETY: reads thread-local error state only.
        std::io::Error::from_raw_os_error(unsafe { WSAGetLastError() }).into()
    }

    impl TransferableHandle for TcpStream {
        fn export_for(self, target_pid: u32) -> Result<ExportedHandle<Self>> {
            // SAFETY: WSAPROTOCOL_INFOW is plain data, zero is a valid value.
            let mut info: WSAPROTOCOL_INFOW = unsafe { std::mem::zeroed() };
            let rc =
                unsafe { WSADuplicateSocketW(self.as_raw_socket() as SOCKET, target_pid, &mut info) };
            if rc != 0 {
                return Err(last_error());
            }

            // SAFETY: `info` is TICKET_SIZE bytes of initialized plain data.
            let ticket = unsafe {
                std::slice::from_raw_parts(&info as *const WSAPROTOCOL_INFOW as *const u8, TICKET_SIZE)
            }
            .to_vec();

            Ok(ExportedHandle {
                ticket,
                source: Some(self),
            })
        }

        fn import_ticket(ticket: &[u8]) -> Result<Self> {
            if ticket.len() != TICKET_SIZE {
                return Err(IoServiceError::InvalidBundle(format!(
                    "duplication ticket is {} bytes, expected {}",
                    ticket.len(),
                    TICKET_SIZE
                )));
            }

            // A fresh child may not have touched winsock yet
            let mut data: WSADATA = unsafe { std::mem::zeroed() };
            if unsafe { WSAStartup(0x0202, &mut data) } != 0 {
                return Err(last_error());
            }

            let mut info: WSAPROTOCOL_INFOW = unsafe { std::mem::zeroed() };
            // SAFETY: lengths checked above, both sides are plain data.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    ticket.as_ptr(),
                    &mut info as *mut WSAPROTOCOL_INFOW as *mut u8,
                    TICKET_SIZE,
                );
            }

            let socket = unsafe {
                WSASocketW(
                    FROM_PROTOCOL_INFO,
                    FROM_PROTOCOL_INFO,
                    FROM_PROTOCOL_INFO,
                    &info,
                    0,
                    WSA_FLAG_OVERLAPPED,
                )
            };
            if socket == INVALID_SOCKET {
                return Err(last_error());
            }

            // SAFETY: WSASocketW returned a fresh socket we now own.
            Ok(unsafe { TcpStream::from_raw_socket(socket as RawSocket) })
        }
    }
}

#[cfg(unix)]
pub(crate) use unix_impl::{adopt_inherited, set_inheritable};

#[cfg(windows)]
pub use windows_impl::TICKET_SIZE;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn std_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_export_import_same_process() {
        let (client, mut server) = std_pair();

        let exported = client.export_for(std::process::id()).unwrap();
        assert!(exported.source.is_none());

        let mut resumed = TcpStream::import_ticket(&exported.ticket).unwrap();
        resumed.write_all(b"still here").unwrap();

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[test]
    fn test_ticket_opens_once() {
        let (client, _server) = std_pair();
        let exported = client.export_for(std::process::id()).unwrap();

        let _first = TcpStream::import_ticket(&exported.ticket).unwrap();
        assert!(matches!(
            TcpStream::import_ticket(&exported.ticket),
            Err(crate::error::IoServiceError::InvalidBundle(_))
        ));
    }

    #[test]
    fn test_export_refuses_other_process() {
        let (client, _server) = std_pair();
        assert!(!can_export_to(std::process::id().wrapping_add(1)));
        assert!(client.export_for(std::process::id().wrapping_add(1)).is_err());
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(TcpStream::import_ticket(b"not a ticket").is_err());
        assert!(TcpStream::import_ticket(b"").is_err());
        assert!(TcpStream::import_ticket(uuid::Uuid::new_v4().as_bytes()).is_err());
    }

    #[test]
    fn test_adopt_inherited_rejects_closed_descriptor() {
        assert!(adopt_inherited(-3).is_err());
    }
}
