//! Control plane - management packages exchanged by the transport itself.
//!
//! Management packages use the reserved type range
//! ([`mng`](crate::protocol::mng)) and carry a single JSON buffer. They are
//! never surfaced to observers.
//!
//! # Workflow
//!
//! 1. Client connects (directly, or to a proxy and sends `ProxyHello`)
//! 2. Client sends `Handshake` with its sender type and routing table
//! 3. Server merges routing tables and answers `HandshakeAck`
//! 4. Application packages flow; idle links exchange `HeartBeat`

mod handshake;
mod proxy;

pub use handshake::{Hello, HelloAck};
pub use proxy::{ProxyConnectRequest, ProxyHello, ProxyHelloAck, ProxyRole};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IoServiceError, Result};
use crate::protocol::{Encoding, FrameBuffer, Package};

/// Read chunk size while waiting for a management package.
const READ_CHUNK: usize = 16 * 1024;

/// Wrap a management message into a package of the given reserved type.
pub(crate) fn control_package<T: Serialize>(package_type: u32, message: &T) -> Result<Package> {
    let mut package = Package::create_instance(package_type, 1);
    package.fill_buffer_as(0, Encoding::Json, message)?;
    Ok(package)
}

/// Unwrap a management message, checking its type first.
pub(crate) fn parse_control<T: DeserializeOwned>(package: &Package, expected: u32) -> Result<T> {
    if package.package_type() != expected {
        return Err(IoServiceError::Protocol(format!(
            "Expected management package 0x{:08x}, got 0x{:08x}",
            expected,
            package.package_type()
        )));
    }
    package.get_buffer_as(0)
}

/// Write one package directly to a stream (before a link is spawned).
pub(crate) async fn write_package<W>(writer: &mut W, package: &Package) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (header, payload) = package.encode()?;
    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one package. Bytes after it stay in `decoder`.
pub(crate) async fn read_package<R>(reader: &mut R, decoder: &mut FrameBuffer) -> Result<Package>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if let Some(package) = decoder.try_extract_one()? {
            return Ok(package);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(IoServiceError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mng;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_package_leaves_tail_in_decoder() {
        let (mut a, mut b) = duplex(64 * 1024);
        let hello = ProxyHello {
            role: ProxyRole::Client,
            routing_uuid: uuid::Uuid::new_v4(),
            session: None,
        };
        let first = control_package(mng::PROXY_HELLO, &hello).unwrap();
        let second = Package::create_instance(42, 0);

        let mut bytes = first.to_bytes().unwrap();
        bytes.extend(second.to_bytes().unwrap());
        a.write_all(&bytes).await.unwrap();

        let mut decoder = FrameBuffer::new();
        let got = read_package(&mut b, &mut decoder).await.unwrap();
        let parsed: ProxyHello = parse_control(&got, mng::PROXY_HELLO).unwrap();
        assert_eq!(parsed.routing_uuid, hello.routing_uuid);

        let tail = decoder.try_extract_one().unwrap().unwrap();
        assert_eq!(tail.uuid(), second.uuid());
    }

    #[tokio::test]
    async fn test_read_package_on_closed_stream() {
        let (a, mut b) = duplex(64);
        drop(a);
        let mut decoder = FrameBuffer::new();
        let result = read_package(&mut b, &mut decoder).await;
        assert!(matches!(result, Err(IoServiceError::ConnectionClosed)));
    }

    #[test]
    fn test_parse_control_checks_type() {
        let package = control_package(mng::HEART_BEAT, &()).unwrap();
        let result: Result<()> = parse_control(&package, mng::HANDSHAKE);
        assert!(result.is_err());
    }
}
