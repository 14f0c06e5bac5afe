//! Wire format encoding and decoding.
//!
//! Every package starts with an 86-byte header:
//! ```text
//! ┌───────┬─────┬─────┬──────┬────────────┬─────────┬─────────┬──────┬────────┬────────┬──────────┬───────┐
//! │ Magic │ Ver │ Rsv │ Type │ Numeric ID │ Buffers │ Payload │ Uuid │ Parent │ Sender │ Receiver │ CRC16 │
//! │ u16   │ u8  │ u8  │ u32  │ u32        │ u32     │ u32     │ 16   │ 16     │ 16     │ 16       │ u16   │
//! └───────┴─────┴─────┴──────┴────────────┴─────────┴─────────┴──────┴────────┴────────┴──────────┴───────┘
//! ```
//!
//! The payload follows: for each buffer `[encoding u16][length u32][bytes]`.
//!
//! All multi-byte integers are Big Endian. The CRC covers every header byte
//! except the CRC field itself.

use crc::{Crc, CRC_16_IBM_SDLC};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IoServiceError, Result};

/// Header size in bytes (fixed).
pub const HEADER_SIZE: usize = 86;

/// Per-buffer descriptor size inside the payload (encoding + length).
pub const BUFFER_DESCRIPTOR_SIZE: usize = 6;

/// Magic prefix, "IO".
pub const PACKAGE_MAGIC: u16 = 0x494F;

/// Current wire version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum payload size (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1_073_741_824;

const CRC_OFFSET: usize = HEADER_SIZE - 2;

/// X.25 CRC-16, the same polynomial Qt's `qChecksum` uses.
const HEADER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Reserved package types used by the transport itself.
///
/// Applications must stay below [`mng::TYPE_BASE`].
pub mod mng {
    /// First reserved type.
    pub const TYPE_BASE: u32 = 0xFFFF_FF00;
    /// Client hello carrying sender type and routing table.
    pub const HANDSHAKE: u32 = TYPE_BASE + 1;
    /// Server answer carrying the assigned sender handle.
    pub const HANDSHAKE_ACK: u32 = TYPE_BASE + 2;
    /// Keep-alive on idle links.
    pub const HEART_BEAT: u32 = TYPE_BASE + 3;
    /// Carries an exported detached client ticket.
    pub const DETACHED_CLIENT: u32 = TYPE_BASE + 4;
    /// First package on every link to a proxy relay.
    pub const PROXY_HELLO: u32 = TYPE_BASE + 5;
    /// Proxy answer to a hello.
    pub const PROXY_HELLO_ACK: u32 = TYPE_BASE + 6;
    /// Proxy asks a server to dial a data link for a new client.
    pub const PROXY_CONNECT_REQUEST: u32 = TYPE_BASE + 7;

    /// Check if a type falls into the reserved range.
    #[inline]
    pub fn is_management(package_type: u32) -> bool {
        package_type >= TYPE_BASE
    }
}

/// Encoding tag of a package buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Opaque bytes.
    Raw,
    /// MessagePack, struct-as-map.
    MsgPack,
    /// UTF-8 JSON.
    Json,
}

impl Encoding {
    /// Wire tag of this encoding.
    pub fn tag(self) -> u16 {
        match self {
            Encoding::Raw => 0,
            Encoding::MsgPack => 1,
            Encoding::Json => 2,
        }
    }

    /// Parse a wire tag.
    pub fn from_tag(tag: u16) -> Result<Self> {
        match tag {
            0 => Ok(Encoding::Raw),
            1 => Ok(Encoding::MsgPack),
            2 => Ok(Encoding::Json),
            other => Err(IoServiceError::Protocol(format!(
                "Unknown buffer encoding {}",
                other
            ))),
        }
    }
}

/// Decoded package header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Application-defined package type.
    pub package_type: u32,
    /// Application counter, carried untouched.
    pub numeric_id: u32,
    /// Number of buffers in the payload.
    pub buffers_number: u32,
    /// Payload length in bytes (descriptors included).
    pub payload_length: u32,
    /// Package identity.
    pub uuid: Uuid,
    /// Request this package answers, nil for requests.
    pub parent_uuid: Uuid,
    /// Identity of the sending endpoint.
    pub sender_uuid: Uuid,
    /// Intended receiver, nil for broadcast.
    pub receiver_uuid: Uuid,
    /// Header checksum as read from or written to the wire.
    pub crc16: u16,
}

impl Header {
    /// Create a header with nil identities.
    pub fn new(package_type: u32, buffers_number: u32) -> Self {
        Self {
            package_type,
            numeric_id: 0,
            buffers_number,
            payload_length: 0,
            uuid: Uuid::nil(),
            parent_uuid: Uuid::nil(),
            sender_uuid: Uuid::nil(),
            receiver_uuid: Uuid::nil(),
            crc16: 0,
        }
    }

    /// Encode header to bytes (Big Endian), computing the checksum.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_fields(&mut buf);
        let crc = HEADER_CRC.checksum(&buf[..CRC_OFFSET]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn encode_fields(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0..2].copy_from_slice(&PACKAGE_MAGIC.to_be_bytes());
        buf[2] = PROTOCOL_VERSION;
        buf[3] = 0;
        buf[4..8].copy_from_slice(&self.package_type.to_be_bytes());
        buf[8..12].copy_from_slice(&self.numeric_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.buffers_number.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[20..36].copy_from_slice(self.uuid.as_bytes());
        buf[36..52].copy_from_slice(self.parent_uuid.as_bytes());
        buf[52..68].copy_from_slice(self.sender_uuid.as_bytes());
        buf[68..84].copy_from_slice(self.receiver_uuid.as_bytes());
    }

    /// Checksum of the header as it would be encoded.
    pub fn checksum(&self) -> u16 {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_fields(&mut buf);
        HEADER_CRC.checksum(&buf[..CRC_OFFSET])
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. Magic, version and checksum are
    /// checked by [`Header::validate_bytes`], not here.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            package_type: read_u32(&buf[4..8]),
            numeric_id: read_u32(&buf[8..12]),
            buffers_number: read_u32(&buf[12..16]),
            payload_length: read_u32(&buf[16..20]),
            uuid: read_uuid(&buf[20..36]),
            parent_uuid: read_uuid(&buf[36..52]),
            sender_uuid: read_uuid(&buf[52..68]),
            receiver_uuid: read_uuid(&buf[68..84]),
            crc16: u16::from_be_bytes([buf[CRC_OFFSET], buf[CRC_OFFSET + 1]]),
        })
    }

    /// Validate raw header bytes: magic, version and checksum.
    pub fn validate_bytes(buf: &[u8]) -> Result<()> {
        if buf.len() < HEADER_SIZE {
            return Err(IoServiceError::Protocol("Header truncated".to_string()));
        }
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != PACKAGE_MAGIC {
            return Err(IoServiceError::Protocol(format!(
                "Bad package magic 0x{:04x}",
                magic
            )));
        }
        if buf[2] != PROTOCOL_VERSION {
            return Err(IoServiceError::Protocol(format!(
                "Unsupported protocol version {}",
                buf[2]
            )));
        }
        let expected = HEADER_CRC.checksum(&buf[..CRC_OFFSET]);
        let actual = u16::from_be_bytes([buf[CRC_OFFSET], buf[CRC_OFFSET + 1]]);
        if expected != actual {
            return Err(IoServiceError::Protocol(format!(
                "Header checksum mismatch: expected 0x{:04x}, got 0x{:04x}",
                expected, actual
            )));
        }
        Ok(())
    }

    /// Validate the payload size against a limit.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(IoServiceError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }
        let min_payload = self.buffers_number as u64 * BUFFER_DESCRIPTOR_SIZE as u64;
        if (self.payload_length as u64) < min_payload {
            return Err(IoServiceError::Protocol(format!(
                "Payload size {} too small for {} buffers",
                self.payload_length, self.buffers_number
            )));
        }
        Ok(())
    }

    /// Check if this header belongs to a transport management package.
    #[inline]
    pub fn is_management(&self) -> bool {
        mng::is_management(self.package_type)
    }
}

#[inline]
fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
fn read_uuid(b: &[u8]) -> Uuid {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(b);
    Uuid::from_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        let mut header = Header::new(7, 2);
        header.numeric_id = 99;
        header.payload_length = 20;
        header.uuid = Uuid::new_v4();
        header.sender_uuid = Uuid::new_v4();
        header
    }

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = sample();
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();

        assert_eq!(decoded.package_type, 7);
        assert_eq!(decoded.numeric_id, 99);
        assert_eq!(decoded.buffers_number, 2);
        assert_eq!(decoded.uuid, original.uuid);
        assert_eq!(decoded.sender_uuid, original.sender_uuid);
        assert!(decoded.parent_uuid.is_nil());
        assert_eq!(decoded.crc16, original.checksum());
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let mut header = Header::new(0x01020304, 0);
        header.numeric_id = 0x05060708;
        let bytes = header.encode();

        assert_eq!(&bytes[0..2], &[0x49, 0x4F]);
        assert_eq!(bytes[2], PROTOCOL_VERSION);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..12], &[0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn test_checksum_changes_with_buffers_number() {
        let mut header = sample();
        let before = header.checksum();
        header.buffers_number += 1;
        assert_ne!(before, header.checksum());
    }

    #[test]
    fn test_checksum_excludes_crc_field() {
        let mut header = sample();
        let crc = header.checksum();
        header.crc16 = crc;
        assert_eq!(header.checksum(), crc);
    }

    #[test]
    fn test_validate_bytes_detects_corruption() {
        let mut bytes = sample().encode();
        assert!(Header::validate_bytes(&bytes).is_ok());

        bytes[10] ^= 0xFF;
        let err = Header::validate_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_validate_bytes_bad_magic() {
        let mut bytes = sample().encode();
        bytes[0] = 0;
        let err = Header::validate_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; HEADER_SIZE - 1];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_payload_limits() {
        let mut header = Header::new(1, 1);
        header.payload_length = 1_000;
        assert!(header.validate(100).is_err());

        header.payload_length = 3;
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());

        header.payload_length = BUFFER_DESCRIPTOR_SIZE as u32;
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }

    #[test]
    fn test_management_range() {
        assert!(mng::is_management(mng::HANDSHAKE));
        assert!(mng::is_management(mng::PROXY_CONNECT_REQUEST));
        assert!(!mng::is_management(1000));
        assert!(Header::new(mng::HEART_BEAT, 0).is_management());
    }

    #[test]
    fn test_encoding_tags() {
        for enc in [Encoding::Raw, Encoding::MsgPack, Encoding::Json] {
            assert_eq!(Encoding::from_tag(enc.tag()).unwrap(), enc);
        }
        assert!(Encoding::from_tag(42).is_err());
    }
}
