//! The package: a typed header plus an ordered list of encoded buffers.
//!
//! A package is built mutably, then handed to an endpoint. From that point
//! on it is shared behind an `Arc` and never changes again.
//!
//! # Example
//!
//! ```
//! use ioservice::protocol::{Encoding, Package};
//!
//! let mut request = Package::create_instance(100, 1);
//! request.fill_buffer(0, Encoding::Raw, b"ping").unwrap();
//!
//! let response = Package::create_response(101, 0, &request);
//! assert_eq!(response.parent_uuid(), request.uuid());
//! assert!(response.is_response());
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::wire_format::{Encoding, Header, BUFFER_DESCRIPTOR_SIZE, HEADER_SIZE};
use crate::codec::{JsonCodec, MsgPackCodec};
use crate::error::{IoServiceError, Result};

/// One buffer slot of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    /// How `data` is encoded.
    pub encoding: Encoding,
    /// Buffer contents.
    pub data: Bytes,
}

impl Buffer {
    fn empty() -> Self {
        Self {
            encoding: Encoding::Raw,
            data: Bytes::new(),
        }
    }

    /// Byte length of the contents.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A self-describing request, response or notification.
#[derive(Debug, Clone)]
pub struct Package {
    header: Header,
    buffers: Vec<Buffer>,
}

impl Package {
    /// Create a package with a fresh uuid and `buffers_number` empty slots.
    pub fn create_instance(package_type: u32, buffers_number: u32) -> Self {
        let mut header = Header::new(package_type, buffers_number);
        header.uuid = Uuid::new_v4();
        Self {
            header,
            buffers: vec![Buffer::empty(); buffers_number as usize],
        }
    }

    /// Create a package that answers `request`.
    pub fn create_response(package_type: u32, buffers_number: u32, request: &Package) -> Self {
        let mut package = Self::create_instance(package_type, buffers_number);
        package.header.parent_uuid = request.header.uuid;
        package
    }

    /// Copy `data` into slot `index`.
    pub fn fill_buffer(&mut self, index: u32, encoding: Encoding, data: &[u8]) -> Result<()> {
        self.fill_buffer_bytes(index, encoding, Bytes::copy_from_slice(data))
    }

    /// Store `data` in slot `index` without copying.
    pub fn fill_buffer_bytes(&mut self, index: u32, encoding: Encoding, data: Bytes) -> Result<()> {
        let count = self.header.buffers_number;
        let slot = self
            .buffers
            .get_mut(index as usize)
            .ok_or(IoServiceError::BufferOutOfRange { index, count })?;
        *slot = Buffer { encoding, data };
        Ok(())
    }

    /// Serialize `value` with a structured encoding into slot `index`.
    pub fn fill_buffer_as<T: Serialize>(
        &mut self,
        index: u32,
        encoding: Encoding,
        value: &T,
    ) -> Result<()> {
        let data = match encoding {
            Encoding::MsgPack => MsgPackCodec::encode(value)?,
            Encoding::Json => JsonCodec::encode(value)?,
            Encoding::Raw => {
                return Err(IoServiceError::Protocol(
                    "Raw encoding cannot hold a structured value".to_string(),
                ))
            }
        };
        self.fill_buffer_bytes(index, encoding, Bytes::from(data))
    }

    /// View slot `index`.
    pub fn get_buffer(&self, index: u32) -> Result<&Buffer> {
        self.buffers
            .get(index as usize)
            .ok_or(IoServiceError::BufferOutOfRange {
                index,
                count: self.header.buffers_number,
            })
    }

    /// Decode slot `index` according to its encoding tag.
    pub fn get_buffer_as<T: DeserializeOwned>(&self, index: u32) -> Result<T> {
        let buffer = self.get_buffer(index)?;
        match buffer.encoding {
            Encoding::MsgPack => MsgPackCodec::decode(&buffer.data),
            Encoding::Json => JsonCodec::decode(&buffer.data),
            Encoding::Raw => Err(IoServiceError::EncodingMismatch {
                index,
                expected: Encoding::MsgPack,
                actual: Encoding::Raw,
            }),
        }
    }

    /// All buffer slots in order.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Turn this package into a response to `request`, addressed to its sender.
    pub fn make_direct_response(&mut self, request: &Package) {
        self.header.parent_uuid = request.header.uuid;
        self.header.receiver_uuid = request.header.sender_uuid;
    }

    /// Turn this package into a response to `request` for every listener.
    pub fn make_broadcast_response(&mut self, request: &Package) {
        self.header.parent_uuid = request.header.uuid;
        self.header.receiver_uuid = Uuid::nil();
    }

    /// Check if this package answers another one.
    pub fn is_response(&self) -> bool {
        !self.header.parent_uuid.is_nil()
    }

    /// Check if this package belongs to the transport itself.
    pub fn is_management(&self) -> bool {
        self.header.is_management()
    }

    /// Copy the package. A shallow copy shares buffer storage, a deep one does not.
    pub fn duplicate(&self, deep: bool) -> Package {
        let mut copy = self.clone();
        if deep {
            for buffer in &mut copy.buffers {
                buffer.data = Bytes::copy_from_slice(&buffer.data);
            }
        }
        copy
    }

    /// Total bytes held by all buffers.
    pub fn buffers_size(&self) -> u64 {
        self.buffers.iter().map(|b| b.data.len() as u64).sum()
    }

    /// CRC-16 of the header as it goes on the wire.
    pub fn header_checksum(&self) -> u16 {
        self.wire_header().checksum()
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.header.uuid = uuid;
    }

    pub fn parent_uuid(&self) -> Uuid {
        self.header.parent_uuid
    }

    pub fn sender_uuid(&self) -> Uuid {
        self.header.sender_uuid
    }

    pub fn set_sender_uuid(&mut self, uuid: Uuid) {
        self.header.sender_uuid = uuid;
    }

    pub fn receiver_uuid(&self) -> Uuid {
        self.header.receiver_uuid
    }

    pub fn set_receiver_uuid(&mut self, uuid: Uuid) {
        self.header.receiver_uuid = uuid;
    }

    pub fn package_type(&self) -> u32 {
        self.header.package_type
    }

    pub fn numeric_id(&self) -> u32 {
        self.header.numeric_id
    }

    pub fn set_numeric_id(&mut self, id: u32) {
        self.header.numeric_id = id;
    }

    pub fn buffers_number(&self) -> u32 {
        self.header.buffers_number
    }

    fn payload_length(&self) -> usize {
        self.buffers
            .iter()
            .map(|b| BUFFER_DESCRIPTOR_SIZE + b.data.len())
            .sum()
    }

    fn wire_header(&self) -> Header {
        let mut header = self.header;
        header.payload_length = self.payload_length() as u32;
        header
    }

    /// Encode into header bytes and payload.
    pub fn encode(&self) -> Result<([u8; HEADER_SIZE], Bytes)> {
        let payload_length = self.payload_length();
        if payload_length > u32::MAX as usize {
            return Err(IoServiceError::Protocol(format!(
                "Package payload of {} bytes does not fit the wire format",
                payload_length
            )));
        }

        let mut payload = BytesMut::with_capacity(payload_length);
        for buffer in &self.buffers {
            payload.put_u16(buffer.encoding.tag());
            payload.put_u32(buffer.data.len() as u32);
            payload.extend_from_slice(&buffer.data);
        }

        Ok((self.wire_header().encode(), payload.freeze()))
    }

    /// Encode into one contiguous byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (header, payload) = self.encode()?;
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a complete package from its wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Package> {
        Header::validate_bytes(bytes)?;
        let header = Header::decode(bytes)
            .ok_or_else(|| IoServiceError::Protocol("Header truncated".to_string()))?;
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() != header.payload_length as usize {
            return Err(IoServiceError::Protocol(format!(
                "Payload length mismatch: header says {}, got {}",
                header.payload_length,
                payload.len()
            )));
        }
        Self::from_parts(header, Bytes::copy_from_slice(payload))
    }

    /// Decode a complete package and mark it as a response to `request`.
    pub fn from_bytes_response(bytes: &[u8], request: &Package) -> Result<Package> {
        let mut package = Self::from_bytes(bytes)?;
        package.header.parent_uuid = request.header.uuid;
        Ok(package)
    }

    /// Build a package from a validated header and its payload.
    pub(crate) fn from_parts(header: Header, mut payload: Bytes) -> Result<Package> {
        let mut buffers = Vec::with_capacity(header.buffers_number as usize);
        for index in 0..header.buffers_number {
            if payload.remaining() < BUFFER_DESCRIPTOR_SIZE {
                return Err(IoServiceError::Protocol(format!(
                    "Buffer {} descriptor truncated",
                    index
                )));
            }
            let encoding = Encoding::from_tag(payload.get_u16())?;
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(IoServiceError::Protocol(format!(
                    "Buffer {} claims {} bytes, {} left",
                    index,
                    len,
                    payload.remaining()
                )));
            }
            buffers.push(Buffer {
                encoding,
                data: payload.split_to(len),
            });
        }
        if payload.has_remaining() {
            return Err(IoServiceError::Protocol(format!(
                "{} trailing payload bytes",
                payload.remaining()
            )));
        }

        Ok(Package { header, buffers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn filled(buffers: u32) -> Package {
        let mut package = Package::create_instance(0, buffers);
        for i in 0..buffers {
            let data = vec![i as u8; (i as usize + 1) * 3];
            package.fill_buffer(i, Encoding::Raw, &data).unwrap();
        }
        package
    }

    #[test]
    fn test_create_instance() {
        for n in 0..5 {
            let package = Package::create_instance(0, n);
            assert_eq!(package.buffers_number(), n);
            assert_eq!(package.buffers().len(), n as usize);
            assert!(!package.uuid().is_nil());
            assert!(package.parent_uuid().is_nil());
            assert!(package.receiver_uuid().is_nil());
            assert!(!package.is_response());
        }
    }

    #[test]
    fn test_fill_buffer_out_of_range() {
        let mut package = Package::create_instance(0, 2);
        let err = package.fill_buffer(2, Encoding::Raw, b"x").unwrap_err();
        assert!(matches!(
            err,
            IoServiceError::BufferOutOfRange { index: 2, count: 2 }
        ));
        assert!(package.get_buffer(5).is_err());
    }

    #[test]
    fn test_get_buffer_returns_filled_data() {
        let mut package = Package::create_instance(0, 1);
        package.fill_buffer(0, Encoding::Raw, b"hello").unwrap();

        let buffer = package.get_buffer(0).unwrap();
        assert_eq!(buffer.encoding, Encoding::Raw);
        assert_eq!(&buffer.data[..], b"hello");
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_shallow_duplicate_shares_storage() {
        let original = filled(3);
        let copy = original.duplicate(false);

        assert_eq!(copy.uuid(), original.uuid());
        for i in 0..3 {
            let a = original.get_buffer(i).unwrap();
            let b = copy.get_buffer(i).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.data.as_ptr(), b.data.as_ptr());
        }
    }

    #[test]
    fn test_deep_duplicate_copies_storage() {
        let original = filled(3);
        let copy = original.duplicate(true);

        for i in 0..3 {
            let a = original.get_buffer(i).unwrap();
            let b = copy.get_buffer(i).unwrap();
            assert_eq!(a, b);
            assert_ne!(a.data.as_ptr(), b.data.as_ptr());
        }
    }

    #[test]
    fn test_direct_and_broadcast_responses() {
        let mut request = Package::create_instance(0, 0);
        request.set_sender_uuid(Uuid::new_v4());

        let mut broadcast = Package::create_instance(0, 0);
        broadcast.make_broadcast_response(&request);
        assert_eq!(broadcast.parent_uuid(), request.uuid());
        assert!(broadcast.receiver_uuid().is_nil());

        let mut direct = Package::create_instance(0, 0);
        direct.make_direct_response(&request);
        assert_eq!(direct.parent_uuid(), request.uuid());
        assert_eq!(direct.receiver_uuid(), request.sender_uuid());
    }

    #[test]
    fn test_wire_roundtrip_preserves_buffers() {
        let mut original = filled(4);
        original.set_sender_uuid(Uuid::new_v4());
        original.set_numeric_id(17);

        let bytes = original.to_bytes().unwrap();
        let decoded = Package::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.uuid(), original.uuid());
        assert_eq!(decoded.sender_uuid(), original.sender_uuid());
        assert_eq!(decoded.numeric_id(), 17);
        assert_eq!(decoded.buffers(), original.buffers());
        assert_eq!(decoded.buffers_size(), original.buffers_size());
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_from_bytes_response_links_parent() {
        let request = filled(0);
        let bytes = filled(2).to_bytes().unwrap();
        let response = Package::from_bytes_response(&bytes, &request).unwrap();
        assert_eq!(response.parent_uuid(), request.uuid());
        assert_eq!(response.buffers_number(), 2);
    }

    #[test]
    fn test_from_bytes_rejects_truncated_payload() {
        let bytes = filled(2).to_bytes().unwrap();
        assert!(Package::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_buffers_size() {
        let package = filled(3);
        assert_eq!(package.buffers_size(), 3 + 6 + 9);
    }

    #[test]
    fn test_typed_buffers() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Vm {
            name: String,
            cpus: u8,
        }

        let vm = Vm {
            name: "alpha".to_string(),
            cpus: 4,
        };
        let mut package = Package::create_instance(1, 2);
        package.fill_buffer_as(0, Encoding::MsgPack, &vm).unwrap();
        package.fill_buffer_as(1, Encoding::Json, &vm).unwrap();

        let decoded = Package::from_bytes(&package.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get_buffer_as::<Vm>(0).unwrap(), vm);
        assert_eq!(decoded.get_buffer_as::<Vm>(1).unwrap(), vm);
        assert!(package.fill_buffer_as(0, Encoding::Raw, &vm).is_err());
    }

    #[test]
    fn test_header_checksum_tracks_fields() {
        let mut package = filled(1);
        let before = package.header_checksum();
        package.set_receiver_uuid(Uuid::new_v4());
        assert_ne!(before, package.header_checksum());
    }
}
