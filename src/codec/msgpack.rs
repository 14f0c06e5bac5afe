//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named`, so field names travel with the
//! data and peers built against a newer struct layout can still read them.
//!
//! # Example
//!
//! ```
//! use ioservice::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct VmState {
//!     id: u32,
//!     running: bool,
//! }
//!
//! let state = VmState { id: 42, running: true };
//! let encoded = MsgPackCodec::encode(&state).unwrap();
//! let decoded: VmState = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, state);
//! ```

use crate::error::Result;

/// MessagePack codec for structured buffers.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct DeviceV1 {
        index: u32,
        name: String,
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct DeviceV2 {
        index: u32,
        name: String,
        #[serde(default)]
        connected: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = DeviceV1 {
            index: 3,
            name: "hdd".to_string(),
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: DeviceV1 = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_named_fields_tolerate_new_layout() {
        let old = DeviceV1 {
            index: 1,
            name: "cdrom".to_string(),
        };
        let encoded = MsgPackCodec::encode(&old).unwrap();

        let newer: DeviceV2 = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(newer.index, 1);
        assert_eq!(newer.name, "cdrom");
        assert!(!newer.connected);
    }

    #[test]
    fn test_decode_invalid_data() {
        let result: Result<DeviceV1> = MsgPackCodec::decode(&[0xC1]);
        assert!(result.is_err());
    }
}
