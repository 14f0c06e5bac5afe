//! Codec module - structured encodings for package buffers.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`, struct-as-map)
//! - [`JsonCodec`] - JSON using `serde_json`
//!
//! Raw buffers need no codec; they are stored as given.
//!
//! # Design
//!
//! Codecs are implemented as marker structs with static methods rather than trait objects.
//! [`Package::fill_buffer_as`](crate::protocol::Package::fill_buffer_as) picks one from the
//! buffer's [`Encoding`](crate::protocol::Encoding) tag.

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
