//! Protocol module - package model, wire format and framing.
//!
//! - Fixed-size package header with CRC-16 checksum
//! - Package with typed buffers
//! - Frame buffer for accumulating partial reads

mod frame_buffer;
mod package;
mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use package::{Buffer, Package};
pub use wire_format::{
    mng, Encoding, Header, BUFFER_DESCRIPTOR_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
    PACKAGE_MAGIC, PROTOCOL_VERSION,
};
