//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented packages:
//! - `WaitingForHeader`: Need at least a full header
//! - `WaitingForPayload`: Header validated, need the rest of the package
//!
//! Nothing is consumed until a whole package is present, so the bytes left
//! in the buffer always start at a package boundary. A detach relies on that
//! to hand the unread tail to another endpoint.
//!
//! # Example
//!
//! ```ignore
//! use ioservice::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let packages = buffer.push(&chunk)?;
//!
//! for package in packages {
//!     println!("Got package of type {}", package.package_type());
//! }
//! ```

use bytes::BytesMut;

use super::package::Package;
use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header.
    WaitingForHeader,
    /// Header validated, waiting for the whole package.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete packages.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 1GB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete packages.
    ///
    /// # Errors
    ///
    /// Returns error on a corrupted header, an oversized payload or a
    /// malformed buffer layout. The link is unusable after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Package>> {
        self.buffer.extend_from_slice(data);

        let mut packages = Vec::new();
        while let Some(package) = self.try_extract_one()? {
            packages.push(package);
        }

        Ok(packages)
    }

    /// Try to extract a single package from the buffer.
    pub fn try_extract_one(&mut self) -> Result<Option<Package>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    // Peek only; the header stays in the buffer until the package is whole
                    let raw = &self.buffer[..HEADER_SIZE];
                    Header::validate_bytes(raw)?;
                    let Some(header) = Header::decode(raw) else {
                        return Ok(None);
                    };
                    header.validate(self.max_payload_size)?;

                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let total = HEADER_SIZE + header.payload_length as usize;
                    if self.buffer.len() < total {
                        return Ok(None);
                    }

                    let header = *header;
                    let mut frame = self.buffer.split_to(total);
                    let payload = frame.split_off(HEADER_SIZE).freeze();
                    self.state = State::WaitingForHeader;

                    return Package::from_parts(header, payload).map(Some);
                }
            }
        }
    }

    /// Append data without extracting packages.
    ///
    /// Pair with [`FrameBuffer::try_extract_one`] to pull one package at a time.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take every unconsumed byte, starting at a package boundary.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.state = State::WaitingForHeader;
        self.buffer.split()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
