//! Incremental frame decoding from arbitrary transport reads.
//!
//! A read may end anywhere: mid-header, mid-payload, or across several
//! frames. [`FrameBuffer`] keeps the unconsumed bytes in one `BytesMut` and
//! remembers a header once it has been decoded and validated, so a large
//! payload is never re-validated while it trickles in.

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial read buffer capacity.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates transport bytes and splits them into frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Header of the frame whose payload is still arriving.
    header: Option<Header>,
    max_payload_size: u32,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Reject frames whose payload exceeds `max_payload_size`.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            header: None,
            max_payload_size,
        }
    }

    /// Append `data` and return every frame it completes, in order.
    ///
    /// # Errors
    ///
    /// Fails on the first header that does not validate (reserved stream
    /// id, unknown kind, reserved flag bits, oversized payload). The buffer
    /// is unusable afterwards; the connection has lost framing.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                let Some(header) = Header::decode(&self.buffer) else {
                    return Ok(None);
                };
                header.validate(self.max_payload_size)?;
                let _ = self.buffer.split_to(HEADER_SIZE);
                header
            }
        };

        let len = header.payload_length as usize;
        if self.buffer.len() < len {
            self.header = Some(header);
            return Ok(None);
        }

        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame::new(header, payload)))
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a header has been decoded and its payload is pending.
    pub fn awaiting_payload(&self) -> bool {
        self.header.is_some()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
