//! The fixed 10-byte frame header.
//!
//! ```text
//! 0               4      5       6               10
//! ┌───────────────┬──────┬───────┬───────────────┐
//! │ stream id     │ kind │ flags │ payload len   │
//! │ u32 BE        │ u8   │ u8    │ u32 BE        │
//! └───────────────┴──────┴───────┴───────────────┘
//! ```

use bytes::{Buf, BufMut};

use crate::error::{DuplexError, Result};

pub const HEADER_SIZE: usize = 10;

/// Largest payload accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Stream 0 addresses the connection itself and never carries an exchange.
pub const RESERVED_STREAM_ID: u32 = 0;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Body bytes for one direction of a stream.
    Data = 0x0,
    /// A metadata frame.
    Headers = 0x1,
    /// Aborts both directions of a stream.
    RstStream = 0x3,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::try_from(value).ok()
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = DuplexError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Data),
            0x1 => Ok(Self::Headers),
            0x3 => Ok(Self::RstStream),
            other => Err(DuplexError::Protocol(format!(
                "Unknown frame kind 0x{:02x}",
                other
            ))),
        }
    }
}

pub mod flags {
    /// No more frames follow on this direction of the stream.
    pub const END_STREAM: u8 = 0x01;

    /// Bits that must be zero on the wire.
    pub const RESERVED_MASK: u8 = !END_STREAM;
}

/// A header as read off the wire.
///
/// `kind` stays a raw byte so a header with an unknown kind can still be
/// decoded and reported by [`validate`](Header::validate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Odd ids are opened by clients, even ids by servers.
    pub stream_id: u32,
    pub kind: u8,
    pub flags: u8,
    pub payload_length: u32,
}

impl Header {
    pub fn new(stream_id: u32, kind: FrameKind, flags: u8, payload_length: u32) -> Self {
        Self {
            stream_id,
            kind: kind as u8,
            flags,
            payload_length,
        }
    }

    /// ```
    /// use duplexwire::protocol::{flags, FrameKind, Header};
    ///
    /// let bytes = Header::new(1, FrameKind::Data, flags::END_STREAM, 100).encode();
    /// assert_eq!(bytes, [0, 0, 0, 1, 0, 1, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut cursor = &mut out[..];
        cursor.put_u32(self.stream_id);
        cursor.put_u8(self.kind);
        cursor.put_u8(self.flags);
        cursor.put_u32(self.payload_length);
        out
    }

    /// Decode the first [`HEADER_SIZE`] bytes of `buf`, or `None` if fewer
    /// are available. No validation happens here.
    ///
    /// ```
    /// use duplexwire::protocol::Header;
    ///
    /// let header = Header::decode(&[0, 0, 0, 3, 1, 1, 0, 0, 0, 42]).unwrap();
    /// assert_eq!((header.stream_id, header.payload_length), (3, 42));
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut buf = buf.get(..HEADER_SIZE)?;
        Some(Self {
            stream_id: buf.get_u32(),
            kind: buf.get_u8(),
            flags: buf.get_u8(),
            payload_length: buf.get_u32(),
        })
    }

    /// Reject headers no well-behaved peer sends: the reserved stream, an
    /// unknown kind, a payload over `max_payload_size`, or reserved flag
    /// bits.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.stream_id == RESERVED_STREAM_ID {
            return Err(DuplexError::Protocol(
                "Frame addressed to reserved stream 0".into(),
            ));
        }
        FrameKind::try_from(self.kind)?;
        if self.payload_length > max_payload_size {
            return Err(DuplexError::Protocol(format!(
                "Frame payload of {} bytes exceeds maximum of {}",
                self.payload_length, max_payload_size
            )));
        }
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(DuplexError::Protocol(format!(
                "Reserved flag bits set: 0x{:02x}",
                self.flags
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn frame_kind(&self) -> Option<FrameKind> {
        FrameKind::from_u8(self.kind)
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    #[inline]
    pub fn is_client_initiated(&self) -> bool {
        self.stream_id % 2 == 1
    }
}
