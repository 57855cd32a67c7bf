//! A decoded frame: header plus payload.
//!
//! ```
//! use bytes::Bytes;
//! use duplexwire::protocol::{flags, Frame, FrameKind, Header};
//!
//! let frame = Frame::new(
//!     Header::new(1, FrameKind::Data, flags::END_STREAM, 5),
//!     Bytes::from_static(b"hello"),
//! );
//! assert!(frame.is_end_stream());
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{FrameKind, Header};

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// `None` only for frames built by hand; decoded frames are validated.
    #[inline]
    pub fn kind(&self) -> Option<FrameKind> {
        self.header.frame_kind()
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.header.is_end_stream()
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Encode `header` followed by `payload` into one contiguous buffer.
///
/// The writer task never uses this; it writes header and payload as
/// separate slices. Handy for tests and for feeding a [`super::FrameBuffer`].
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    [&header.encode()[..], payload].concat()
}
