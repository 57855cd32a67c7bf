//! Framing the duplex layer runs on.
//!
//! Every frame is a [`Header`] followed by `payload_length` bytes.
//! [`FrameBuffer`] turns arbitrary transport reads into whole [`Frame`]s.

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, FrameKind, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, RESERVED_STREAM_ID,
};
