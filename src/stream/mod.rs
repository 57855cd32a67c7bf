//! Per-stream machinery: lifecycle state, body channels, metadata delivery.

mod body;
mod listener;
mod sender;
mod sink;
mod state;

pub use body::{BodyReader, BodyWriter};
pub use listener::{HeaderListener, RecordingListener};
pub use sink::MetadataSink;
pub use state::{ResetCode, ResetReason, StreamState};

pub(crate) use body::Inbound;
pub(crate) use listener::{spawn_listener_task, ListenerEvent, ListenerHandle};
pub(crate) use sender::{rst_frame, StreamSender};
pub(crate) use state::StreamShared;
