//! Per-stream lifecycle state and the reset signal.
//!
//! Every exchange has one [`StreamShared`] referenced by its reader, its
//! writer, its listener task and the dispatcher's stream table. The state
//! lock is never held across an `.await`; waiting on a reset goes through a
//! `watch` channel so blocked readers wake as soon as it is set.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::codec::MsgPackCodec;
use crate::error::{DuplexError, Result};

/// Stream states, combining both directions.
///
/// `Local` is the direction this endpoint writes, `Remote` the one it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// We sent END_STREAM; the peer may still send.
    HalfClosedLocal,
    /// The peer sent END_STREAM; we may still send.
    HalfClosedRemote,
    Closed,
    /// Terminal abort of both directions.
    Reset,
}

impl StreamState {
    /// Whether the peer may still send frames on this stream.
    pub fn can_recv(self) -> bool {
        matches!(
            self,
            StreamState::Idle | StreamState::Open | StreamState::HalfClosedLocal
        )
    }

    /// Whether this endpoint may still send frames on this stream.
    pub fn can_send(self) -> bool {
        matches!(
            self,
            StreamState::Idle | StreamState::Open | StreamState::HalfClosedRemote
        )
    }

    /// Whether the stream has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Reset)
    }
}

/// Why a stream was reset. Codes follow HTTP/2 error code numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetCode {
    ProtocolError,
    InternalError,
    RefusedStream,
    Cancel,
    /// Local only: the transport went away. Never sent on the wire.
    ConnectionClosed,
}

impl ResetCode {
    /// Numeric code carried in RST_STREAM payloads.
    pub fn as_u32(self) -> u32 {
        match self {
            ResetCode::ProtocolError => 0x1,
            ResetCode::InternalError => 0x2,
            ResetCode::RefusedStream => 0x7,
            ResetCode::Cancel => 0x8,
            ResetCode::ConnectionClosed => 0xff,
        }
    }

    /// Map a wire code back; unknown codes read as `InternalError`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x1 => ResetCode::ProtocolError,
            0x7 => ResetCode::RefusedStream,
            0x8 => ResetCode::Cancel,
            0xff => ResetCode::ConnectionClosed,
            _ => ResetCode::InternalError,
        }
    }
}

/// Code plus human-readable detail for a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReason {
    pub code: ResetCode,
    pub message: String,
}

#[derive(Serialize, Deserialize)]
struct ResetPayload {
    code: u32,
    message: String,
}

impl ResetReason {
    pub fn new(code: ResetCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Encode as an RST_STREAM payload.
    pub fn encode(&self) -> Result<Bytes> {
        let payload = ResetPayload {
            code: self.code.as_u32(),
            message: self.message.clone(),
        };
        Ok(Bytes::from(MsgPackCodec::encode(&payload)?))
    }

    /// Decode an RST_STREAM payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let decoded: ResetPayload = MsgPackCodec::decode(payload)?;
        Ok(Self::new(ResetCode::from_u32(decoded.code), decoded.message))
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message)
        }
    }
}

const WRITER_FREE: u8 = 0;
const WRITER_IN_RESPONDER: u8 = 1;
const WRITER_DROPPED_IN_RESPONDER: u8 = 2;

/// State shared by every handle of one stream.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
    reset_tx: watch::Sender<Option<ResetReason>>,
    /// Whether the responder callback still owns the writer's fate.
    writer_phase: AtomicU8,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Arc<Self> {
        let (reset_tx, _) = watch::channel(None);
        Arc::new(Self {
            id,
            state: Mutex::new(StreamState::Idle),
            reset_tx,
            writer_phase: AtomicU8::new(WRITER_FREE),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn state(&self) -> StreamState {
        *self.lock()
    }

    /// First frame sent or received.
    pub(crate) fn open(&self) {
        let mut state = self.lock();
        if *state == StreamState::Idle {
            *state = StreamState::Open;
        }
    }

    /// END_STREAM sent by us. Returns the resulting state.
    pub(crate) fn send_end(&self) -> StreamState {
        let mut state = self.lock();
        *state = match *state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        *state
    }

    /// END_STREAM received from the peer. Returns the resulting state.
    pub(crate) fn recv_end(&self) -> StreamState {
        let mut state = self.lock();
        *state = match *state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        *state
    }

    /// Apply a reset. Returns `false` if the stream was already reset or
    /// closed, in which case nothing changes.
    pub(crate) fn reset(&self, reason: ResetReason) -> bool {
        {
            let mut state = self.lock();
            if state.is_terminal() {
                return false;
            }
            *state = StreamState::Reset;
        }
        self.reset_tx.send_replace(Some(reason));
        true
    }

    pub(crate) fn reset_reason(&self) -> Option<ResetReason> {
        self.reset_tx.borrow().clone()
    }

    /// Fail with `StreamReset` if the stream has been reset.
    pub(crate) fn check_reset(&self) -> Result<()> {
        match self.reset_reason() {
            Some(reason) => Err(DuplexError::StreamReset(reason)),
            None => Ok(()),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<ResetReason>> {
        self.reset_tx.subscribe()
    }

    /// The responder callback is about to run with this stream's writer.
    pub(crate) fn enter_responder(&self) {
        self.writer_phase.store(WRITER_IN_RESPONDER, Ordering::SeqCst);
    }

    /// The responder callback returned. Returns `true` if the writer was
    /// dropped while it ran.
    pub(crate) fn leave_responder(&self) -> bool {
        self.writer_phase.swap(WRITER_FREE, Ordering::SeqCst) == WRITER_DROPPED_IN_RESPONDER
    }

    /// Record a dropped writer. Returns `false` outside a responder
    /// callback, when the caller must reset the stream itself.
    pub(crate) fn defer_writer_drop(&self) -> bool {
        self.writer_phase
            .compare_exchange(
                WRITER_IN_RESPONDER,
                WRITER_DROPPED_IN_RESPONDER,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
