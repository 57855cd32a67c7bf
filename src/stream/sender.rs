//! Outbound frame path for one stream.
//!
//! Wraps the connection's [`WriterHandle`] with the stream's id and state,
//! and tells the dispatcher when the stream is finished with.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::state::{ResetReason, StreamShared, StreamState};
use crate::dispatcher::Command;
use crate::error::{DuplexError, Result};
use crate::metadata::Metadata;
use crate::protocol::{flags, FrameKind, Header, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{OutboundFrame, WriterHandle};

/// Build an RST_STREAM frame for `stream_id`.
pub(crate) fn rst_frame(stream_id: u32, reason: &ResetReason) -> Result<OutboundFrame> {
    let payload = reason.encode()?;
    let header = Header::new(stream_id, FrameKind::RstStream, 0, payload.len() as u32);
    Ok(OutboundFrame::new(&header, payload))
}

#[derive(Clone)]
pub(crate) struct StreamSender {
    shared: Arc<StreamShared>,
    writer: WriterHandle,
    commands: mpsc::UnboundedSender<Command>,
    max_payload_size: u32,
}

impl StreamSender {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        writer: WriterHandle,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            shared,
            writer,
            commands,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Refuse to queue payloads the peer would reject.
    pub(crate) fn with_max_payload(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub(crate) fn stream_id(&self) -> u32 {
        self.shared.id()
    }

    /// Send a DATA frame. `end` sets END_STREAM and half-closes our side.
    pub(crate) async fn send_data(&self, payload: Bytes, end: bool) -> Result<()> {
        self.shared.check_reset()?;
        let frame_flags = if end { flags::END_STREAM } else { 0 };
        let frame = self.frame(FrameKind::Data, frame_flags, payload)?;

        self.shared.open();
        self.enqueue(frame).await?;

        if end {
            self.local_end();
        }
        Ok(())
    }

    /// Send a HEADERS frame.
    ///
    /// Metadata larger than the payload limit fails before anything is
    /// queued, leaving the stream usable.
    pub(crate) async fn send_headers(&self, metadata: &Metadata) -> Result<()> {
        self.shared.check_reset()?;
        let frame = self.frame(FrameKind::Headers, 0, metadata.encode()?)?;

        self.shared.open();
        self.enqueue(frame).await
    }

    /// Reset the stream locally and tell the peer.
    ///
    /// A no-op if the stream already reached a terminal state.
    pub(crate) async fn reset(&self, reason: ResetReason) -> Result<()> {
        if !self.shared.reset(reason.clone()) {
            return Ok(());
        }
        tracing::debug!("Resetting stream {}: {}", self.stream_id(), reason);
        let _ = self.commands.send(Command::Release(self.stream_id()));
        self.writer.send(rst_frame(self.stream_id(), &reason)?).await
    }

    /// Like [`reset`](Self::reset) but never waits, for use from `Drop`.
    pub(crate) fn abandon(&self, reason: ResetReason) {
        if !self.shared.reset(reason.clone()) {
            return;
        }
        tracing::debug!("Abandoning stream {}: {}", self.stream_id(), reason);
        let _ = self.commands.send(Command::Release(self.stream_id()));

        let sent = rst_frame(self.stream_id(), &reason)
            .and_then(|frame| self.writer.send_detached(frame));
        if let Err(e) = sent {
            tracing::debug!("Could not send reset for stream {}: {}", self.stream_id(), e);
        }
    }

    fn frame(&self, kind: FrameKind, frame_flags: u8, payload: Bytes) -> Result<OutboundFrame> {
        if payload.len() as u64 > self.max_payload_size as u64 {
            return Err(DuplexError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }
        let header = Header::new(self.stream_id(), kind, frame_flags, payload.len() as u32);
        Ok(OutboundFrame::new(&header, payload))
    }

    /// Queue a frame, giving up as soon as the stream is reset.
    async fn enqueue(&self, frame: OutboundFrame) -> Result<()> {
        let mut reset_rx = self.shared.subscribe();
        tokio::select! {
            biased;

            sent = self.writer.send(frame) => sent,
            reset = reset_rx.wait_for(Option::is_some) => {
                let reason = reset.ok().and_then(|reason| (*reason).clone());
                Err(reason.map_or(DuplexError::ConnectionClosed, DuplexError::StreamReset))
            }
        }
    }

    fn local_end(&self) {
        if self.shared.send_end() == StreamState::Closed {
            let _ = self.commands.send(Command::Release(self.stream_id()));
        }
    }
}
