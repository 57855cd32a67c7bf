//! Connection dispatcher: the single owner of the stream table.
//!
//! One task per connection reads frames from the transport and routes them
//! to per-stream body queues and listener tasks. Exchanges never touch the
//! table directly; they send [`Command`]s, which are handled ahead of
//! inbound frames so a locally opened stream is registered before any
//! response to it can be routed.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use crate::config::{ConnectionConfig, Role};
use crate::error::{DuplexError, Result};
use crate::handler::ResponderRegistry;
use crate::metadata::{Metadata, MetadataFrame};
use crate::protocol::{Frame, FrameBuffer, FrameKind};
use crate::stream::{
    rst_frame, spawn_listener_task, BodyReader, BodyWriter, Inbound, ListenerEvent, MetadataSink,
    ResetCode, ResetReason, StreamSender, StreamShared, StreamState,
};
use crate::writer::WriterHandle;

/// Transport read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Requests from exchanges and the connection handle.
pub(crate) enum Command {
    /// Register a locally initiated stream.
    Open { stream_id: u32, entry: StreamEntry },
    /// The stream may be finished with; dropped if it is terminal.
    Release(u32),
    /// Stop reading and reset every live stream.
    Shutdown,
}

/// Dispatcher-side view of one live stream.
pub(crate) struct StreamEntry {
    shared: Arc<StreamShared>,
    body_tx: mpsc::UnboundedSender<Inbound>,
    listener_tx: mpsc::UnboundedSender<ListenerEvent>,
    /// Body bytes received so far, stamped on each metadata frame.
    offset: u64,
    /// Fired by the first frame from the peer.
    opened: Option<oneshot::Sender<()>>,
}

impl StreamEntry {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        body_tx: mpsc::UnboundedSender<Inbound>,
        listener_tx: mpsc::UnboundedSender<ListenerEvent>,
        opened: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self {
            shared,
            body_tx,
            listener_tx,
            offset: 0,
            opened,
        }
    }

    fn resolve_opened(&mut self) {
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(());
        }
    }
}

pub(crate) struct Dispatcher {
    role: Role,
    streams: HashMap<u32, StreamEntry>,
    registry: Arc<ResponderRegistry>,
    writer: WriterHandle,
    /// Handed to responder-side streams.
    commands: mpsc::UnboundedSender<Command>,
    max_frame_size: usize,
    max_payload_size: u32,
    /// Highest stream id the peer has opened.
    last_peer_stream: u32,
}

impl Dispatcher {
    pub(crate) fn new(
        config: &ConnectionConfig,
        registry: Arc<ResponderRegistry>,
        writer: WriterHandle,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            role: config.role,
            streams: HashMap::new(),
            registry,
            writer,
            commands,
            max_frame_size: config.max_frame_size,
            max_payload_size: config.max_payload_size,
            last_peer_stream: 0,
        }
    }

    /// Main loop. Returns when the transport closes, fails, or a shutdown
    /// is requested; every stream still live at that point is reset and
    /// the writer is closed so the peer sees end-of-stream.
    pub(crate) async fn run<R>(
        mut self,
        mut reader: R,
        mut commands_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame_buffer = FrameBuffer::with_max_payload(self.max_payload_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = loop {
            tokio::select! {
                biased;

                command = commands_rx.recv() => match command {
                    Some(Command::Open { stream_id, entry }) => {
                        tracing::trace!("Opened stream {}", stream_id);
                        self.streams.insert(stream_id, entry);
                    }
                    Some(Command::Release(stream_id)) => self.release(stream_id),
                    Some(Command::Shutdown) | None => {
                        tracing::debug!("Dispatcher shutting down");
                        break Ok(());
                    }
                },

                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            tracing::debug!("Transport closed by peer");
                            break Ok(());
                        }
                        Ok(n) => n,
                        Err(e) => break Err(DuplexError::Io(e)),
                    };

                    match frame_buffer.push(&buf[..n]) {
                        Ok(frames) => {
                            for frame in frames {
                                self.on_frame(frame);
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        if let Err(e) = &result {
            tracing::error!("Dispatcher stopped: {}", e);
        }
        let message = match &result {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };
        self.reset_all(ResetReason::new(ResetCode::ConnectionClosed, message));
        self.writer.close();
        result
    }

    fn on_frame(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        let end = frame.is_end_stream();

        match frame.kind() {
            Some(FrameKind::Data) => self.on_data(stream_id, frame.payload, end),
            Some(FrameKind::Headers) => self.on_headers(stream_id, &frame.payload, end),
            Some(FrameKind::RstStream) => self.on_rst(stream_id, &frame.payload),
            // Rejected by FrameBuffer validation.
            None => {}
        }
    }

    fn on_data(&mut self, stream_id: u32, payload: Bytes, end: bool) {
        let Some(entry) = self.receivable(stream_id, "DATA") else {
            return;
        };

        entry.offset += payload.len() as u64;
        if !payload.is_empty() {
            let _ = entry.body_tx.send(Inbound::Data(payload));
        }
        if end {
            self.end_remote(stream_id);
        }
    }

    fn on_headers(&mut self, stream_id: u32, payload: &[u8], end: bool) {
        let metadata = match Metadata::decode(payload) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("Malformed metadata on stream {}: {}", stream_id, e);
                self.fail_stream(
                    stream_id,
                    ResetReason::new(ResetCode::ProtocolError, format!("malformed metadata: {}", e)),
                );
                return;
            }
        };

        if !self.streams.contains_key(&stream_id) {
            if self.role.owns(stream_id) {
                tracing::debug!("Dropping HEADERS for unknown stream {}", stream_id);
                return;
            }
            if stream_id <= self.last_peer_stream {
                tracing::warn!(
                    "Peer opened stream {} after stream {}",
                    stream_id,
                    self.last_peer_stream
                );
                let message = format!(
                    "stream {} is not above last opened stream {}",
                    stream_id, self.last_peer_stream
                );
                self.send_rst(stream_id, &ResetReason::new(ResetCode::ProtocolError, message));
                return;
            }
            self.last_peer_stream = stream_id;
            self.accept(stream_id, metadata, end);
            return;
        }

        let Some(entry) = self.receivable(stream_id, "HEADERS") else {
            return;
        };
        let frame = MetadataFrame {
            stream_id,
            offset: entry.offset,
            metadata,
        };
        let _ = entry.listener_tx.send(ListenerEvent::Frame(frame));
        if end {
            self.end_remote(stream_id);
        }
    }

    fn on_rst(&mut self, stream_id: u32, payload: &[u8]) {
        let reason = ResetReason::decode(payload).unwrap_or_else(|e| {
            tracing::debug!("Malformed RST_STREAM on stream {}: {}", stream_id, e);
            ResetReason::new(ResetCode::InternalError, "malformed RST_STREAM")
        });

        match self.streams.remove(&stream_id) {
            Some(entry) => {
                tracing::debug!("Stream {} reset by peer: {}", stream_id, reason);
                entry.shared.reset(reason);
            }
            None => tracing::debug!("Dropping RST_STREAM for unknown stream {}", stream_id),
        }
    }

    /// Set up a peer-initiated stream and hand it to its responder.
    fn accept(&mut self, stream_id: u32, metadata: Metadata, end: bool) {
        let Some(responder) = self.registry.route(&metadata) else {
            let route = format!(
                "{} {}",
                metadata.method().unwrap_or("-"),
                metadata.path().unwrap_or("-")
            );
            tracing::warn!("No responder for stream {} ({})", stream_id, route);
            self.send_rst(
                stream_id,
                &ResetReason::new(ResetCode::RefusedStream, format!("no responder for {}", route)),
            );
            return;
        };

        let shared = StreamShared::new(stream_id);
        shared.open();

        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        spawn_listener_task(shared.clone(), listener_rx);

        let body = BodyReader::new(shared.clone(), body_rx);
        let sender = StreamSender::new(shared.clone(), self.writer.clone(), self.commands.clone())
            .with_max_payload(self.max_payload_size);
        let sink = MetadataSink::new(BodyWriter::new(sender, self.max_frame_size));

        // A sink dropped inside the callback is settled below, after the
        // outcome is known.
        shared.enter_responder();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            responder.on_request(metadata, body, sink)
        }));
        let sink_dropped = shared.leave_responder();

        let failure = match outcome {
            Ok(Ok(listener)) => {
                let _ = listener_tx.send(ListenerEvent::Register(listener));
                None
            }
            Ok(Err(e)) => Some(DuplexError::CallbackFailure(e.to_string())),
            Err(panic) => Some(DuplexError::CallbackFailure(panic_message(&*panic))),
        };

        if let Some(err) = failure {
            tracing::error!("Stream {}: {}", stream_id, err);
            let reason = ResetReason::new(ResetCode::InternalError, err.to_string());
            shared.reset(reason.clone());
            self.send_rst(stream_id, &reason);
            return;
        }
        if sink_dropped {
            tracing::debug!("Responder for stream {} dropped its sink", stream_id);
            let reason = ResetReason::new(ResetCode::Cancel, "body writer dropped before close");
            if shared.reset(reason.clone()) {
                self.send_rst(stream_id, &reason);
            }
            return;
        }

        tracing::debug!("Accepted stream {}", stream_id);
        self.streams
            .insert(stream_id, StreamEntry::new(shared, body_tx, listener_tx, None));
        if end {
            self.end_remote(stream_id);
        }
    }

    /// The entry for a frame the peer is allowed to send right now.
    ///
    /// DATA or HEADERS after the peer's END_STREAM resets the stream.
    fn receivable(&mut self, stream_id: u32, kind: &str) -> Option<&mut StreamEntry> {
        let Some(state) = self.streams.get(&stream_id).map(|e| e.shared.state()) else {
            tracing::debug!("Dropping {} for unknown stream {}", kind, stream_id);
            return None;
        };

        if state == StreamState::HalfClosedRemote {
            let err = DuplexError::OrderingViolation(format!(
                "{} on stream {} after END_STREAM",
                kind, stream_id
            ));
            tracing::warn!("{}", err);
            self.fail_stream(
                stream_id,
                ResetReason::new(ResetCode::ProtocolError, err.to_string()),
            );
            return None;
        }
        if !state.can_recv() {
            tracing::trace!("Dropping {} for finished stream {}", kind, stream_id);
            return None;
        }

        let entry = self.streams.get_mut(&stream_id)?;
        entry.resolve_opened();
        Some(entry)
    }

    fn end_remote(&mut self, stream_id: u32) {
        let Some(entry) = self.streams.get(&stream_id) else {
            return;
        };
        let _ = entry.body_tx.send(Inbound::End);
        if entry.shared.recv_end() == StreamState::Closed {
            tracing::trace!("Stream {} closed", stream_id);
            self.streams.remove(&stream_id);
        }
    }

    fn release(&mut self, stream_id: u32) {
        let finished = self
            .streams
            .get(&stream_id)
            .is_some_and(|e| e.shared.state().is_terminal());
        if finished {
            tracing::trace!("Released stream {}", stream_id);
            self.streams.remove(&stream_id);
        }
    }

    /// Reset a stream locally and tell the peer.
    fn fail_stream(&mut self, stream_id: u32, reason: ResetReason) {
        if let Some(entry) = self.streams.remove(&stream_id) {
            entry.shared.reset(reason.clone());
        }
        self.send_rst(stream_id, &reason);
    }

    /// Queue an RST_STREAM. Never blocks the read loop on backpressure.
    fn send_rst(&self, stream_id: u32, reason: &ResetReason) {
        let sent = rst_frame(stream_id, reason).and_then(|frame| self.writer.send_detached(frame));
        if let Err(e) = sent {
            tracing::debug!("Could not send reset for stream {}: {}", stream_id, e);
        }
    }

    fn reset_all(&mut self, reason: ResetReason) {
        if !self.streams.is_empty() {
            tracing::debug!("Resetting {} live streams: {}", self.streams.len(), reason);
        }
        for (_, entry) in self.streams.drain() {
            entry.shared.reset(reason.clone());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("responder panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("responder panicked: {}", msg)
    } else {
        "responder panicked".to_string()
    }
}
