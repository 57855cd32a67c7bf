//! Body channel halves: [`BodyWriter`] for the outgoing direction and
//! [`BodyReader`] for the incoming one.
//!
//! Reads never return bytes that span a metadata frame: each DATA frame is
//! queued as its own chunk, so after any read [`BodyReader::position`] can be
//! compared with [`MetadataFrame::offset`](crate::MetadataFrame::offset).

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};

use super::sender::StreamSender;
use super::state::{ResetCode, ResetReason, StreamShared};
use crate::error::{DuplexError, Result};

/// What the dispatcher queues for a reader.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    End,
}

/// Write half of a body channel.
///
/// Writes are buffered until [`flush`](Self::flush), until a full frame's
/// worth accumulates, or until a metadata frame or close forces them out.
pub struct BodyWriter {
    sender: StreamSender,
    buffer: BytesMut,
    max_frame_size: usize,
    closed: bool,
}

impl BodyWriter {
    pub(crate) fn new(sender: StreamSender, max_frame_size: usize) -> Self {
        Self {
            sender,
            buffer: BytesMut::new(),
            max_frame_size: max_frame_size.max(1),
            closed: false,
        }
    }

    /// Stream this writer belongs to.
    pub fn stream_id(&self) -> u32 {
        self.sender.stream_id()
    }

    /// Bytes written but not yet handed to the transport.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether `close_write` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append bytes to the outgoing body.
    ///
    /// Only suspends when a full frame is ready and the writer task is
    /// applying backpressure.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.buffer.extend_from_slice(data);

        while self.buffer.len() >= self.max_frame_size {
            let chunk = self.buffer.split_to(self.max_frame_size).freeze();
            self.sender.send_data(chunk, false).await?;
        }
        Ok(())
    }

    /// Convenience for UTF-8 text.
    pub async fn write_str(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await
    }

    /// Hand every buffered byte to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.flush_buffer().await
    }

    /// Flush and send END_STREAM. Terminal: a second call, like any later
    /// write, fails with [`DuplexError::ChannelClosed`].
    pub async fn close_write(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.closed = true;

        let last = self.buffer.split().freeze();
        self.sender.send_data(last, true).await
    }

    /// Abort the whole exchange, both directions.
    pub async fn reset(&mut self, code: ResetCode, message: &str) -> Result<()> {
        self.closed = true;
        self.buffer.clear();
        self.sender.reset(ResetReason::new(code, message)).await
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.closed {
            return Err(DuplexError::ChannelClosed);
        }
        self.sender.shared().check_reset()
    }

    pub(crate) async fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = self.buffer.split().freeze();
        self.sender.send_data(chunk, false).await
    }

    pub(crate) fn sender(&self) -> &StreamSender {
        &self.sender
    }
}

/// A writer dropped before `close_write` cancels the exchange, so the peer
/// is not left waiting for an END_STREAM that never comes.
impl Drop for BodyWriter {
    fn drop(&mut self) {
        if self.closed || std::thread::panicking() {
            return;
        }
        let shared = self.sender.shared();
        if shared.state().is_terminal() || shared.defer_writer_drop() {
            return;
        }
        self.sender
            .abandon(ResetReason::new(ResetCode::Cancel, "body writer dropped before close"));
    }
}

/// Read half of a body channel.
pub struct BodyReader {
    shared: Arc<StreamShared>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    reset_rx: watch::Receiver<Option<ResetReason>>,
    leftover: Bytes,
    position: u64,
    finished: bool,
}

impl BodyReader {
    pub(crate) fn new(shared: Arc<StreamShared>, rx: mpsc::UnboundedReceiver<Inbound>) -> Self {
        let reset_rx = shared.subscribe();
        Self {
            shared,
            rx,
            reset_rx,
            leftover: Bytes::new(),
            position: 0,
            finished: false,
        }
    }

    /// Stream this reader belongs to.
    pub fn stream_id(&self) -> u32 {
        self.shared.id()
    }

    /// Body bytes returned to the caller so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether end-of-stream has been returned.
    pub fn is_finished(&self) -> bool {
        self.finished && self.leftover.is_empty()
    }

    /// Next chunk of body bytes, `None` at end-of-stream.
    ///
    /// Suspends until data, end-of-stream or a reset arrives. A reset wins
    /// over data still queued.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let chunk = self.next_chunk().await?;
        if let Some(chunk) = &chunk {
            self.position += chunk.len() as u64;
        }
        Ok(chunk)
    }

    /// Read into `buf`, returning 0 at end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut chunk = match self.next_chunk().await? {
            Some(chunk) => chunk,
            None => return Ok(0),
        };

        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        self.leftover = chunk.split_off(n);
        self.position += n as u64;
        Ok(n)
    }

    /// Read everything up to end-of-stream.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Read everything up to end-of-stream as UTF-8.
    pub async fn read_to_string(&mut self) -> Result<String> {
        let body = self.read_to_end().await?;
        String::from_utf8(body.to_vec())
            .map_err(|e| DuplexError::Protocol(format!("Body is not valid UTF-8: {}", e)))
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if let Some(reason) = self.reset_rx.borrow_and_update().clone() {
            return Err(DuplexError::StreamReset(reason));
        }
        if !self.leftover.is_empty() {
            return Ok(Some(std::mem::take(&mut self.leftover)));
        }
        if self.finished {
            return Ok(None);
        }

        loop {
            tokio::select! {
                biased;

                changed = self.reset_rx.changed() => {
                    if changed.is_ok() {
                        if let Some(reason) = self.reset_rx.borrow_and_update().clone() {
                            return Err(DuplexError::StreamReset(reason));
                        }
                    }
                }

                item = self.rx.recv() => match item {
                    Some(Inbound::Data(bytes)) if bytes.is_empty() => continue,
                    Some(Inbound::Data(bytes)) => return Ok(Some(bytes)),
                    Some(Inbound::End) => {
                        self.finished = true;
                        return Ok(None);
                    }
                    None => {
                        // Dropped by the dispatcher without END_STREAM.
                        self.shared.check_reset()?;
                        return Err(DuplexError::ConnectionClosed);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Command;
    use crate::protocol::{FrameBuffer, FrameKind};
    use crate::stream::StreamState;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn reader() -> (Arc<StreamShared>, mpsc::UnboundedSender<Inbound>, BodyReader) {
        let shared = StreamShared::new(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = BodyReader::new(shared.clone(), rx);
        (shared, tx, reader)
    }

    fn writer(
        max_frame_size: usize,
    ) -> (
        BodyWriter,
        DuplexStream,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let (client, server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let sender = StreamSender::new(StreamShared::new(1), handle, commands);
        (BodyWriter::new(sender, max_frame_size), server, commands_rx)
    }

    async fn read_frames(server: &mut DuplexStream, count: usize) -> Vec<crate::protocol::Frame> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 4096];
        while frames.len() < count {
            let n = server.read(&mut buf).await.unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_read_chunks_then_end() {
        let (_shared, tx, mut reader) = reader();
        tx.send(Inbound::Data(Bytes::from_static(b"staten"))).unwrap();
        tx.send(Inbound::Data(Bytes::from_static(b" island"))).unwrap();
        tx.send(Inbound::End).unwrap();

        assert_eq!(reader.read_chunk().await.unwrap().unwrap(), "staten");
        assert_eq!(reader.position(), 6);
        assert_eq!(reader.read_to_string().await.unwrap(), " island");
        assert!(reader.is_finished());
        assert!(reader.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_into_small_buffer_keeps_leftover() {
        let (_shared, tx, mut reader) = reader();
        tx.send(Inbound::Data(Bytes::from_static(b"abcdef"))).unwrap();
        tx.send(Inbound::End).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.position(), 6);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_end_without_data_is_not_an_error() {
        let (_shared, tx, mut reader) = reader();
        tx.send(Inbound::End).unwrap();
        assert!(reader.read_to_end().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_wakes_blocked_reader() {
        let (shared, _tx, mut reader) = reader();

        let blocked = tokio::spawn(async move { reader.read_chunk().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        shared.reset(ResetReason::new(ResetCode::Cancel, "gone"));

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("reader must wake promptly")
            .unwrap();
        assert!(matches!(result, Err(DuplexError::StreamReset(r)) if r.code == ResetCode::Cancel));
    }

    #[tokio::test]
    async fn test_reset_wins_over_queued_data() {
        let (shared, tx, mut reader) = reader();
        tx.send(Inbound::Data(Bytes::from_static(b"late"))).unwrap();
        shared.reset(ResetReason::new(ResetCode::InternalError, ""));

        assert!(matches!(
            reader.read_chunk().await,
            Err(DuplexError::StreamReset(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_queue_reads_as_connection_closed() {
        let (_shared, tx, mut reader) = reader();
        drop(tx);
        assert!(matches!(
            reader.read_chunk().await,
            Err(DuplexError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writes_buffer_until_flush() {
        let (mut writer, mut server, _commands) = writer(1024);

        writer.write(b"abc").await.unwrap();
        writer.write_str("def").await.unwrap();
        assert_eq!(writer.buffered(), 6);

        writer.flush().await.unwrap();
        assert_eq!(writer.buffered(), 0);

        let frames = read_frames(&mut server, 1).await;
        assert_eq!(frames[0].kind(), Some(FrameKind::Data));
        assert_eq!(frames[0].payload(), b"abcdef");
        assert!(!frames[0].is_end_stream());
    }

    #[tokio::test]
    async fn test_large_write_splits_into_frames() {
        let (mut writer, mut server, _commands) = writer(4);

        writer.write(b"0123456789").await.unwrap();
        assert_eq!(writer.buffered(), 2);
        writer.close_write().await.unwrap();

        let frames = read_frames(&mut server, 3).await;
        assert_eq!(frames[0].payload(), b"0123");
        assert_eq!(frames[1].payload(), b"4567");
        assert_eq!(frames[2].payload(), b"89");
        assert!(frames[2].is_end_stream());
    }

    #[tokio::test]
    async fn test_double_close_fails() {
        let (mut writer, mut server, _commands) = writer(1024);

        writer.close_write().await.unwrap();
        assert!(matches!(
            writer.close_write().await,
            Err(DuplexError::ChannelClosed)
        ));
        assert!(matches!(
            writer.write(b"x").await,
            Err(DuplexError::ChannelClosed)
        ));

        let frames = read_frames(&mut server, 1).await;
        assert!(frames[0].is_end_stream());
        assert!(frames[0].payload().is_empty());
        assert_eq!(writer.sender().shared().state(), StreamState::HalfClosedLocal);
    }

    #[tokio::test]
    async fn test_write_after_reset_fails_fast() {
        let (mut writer, _server, _commands) = writer(1024);
        writer
            .sender()
            .shared()
            .reset(ResetReason::new(ResetCode::Cancel, "peer"));

        assert!(matches!(
            writer.write(b"x").await,
            Err(DuplexError::StreamReset(_))
        ));
    }

    #[tokio::test]
    async fn test_local_reset_sends_rst_and_releases() {
        let (mut writer, mut server, mut commands) = writer(1024);
        writer.write(b"discarded").await.unwrap();
        writer.reset(ResetCode::Cancel, "changed my mind").await.unwrap();

        let frames = read_frames(&mut server, 1).await;
        assert_eq!(frames[0].kind(), Some(FrameKind::RstStream));
        let reason = ResetReason::decode(frames[0].payload()).unwrap();
        assert_eq!(reason.message, "changed my mind");

        assert!(matches!(commands.recv().await, Some(Command::Release(1))));
        assert!(matches!(
            writer.flush().await,
            Err(DuplexError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_drop_before_close_cancels_stream() {
        let (mut writer, mut server, mut commands) = writer(1024);
        writer.write(b"partial").await.unwrap();
        writer.flush().await.unwrap();
        let shared = writer.sender().shared().clone();
        drop(writer);

        let frames = read_frames(&mut server, 2).await;
        assert_eq!(frames[0].payload(), b"partial");
        assert_eq!(frames[1].kind(), Some(FrameKind::RstStream));
        let reason = ResetReason::decode(frames[1].payload()).unwrap();
        assert_eq!(reason.code, ResetCode::Cancel);

        assert_eq!(shared.state(), StreamState::Reset);
        assert!(matches!(commands.recv().await, Some(Command::Release(1))));
    }

    #[tokio::test]
    async fn test_drop_after_close_sends_nothing_more() {
        let (mut writer, mut server, _commands) = writer(1024);
        writer.close_write().await.unwrap();
        let shared = writer.sender().shared().clone();
        drop(writer);

        let frames = read_frames(&mut server, 1).await;
        assert!(frames[0].is_end_stream());
        assert_eq!(shared.state(), StreamState::HalfClosedLocal);
        assert!(shared.reset_reason().is_none());
    }
}
