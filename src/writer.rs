//! The single task that owns a connection's write half.
//!
//! Streams never touch the transport. They queue [`OutboundFrame`]s on a
//! shared channel and the writer task drains it, coalescing whatever is
//! queued into one vectored write. A stream's frames keep their order
//! because each stream queues from a single owner.
//!
//! ```text
//! sink (stream 1) ─┐
//! sink (stream 3) ─┼─► mpsc<OutboundFrame> ─► writer task ─► transport
//! dispatcher RST  ─┘
//! ```

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::backpressure::BackpressureController;
use crate::error::{DuplexError, Result};
use crate::protocol::Header;

pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long a writer waits for a free slot before failing.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames coalesced into one vectored write.
const MAX_BATCH_FRAMES: usize = 64;

/// An encoded header plus its payload, queued for the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    header: Bytes,
    payload: Bytes,
}

impl OutboundFrame {
    pub fn new(header: &Header, payload: Bytes) -> Self {
        Self {
            header: Bytes::copy_from_slice(&header.encode()),
            payload,
        }
    }
}

/// Limits applied to the writer task and its queue.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued but unwritten before writers start waiting.
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    /// How long a writer waits for a free slot.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Cloneable entry point to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    queue: mpsc::Sender<OutboundFrame>,
    slots: BackpressureController,
    closing: Arc<Notify>,
}

impl WriterHandle {
    fn new(queue: mpsc::Sender<OutboundFrame>, slots: BackpressureController) -> Self {
        Self {
            queue,
            slots,
            closing: Arc::new(Notify::new()),
        }
    }

    /// Queue a frame, waiting for a free slot if the writer is behind.
    ///
    /// Cancel-safe: dropping the future before it completes queues nothing
    /// and holds no slot.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let permit = self
            .queue
            .reserve()
            .await
            .map_err(|_| DuplexError::ConnectionClosed)?;
        self.slots.reserve().await?;
        permit.send(frame);
        Ok(())
    }

    /// Queue a frame from code that cannot wait.
    ///
    /// Falls back to a spawned [`send`](Self::send) when the writer is
    /// behind and a runtime is available.
    pub fn send_detached(&self, frame: OutboundFrame) -> Result<()> {
        match self.try_send(frame.clone()) {
            Err(DuplexError::BackpressureTimeout) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| DuplexError::BackpressureTimeout)?;
                let handle = self.clone();
                runtime.spawn(async move {
                    if let Err(e) = handle.send(frame).await {
                        tracing::debug!("Detached frame dropped: {}", e);
                    }
                });
                Ok(())
            }
            other => other,
        }
    }

    /// Write out what is already queued, then shut the transport down.
    /// Later sends fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.closing.notify_one();
    }

    /// Queue a frame only if a slot is free right now.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.slots.try_reserve()?;
        match self.queue.try_send(frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.slots.release();
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => DuplexError::BackpressureTimeout,
                    mpsc::error::TrySendError::Closed(_) => DuplexError::ConnectionClosed,
                })
            }
        }
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.slots.is_active()
    }

    pub fn pending_count(&self) -> usize {
        self.slots.pending_count()
    }
}

/// Start the writer task on `transport`.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, shutting
/// the transport down, or with the first write error.
pub fn spawn_writer_task<W>(
    transport: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (queue, rx) = mpsc::channel(config.channel_capacity);
    let slots = BackpressureController::new(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle::new(queue, slots.clone());
    let task = tokio::spawn(drain_queue(rx, transport, slots, handle.closing.clone()));
    (handle, task)
}

async fn drain_queue<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut transport: W,
    slots: BackpressureController,
    closing: Arc<Notify>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_FRAMES);
    let mut draining = false;
    loop {
        let received = tokio::select! {
            biased;

            _ = closing.notified(), if !draining => {
                // Frames already queued still go out.
                draining = true;
                rx.close();
                continue;
            }
            received = rx.recv_many(&mut batch, MAX_BATCH_FRAMES) => received,
        };
        if received == 0 {
            tracing::debug!("Writer queue closed, shutting transport down");
            let _ = transport.shutdown().await;
            return Ok(());
        }

        let count = batch.len();
        let result = write_batch(&mut transport, batch.drain(..)).await;
        slots.release_many(count);
        if let Err(e) = result {
            tracing::error!("Transport write failed: {}", e);
            return Err(e);
        }
    }
}

/// Write every frame of `batch` with as few vectored writes as the
/// transport allows, then flush.
async fn write_batch<W, I>(transport: &mut W, batch: I) -> Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = OutboundFrame>,
{
    let mut chunks: VecDeque<Bytes> = batch
        .into_iter()
        .flat_map(|frame| [frame.header, frame.payload])
        .filter(|chunk| !chunk.is_empty())
        .collect();

    while !chunks.is_empty() {
        let mut written = {
            let slices: Vec<IoSlice<'_>> = chunks.iter().map(|c| IoSlice::new(c)).collect();
            transport.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(DuplexError::Io(std::io::ErrorKind::WriteZero.into()));
        }

        while let Some(front) = chunks.front_mut() {
            if written < front.len() {
                front.advance(written);
                break;
            }
            written -= front.len();
            chunks.pop_front();
        }
    }

    transport.flush().await?;
    Ok(())
}
