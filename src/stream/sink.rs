//! Outgoing half of an exchange: body bytes interleaved with metadata.

use super::body::BodyWriter;
use super::state::ResetCode;
use crate::error::Result;
use crate::metadata::Metadata;

/// Writes a body and inserts metadata frames into it at chosen points.
///
/// A metadata frame is an ordering barrier: every byte written before
/// [`emit_metadata`](Self::emit_metadata) goes out ahead of it, every byte
/// written after follows it.
pub struct MetadataSink {
    writer: BodyWriter,
}

impl MetadataSink {
    pub(crate) fn new(writer: BodyWriter) -> Self {
        Self { writer }
    }

    /// Stream this sink belongs to.
    pub fn stream_id(&self) -> u32 {
        self.writer.stream_id()
    }

    /// The body byte channel.
    pub fn sink(&mut self) -> &mut BodyWriter {
        &mut self.writer
    }

    /// Shorthand for `sink().write(data)`.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    /// Shorthand for `sink().flush()`.
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Send a metadata frame after everything written so far.
    pub async fn emit_metadata(&mut self, metadata: Metadata) -> Result<()> {
        self.writer.ensure_writable()?;
        self.writer.flush_buffer().await?;
        self.writer.sender().send_headers(&metadata).await
    }

    /// Flush and end the outgoing direction.
    pub async fn close_write(&mut self) -> Result<()> {
        self.writer.close_write().await
    }

    /// Abort the exchange in both directions.
    pub async fn reset(&mut self, code: ResetCode, message: &str) -> Result<()> {
        self.writer.reset(code, message).await
    }
}
