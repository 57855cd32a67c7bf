//! Initiator-side view of an exchange.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{DuplexError, Result};
use crate::stream::{BodyReader, HeaderListener, ListenerHandle, StreamShared};

/// An exchange whose responder has not answered yet.
///
/// Resolves to an [`Exchange`] once the first frame of the response
/// arrives, or fails with [`DuplexError::StreamReset`] if the stream is
/// reset first. Can be awaited directly.
pub struct PendingExchange {
    opened: oneshot::Receiver<()>,
    shared: Arc<StreamShared>,
    exchange: Exchange,
}

impl PendingExchange {
    pub(crate) fn new(
        opened: oneshot::Receiver<()>,
        shared: Arc<StreamShared>,
        exchange: Exchange,
    ) -> Self {
        Self {
            opened,
            shared,
            exchange,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.exchange.stream_id()
    }

    /// Register the listener before the response starts, so not even the
    /// responder's initial metadata is buffered.
    pub fn register_header_listener(&mut self, listener: Arc<dyn HeaderListener>) -> Result<()> {
        self.exchange.register_header_listener(listener)
    }

    /// Wait for the response to start.
    pub async fn wait(self) -> Result<Exchange> {
        match self.opened.await {
            Ok(()) => Ok(self.exchange),
            Err(_) => Err(self
                .shared
                .reset_reason()
                .map(DuplexError::StreamReset)
                .unwrap_or(DuplexError::ConnectionClosed)),
        }
    }
}

impl IntoFuture for PendingExchange {
    type Output = Result<Exchange>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// The incoming half of an exchange: the responder's body and metadata.
pub struct Exchange {
    stream_id: u32,
    body: BodyReader,
    listener: ListenerHandle,
}

impl Exchange {
    pub(crate) fn new(stream_id: u32, body: BodyReader, listener: ListenerHandle) -> Self {
        Self {
            stream_id,
            body,
            listener,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Attach the listener for the responder's metadata frames.
    ///
    /// Frames that arrived earlier are delivered first, in order. Only one
    /// listener may be registered.
    pub fn register_header_listener(&mut self, listener: Arc<dyn HeaderListener>) -> Result<()> {
        self.listener.register(listener)
    }

    /// The responder's body.
    pub fn body(&mut self) -> &mut BodyReader {
        &mut self.body
    }

    /// Give up listener registration and keep only the body.
    pub fn into_body(self) -> BodyReader {
        self.body
    }
}
