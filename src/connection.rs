//! Connection builder and handle.
//!
//! The [`ConnectionBuilder`] collects responders and limits, then
//! [`start`](ConnectionBuilder::start) takes over a byte transport:
//! 1. Split it into read and write halves
//! 2. Spawn the writer task on the write half
//! 3. Spawn the dispatcher on the read half
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use duplexwire::{Connection, HeaderListener, Metadata, MetadataFrame, Role};
//!
//! # async fn demo(io: tokio::net::TcpStream) -> duplexwire::Result<()> {
//! let server = Connection::builder()
//!     .role(Role::Server)
//!     .responder("POST", "/echo", |_md, mut body, mut sink| {
//!         tokio::spawn(async move {
//!             sink.emit_metadata(Metadata::status(200)).await?;
//!             let data = body.read_to_end().await?;
//!             sink.write(&data).await?;
//!             sink.close_write().await
//!         });
//!         let listener: Arc<dyn HeaderListener> = Arc::new(|_frame: MetadataFrame| {});
//!         Ok(listener)
//!     })
//!     .start(io)?;
//!
//! server.wait_for_shutdown().await
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::{ConnectionConfig, Role};
use crate::dispatcher::{Command, Dispatcher, StreamEntry};
use crate::error::{DuplexError, Result};
use crate::exchange::{Exchange, PendingExchange};
use crate::handler::{DuplexResponder, ResponderRegistry};
use crate::metadata::Metadata;
use crate::stream::{
    spawn_listener_task, BodyReader, BodyWriter, HeaderListener, ListenerHandle, MetadataSink,
    ResetCode, ResetReason, StreamSender, StreamShared,
};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Largest stream id either side may open.
const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Builder for configuring and starting a connection.
pub struct ConnectionBuilder {
    registry: ResponderRegistry,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    /// Create a new connection builder.
    pub fn new() -> Self {
        Self {
            registry: ResponderRegistry::new(),
            config: ConnectionConfig::default(),
        }
    }

    /// Which side of the connection this endpoint is.
    ///
    /// Default: `Role::Client`
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    /// Register a responder for exchanges the peer opens on `(method, path)`.
    ///
    /// Use path `*` to catch every path of a method.
    pub fn responder<F>(mut self, method: &str, path: &str, responder: F) -> Self
    where
        F: Fn(Metadata, BodyReader, MetadataSink) -> Result<Arc<dyn HeaderListener>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.register(method, path, responder);
        self
    }

    /// Register a [`DuplexResponder`] implementation.
    pub fn responder_impl(
        mut self,
        method: &str,
        path: &str,
        responder: Arc<dyn DuplexResponder>,
    ) -> Self {
        self.registry.register_responder(method, path, responder);
        self
    }

    /// Replace every limit at once, e.g. with a config loaded from JSON.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Largest DATA payload written in one frame.
    ///
    /// Default: 16 KiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Largest payload accepted from the peer, and sent to it.
    ///
    /// Default: 16 MiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// When this limit is reached, writers wait until backpressure clears
    /// or the timeout expires.
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Take over `io` and start the writer and dispatcher tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<T>(self, io: T) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;

        let (read_half, write_half) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(write_half, self.config.writer_config());

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            &self.config,
            Arc::new(self.registry),
            writer.clone(),
            commands.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run(read_half, commands_rx));

        tracing::debug!("Connection started as {:?}", self.config.role);

        Ok(Connection {
            next_stream_id: Mutex::new(self.config.role.first_stream_id()),
            config: self.config,
            writer,
            commands,
            dispatcher_task,
            _writer_task: writer_task,
        })
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running connection.
///
/// Use `start_exchange()` to open exchanges with the peer.
/// Use `wait_for_shutdown()` to block until the transport closes.
pub struct Connection {
    config: ConnectionConfig,
    writer: WriterHandle,
    commands: mpsc::UnboundedSender<Command>,
    /// Held until a new stream's HEADERS is queued, so ids reach the peer
    /// in increasing order.
    next_stream_id: Mutex<u32>,
    dispatcher_task: JoinHandle<Result<()>>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Open an exchange, sending `initial` as its opening metadata.
    ///
    /// The sink is usable right away; the pending exchange resolves once
    /// the responder's first frame arrives.
    pub async fn start_exchange(
        &self,
        initial: Metadata,
    ) -> Result<(MetadataSink, PendingExchange)> {
        let mut next_stream_id = self.next_stream_id.lock().await;
        let stream_id = *next_stream_id;
        if stream_id > MAX_STREAM_ID {
            return Err(DuplexError::Protocol("Stream ids exhausted".into()));
        }
        *next_stream_id = stream_id + 2;

        let shared = StreamShared::new(stream_id);
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();
        spawn_listener_task(shared.clone(), listener_rx);

        // Registered before the HEADERS frame goes out, so the response
        // always finds its stream.
        let entry = StreamEntry::new(shared.clone(), body_tx, listener_tx.clone(), Some(opened_tx));
        self.commands
            .send(Command::Open { stream_id, entry })
            .map_err(|_| DuplexError::ConnectionClosed)?;

        let sender = StreamSender::new(shared.clone(), self.writer.clone(), self.commands.clone())
            .with_max_payload(self.config.max_payload_size);
        let mut sink = MetadataSink::new(BodyWriter::new(sender, self.config.max_frame_size));
        if let Err(e) = sink.emit_metadata(initial).await {
            shared.reset(ResetReason::new(ResetCode::Cancel, e.to_string()));
            let _ = self.commands.send(Command::Release(stream_id));
            return Err(e);
        }
        drop(next_stream_id);
        tracing::debug!("Started exchange on stream {}", stream_id);

        let exchange = Exchange::new(
            stream_id,
            BodyReader::new(shared.clone(), body_rx),
            ListenerHandle::new(listener_tx),
        );
        Ok((sink, PendingExchange::new(opened_rx, shared, exchange)))
    }

    /// Get the current backpressure status.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }

    /// Get the current pending frame count.
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    /// Stop reading from the transport. Every live exchange is reset with
    /// `ConnectionClosed`.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Wait for the dispatcher to stop (transport closed or `shutdown()`).
    ///
    /// This consumes the connection. Returns the transport error, if any.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        match self.dispatcher_task.await {
            Ok(result) => result,
            Err(e) => Err(DuplexError::Protocol(format!("Dispatcher task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataFrame;

    #[test]
    fn test_builder_configuration() {
        let builder = Connection::builder()
            .role(Role::Server)
            .max_frame_size(1024)
            .max_pending_frames(2048)
            .channel_capacity(512)
            .backpressure_timeout(Duration::from_secs(10));

        assert_eq!(builder.config.role, Role::Server);
        assert_eq!(builder.config.max_frame_size, 1024);
        assert_eq!(builder.config.max_pending_frames, 2048);
        assert_eq!(builder.config.channel_capacity, 512);
        assert_eq!(
            builder.config.writer_config().backpressure_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_builder_registers_responders() {
        let builder = ConnectionBuilder::default()
            .responder("POST", "/a", |_md, _body, _sink| {
                let l: Arc<dyn HeaderListener> = Arc::new(|_f: MetadataFrame| {});
                Ok(l)
            })
            .responder("GET", "*", |_md, _body, _sink| {
                let l: Arc<dyn HeaderListener> = Arc::new(|_f: MetadataFrame| {});
                Ok(l)
            });

        assert_eq!(builder.registry.len(), 2);
        assert!(builder.registry.route(&Metadata::request("GET", "/b")).is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_start() {
        let (io, _peer) = tokio::io::duplex(1024);
        let result = Connection::builder().max_frame_size(0).start(io);
        assert!(matches!(result, Err(DuplexError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_stream_ids_follow_role_parity() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = Connection::builder().start(a).unwrap();
        let server = Connection::builder().role(Role::Server).start(b).unwrap();

        let (_s1, p1) = client.start_exchange(Metadata::request("GET", "/")).await.unwrap();
        let (_s2, p2) = client.start_exchange(Metadata::request("GET", "/")).await.unwrap();
        let (_s3, p3) = server.start_exchange(Metadata::request("GET", "/")).await.unwrap();

        assert_eq!((p1.stream_id(), p2.stream_id()), (1, 3));
        assert_eq!(p3.stream_id(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_exchange() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let client = Connection::builder().start(a).unwrap();

        let (_sink, pending) = client
            .start_exchange(Metadata::request("GET", "/slow"))
            .await
            .unwrap();
        client.shutdown();

        let err = pending.await.err().unwrap();
        assert_eq!(err.reset_reason().unwrap().code, ResetCode::ConnectionClosed);
        assert!(client.wait_for_shutdown().await.is_ok());
    }
}
