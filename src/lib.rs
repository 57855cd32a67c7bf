//! # duplexwire
//!
//! Full-duplex request/response exchanges over a multiplexed binary
//! transport, HTTP/2 style.
//!
//! Each exchange is one stream. Both sides write a body and may interleave
//! metadata frames (ordered name/value pairs) anywhere in it. A metadata
//! frame is an ordering barrier: the receiver sees it exactly between the
//! body bytes written before and after it.
//!
//! ## Architecture
//!
//! - **Writer task**: owns the transport's write half; every stream sends
//!   frames to it through a channel
//! - **Dispatcher task**: owns the read half and the stream table, routes
//!   DATA to body readers and HEADERS to per-stream listener tasks
//! - **Exchanges**: a [`MetadataSink`] for the outgoing direction, a
//!   [`BodyReader`] plus a [`HeaderListener`] for the incoming one
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use duplexwire::{Connection, Metadata, RecordingListener};
//!
//! # async fn demo(io: tokio::net::TcpStream) -> duplexwire::Result<()> {
//! let conn = Connection::builder().start(io)?;
//!
//! let (mut sink, pending) = conn.start_exchange(Metadata::request("POST", "/upload")).await?;
//! sink.write(b"staten").await?;
//! sink.emit_metadata(Metadata::of(&[("brooklyn", "zoo")])).await?;
//! sink.write(b" island").await?;
//! sink.close_write().await?;
//!
//! let mut exchange = pending.await?;
//! let listener = RecordingListener::new();
//! exchange.register_header_listener(listener.clone())?;
//! let reply = exchange.body().read_to_string().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod metadata;
pub mod protocol;
pub mod stream;

mod backpressure;
mod connection;
mod dispatcher;
mod exchange;
mod writer;

pub use config::{ConnectionConfig, Role};
pub use connection::{Connection, ConnectionBuilder};
pub use error::{DuplexError, Result};
pub use exchange::{Exchange, PendingExchange};
pub use handler::DuplexResponder;
pub use metadata::{Metadata, MetadataFrame};
pub use stream::{
    BodyReader, BodyWriter, HeaderListener, MetadataSink, RecordingListener, ResetCode,
    ResetReason, StreamState,
};
pub use writer::WriterConfig;
