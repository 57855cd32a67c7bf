//! Responder registry for dispatching peer-initiated exchanges by route.
//!
//! Routes are `(method, path)` pairs taken from the `:method` and `:path`
//! entries of an exchange's opening metadata. A route registered with path
//! `*` catches every path for its method that has no exact match.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use duplexwire::handler::ResponderRegistry;
//! use duplexwire::{HeaderListener, Metadata, MetadataFrame};
//!
//! let mut registry = ResponderRegistry::new();
//! registry.register("POST", "/echo", |_md: Metadata, _body, _sink| {
//!     let listener: Arc<dyn HeaderListener> = Arc::new(|_frame: MetadataFrame| {});
//!     Ok(listener)
//! });
//!
//! assert!(registry.route(&Metadata::request("POST", "/echo")).is_some());
//! assert!(registry.route(&Metadata::request("GET", "/echo")).is_none());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::metadata::Metadata;
use crate::stream::{BodyReader, HeaderListener, MetadataSink};

/// Path that matches any path of its method.
pub const WILDCARD_PATH: &str = "*";

/// Handles one peer-initiated exchange.
///
/// Invoked synchronously on the connection's dispatcher as soon as the
/// opening metadata arrives, so it must not block. Typical responders spawn
/// a task that owns the reader and sink, then return a listener for the
/// peer's metadata frames. An `Err` or a panic resets the exchange with
/// `InternalError`; dropping the sink without closing it resets it with
/// `Cancel`.
pub trait DuplexResponder: Send + Sync + 'static {
    fn on_request(
        &self,
        metadata: Metadata,
        body: BodyReader,
        sink: MetadataSink,
    ) -> Result<Arc<dyn HeaderListener>>;
}

impl<F> DuplexResponder for F
where
    F: Fn(Metadata, BodyReader, MetadataSink) -> Result<Arc<dyn HeaderListener>>
        + Send
        + Sync
        + 'static,
{
    fn on_request(
        &self,
        metadata: Metadata,
        body: BodyReader,
        sink: MetadataSink,
    ) -> Result<Arc<dyn HeaderListener>> {
        self(metadata, body, sink)
    }
}

/// Registry mapping routes to responders.
#[derive(Default)]
pub struct ResponderRegistry {
    routes: HashMap<(String, String), Arc<dyn DuplexResponder>>,
}

impl ResponderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure responder. A later registration for the same
    /// route replaces the earlier one.
    pub fn register<F>(&mut self, method: &str, path: &str, responder: F)
    where
        F: Fn(Metadata, BodyReader, MetadataSink) -> Result<Arc<dyn HeaderListener>>
            + Send
            + Sync
            + 'static,
    {
        self.register_responder(method, path, Arc::new(responder));
    }

    /// Register a responder implementing [`DuplexResponder`] directly.
    pub fn register_responder(
        &mut self,
        method: &str,
        path: &str,
        responder: Arc<dyn DuplexResponder>,
    ) {
        if self
            .routes
            .insert((method.to_string(), path.to_string()), responder)
            .is_some()
        {
            tracing::warn!("Replacing responder for {} {}", method, path);
        }
    }

    /// Find the responder for an exchange's opening metadata.
    pub fn route(&self, metadata: &Metadata) -> Option<Arc<dyn DuplexResponder>> {
        let method = metadata.method()?;
        let path = metadata.path().unwrap_or_default();

        self.routes
            .get(&(method.to_string(), path.to_string()))
            .or_else(|| {
                self.routes
                    .get(&(method.to_string(), WILDCARD_PATH.to_string()))
            })
            .cloned()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
