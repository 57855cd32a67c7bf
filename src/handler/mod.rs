//! Responder handling for peer-initiated exchanges.
//!
//! Provides:
//! - [`DuplexResponder`] - handles one incoming exchange
//! - [`ResponderRegistry`] - maps `(method, path)` routes to responders

mod registry;

pub use registry::{DuplexResponder, ResponderRegistry, WILDCARD_PATH};
