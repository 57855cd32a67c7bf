//! Metadata carried by HEADERS frames.
//!
//! [`Metadata`] is an ordered list of `(name, value)` pairs. Names are not
//! unique and order is significant, so it is not a map.
//!
//! ```
//! use duplexwire::Metadata;
//!
//! let md = Metadata::of(&[(":method", "POST"), ("h2", "v1"), ("h2", "v2")]);
//! assert_eq!(md.method(), Some("POST"));
//! assert_eq!(md.get_all("h2").collect::<Vec<_>>(), vec!["v1", "v2"]);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Pseudo-header carrying the request method.
pub const METHOD: &str = ":method";

/// Pseudo-header carrying the request path.
pub const PATH: &str = ":path";

/// Pseudo-header carrying the response status.
pub const STATUS: &str = ":status";

/// Ordered name/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from borrowed pairs, keeping their order.
    pub fn of(pairs: &[(&str, &str)]) -> Self {
        Self {
            entries: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    /// Opening metadata for a request.
    pub fn request(method: &str, path: &str) -> Self {
        Self::of(&[(METHOD, method), (PATH, path)])
    }

    /// Opening metadata for a response.
    pub fn status(code: u16) -> Self {
        let mut md = Self::new();
        md.push(STATUS, code.to_string());
        md
    }

    /// Append a pair.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in order.
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.entries
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The `:method` pseudo-header.
    pub fn method(&self) -> Option<&str> {
        self.get(METHOD)
    }

    /// The `:path` pseudo-header.
    pub fn path(&self) -> Option<&str> {
        self.get(PATH)
    }

    /// Iterate over all pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as a HEADERS payload.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(MsgPackCodec::encode(self)?))
    }

    /// Decode a HEADERS payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(payload)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// A metadata frame as seen by a [`HeaderListener`](crate::HeaderListener).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFrame {
    /// Stream the frame arrived on.
    pub stream_id: u32,
    /// Body bytes received on this direction before the frame.
    pub offset: u64,
    /// The name/value pairs.
    pub metadata: Metadata,
}
