//! Connection configuration.
//!
//! Usually set through [`ConnectionBuilder`](crate::ConnectionBuilder), but
//! also loadable from JSON so deployments can tune limits without code
//! changes. Every field has a default; an empty object is a valid config.
//!
//! ```
//! use duplexwire::config::{ConnectionConfig, Role};
//!
//! let config = ConnectionConfig::from_json(r#"{"role": "server", "max_frame_size": 4096}"#).unwrap();
//! assert_eq!(config.role, Role::Server);
//! assert_eq!(config.max_frame_size, 4096);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DuplexError, Result};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Default DATA frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// Which side of the connection this endpoint is.
///
/// Decides stream id parity: clients open odd ids, servers even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Client,
    Server,
}

impl Role {
    /// First stream id this role opens.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `stream_id` would be opened by this role.
    pub fn owns(self, stream_id: u32) -> bool {
        stream_id != 0 && (stream_id % 2 == 1) == (self == Role::Client)
    }
}

/// Tunables for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub role: Role,
    /// Largest DATA payload a body writer sends in one frame.
    pub max_frame_size: usize,
    /// Largest payload accepted from the peer.
    pub max_payload_size: u32,
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
    pub backpressure_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ConnectionConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(DuplexError::Protocol("max_frame_size must be non-zero".into()));
        }
        if self.max_frame_size as u64 > self.max_payload_size as u64 {
            return Err(DuplexError::Protocol(format!(
                "max_frame_size {} exceeds max_payload_size {}",
                self.max_frame_size, self.max_payload_size
            )));
        }
        if self.max_pending_frames == 0 || self.channel_capacity == 0 {
            return Err(DuplexError::Protocol(
                "max_pending_frames and channel_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Settings for the connection's writer task.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: self.backpressure_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = ConnectionConfig::from_json("{}").unwrap();
        assert_eq!(config, ConnectionConfig::default());
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.backpressure_timeout(), DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[test]
    fn test_partial_json() {
        let config =
            ConnectionConfig::from_json(r#"{"role":"server","backpressure_timeout_ms":250}"#)
                .unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.writer_config().backpressure_timeout, Duration::from_millis(250));
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ConnectionConfig::from_json(r#"{"max_frame_size":0}"#),
            Err(DuplexError::Protocol(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_json(r#"{"max_frame_size":100,"max_payload_size":10}"#),
            Err(DuplexError::Protocol(_))
        ));
        assert!(matches!(
            ConnectionConfig::from_json(r#"{"role":"peer"}"#),
            Err(DuplexError::Json(_))
        ));
    }

    #[test]
    fn test_role_parity() {
        assert_eq!(Role::Client.first_stream_id(), 1);
        assert_eq!(Role::Server.first_stream_id(), 2);
        assert!(Role::Client.owns(3));
        assert!(!Role::Client.owns(4));
        assert!(Role::Server.owns(4));
        assert!(!Role::Server.owns(0));
    }
}
