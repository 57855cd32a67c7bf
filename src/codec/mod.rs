//! Payload serialization.
//!
//! HEADERS and RST_STREAM payloads are MessagePack, written with
//! [`MsgPackCodec`]. DATA payloads are raw body bytes.
//!
//! # Example
//!
//! ```
//! use duplexwire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&vec![("brooklyn", "zoo")]).unwrap();
//! let decoded: Vec<(String, String)> = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded[0].0, "brooklyn");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
