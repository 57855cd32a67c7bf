//! MessagePack via `rmp-serde`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Encodes HEADERS and RST_STREAM payloads.
///
/// Structs go out as maps keyed by field name (`to_vec_named`), so a peer
/// can add fields to a reset payload without breaking this decoder.
pub struct MsgPackCodec;

impl MsgPackCodec {
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Abort {
        code: u32,
        message: String,
    }

    #[derive(Deserialize, PartialEq, Debug)]
    struct CodeOnly {
        code: u32,
    }

    #[test]
    fn test_struct_goes_out_as_map() {
        let bytes = MsgPackCodec::encode(&Abort {
            code: 8,
            message: "cancel".into(),
        })
        .unwrap();

        // fixmap of two entries
        assert_eq!(bytes[0], 0x82);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let bytes = MsgPackCodec::encode(&Abort {
            code: 2,
            message: "extra".into(),
        })
        .unwrap();

        let decoded: CodeOnly = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, CodeOnly { code: 2 });
    }

    #[test]
    fn test_repeated_names_keep_order() {
        let pairs = vec![
            ("set-cookie".to_string(), "a".to_string()),
            ("via".to_string(), "x".to_string()),
            ("set-cookie".to_string(), "b".to_string()),
        ];
        let decoded: Vec<(String, String)> =
            MsgPackCodec::decode(&MsgPackCodec::encode(&pairs).unwrap()).unwrap();
        assert_eq!(decoded, pairs);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(MsgPackCodec::decode::<Abort>(b"\xc1").is_err());
    }
}
