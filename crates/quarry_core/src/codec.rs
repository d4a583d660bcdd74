//! Payload serialization.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Turns entity values into stored payload bytes and back.
pub trait PayloadCodec {
    /// Encodes a value.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the value cannot be serialized.
    fn encode<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>>;

    /// Decodes a value.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the bytes do not hold a `T`.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T>;
}

/// CBOR payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl PayloadCodec for CborCodec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Line {
        sku: String,
        qty: u32,
    }

    #[test]
    fn cbor_payload() {
        let line = Line {
            sku: "A-1".into(),
            qty: 3,
        };
        let bytes = CborCodec::encode(&line).unwrap();
        assert_eq!(CborCodec::decode::<Line>(&bytes).unwrap(), line);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = CborCodec::decode::<Line>(&[0xFF, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::Codec { .. }));
    }
}
