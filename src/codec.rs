//! CBOR helpers
//!
//! Wire messages and model mutations/snapshots are CBOR-encoded.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Serialize a value to CBOR bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR bytes.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(data).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    enum Sample {
        Set { key: String, value: i64 },
        Clear,
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let result: Result<Sample, _> = decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_enum_survives_encoding() {
        let bytes = encode(&Sample::Set { key: "x".into(), value: -3 }).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(back, Sample::Set { key: "x".into(), value: -3 });
    }
}
