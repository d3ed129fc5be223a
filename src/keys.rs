//! Public keys
//!
//! Every addressable thing in a space (the space itself, members, devices,
//! feeds) is named by a 32-byte ed25519 verifying key. Keys order by their
//! raw bytes, which is the same order as their lowercase hex strings, so
//! tie-breaks on keys are stable across peers.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("Not a valid ed25519 point: {0}")]
    InvalidPoint(String),
}

/// A 32-byte public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::InvalidLength(bytes.len()))?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|e| KeyError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Random key bytes. Useful for feeds and tests where no signing is needed.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn truncate(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Interpret as an ed25519 verifying key.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| KeyError::InvalidPoint(e.to_string()))
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.truncate())
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let key = PublicKey::random();
        let parsed: PublicKey = key.to_hex().parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_byte_order_matches_hex_order() {
        for _ in 0..32 {
            let a = PublicKey::random();
            let b = PublicKey::random();
            assert_eq!(a.cmp(&b), a.to_hex().cmp(&b.to_hex()));
        }
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(PublicKey::from_hex("zz"), Err(KeyError::InvalidHex(_))));
        assert_eq!(
            PublicKey::from_hex("0102"),
            Err(KeyError::InvalidLength(2))
        );
    }

    #[test]
    fn test_json_uses_hex_string() {
        let key = PublicKey::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
