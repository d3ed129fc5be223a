//! Cryptographic identity and authentication capabilities
//!
//! - `KeyPair`: Ed25519 signing key, persisted as a JSON keystore
//! - `AuthProvider` / `AuthVerifier`: answering and checking auth challenges
//! - `SwarmIdentity`: the bundle a peer joins a swarm with

pub mod auth;
pub mod keys;

pub use auth::{AuthProvider, AuthVerifier, KeyPairAuthProvider, SwarmIdentity};
pub use keys::KeyPair;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}
