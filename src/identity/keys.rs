//! Ed25519 signing identities
//!
//! Spaces, members, devices and writable feeds are all backed by a
//! `KeyPair`. The public half is the `PublicKey` they are known by.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::Zeroize;

use super::IdentityError;
use crate::keys::PublicKey;

/// Serializable form of a KeyPair (for persistence). Zeroized on drop.
#[derive(Serialize, Deserialize)]
struct KeyPairStore {
    public_key: PublicKey,
    secret_key_bytes: [u8; 32],
}

impl Drop for KeyPairStore {
    fn drop(&mut self) {
        self.secret_key_bytes.zeroize();
    }
}

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.signing_key.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    /// Check `signature` over `data` against `key`. Malformed keys or
    /// signatures simply fail verification.
    pub fn verify_with_key(key: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying_key) = key.to_verifying_key() else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        verifying_key
            .verify(data, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }

    /// Sign the JSON encoding of `data`.
    pub fn sign_json<T: Serialize>(&self, data: &T) -> Result<Vec<u8>, IdentityError> {
        let json =
            serde_json::to_vec(data).map_err(|e| IdentityError::SerializationError(e.to_string()))?;
        Ok(self.sign(&json).to_bytes().to_vec())
    }

    pub fn verify_json<T: Serialize>(key: &PublicKey, data: &T, signature: &[u8]) -> bool {
        let Ok(json) = serde_json::to_vec(data) else {
            return false;
        };
        Self::verify_with_key(key, &json, signature)
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = std::fs::read(path).map_err(|e| IdentityError::IoError(e.to_string()))?;
        let store: KeyPairStore = serde_json::from_slice(&data)
            .map_err(|e| IdentityError::DeserializationError(e.to_string()))?;

        let keypair = Self::from_secret_bytes(&store.secret_key_bytes);
        if keypair.public_key() != store.public_key {
            return Err(IdentityError::InvalidKeyMaterial(format!(
                "public key {} does not match secret key",
                store.public_key.truncate()
            )));
        }
        Ok(keypair)
    }

    /// Persist to a JSON keystore file.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::IoError(e.to_string()))?;
        }

        let store = KeyPairStore {
            public_key: self.public_key(),
            secret_key_bytes: self.signing_key.to_bytes(),
        };
        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| IdentityError::SerializationError(e.to_string()))?;

        std::fs::write(path, json).map_err(|e| IdentityError::IoError(e.to_string()))
    }

    /// Load from path if it exists, otherwise generate and save.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            let keypair = Self::generate();
            keypair.save(path)?;
            Ok(keypair)
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
