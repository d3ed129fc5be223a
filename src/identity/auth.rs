//! Challenge-response authentication capabilities
//!
//! A peer proves membership by answering a random challenge with a
//! credential carrying the challenge as its nonce. `AuthProvider` produces
//! those answers, `AuthVerifier` checks them.

use std::sync::Arc;

use async_trait::async_trait;

use super::keys::KeyPair;
use crate::credentials::{Assertion, Credential};
use crate::keys::PublicKey;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Credential answering `challenge`, or `None` to refuse.
    async fn provide(&self, challenge: &[u8]) -> Option<Credential>;
}

#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, challenge: &[u8], credential: &Credential) -> bool;
}

/// Answers challenges with `Auth` credentials signed by a device key.
pub struct KeyPairAuthProvider {
    device: Arc<KeyPair>,
    space_key: PublicKey,
}

impl KeyPairAuthProvider {
    pub fn new(device: Arc<KeyPair>, space_key: PublicKey) -> Self {
        Self { device, space_key }
    }
}

#[async_trait]
impl AuthProvider for KeyPairAuthProvider {
    async fn provide(&self, challenge: &[u8]) -> Option<Credential> {
        let assertion = Assertion::Auth {
            space_key: self.space_key,
        };
        match Credential::issue_with_nonce(
            &self.device,
            self.device.public_key(),
            assertion,
            challenge.to_vec(),
        ) {
            Ok(credential) => Some(credential),
            Err(e) => {
                log::warn!("Could not sign auth credential: {}", e);
                None
            }
        }
    }
}

/// Capabilities a peer joins a swarm with.
#[derive(Clone)]
pub struct SwarmIdentity {
    pub peer_key: PublicKey,
    pub credential_provider: Arc<dyn AuthProvider>,
    pub credential_authenticator: Arc<dyn AuthVerifier>,
}

impl std::fmt::Debug for SwarmIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmIdentity")
            .field("peer_key", &self.peer_key)
            .finish_non_exhaustive()
    }
}
