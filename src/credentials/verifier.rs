//! Verification of auth challenge responses against a space's membership

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Assertion, Credential, SpaceState};
use crate::identity::AuthVerifier;
use crate::keys::PublicKey;

/// Accepts `Auth` credentials from admitted members and devices.
///
/// The local credential log may lag behind the peer being verified, so an
/// unknown issuer is given `catch_up_timeout` for its admission to arrive.
/// Keys in the bootstrap set are trusted without waiting; a peer that is
/// joining uses them to admit the peers it replicates its first credentials
/// from.
pub struct SpaceAuthVerifier {
    space_key: PublicKey,
    state: SpaceState,
    bootstrap_keys: Mutex<HashSet<PublicKey>>,
    catch_up_timeout: Duration,
}

impl SpaceAuthVerifier {
    pub fn new(state: SpaceState, catch_up_timeout: Duration) -> Self {
        Self {
            space_key: state.space_key(),
            state,
            bootstrap_keys: Mutex::new(HashSet::new()),
            catch_up_timeout,
        }
    }

    pub fn with_bootstrap_keys(self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        for key in keys {
            self.trust(key);
        }
        self
    }

    /// Trust `key` before its admission has been replicated.
    pub fn trust(&self, key: PublicKey) {
        self.bootstrap_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    fn is_bootstrap(&self, key: &PublicKey) -> bool {
        self.bootstrap_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    fn well_formed(&self, challenge: &[u8], credential: &Credential) -> bool {
        if let Err(e) = credential.verify() {
            log::debug!("Rejecting auth credential: {}", e);
            return false;
        }
        let for_this_space = matches!(
            &credential.assertion,
            Assertion::Auth { space_key } if *space_key == self.space_key
        );
        if !for_this_space {
            log::debug!("Rejecting {} credential for auth", credential.assertion.kind());
            return false;
        }
        credential.proof.nonce.as_deref() == Some(challenge)
    }

    async fn wait_for_admission(&self, key: &PublicKey) -> bool {
        let deadline = Instant::now() + self.catch_up_timeout;
        let mut revision = self.state.watch();
        loop {
            if self.state.is_admitted(key) {
                return true;
            }
            match tokio::time::timeout_at(deadline, revision.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return self.state.is_admitted(key),
            }
        }
    }
}

#[async_trait]
impl AuthVerifier for SpaceAuthVerifier {
    async fn verify(&self, challenge: &[u8], credential: &Credential) -> bool {
        if !self.well_formed(challenge, credential) {
            return false;
        }
        if self.is_bootstrap(&credential.issuer) {
            return true;
        }
        let admitted = self.wait_for_admission(&credential.issuer).await;
        if !admitted {
            log::info!(
                "Auth credential from {} not admitted to space {}",
                credential.issuer.truncate(),
                self.space_key.truncate()
            );
        }
        admitted
    }
}
