//! Per-connection challenge/response authentication
//!
//! Each side challenges the other with random bytes and expects a credential
//! signed over them in return. The state moves once from `Initial` to
//! `Success` or `Failure` and stays there.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use super::messages::{AuthMessage, WireMessage};
use super::transport::Connection;
use super::{AuthError, TransportError};
use crate::credentials::Credential;
use crate::event::Event;
use crate::identity::{AuthProvider, AuthVerifier};

pub const CHALLENGE_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Initial,
    Success,
    Failure,
}

type PendingResponse = oneshot::Sender<Option<Credential>>;

pub struct AuthExtension {
    provider: Arc<dyn AuthProvider>,
    verifier: Arc<dyn AuthVerifier>,
    timeout: Duration,
    state: watch::Sender<AuthState>,
    pending: Mutex<HashMap<Uuid, PendingResponse>>,
    auth_success: Event<()>,
    auth_failure: Event<AuthError>,
}

impl AuthExtension {
    pub fn new(provider: Arc<dyn AuthProvider>, verifier: Arc<dyn AuthVerifier>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(AuthState::Initial);
        Self {
            provider,
            verifier,
            timeout,
            state,
            pending: Mutex::new(HashMap::new()),
            auth_success: Event::new("auth_success"),
            auth_failure: Event::new("auth_failure"),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    pub fn auth_success(&self) -> &Event<()> {
        &self.auth_success
    }

    pub fn auth_failure(&self) -> &Event<AuthError> {
        &self.auth_failure
    }

    /// Wait for a terminal state. Returns whether the remote authenticated.
    pub async fn wait(&self) -> bool {
        let mut state = self.state.subscribe();
        let authenticated = match state.wait_for(|s| *s != AuthState::Initial).await {
            Ok(state) => *state == AuthState::Success,
            Err(_) => false,
        };
        authenticated
    }

    /// Challenge the remote and verify its answer, bounded by the auth
    /// timeout. The connection is closed on failure.
    pub async fn authenticate(&self, connection: &dyn Connection) -> Result<(), AuthError> {
        let result = tokio::time::timeout(self.timeout, self.exchange(connection))
            .await
            .unwrap_or(Err(AuthError::Timeout));

        match &result {
            Ok(()) => {
                if self.transition(AuthState::Success) {
                    log::info!("Peer {} authenticated", connection.remote_peer().truncate());
                    self.auth_success.emit(&());
                }
            }
            Err(e) => {
                if self.transition(AuthState::Failure) {
                    log::warn!(
                        "Authentication of peer {} failed: {}",
                        connection.remote_peer().truncate(),
                        e
                    );
                    connection.close().await;
                    self.auth_failure.emit(e);
                }
            }
        }
        result
    }

    async fn exchange(&self, connection: &dyn Connection) -> Result<(), AuthError> {
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut challenge);
        let request_id = Uuid::new_v4();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);

        let request = WireMessage::from(AuthMessage::Challenge {
            request_id,
            challenge: challenge.clone(),
        });
        connection.send(&request.encode()?).await?;

        let credential = rx
            .await
            .map_err(|_| AuthError::Transport(TransportError::Disconnected))?
            .ok_or(AuthError::NoCredential)?;

        if self.verifier.verify(&challenge, &credential).await {
            Ok(())
        } else {
            Err(AuthError::Rejected)
        }
    }

    fn transition(&self, to: AuthState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == AuthState::Initial {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Handle an auth message from the remote: answer its challenges,
    /// resolve responses to ours.
    pub async fn handle_message(&self, message: AuthMessage, connection: &dyn Connection) -> Result<(), TransportError> {
        match message {
            AuthMessage::Challenge { request_id, challenge } => {
                let credential = self.provider.provide(&challenge).await;
                if credential.is_none() {
                    log::debug!("Declining challenge {}", request_id);
                }
                let response = WireMessage::from(AuthMessage::Response {
                    request_id,
                    credential,
                });
                connection.send(&response.encode()?).await
            }
            AuthMessage::Response { request_id, credential } => {
                let pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                match pending {
                    Some(tx) => {
                        let _ = tx.send(credential);
                    }
                    None => log::warn!("Ignoring response to unknown challenge {}", request_id),
                }
                Ok(())
            }
        }
    }

    /// Fail every outstanding challenge. Called when the connection ends.
    pub fn abort(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{KeyPair, KeyPairAuthProvider};
    use crate::keys::PublicKey;
    use crate::protocol::simulated::SimConnection;
    use async_trait::async_trait;

    struct Accept(bool);

    #[async_trait]
    impl AuthVerifier for Accept {
        async fn verify(&self, challenge: &[u8], credential: &Credential) -> bool {
            self.0 && credential.proof.nonce.as_deref() == Some(challenge)
        }
    }

    struct Refuse;

    #[async_trait]
    impl AuthProvider for Refuse {
        async fn provide(&self, _challenge: &[u8]) -> Option<Credential> {
            None
        }
    }

    fn provider() -> Arc<dyn AuthProvider> {
        Arc::new(KeyPairAuthProvider::new(
            Arc::new(KeyPair::generate()),
            PublicKey::random(),
        ))
    }

    /// Run `local` challenging a remote side answered by `remote`.
    async fn run(local: AuthExtension, remote: AuthExtension) -> (Arc<AuthExtension>, Result<(), AuthError>) {
        let (a, b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        let local = Arc::new(local);
        let remote = Arc::new(remote);

        // Each side's receive loop.
        for (ext, conn) in [(Arc::clone(&local), Arc::clone(&a)), (Arc::clone(&remote), Arc::clone(&b))] {
            tokio::spawn(async move {
                while let Ok(data) = conn.recv().await {
                    if let Ok(WireMessage::Auth(message)) = WireMessage::decode(&data) {
                        let _ = ext.handle_message(message, &*conn).await;
                    }
                }
                ext.abort();
            });
        }

        let result = local.authenticate(&*a).await;
        (local, result)
    }

    #[tokio::test]
    async fn test_valid_credential_succeeds_once() {
        let local = AuthExtension::new(provider(), Arc::new(Accept(true)), Duration::from_secs(5));
        let mut successes = local.auth_success().subscribe();
        let remote = AuthExtension::new(provider(), Arc::new(Accept(true)), Duration::from_secs(5));

        let (local, result) = run(local, remote).await;
        assert_eq!(result, Ok(()));
        assert_eq!(local.state(), AuthState::Success);
        assert!(local.wait().await);
        successes.recv().await.unwrap();
        assert!(successes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejected_credential_fails() {
        let local = AuthExtension::new(provider(), Arc::new(Accept(false)), Duration::from_secs(5));
        let mut failures = local.auth_failure().subscribe();
        let remote = AuthExtension::new(provider(), Arc::new(Accept(true)), Duration::from_secs(5));

        let (local, result) = run(local, remote).await;
        assert_eq!(result, Err(AuthError::Rejected));
        assert_eq!(local.state(), AuthState::Failure);
        assert!(!local.wait().await);
        assert_eq!(failures.recv().await, Some(AuthError::Rejected));
    }

    #[tokio::test]
    async fn test_missing_credential_fails() {
        let local = AuthExtension::new(provider(), Arc::new(Accept(true)), Duration::from_secs(5));
        let remote = AuthExtension::new(Arc::new(Refuse), Arc::new(Accept(true)), Duration::from_secs(5));
        let (_, result) = run(local, remote).await;
        assert_eq!(result, Err(AuthError::NoCredential));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let local = AuthExtension::new(provider(), Arc::new(Accept(true)), Duration::from_secs(30));
        let (a, _b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        assert_eq!(local.authenticate(&*a).await, Err(AuthError::Timeout));
        assert_eq!(local.state(), AuthState::Failure);
        assert!(!a.is_connected());
    }
}
