//! One authenticated replication session per connection

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::auth::{AuthExtension, AuthState};
use super::messages::WireMessage;
use super::replicator::ReplicatorExtension;
use super::transport::Connection;
use crate::feed::Feed;
use crate::identity::SwarmIdentity;
use crate::keys::PublicKey;

pub struct SpaceProtocolSession {
    id: Uuid,
    connection: Arc<dyn Connection>,
    initiator: bool,
    auth: AuthExtension,
    replicator: Arc<ReplicatorExtension>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Option<SessionTasks>>,
}

struct SessionTasks {
    receive: JoinHandle<()>,
    authenticate: JoinHandle<()>,
}

impl SpaceProtocolSession {
    /// Session over `connection`, sharing `feeds` once authenticated.
    pub fn new(
        connection: Arc<dyn Connection>,
        initiator: bool,
        identity: &SwarmIdentity,
        feeds: Vec<Arc<Feed>>,
        auth_timeout: Duration,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            auth: AuthExtension::new(
                Arc::clone(&identity.credential_provider),
                Arc::clone(&identity.credential_authenticator),
                auth_timeout,
            ),
            replicator: ReplicatorExtension::new(Arc::clone(&connection), feeds),
            connection,
            initiator,
            closed,
            tasks: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_peer(&self) -> PublicKey {
        self.connection.remote_peer()
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn auth(&self) -> &AuthExtension {
        &self.auth
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.state()
    }

    pub fn replicator(&self) -> &Arc<ReplicatorExtension> {
        &self.replicator
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Share another feed. Ignored once authentication failed.
    pub fn add_feed(&self, feed: Arc<Feed>) {
        if self.auth.state() == AuthState::Failure {
            return;
        }
        self.replicator.add_feed(feed);
    }

    /// Start the receive loop and authenticate the remote.
    pub fn open(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_some() || self.is_closed() {
            return;
        }

        let session = Arc::clone(self);
        let receive = tokio::spawn(async move {
            session.receive_loop().await;
        });

        let session = Arc::clone(self);
        let authenticate = tokio::spawn(async move {
            if session.auth.authenticate(&*session.connection).await.is_ok() {
                session.replicator.enable();
            }
        });

        *tasks = Some(SessionTasks { receive, authenticate });
    }

    async fn receive_loop(&self) {
        let peer = self.remote_peer().truncate();
        loop {
            let data = match self.connection.recv().await {
                Ok(data) => data,
                Err(e) => {
                    log::debug!("Session {} with {} ended: {}", self.id, peer, e);
                    break;
                }
            };
            match WireMessage::decode(&data) {
                Ok(WireMessage::Auth(message)) => {
                    if let Err(e) = self.auth.handle_message(message, &*self.connection).await {
                        log::warn!("Auth message from {} failed: {}", peer, e);
                    }
                }
                Ok(WireMessage::Replicator(message)) => self.replicator.handle_message(message),
                Err(e) => log::warn!("Failed to decode message from {}: {}", peer, e),
            }
        }

        self.auth.abort();
        self.replicator.stop().await;
        self.closed.send_replace(true);
    }

    /// Resolves once the session has ended.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Close the connection and wait for the session's tasks.
    pub async fn close(&self) {
        self.connection.close().await;
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(SessionTasks { receive, authenticate }) = tasks {
            // Verification may be waiting on the credential log.
            authenticate.abort();
            let _ = authenticate.await;
            if let Err(e) = receive.await {
                log::error!("Session {} receive task failed: {}", self.id, e);
            }
        }
        self.replicator.stop().await;
        self.closed.send_replace(true);
    }
}

impl std::fmt::Debug for SpaceProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceProtocolSession")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer())
            .field("initiator", &self.initiator)
            .field("auth", &self.auth.state())
            .finish()
    }
}
