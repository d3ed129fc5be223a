//! Swarm membership and sessions of one space
//!
//! Joins the space's discovery topic, opens a `SpaceProtocolSession` per
//! connection and keeps feeds and sessions cross-registered: every session
//! shares every feed, whichever was added first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::auth::AuthState;
use super::session::SpaceProtocolSession;
use super::transport::{discovery_topic, Connection, ConnectionHandler, JoinOptions, Swarm, Topic};
use super::TransportError;
use crate::config::ProtocolConfig;
use crate::event::Event;
use crate::feed::Feed;
use crate::identity::SwarmIdentity;
use crate::keys::PublicKey;

/// A session whose remote peer authenticated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionAuth {
    pub session_id: Uuid,
    pub peer_key: PublicKey,
}

pub struct SpaceProtocol {
    space_key: PublicKey,
    topic: Topic,
    identity: SwarmIdentity,
    swarm: Arc<dyn Swarm>,
    config: ProtocolConfig,
    // Lock order: feeds, then sessions.
    feeds: Mutex<HashMap<PublicKey, Arc<Feed>>>,
    sessions: Mutex<HashMap<Uuid, Arc<SpaceProtocolSession>>>,
    joined: tokio::sync::Mutex<bool>,
    session_auth: Event<SessionAuth>,
    session_rejected: Event<SessionAuth>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

/// Hands swarm connections to a protocol without keeping it alive.
struct ProtocolHandler(Weak<SpaceProtocol>);

#[async_trait]
impl ConnectionHandler for ProtocolHandler {
    async fn on_connection(&self, connection: Arc<dyn Connection>, initiator: bool) {
        match self.0.upgrade() {
            Some(protocol) => protocol.add_session(connection, initiator),
            None => connection.close().await,
        }
    }
}

impl SpaceProtocol {
    pub fn new(
        space_key: PublicKey,
        swarm: Arc<dyn Swarm>,
        identity: SwarmIdentity,
        config: ProtocolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            space_key,
            topic: discovery_topic(&space_key),
            identity,
            swarm,
            config,
            feeds: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            joined: tokio::sync::Mutex::new(false),
            session_auth: Event::new("session_auth"),
            session_rejected: Event::new("session_rejected"),
            monitors: Mutex::new(Vec::new()),
        })
    }

    pub fn space_key(&self) -> PublicKey {
        self.space_key
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn peer_key(&self) -> PublicKey {
        self.identity.peer_key
    }

    /// Fires once for every session whose remote authenticated.
    pub fn session_auth(&self) -> &Event<SessionAuth> {
        &self.session_auth
    }

    /// Fires for every session whose remote failed authentication.
    pub fn session_rejected(&self) -> &Event<SessionAuth> {
        &self.session_rejected
    }

    pub fn feeds(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        keys.sort();
        keys
    }

    pub fn sessions(&self) -> Vec<Arc<SpaceProtocolSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Replicate `feed` with every current and future session.
    pub fn add_feed(&self, feed: Arc<Feed>) {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if feeds.contains_key(&feed.key()) {
            return;
        }
        feeds.insert(feed.key(), Arc::clone(&feed));
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            session.add_feed(Arc::clone(&feed));
        }
        log::debug!(
            "Replicating feed {} with {} sessions",
            feed.key().truncate(),
            sessions.len()
        );
    }

    fn add_session(self: &Arc<Self>, connection: Arc<dyn Connection>, initiator: bool) {
        let session = {
            let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
            let session = SpaceProtocolSession::new(
                connection,
                initiator,
                &self.identity,
                feeds.values().cloned().collect(),
                self.config.auth_timeout(),
            );
            self.sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session.id(), Arc::clone(&session));
            session
        };
        log::debug!(
            "Session {} with {} opened",
            session.id(),
            session.remote_peer().truncate()
        );
        session.open();

        let protocol = Arc::clone(self);
        let monitor = tokio::spawn(async move {
            let authenticated = tokio::select! {
                authenticated = session.auth().wait() => authenticated,
                _ = session.wait_closed() => false,
            };
            let info = SessionAuth {
                session_id: session.id(),
                peer_key: session.remote_peer(),
            };
            if authenticated {
                protocol.session_auth.emit(&info);
            } else if session.auth_state() == AuthState::Failure {
                protocol.session_rejected.emit(&info);
            }
            session.wait_closed().await;
            protocol
                .sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session.id());
        });

        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        monitors.retain(|task| !task.is_finished());
        monitors.push(monitor);
    }

    /// Join the discovery topic. Calling it again has no effect.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut joined = self.joined.lock().await;
        if *joined {
            return Ok(());
        }
        self.swarm
            .join(JoinOptions {
                topic: self.topic,
                peer_id: self.identity.peer_key,
                topology: self.config.topology.clone(),
                handler: Arc::new(ProtocolHandler(Arc::downgrade(self))),
            })
            .await?;
        *joined = true;
        log::info!(
            "Joined swarm for space {} as {}",
            self.space_key.truncate(),
            self.identity.peer_key.truncate()
        );
        Ok(())
    }

    /// Leave the topic and close every session. Calling it again has no
    /// effect.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let mut joined = self.joined.lock().await;
        if !*joined {
            return Ok(());
        }
        *joined = false;
        let left = self.swarm.leave(&self.topic, &self.identity.peer_key).await;

        let sessions: Vec<_> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.close().await;
        }

        let monitors: Vec<_> = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for monitor in monitors {
            let _ = monitor.await;
        }
        log::info!("Left swarm for space {}", self.space_key.truncate());
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::feed::{FeedMessage, Timeframe};
    use crate::identity::{AuthVerifier, KeyPair, KeyPairAuthProvider};
    use crate::item::ItemMutation;
    use crate::protocol::SimSwarm;
    use std::time::Duration;

    struct Allow(Vec<PublicKey>);

    #[async_trait]
    impl AuthVerifier for Allow {
        async fn verify(&self, _challenge: &[u8], credential: &Credential) -> bool {
            credential.verify().is_ok() && self.0.contains(&credential.issuer)
        }
    }

    struct Peer {
        device: Arc<KeyPair>,
        protocol: Arc<SpaceProtocol>,
    }

    fn peer(space: PublicKey, swarm: &SimSwarm, device: Arc<KeyPair>, allowed: Vec<PublicKey>) -> Peer {
        let identity = SwarmIdentity {
            peer_key: device.public_key(),
            credential_provider: Arc::new(KeyPairAuthProvider::new(Arc::clone(&device), space)),
            credential_authenticator: Arc::new(Allow(allowed)),
        };
        let protocol = SpaceProtocol::new(space, Arc::new(swarm.clone()), identity, ProtocolConfig::default());
        Peer { device, protocol }
    }

    fn entry(n: u64) -> FeedMessage {
        FeedMessage::data(Timeframe::new(), ItemMutation::new(format!("obj-{}", n)), None)
    }

    async fn wait_len(feed: &Feed, len: u64) {
        let mut rx = feed.watch_len();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|l| *l >= len))
            .await
            .expect("feed did not replicate")
            .unwrap();
    }

    #[tokio::test]
    async fn test_feeds_added_before_and_after_connecting_replicate() {
        let swarm = SimSwarm::new();
        let space = PublicKey::random();
        let (da, db) = (Arc::new(KeyPair::generate()), Arc::new(KeyPair::generate()));
        let keys = vec![da.public_key(), db.public_key()];
        let a = peer(space, &swarm, da, keys.clone());
        let b = peer(space, &swarm, db, keys);
        let mut auths = a.protocol.session_auth().subscribe();

        let early_key = PublicKey::random();
        let early = Arc::new(Feed::new(early_key, true));
        early.append(entry(0)).unwrap();
        a.protocol.add_feed(Arc::clone(&early));
        let early_copy = Arc::new(Feed::new(early_key, false));
        b.protocol.add_feed(Arc::clone(&early_copy));

        a.protocol.start().await.unwrap();
        a.protocol.start().await.unwrap();
        b.protocol.start().await.unwrap();

        let auth = tokio::time::timeout(Duration::from_secs(5), auths.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(auth.peer_key, b.device.public_key());
        wait_len(&early_copy, 1).await;

        let late_key = PublicKey::random();
        let late_copy = Arc::new(Feed::new(late_key, false));
        b.protocol.add_feed(Arc::clone(&late_copy));
        let late = Arc::new(Feed::new(late_key, true));
        late.append(entry(1)).unwrap();
        late.append(entry(2)).unwrap();
        a.protocol.add_feed(late);
        wait_len(&late_copy, 2).await;
        // Reported once per session.
        assert!(auths.try_recv().is_err());

        a.protocol.stop().await.unwrap();
        a.protocol.stop().await.unwrap();
        b.protocol.stop().await.unwrap();
        assert!(a.protocol.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_peer_is_not_replicated_to() {
        let swarm = SimSwarm::new();
        let space = PublicKey::random();
        let (da, db) = (Arc::new(KeyPair::generate()), Arc::new(KeyPair::generate()));
        // A only trusts itself; B trusts both.
        let a = peer(space, &swarm, Arc::clone(&da), vec![da.public_key()]);
        let b = peer(space, &swarm, Arc::clone(&db), vec![da.public_key(), db.public_key()]);
        let mut rejections = a.protocol.session_rejected().subscribe();

        let key = PublicKey::random();
        let feed = Arc::new(Feed::new(key, true));
        feed.append(entry(0)).unwrap();
        a.protocol.add_feed(feed);
        let copy = Arc::new(Feed::new(key, false));
        b.protocol.add_feed(Arc::clone(&copy));

        a.protocol.start().await.unwrap();
        b.protocol.start().await.unwrap();

        // A rejects B and the connection is dropped.
        let rejected = tokio::time::timeout(Duration::from_secs(5), rejections.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.peer_key, db.public_key());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(copy.is_empty());

        a.protocol.stop().await.unwrap();
        b.protocol.stop().await.unwrap();
    }
}
