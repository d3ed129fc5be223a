//! SpaceManager: the spaces of one local identity

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{Space, SpaceError, SpaceParams};
use crate::config::Config;
use crate::credentials::{Assertion, Credential, Designation, MemberRole};
use crate::feed::{Feed, FeedMessage, FeedStore, Timeframe};
use crate::identity::KeyPair;
use crate::keys::PublicKey;
use crate::models::{Model, ModelFactory};
use crate::protocol::Swarm;

/// Creates, accepts and tracks open spaces. The identity key doubles as the
/// device key.
pub struct SpaceManager {
    identity: Arc<KeyPair>,
    feed_store: Arc<dyn FeedStore>,
    swarm: Arc<dyn Swarm>,
    config: Config,
    factory: ModelFactory,
    spaces: RwLock<HashMap<PublicKey, Arc<Space>>>,
}

impl SpaceManager {
    pub fn new(identity: Arc<KeyPair>, feed_store: Arc<dyn FeedStore>, swarm: Arc<dyn Swarm>, config: Config) -> Self {
        Self {
            identity,
            feed_store,
            swarm,
            config,
            factory: ModelFactory::with_defaults(),
            spaces: RwLock::new(HashMap::new()),
        }
    }

    /// Make model `M` available to spaces opened from now on.
    pub fn register_model<M: Model>(&mut self) {
        self.factory.register::<M>();
    }

    pub fn identity_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn new_feed(&self) -> Result<Arc<Feed>, SpaceError> {
        Ok(self.feed_store.open_feed(PublicKey::random(), true).await?)
    }

    /// Create a space owned by this identity.
    ///
    /// The new control feed doubles as the genesis feed and starts with the
    /// space genesis, the owner's membership and the admission of both of
    /// this device's feeds.
    pub async fn create_space(&self) -> Result<Arc<Space>, SpaceError> {
        let space_keys = KeyPair::generate();
        let space_key = space_keys.public_key();
        let owner = self.identity.public_key();
        let control_feed = self.new_feed().await?;
        let data_feed = self.new_feed().await?;

        let genesis = [
            Credential::issue(&space_keys, space_key, Assertion::SpaceGenesis { space_key })?,
            Credential::issue(
                &space_keys,
                owner,
                Assertion::SpaceMember {
                    space_key,
                    role: MemberRole::Owner,
                    genesis_feed_key: control_feed.key(),
                },
            )?,
            admitted_feed(&space_keys, space_key, control_feed.key(), owner, Designation::Control)?,
            admitted_feed(&space_keys, space_key, data_feed.key(), owner, Designation::Data)?,
        ];
        for credential in genesis {
            control_feed.append(FeedMessage::credential(Timeframe::new(), credential))?;
        }

        let genesis_feed_key = control_feed.key();
        self.open(space_key, genesis_feed_key, control_feed, data_feed, Vec::new())
            .await
    }

    /// Join an existing space.
    ///
    /// This device's new feeds only replicate to others once a member admits
    /// them (see `Space::admit_feed`). `bootstrap_peers` are trusted until
    /// the local credential log has caught up.
    pub async fn accept_space(
        &self,
        space_key: PublicKey,
        genesis_feed_key: PublicKey,
        bootstrap_peers: Vec<PublicKey>,
    ) -> Result<Arc<Space>, SpaceError> {
        if self.spaces.read().await.contains_key(&space_key) {
            return Err(SpaceError::AlreadyOpen(space_key));
        }
        let control_feed = self.new_feed().await?;
        let data_feed = self.new_feed().await?;
        self.open(space_key, genesis_feed_key, control_feed, data_feed, bootstrap_peers)
            .await
    }

    async fn open(
        &self,
        space_key: PublicKey,
        genesis_feed_key: PublicKey,
        control_feed: Arc<Feed>,
        data_feed: Arc<Feed>,
        bootstrap_peers: Vec<PublicKey>,
    ) -> Result<Arc<Space>, SpaceError> {
        if self.spaces.read().await.contains_key(&space_key) {
            return Err(SpaceError::AlreadyOpen(space_key));
        }

        let space = Space::open(SpaceParams {
            space_key,
            genesis_feed_key,
            control_feed,
            data_feed,
            identity: Arc::clone(&self.identity),
            feed_store: Arc::clone(&self.feed_store),
            swarm: Arc::clone(&self.swarm),
            config: self.config.clone(),
            factory: self.factory.clone(),
            bootstrap_peers,
        })
        .await?;
        space.initialize_data_pipeline().await?;

        let mut spaces = self.spaces.write().await;
        if spaces.contains_key(&space_key) {
            drop(spaces);
            let _ = space.close().await;
            return Err(SpaceError::AlreadyOpen(space_key));
        }
        spaces.insert(space_key, Arc::clone(&space));
        Ok(space)
    }

    pub async fn get(&self, space_key: &PublicKey) -> Option<Arc<Space>> {
        self.spaces.read().await.get(space_key).cloned()
    }

    pub async fn spaces(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.spaces.read().await.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Close one space.
    pub async fn close_space(&self, space_key: &PublicKey) -> Result<(), SpaceError> {
        let space = self
            .spaces
            .write()
            .await
            .remove(space_key)
            .ok_or(SpaceError::NotFound(*space_key))?;
        space.close().await
    }

    /// Close every open space.
    pub async fn close(&self) {
        let spaces: Vec<_> = self.spaces.write().await.drain().map(|(_, s)| s).collect();
        for space in spaces {
            if let Err(e) = space.close().await {
                log::warn!("Error closing space {}: {}", space.key().truncate(), e);
            }
        }
    }
}

fn admitted_feed(
    space_keys: &KeyPair,
    space_key: PublicKey,
    feed_key: PublicKey,
    owner: PublicKey,
    designation: Designation,
) -> Result<Credential, SpaceError> {
    Ok(Credential::issue(
        space_keys,
        feed_key,
        Assertion::AdmittedFeed {
            space_key,
            identity_key: owner,
            device_key: owner,
            designation,
        },
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeedStore;
    use crate::models::{ObjectModel, ObjectMutation, Value};
    use crate::protocol::SimSwarm;
    use std::time::Duration;

    fn manager(swarm: &SimSwarm) -> SpaceManager {
        SpaceManager::new(
            Arc::new(KeyPair::generate()),
            Arc::new(MemoryFeedStore::new()),
            Arc::new(swarm.clone()),
            Config::default(),
        )
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_create_space_admits_owner_and_feeds() {
        let swarm = SimSwarm::new();
        let manager = manager(&swarm);
        let space = manager.create_space().await.unwrap();

        wait_for(|| space.state().feeds().len() == 2).await;
        let members = space.state().members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].key, manager.identity_key());
        assert_eq!(members[0].role, MemberRole::Owner);
        assert_eq!(space.genesis_feed_key(), space.control_feed_key());
        assert_eq!(space.protocol().feeds().len(), 2);

        let receipt = space.data().create::<ObjectModel>(None).unwrap();
        let id = receipt.object_id.clone();
        assert!(receipt.confirmed().await);
        space
            .data()
            .mutate::<ObjectModel>(&id, &ObjectMutation::set("name", Value::string("plans")))
            .unwrap();
        space.data().flush().await;

        assert_eq!(manager.spaces().await, vec![space.key()]);
        manager.close_space(&space.key()).await.unwrap();
        assert!(manager.get(&space.key()).await.is_none());
        assert!(matches!(
            manager.close_space(&space.key()).await,
            Err(SpaceError::NotFound(_))
        ));
    }

    #[tokio::test]
    #[should_panic(expected = "already initialized")]
    async fn test_data_pipeline_initializes_once() {
        let swarm = SimSwarm::new();
        let manager = manager(&swarm);
        let space = manager.create_space().await.unwrap();
        let _ = space.initialize_data_pipeline().await;
    }
}
