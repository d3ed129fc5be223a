//! One open space

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::SpaceError;
use crate::config::Config;
use crate::credentials::{
    Assertion, Credential, Designation, FeedInfo, MemberRole, SpaceAuthVerifier, SpaceState,
};
use crate::feed::{Feed, FeedStore, Seq};
use crate::identity::{KeyPair, KeyPairAuthProvider, SwarmIdentity};
use crate::keys::PublicKey;
use crate::models::ModelFactory;
use crate::pipeline::{ControlPipeline, DataPipelineController};
use crate::protocol::{SpaceProtocol, Swarm};

/// Everything needed to open a space.
pub struct SpaceParams {
    pub space_key: PublicKey,
    pub genesis_feed_key: PublicKey,
    /// This device's control feed, writable.
    pub control_feed: Arc<Feed>,
    /// This device's data feed, writable.
    pub data_feed: Arc<Feed>,
    pub identity: Arc<KeyPair>,
    pub feed_store: Arc<dyn FeedStore>,
    pub swarm: Arc<dyn Swarm>,
    pub config: Config,
    pub factory: ModelFactory,
    /// Device keys trusted before their admission has been replicated.
    pub bootstrap_peers: Vec<PublicKey>,
}

pub struct Space {
    key: PublicKey,
    genesis_feed_key: PublicKey,
    identity: Arc<KeyPair>,
    control_feed: Arc<Feed>,
    data_feed: Arc<Feed>,
    feed_store: Arc<dyn FeedStore>,
    control: Arc<ControlPipeline>,
    data: Arc<DataPipelineController>,
    protocol: Arc<SpaceProtocol>,
    verifier: Arc<SpaceAuthVerifier>,
    shutdown_tx: broadcast::Sender<()>,
    wiring: Mutex<Option<JoinHandle<()>>>,
}

impl Space {
    /// Open a space: start the control pipeline and join the swarm. The
    /// data pipeline waits for `initialize_data_pipeline`.
    pub async fn open(params: SpaceParams) -> Result<Arc<Self>, SpaceError> {
        let SpaceParams {
            space_key,
            genesis_feed_key,
            control_feed,
            data_feed,
            identity,
            feed_store,
            swarm,
            config,
            factory,
            bootstrap_peers,
        } = params;

        let genesis_feed = if genesis_feed_key == control_feed.key() {
            Arc::clone(&control_feed)
        } else {
            feed_store.open_read_only_feed(genesis_feed_key).await?
        };

        let control = ControlPipeline::new(space_key, Arc::clone(&genesis_feed), Arc::clone(&feed_store));
        control.set_write_feed(Arc::clone(&control_feed));

        let verifier = Arc::new(
            SpaceAuthVerifier::new(control.state().clone(), config.protocol.verify_catch_up())
                .with_bootstrap_keys(bootstrap_peers),
        );
        let swarm_identity = SwarmIdentity {
            peer_key: identity.public_key(),
            credential_provider: Arc::new(KeyPairAuthProvider::new(Arc::clone(&identity), space_key)),
            credential_authenticator: verifier.clone(),
        };
        let protocol = SpaceProtocol::new(space_key, swarm, swarm_identity, config.protocol.clone());
        for feed in [&genesis_feed, &control_feed, &data_feed] {
            protocol.add_feed(Arc::clone(feed));
        }

        let data = DataPipelineController::new(space_key, factory, &config.data);
        let (shutdown_tx, _) = broadcast::channel(1);

        let space = Arc::new(Self {
            key: space_key,
            genesis_feed_key,
            identity,
            control_feed,
            data_feed,
            feed_store,
            control,
            data,
            protocol,
            verifier,
            shutdown_tx,
            wiring: Mutex::new(None),
        });

        space.start_wiring();
        space.control.start();
        if let Err(e) = space.protocol.start().await {
            let _ = space.close().await;
            return Err(e.into());
        }
        log::info!("Opened space {}", space_key.truncate());
        Ok(space)
    }

    /// Route every admitted feed to the protocol, and data feeds to the
    /// data pipeline.
    fn start_wiring(&self) {
        let mut admitted = self.control.feed_admitted().subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let feed_store = Arc::clone(&self.feed_store);
        let protocol = Arc::clone(&self.protocol);
        let data = Arc::clone(&self.data);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    info = admitted.recv() => match info {
                        Some(info) => wire_feed(&*feed_store, &protocol, &data, info).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
        *self.wiring.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn genesis_feed_key(&self) -> PublicKey {
        self.genesis_feed_key
    }

    pub fn control_feed_key(&self) -> PublicKey {
        self.control_feed.key()
    }

    pub fn data_feed_key(&self) -> PublicKey {
        self.data_feed.key()
    }

    pub fn identity_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn state(&self) -> &SpaceState {
        self.control.state()
    }

    pub fn control(&self) -> &Arc<ControlPipeline> {
        &self.control
    }

    pub fn data(&self) -> &Arc<DataPipelineController> {
        &self.data
    }

    pub fn protocol(&self) -> &Arc<SpaceProtocol> {
        &self.protocol
    }

    pub fn verifier(&self) -> &Arc<SpaceAuthVerifier> {
        &self.verifier
    }

    /// Start the data pipeline with this device's data feed and every data
    /// feed admitted so far.
    ///
    /// # Panics
    /// If the data pipeline is already initialized.
    pub async fn initialize_data_pipeline(&self) -> Result<(), SpaceError> {
        assert!(
            !self.data.is_initialized(),
            "Data pipeline of space {} is already initialized",
            self.key.truncate()
        );

        let mut feeds = Vec::new();
        for info in self.state().feeds() {
            if info.designation != Designation::Data || info.key == self.data_feed.key() {
                continue;
            }
            match self.feed_store.open_read_only_feed(info.key).await {
                Ok(feed) => feeds.push(feed),
                Err(e) => log::warn!("Could not open data feed {}: {}", info.key.truncate(), e),
            }
        }

        self.data.initialize(Some(Arc::clone(&self.data_feed)), feeds);
        self.data.start()?;
        Ok(())
    }

    /// Admit `key` as a member with `role`.
    pub fn admit_member(&self, key: PublicKey, role: MemberRole) -> Result<Seq, SpaceError> {
        let credential = Credential::issue(
            &self.identity,
            key,
            Assertion::SpaceMember {
                space_key: self.key,
                role,
                genesis_feed_key: self.genesis_feed_key,
            },
        )?;
        Ok(self.control.write_credential(credential)?)
    }

    /// Admit a feed written by `owner`'s device.
    pub fn admit_feed(&self, feed_key: PublicKey, owner: PublicKey, designation: Designation) -> Result<Seq, SpaceError> {
        let credential = Credential::issue(
            &self.identity,
            feed_key,
            Assertion::AdmittedFeed {
                space_key: self.key,
                identity_key: owner,
                device_key: owner,
                designation,
            },
        )?;
        Ok(self.control.write_credential(credential)?)
    }

    /// Stop replication, then the data pipeline, then the control pipeline.
    pub async fn close(&self) -> Result<(), SpaceError> {
        let _ = self.shutdown_tx.send(());
        let wiring = self.wiring.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(wiring) = wiring {
            if let Err(e) = wiring.await {
                log::error!("Wiring task of space {} failed: {}", self.key.truncate(), e);
            }
        }

        let stopped = self.protocol.stop().await;
        self.data.close().await;
        self.control.stop().await;
        log::info!("Closed space {}", self.key.truncate());
        Ok(stopped?)
    }
}

async fn wire_feed(
    feed_store: &dyn FeedStore,
    protocol: &SpaceProtocol,
    data: &DataPipelineController,
    info: FeedInfo,
) {
    let feed = match feed_store.open_read_only_feed(info.key).await {
        Ok(feed) => feed,
        Err(e) => {
            log::warn!("Could not open admitted feed {}: {}", info.key.truncate(), e);
            return;
        }
    };
    protocol.add_feed(Arc::clone(&feed));
    if info.designation == Designation::Data {
        data.add_feed(feed);
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("key", &self.key)
            .field("genesis_feed_key", &self.genesis_feed_key)
            .field("control_feed", &self.control_feed.key())
            .field("data_feed", &self.data_feed.key())
            .finish()
    }
}
