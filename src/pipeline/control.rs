//! Control pipeline: a space's membership log
//!
//! Merges the space's control feeds and folds their credentials into the
//! `SpaceState`. The set of merged feeds starts with the genesis feed and
//! grows as control feeds are admitted.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{write_timeframe, FeedSetIterator, PipelineError};
use crate::credentials::{Credential, Designation, FeedInfo, MemberInfo, SpaceEvent, SpaceState};
use crate::event::Event;
use crate::feed::{Feed, FeedBlock, FeedMessage, FeedStore, Payload, Seq, Timeframe};
use crate::keys::PublicKey;

pub struct ControlPipeline {
    genesis_feed_key: PublicKey,
    feed_store: Arc<dyn FeedStore>,
    iterator: FeedSetIterator,
    state: SpaceState,
    write_feed: Mutex<Option<Arc<Feed>>>,
    feed_admitted: Event<FeedInfo>,
    member_admitted: Event<MemberInfo>,
    credential_processed: Event<Credential>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPipeline {
    /// Must be called from within a tokio runtime.
    pub fn new(space_key: PublicKey, genesis_feed: Arc<Feed>, feed_store: Arc<dyn FeedStore>) -> Arc<Self> {
        let genesis_feed_key = genesis_feed.key();
        let iterator = FeedSetIterator::new(Timeframe::new());
        iterator.add_feed(genesis_feed);

        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            genesis_feed_key,
            feed_store,
            iterator,
            state: SpaceState::new(space_key),
            write_feed: Mutex::new(None),
            feed_admitted: Event::new("feed_admitted"),
            member_admitted: Event::new("member_admitted"),
            credential_processed: Event::new("credential_processed"),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn space_key(&self) -> PublicKey {
        self.state.space_key()
    }

    pub fn genesis_feed_key(&self) -> PublicKey {
        self.genesis_feed_key
    }

    /// Shared membership state.
    pub fn state(&self) -> &SpaceState {
        &self.state
    }

    pub fn feed_admitted(&self) -> &Event<FeedInfo> {
        &self.feed_admitted
    }

    pub fn member_admitted(&self) -> &Event<MemberInfo> {
        &self.member_admitted
    }

    pub fn credential_processed(&self) -> &Event<Credential> {
        &self.credential_processed
    }

    /// Timeframe of every credential processed so far.
    pub fn timeframe(&self) -> Timeframe {
        self.iterator.timeframe()
    }

    /// Control feeds currently merged.
    pub fn feeds(&self) -> Vec<PublicKey> {
        self.iterator.feeds()
    }

    /// Set the feed `write_credential` appends to.
    pub fn set_write_feed(&self, feed: Arc<Feed>) {
        *self.write_feed.lock().unwrap_or_else(PoisonError::into_inner) = Some(feed);
    }

    /// Append a credential to the write feed.
    pub fn write_credential(&self, credential: Credential) -> Result<Seq, PipelineError> {
        let feed = self
            .write_feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PipelineError::NoWriteFeed)?;
        let timeframe = write_timeframe(&self.iterator.timeframe(), &feed.key());
        let seq = feed.append(FeedMessage::credential(timeframe, credential))?;
        Ok(seq)
    }

    /// Spawn the consumer. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }

        let pipeline = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    block = pipeline.iterator.next() => match block {
                        Some(block) => pipeline.process_block(block).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            log::debug!(
                "Control pipeline for {} stopped",
                pipeline.space_key().truncate()
            );
        }));
    }

    /// Stop the consumer and wait for it to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.iterator.close();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Control pipeline task failed: {}", e);
            }
        }
    }

    async fn process_block(&self, block: FeedBlock) {
        let credential = match block.message.payload {
            Payload::Credential(credential) => credential,
            Payload::Data(_) => {
                log::warn!(
                    "Ignoring data message on control feed {} at seq {}",
                    block.feed_key.truncate(),
                    block.seq
                );
                return;
            }
        };

        let events = match self.state.process(&credential, block.feed_key) {
            Ok(events) => events,
            Err(e) => {
                log::warn!(
                    "Skipping credential {} from feed {}: {}",
                    credential.id,
                    block.feed_key.truncate(),
                    e
                );
                return;
            }
        };

        for event in events {
            match event {
                SpaceEvent::FeedAdmitted(info) => {
                    if info.designation == Designation::Control && info.key != self.genesis_feed_key {
                        self.add_control_feed(info.key).await;
                    }
                    self.feed_admitted.emit(&info);
                }
                SpaceEvent::MemberAdmitted(info) => self.member_admitted.emit(&info),
            }
        }
        self.credential_processed.emit(&credential);
    }

    async fn add_control_feed(&self, key: PublicKey) {
        match self.feed_store.open_read_only_feed(key).await {
            Ok(feed) => {
                if self.iterator.add_feed(feed) {
                    log::info!("Admitted control feed {}", key.truncate());
                }
            }
            Err(e) => log::warn!("Could not open control feed {}: {}", key.truncate(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Assertion, MemberRole};
    use crate::feed::MemoryFeedStore;
    use crate::identity::KeyPair;
    use std::time::Duration;

    struct Fixture {
        space: KeyPair,
        owner: KeyPair,
        store: Arc<MemoryFeedStore>,
        genesis_feed: Arc<Feed>,
        pipeline: Arc<ControlPipeline>,
    }

    async fn fixture() -> Fixture {
        let space = KeyPair::generate();
        let owner = KeyPair::generate();
        let store = Arc::new(MemoryFeedStore::new());
        let genesis_feed = store.open_feed(PublicKey::random(), true).await.unwrap();
        let pipeline = ControlPipeline::new(
            space.public_key(),
            Arc::clone(&genesis_feed),
            Arc::clone(&store) as Arc<dyn FeedStore>,
        );
        pipeline.set_write_feed(Arc::clone(&genesis_feed));
        Fixture {
            space,
            owner,
            store,
            genesis_feed,
            pipeline,
        }
    }

    impl Fixture {
        fn space_key(&self) -> PublicKey {
            self.space.public_key()
        }

        fn write_genesis(&self) {
            let genesis = Credential::issue(
                &self.space,
                self.space_key(),
                Assertion::SpaceGenesis {
                    space_key: self.space_key(),
                },
            )
            .unwrap();
            self.pipeline.write_credential(genesis).unwrap();
            let owner = Credential::issue(
                &self.space,
                self.owner.public_key(),
                Assertion::SpaceMember {
                    space_key: self.space_key(),
                    role: MemberRole::Owner,
                    genesis_feed_key: self.genesis_feed.key(),
                },
            )
            .unwrap();
            self.pipeline.write_credential(owner).unwrap();
        }

        fn admit_feed(&self, feed: PublicKey, designation: Designation) -> Credential {
            Credential::issue(
                &self.owner,
                feed,
                Assertion::AdmittedFeed {
                    space_key: self.space_key(),
                    identity_key: self.owner.public_key(),
                    device_key: self.owner.public_key(),
                    designation,
                },
            )
            .unwrap()
        }

        async fn wait_processed(&self, count: usize) {
            let mut rx = self.pipeline.state().watch();
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.pipeline.state().read(|m| m.processed()) < count {
                    rx.changed().await.unwrap();
                }
            })
            .await
            .expect("credentials not processed in time");
        }
    }

    #[tokio::test]
    async fn test_processes_genesis_feed() {
        let f = fixture().await;
        let mut members = f.pipeline.member_admitted().subscribe();
        f.pipeline.start();
        f.write_genesis();
        f.wait_processed(2).await;

        let member = members.recv().await.unwrap();
        assert_eq!(member.key, f.owner.public_key());
        f.pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_admitted_control_feed_joins_the_merge() {
        let f = fixture().await;
        let mut admitted = f.pipeline.feed_admitted().subscribe();
        f.pipeline.start();
        f.write_genesis();

        let second = f.store.open_feed(PublicKey::random(), true).await.unwrap();
        f.pipeline
            .write_credential(f.admit_feed(second.key(), Designation::Control))
            .unwrap();
        f.wait_processed(3).await;
        assert_eq!(admitted.recv().await.unwrap().key, second.key());
        assert!(f.pipeline.feeds().contains(&second.key()));

        // Credentials on the new control feed are now processed too.
        let data_feed = PublicKey::random();
        let tf = f.pipeline.timeframe();
        second
            .append(FeedMessage::credential(tf, f.admit_feed(data_feed, Designation::Data)))
            .unwrap();
        f.wait_processed(4).await;
        let info = admitted.recv().await.unwrap();
        assert_eq!(info.key, data_feed);
        assert_eq!(info.admitted_on, second.key());

        // Data feeds are not merged into the control pipeline.
        assert!(!f.pipeline.feeds().contains(&data_feed));
        f.pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_credentials_do_not_stop_the_loop() {
        let f = fixture().await;
        f.pipeline.start();

        // Admission before genesis is rejected...
        let early = f.admit_feed(PublicKey::random(), Designation::Data);
        f.pipeline.write_credential(early).unwrap();
        // ...and a tampered credential too.
        let mut tampered = f.admit_feed(PublicKey::random(), Designation::Data);
        tampered.subject = PublicKey::random();
        f.pipeline.write_credential(tampered).unwrap();

        f.write_genesis();
        f.wait_processed(2).await;
        assert_eq!(f.pipeline.state().members().len(), 1);
        assert!(f.pipeline.state().feeds().is_empty());
        f.pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_listener_is_contained() {
        let f = fixture().await;
        f.pipeline.credential_processed().on(|_| panic!("listener bug"));
        f.pipeline.start();
        f.write_genesis();
        f.wait_processed(2).await;
        f.pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_write_without_feed_fails() {
        let store: Arc<dyn FeedStore> = Arc::new(MemoryFeedStore::new());
        let genesis = store.open_feed(PublicKey::random(), true).await.unwrap();
        let pipeline = ControlPipeline::new(PublicKey::random(), genesis, store);
        let space = KeyPair::generate();
        let credential = Credential::issue(
            &space,
            space.public_key(),
            Assertion::SpaceGenesis {
                space_key: space.public_key(),
            },
        )
        .unwrap();
        assert!(matches!(
            pipeline.write_credential(credential),
            Err(PipelineError::NoWriteFeed)
        ));
    }
}
