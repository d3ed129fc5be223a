//! Data pipeline: application objects of a space
//!
//! Merges the admitted data feeds into one causal stream and feeds it to an
//! `ItemManager`. Local writes are applied optimistically, appended to the
//! write feed with a client tag, and confirmed once they come back through
//! the merged stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{write_timeframe, FeedSetIterator, PipelineError, SnapshotStore};
use crate::config::DataConfig;
use crate::event::Event;
use crate::feed::{Feed, FeedBlock, FeedMessage, Payload, Seq, Timeframe};
use crate::item::{DatabaseSnapshot, Item, ItemAction, ItemError, ItemManager, ItemMutation, ObjectId};
use crate::keys::PublicKey;
use crate::models::{Model, ModelFactory};

/// Handle to a local write.
#[derive(Debug)]
pub struct WriteReceipt {
    pub object_id: ObjectId,
    pub client_tag: String,
    pub feed_key: PublicKey,
    pub seq: Seq,
    confirmed: oneshot::Receiver<()>,
}

impl WriteReceipt {
    /// Wait until the write has come back through the merged stream.
    /// Returns false if the pipeline closed first.
    pub async fn confirmed(self) -> bool {
        self.confirmed.await.is_ok()
    }
}

struct Shared {
    items: ItemManager,
    pending: HashMap<String, oneshot::Sender<()>>,
    since_snapshot: u64,
}

pub struct DataPipelineController {
    space_key: PublicKey,
    snapshot_interval: u64,
    snapshot_store: Option<SnapshotStore>,
    iterator: OnceLock<FeedSetIterator>,
    writer: OnceLock<Option<Arc<Feed>>>,
    early_feeds: Mutex<Vec<Arc<Feed>>>,
    shared: Mutex<Shared>,
    pending_count: watch::Sender<usize>,
    item_updated: Event<ObjectId>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DataPipelineController {
    pub fn new(space_key: PublicKey, factory: ModelFactory, config: &DataConfig) -> Arc<Self> {
        let (pending_count, _) = watch::channel(0);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            space_key,
            snapshot_interval: config.snapshot_interval.max(1),
            snapshot_store: config.snapshot_dir.clone().map(SnapshotStore::new),
            iterator: OnceLock::new(),
            writer: OnceLock::new(),
            early_feeds: Mutex::new(Vec::new()),
            shared: Mutex::new(Shared {
                items: ItemManager::new(factory),
                pending: HashMap::new(),
                since_snapshot: 0,
            }),
            pending_count,
            item_updated: Event::new("item_updated"),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn space_key(&self) -> PublicKey {
        self.space_key
    }

    /// Fires with the id of every object changed by a confirmed message.
    pub fn item_updated(&self) -> &Event<ObjectId> {
        &self.item_updated
    }

    pub fn is_initialized(&self) -> bool {
        self.iterator.get().is_some()
    }

    fn iterator(&self) -> Result<&FeedSetIterator, PipelineError> {
        self.iterator.get().ok_or(PipelineError::NotInitialized)
    }

    fn writer(&self) -> Result<&Arc<Feed>, PipelineError> {
        self.writer
            .get()
            .and_then(Option::as_ref)
            .ok_or(PipelineError::NoWriteFeed)
    }

    /// Restore the latest snapshot and set up the merged stream.
    ///
    /// # Panics
    /// If called more than once.
    pub fn initialize(&self, writer: Option<Arc<Feed>>, feeds: Vec<Arc<Feed>>) {
        assert!(
            !self.is_initialized(),
            "Data pipeline for {} already initialized",
            self.space_key.truncate()
        );

        // Held until the iterator is set so no early feed is missed.
        let mut early = self.early_feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let start = self.restore_snapshot().unwrap_or_default();
        let iterator = FeedSetIterator::new(start);
        for feed in writer.iter().cloned().chain(feeds).chain(early.drain(..)) {
            iterator.add_feed(feed);
        }

        if self.iterator.set(iterator).is_err() {
            panic!("Data pipeline for {} already initialized", self.space_key.truncate());
        }
        let _ = self.writer.set(writer);
        drop(early);
    }

    fn restore_snapshot(&self) -> Option<Timeframe> {
        let store = self.snapshot_store.as_ref()?;
        match store.load(&self.space_key) {
            Ok(Some(snapshot)) => {
                let timeframe = snapshot.timeframe.clone();
                log::info!(
                    "Restoring {} objects of space {} from snapshot",
                    snapshot.items.len(),
                    self.space_key.truncate()
                );
                self.lock().items.restore(snapshot);
                Some(timeframe)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Ignoring unreadable snapshot: {}", e);
                None
            }
        }
    }

    /// Merge another data feed. Feeds added before `initialize` are kept
    /// until then.
    pub fn add_feed(&self, feed: Arc<Feed>) {
        let mut early = self.early_feeds.lock().unwrap_or_else(PoisonError::into_inner);
        match self.iterator.get() {
            Some(iterator) => {
                drop(early);
                iterator.add_feed(feed);
            }
            None => early.push(feed),
        }
    }

    pub fn feeds(&self) -> Vec<PublicKey> {
        self.iterator.get().map(FeedSetIterator::feeds).unwrap_or_default()
    }

    /// Timeframe of every message processed so far.
    pub fn timeframe(&self) -> Timeframe {
        self.iterator
            .get()
            .map(FeedSetIterator::timeframe)
            .unwrap_or_default()
    }

    /// Make a model type available. Objects of that type created earlier
    /// are initialized now.
    pub fn register_model<M: Model>(&self) {
        self.lock().items.register_model::<M>();
    }

    /// Spawn the consumer. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) -> Result<(), PipelineError> {
        self.iterator()?;
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Ok(());
        }

        let pipeline = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let Some(iterator) = pipeline.iterator.get() else {
                return;
            };
            loop {
                tokio::select! {
                    block = iterator.next() => match block {
                        Some(block) => pipeline.process_block(block),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        }));
        Ok(())
    }

    fn process_block(&self, block: FeedBlock) {
        let FeedBlock {
            feed_key,
            seq,
            message,
        } = block;
        let data = match message.payload {
            Payload::Data(data) => data,
            Payload::Credential(_) => {
                log::warn!(
                    "Ignoring credential on data feed {} at seq {}",
                    feed_key.truncate(),
                    seq
                );
                return;
            }
        };

        let (updated, snapshot) = {
            let mut shared = self.lock();
            if let Some(tag) = &data.client_tag {
                if let Some(done) = shared.pending.remove(tag) {
                    let _ = done.send(());
                    self.pending_count.send_replace(shared.pending.len());
                }
            }

            let updated = match shared.items.process_confirmed(feed_key, seq, message.timeframe, data) {
                Ok(id) => Some(id),
                Err(e) => {
                    log::warn!("Skipping message {} of feed {}: {}", seq, feed_key.truncate(), e);
                    None
                }
            };

            shared.since_snapshot += 1;
            let snapshot = if self.snapshot_store.is_some()
                && shared.since_snapshot >= self.snapshot_interval
                && shared.pending.is_empty()
            {
                shared.since_snapshot = 0;
                Some(shared.items.create_snapshot(self.timeframe()))
            } else {
                None
            };
            (updated, snapshot)
        };

        if let Some(snapshot) = snapshot {
            self.store_snapshot(&snapshot);
        }
        if let Some(id) = updated {
            self.item_updated.emit(&id);
        }
    }

    fn store_snapshot(&self, snapshot: &DatabaseSnapshot) {
        if let Some(store) = &self.snapshot_store {
            match store.save(&self.space_key, snapshot) {
                Ok(()) => log::debug!(
                    "Saved snapshot of {} at {} messages",
                    self.space_key.truncate(),
                    snapshot.timeframe.total_messages()
                ),
                Err(e) => log::warn!("Could not save snapshot: {}", e),
            }
        }
    }

    /// Snapshot every object once no local write is pending.
    ///
    /// Waits for pending writes to be confirmed, so the pipeline must be
    /// started.
    pub async fn save_snapshot(&self) -> Result<DatabaseSnapshot, PipelineError> {
        let store = self
            .snapshot_store
            .as_ref()
            .ok_or_else(|| PipelineError::SnapshotError("no snapshot store configured".into()))?;
        let snapshot = loop {
            self.flush().await;
            let mut shared = self.lock();
            // A write may have started since the flush.
            if shared.pending.is_empty() {
                shared.since_snapshot = 0;
                break shared.items.create_snapshot(self.timeframe());
            }
        };
        store.save(&self.space_key, &snapshot)?;
        Ok(snapshot)
    }

    /// Append `mutation` under `client_tag` and track it until confirmed.
    /// Runs with the shared state locked so the confirmation cannot
    /// overtake the bookkeeping.
    fn append(
        &self,
        shared: &mut Shared,
        mutation: ItemMutation,
        client_tag: String,
    ) -> Result<WriteReceipt, PipelineError> {
        let writer = self.writer()?;
        let object_id = mutation.object_id.clone();
        let timeframe = write_timeframe(&self.timeframe(), &writer.key());

        let seq = writer.append(FeedMessage::data(timeframe, mutation, Some(client_tag.clone())))?;

        let (done, confirmed) = oneshot::channel();
        shared.pending.insert(client_tag.clone(), done);
        self.pending_count.send_replace(shared.pending.len());

        Ok(WriteReceipt {
            object_id,
            client_tag,
            feed_key: writer.key(),
            seq,
            confirmed,
        })
    }

    /// Create an object. It is visible locally right away.
    pub fn create_object(
        &self,
        model_type: &str,
        parent_id: Option<ObjectId>,
        model: Option<Vec<u8>>,
    ) -> Result<WriteReceipt, PipelineError> {
        self.writer()?;
        let mut shared = self.lock();
        // The genesis comes back matched by this tag.
        let client_tag = Uuid::new_v4().to_string();
        let genesis = shared
            .items
            .create_object(model_type, parent_id, model, client_tag.clone());
        self.append(&mut shared, genesis, client_tag)
    }

    /// Create an object of model `M`, optionally with an initial mutation.
    pub fn create<M: Model>(&self, initial: Option<&M::Mutation>) -> Result<WriteReceipt, PipelineError> {
        let model = initial.map(M::encode_mutation).transpose()?;
        self.create_object(M::TYPE_NAME, None, model)
    }

    /// Write an arbitrary mutation of an existing object.
    pub fn write(&self, mutation: ItemMutation) -> Result<WriteReceipt, PipelineError> {
        let mut shared = self.lock();
        if shared.items.get(&mutation.object_id).is_none() {
            return Err(ItemError::NotFound(mutation.object_id).into());
        }
        let receipt = self.append(&mut shared, mutation.clone(), Uuid::new_v4().to_string())?;
        shared
            .items
            .process_optimistic(receipt.client_tag.clone(), mutation)?;
        Ok(receipt)
    }

    pub fn mutate<M: Model>(&self, object_id: &str, mutation: &M::Mutation) -> Result<WriteReceipt, PipelineError> {
        self.write(ItemMutation::new(object_id).with_model::<M>(mutation)?)
    }

    pub fn delete(&self, object_id: &str) -> Result<WriteReceipt, PipelineError> {
        self.write(ItemMutation::new(object_id).with_action(ItemAction::Delete))
    }

    pub fn restore(&self, object_id: &str) -> Result<WriteReceipt, PipelineError> {
        self.write(ItemMutation::new(object_id).with_action(ItemAction::Restore))
    }

    pub fn set_parent(&self, object_id: &str, parent_id: &str) -> Result<WriteReceipt, PipelineError> {
        self.write(ItemMutation::new(object_id).with_parent(parent_id))
    }

    /// Run `f` against one object.
    pub fn with_item<R>(&self, object_id: &str, f: impl FnOnce(&Item) -> R) -> Option<R> {
        self.lock().items.get(object_id).map(f)
    }

    /// Run `f` against all objects.
    pub fn with_items<R>(&self, f: impl FnOnce(&ItemManager) -> R) -> R {
        f(&self.lock().items)
    }

    /// Local writes not confirmed yet.
    pub fn pending_writes(&self) -> usize {
        *self.pending_count.borrow()
    }

    /// Wait until every local write so far has been confirmed.
    pub async fn flush(&self) {
        let mut count = self.pending_count.subscribe();
        while *count.borrow_and_update() > 0 {
            if count.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait for in-flight writes, then stop the consumer.
    pub async fn close(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            self.flush().await;
            let _ = self.shutdown_tx.send(());
            if let Some(iterator) = self.iterator.get() {
                iterator.close();
            }
            if let Err(e) = task.await {
                log::error!("Data pipeline task failed: {}", e);
            }
        } else if let Some(iterator) = self.iterator.get() {
            iterator.close();
        }

        let mut shared = self.lock();
        shared.pending.clear();
        self.pending_count.send_replace(0);
    }
}
