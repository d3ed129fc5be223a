//! Dispatch of feed entries to items

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Item, ItemError, ItemMutation, ItemSnapshot, ObjectId, SnapshotMeta};
use crate::feed::{DataMessage, Seq, Timeframe};
use crate::keys::PublicKey;
use crate::models::{Model, ModelFactory, ModelType};

/// Every item's snapshot, taken at `timeframe`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub timeframe: Timeframe,
    pub items: Vec<ItemSnapshot>,
}

pub struct ItemManager {
    factory: ModelFactory,
    items: BTreeMap<ObjectId, Item>,
}

impl ItemManager {
    pub fn new(factory: ModelFactory) -> Self {
        Self {
            factory,
            items: BTreeMap::new(),
        }
    }

    pub fn factory(&self) -> &ModelFactory {
        &self.factory
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Register a model type and initialize items that were waiting for it.
    pub fn register_model<M: Model>(&mut self) {
        self.factory.register::<M>();
        self.initialize_pending();
    }

    fn initialize_pending(&mut self) {
        for item in self.items.values_mut() {
            if item.is_initialized() {
                continue;
            }
            let constructor = item.model_type().and_then(|t| self.factory.constructor(t));
            if let Some(constructor) = constructor {
                item.initialize(constructor);
            }
        }
    }

    fn insert(&mut self, snapshot: ItemSnapshot) -> &mut Item {
        let mut item = Item::new(snapshot);
        let constructor = item.model_type().and_then(|t| self.factory.constructor(t));
        match constructor {
            Some(constructor) => item.initialize(constructor),
            None => log::debug!(
                "Item {} waits for model type {:?}",
                item.id(),
                item.model_type()
            ),
        }
        let id = item.id().clone();
        self.items.entry(id).or_insert(item)
    }

    /// Create an object locally. The returned genesis mutation still has to
    /// be written to a feed with the same `client_tag`.
    pub fn create_object(
        &mut self,
        model_type: impl Into<ModelType>,
        parent_id: Option<ObjectId>,
        model: Option<Vec<u8>>,
        client_tag: String,
    ) -> ItemMutation {
        let mut mutation = ItemMutation::genesis(model_type);
        mutation.parent_id = parent_id;
        mutation.model = model;

        let meta = SnapshotMeta {
            client_tag: Some(client_tag),
            feed_key: None,
        };
        self.insert(ItemSnapshot::from_genesis(mutation.clone(), meta));
        mutation
    }

    /// Apply a locally written, not yet confirmed mutation.
    pub fn process_optimistic(&mut self, client_tag: String, mutation: ItemMutation) -> Result<(), ItemError> {
        let item = self
            .items
            .get_mut(&mutation.object_id)
            .ok_or_else(|| ItemError::NotFound(mutation.object_id.clone()))?;
        item.process_optimistic_mutation(client_tag, mutation)
    }

    /// Apply a mutation observed on a feed. Returns the affected object.
    pub fn process_confirmed(
        &mut self,
        feed_key: PublicKey,
        seq: Seq,
        timeframe: Timeframe,
        message: DataMessage,
    ) -> Result<ObjectId, ItemError> {
        let DataMessage { mutation, client_tag } = message;
        let id = mutation.object_id.clone();

        if mutation.is_genesis() {
            let meta = SnapshotMeta {
                client_tag,
                feed_key: Some(feed_key),
            };
            let snapshot = ItemSnapshot::from_genesis(mutation, meta);
            match self.items.get_mut(&id) {
                Some(item) => item.reset_to_snapshot(snapshot),
                None => {
                    self.insert(snapshot);
                }
            }
            return Ok(id);
        }

        let item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| ItemError::NotFound(id.clone()))?;
        item.process_message(feed_key, seq, timeframe, client_tag, mutation)?;
        Ok(id)
    }

    pub fn create_snapshot(&self, timeframe: Timeframe) -> DatabaseSnapshot {
        DatabaseSnapshot {
            timeframe,
            items: self.items.values().map(Item::create_snapshot).collect(),
        }
    }

    /// Replace every item with the snapshot's.
    pub fn restore(&mut self, snapshot: DatabaseSnapshot) {
        self.items.clear();
        for item in snapshot.items {
            self.insert(item);
        }
    }
}
