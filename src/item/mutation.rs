//! Item mutations and snapshots

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ObjectId;
use crate::keys::PublicKey;
use crate::models::{Model, ModelError, ModelType};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGenesis {
    pub model_type: ModelType,
}

/// System-level actions, independent of the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemAction {
    Delete,
    Restore,
}

/// A change to one item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemMutation {
    pub object_id: ObjectId,
    #[serde(default)]
    pub genesis: Option<ItemGenesis>,
    #[serde(default)]
    pub action: Option<ItemAction>,
    #[serde(default)]
    pub parent_id: Option<ObjectId>,
    /// Model mutation, encoded with the model's codec.
    #[serde(default)]
    pub model: Option<Vec<u8>>,
}

impl ItemMutation {
    pub fn new(object_id: impl Into<ObjectId>) -> Self {
        Self {
            object_id: object_id.into(),
            genesis: None,
            action: None,
            parent_id: None,
            model: None,
        }
    }

    /// Genesis of a new object with a fresh id.
    pub fn genesis(model_type: impl Into<ModelType>) -> Self {
        let mut mutation = Self::new(Uuid::new_v4().to_string());
        mutation.genesis = Some(ItemGenesis {
            model_type: model_type.into(),
        });
        mutation
    }

    pub fn with_action(mut self, action: ItemAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<ObjectId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_model_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.model = Some(bytes);
        self
    }

    pub fn with_model<M: Model>(self, mutation: &M::Mutation) -> Result<Self, ModelError> {
        Ok(self.with_model_bytes(M::encode_mutation(mutation)?))
    }

    pub fn is_genesis(&self) -> bool {
        self.genesis.is_some()
    }
}

/// System state plus encoded model state at some point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemState {
    pub parent_id: Option<ObjectId>,
    pub deleted: bool,
    pub model: Option<Vec<u8>>,
}

/// Where a snapshot came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub client_tag: Option<String>,
    pub feed_key: Option<PublicKey>,
}

/// Base state of an item: an optional state plus mutations to replay on top.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub object_id: ObjectId,
    pub genesis: Option<ItemGenesis>,
    pub snapshot: Option<ItemState>,
    #[serde(default)]
    pub mutations: Vec<ItemMutation>,
    #[serde(default)]
    pub meta: Option<SnapshotMeta>,
}

impl ItemSnapshot {
    /// Snapshot implied by a genesis mutation.
    pub fn from_genesis(mutation: ItemMutation, meta: SnapshotMeta) -> Self {
        Self {
            object_id: mutation.object_id.clone(),
            genesis: mutation.genesis.clone(),
            snapshot: None,
            mutations: vec![mutation],
            meta: Some(meta),
        }
    }

    pub fn model_type(&self) -> Option<&str> {
        self.genesis.as_ref().map(|g| g.model_type.as_str())
    }
}
