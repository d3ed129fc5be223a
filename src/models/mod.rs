//! Pluggable per-type data models
//!
//! Every item has a model type chosen at creation. A model is a state
//! machine that consumes its own mutation type and can optionally snapshot
//! and restore its state. Items only ever see models through the erased,
//! byte-level interface so new model types can be registered at runtime.

pub mod log_model;
pub mod object;

pub use log_model::LogModel;
pub use object::{ObjectModel, ObjectMutation, Value};

use std::any::Any;
use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::codec;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unknown model type: {0}")]
    UnknownModelType(String),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),
}

/// Name of a registered model type, recorded in every item's genesis.
pub type ModelType = String;

pub trait StateMachine: Send + 'static {
    type Mutation: Serialize + DeserializeOwned;
    type Snapshot: Serialize + DeserializeOwned;

    fn process(&mut self, mutation: Self::Mutation);

    /// Current state as a snapshot, if this model supports snapshotting.
    /// Models that return `None` are snapshotted as their mutation log.
    fn snapshot(&self) -> Option<Self::Snapshot> {
        None
    }

    fn reset(&mut self, snapshot: Self::Snapshot);
}

pub trait Model: StateMachine + Default {
    const TYPE_NAME: &'static str;

    /// Encode a mutation for an `ItemMutation` payload.
    fn encode_mutation(mutation: &Self::Mutation) -> Result<Vec<u8>, ModelError> {
        Ok(codec::encode(mutation)?)
    }
}

/// Byte-level view of a model instance.
pub trait ErasedStateMachine: Send {
    fn type_name(&self) -> &'static str;

    fn process_encoded(&mut self, data: &[u8]) -> Result<(), ModelError>;

    fn snapshot_encoded(&self) -> Result<Option<Vec<u8>>, ModelError>;

    fn reset_encoded(&mut self, data: &[u8]) -> Result<(), ModelError>;

    fn as_any(&self) -> &dyn Any;
}

impl<M: Model> ErasedStateMachine for M {
    fn type_name(&self) -> &'static str {
        M::TYPE_NAME
    }

    fn process_encoded(&mut self, data: &[u8]) -> Result<(), ModelError> {
        let mutation: M::Mutation = codec::decode(data)?;
        self.process(mutation);
        Ok(())
    }

    fn snapshot_encoded(&self) -> Result<Option<Vec<u8>>, ModelError> {
        match self.snapshot() {
            Some(snapshot) => Ok(Some(codec::encode(&snapshot)?)),
            None => Ok(None),
        }
    }

    fn reset_encoded(&mut self, data: &[u8]) -> Result<(), ModelError> {
        let snapshot: M::Snapshot = codec::decode(data)?;
        self.reset(snapshot);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates fresh state machines of one model type.
pub type ModelConstructor = fn() -> Box<dyn ErasedStateMachine>;

fn construct<M: Model>() -> Box<dyn ErasedStateMachine> {
    Box::new(M::default())
}

/// Registry of known model types.
#[derive(Clone, Default)]
pub struct ModelFactory {
    constructors: HashMap<ModelType, ModelConstructor>,
}

impl ModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the built-in models registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register::<ObjectModel>();
        factory.register::<LogModel>();
        factory
    }

    pub fn register<M: Model>(&mut self) {
        self.constructors
            .insert(M::TYPE_NAME.to_string(), construct::<M>);
    }

    pub fn contains(&self, model_type: &str) -> bool {
        self.constructors.contains_key(model_type)
    }

    pub fn constructor(&self, model_type: &str) -> Option<ModelConstructor> {
        self.constructors.get(model_type).copied()
    }

    pub fn create(&self, model_type: &str) -> Result<Box<dyn ErasedStateMachine>, ModelError> {
        self.constructor(model_type)
            .map(|construct| construct())
            .ok_or_else(|| ModelError::UnknownModelType(model_type.to_string()))
    }

    pub fn model_types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}
