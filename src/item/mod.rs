//! Items: the objects of a space
//!
//! - `ItemMutation` / `ItemSnapshot`: what is written to data feeds and
//!   what an item is rebuilt from
//! - `Item`: per-object replay engine
//! - `ItemManager`: dispatches feed entries to items and owns the model
//!   registry

pub mod manager;
pub mod mutation;
pub mod replay;

pub use manager::{DatabaseSnapshot, ItemManager};
pub use mutation::{ItemAction, ItemGenesis, ItemMutation, ItemSnapshot, ItemState, SnapshotMeta};
pub use replay::Item;

use thiserror::Error;

use crate::ordering::OrderingError;

/// Object ids are uuid strings.
pub type ObjectId = String;

#[derive(Error, Debug)]
pub enum ItemError {
    #[error("Object not found: {0}")]
    NotFound(ObjectId),

    #[error("Object already exists: {0}")]
    AlreadyExists(ObjectId),

    #[error("Ordering error: {0}")]
    Ordering(#[from] OrderingError),
}
