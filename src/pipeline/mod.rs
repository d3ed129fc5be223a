//! Pipelines: from merged feeds to space state
//!
//! - `FeedSetIterator`: causal merge of a dynamic set of feeds
//! - `ControlPipeline`: credentials → membership
//! - `DataPipelineController`: mutations → items
//! - `SnapshotStore`: on-disk item snapshots

pub mod control;
pub mod data;
pub mod merge;
pub mod snapshot_store;

pub use control::ControlPipeline;
pub use data::{DataPipelineController, WriteReceipt};
pub use merge::FeedSetIterator;
pub use snapshot_store::SnapshotStore;

use thiserror::Error;

use crate::feed::{FeedError, Timeframe};
use crate::item::ItemError;
use crate::keys::PublicKey;
use crate::models::ModelError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No write feed set")]
    NoWriteFeed,

    #[error("Pipeline not initialized")]
    NotInitialized,

    #[error("Pipeline closed")]
    Closed,

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Item error: {0}")]
    Item(#[from] ItemError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Snapshot error: {0}")]
    SnapshotError(String),
}

/// Timeframe to stamp on an entry written to `own_feed`.
///
/// The writer's own feed is ordered by sequence number already, so it is
/// left out.
pub(crate) fn write_timeframe(processed: &Timeframe, own_feed: &PublicKey) -> Timeframe {
    processed.without(own_feed)
}
