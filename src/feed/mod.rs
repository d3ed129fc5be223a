//! Append-only feeds
//!
//! A feed is a single-writer log of `FeedMessage`s named by a public key.
//! Every message carries the writer's `Timeframe` at the time of writing so
//! readers can merge many feeds into one causal stream.

pub mod message;
pub mod store;
pub mod timeframe;

pub use message::{DataMessage, FeedBlock, FeedMessage, Payload};
pub use store::{Feed, FeedStore, MemoryFeedStore};
pub use timeframe::{Seq, Timeframe};

use thiserror::Error;

use crate::keys::PublicKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Feed {0} is not writable")]
    NotWritable(PublicKey),

    #[error("Feed {0} is written locally and takes no replicated blocks")]
    LocalWriter(PublicKey),

    #[error("Out of order block for feed {feed}: expected seq {expected}, got {got}")]
    OutOfOrder { feed: PublicKey, expected: Seq, got: Seq },

    #[error("Feed not found: {0}")]
    NotFound(PublicKey),

    #[error("Storage error: {0}")]
    StorageError(String),
}
