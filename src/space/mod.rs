//! Spaces: membership, data and replication wired together
//!
//! A `Space` owns the control pipeline, the data pipeline and the
//! replication protocol of one space. `SpaceManager` creates and accepts
//! spaces for one local identity.

pub mod manager;
pub mod space;

pub use manager::SpaceManager;
pub use space::{Space, SpaceParams};

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::feed::FeedError;
use crate::keys::PublicKey;
use crate::pipeline::PipelineError;
use crate::protocol::TransportError;

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("Space not found: {0}")]
    NotFound(PublicKey),

    #[error("Space already open: {0}")]
    AlreadyOpen(PublicKey),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
