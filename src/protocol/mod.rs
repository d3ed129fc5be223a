//! Replication protocol for a space
//!
//! Peers discover each other on a swarm topic derived from the space key.
//! Every connection becomes a `SpaceProtocolSession`: the two sides
//! authenticate with challenge/response credentials, and only then start
//! exchanging feed blocks.

pub mod auth;
pub mod messages;
pub mod replicator;
pub mod session;
pub mod simulated;
pub mod space_protocol;
pub mod transport;

pub use auth::{AuthExtension, AuthState};
pub use messages::{AuthMessage, ReplicatorMessage, WireMessage};
pub use replicator::ReplicatorExtension;
pub use session::SpaceProtocolSession;
pub use simulated::SimSwarm;
pub use space_protocol::{SessionAuth, SpaceProtocol};
pub use transport::{discovery_topic, Connection, ConnectionHandler, JoinOptions, Swarm, Topic};

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Already joined topic")]
    AlreadyJoined,

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        TransportError::EncodingError(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Peer sent no credential")]
    NoCredential,

    #[error("Credential rejected")]
    Rejected,

    #[error("Authentication timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
