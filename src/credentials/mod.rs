//! Credentials: signed assertions that govern a space
//!
//! Control feeds carry credentials. Folding them in order yields the set of
//! members and admitted feeds; the same state decides who may authenticate
//! for replication.

pub mod credential;
pub mod state_machine;
pub mod verifier;

pub use credential::{Assertion, Credential, Designation, MemberRole, Proof};
pub use state_machine::{FeedInfo, MemberInfo, SpaceEvent, SpaceState, SpaceStateMachine};
pub use verifier::SpaceAuthVerifier;

use thiserror::Error;

use crate::keys::PublicKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Credential for space {got} processed by space {expected}")]
    WrongSpace { expected: PublicKey, got: PublicKey },

    #[error("Space has no genesis yet, got {0}")]
    MissingGenesis(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not a member: {0}")]
    NotMember(PublicKey),
}
