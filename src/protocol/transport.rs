//! Swarm transport traits
//!
//! A `Swarm` connects peers that joined the same topic and hands each new
//! connection to the topic's `ConnectionHandler`. `SimSwarm` implements it
//! in-process; a networked implementation plugs in behind the same traits.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::TransportError;
use crate::config::TopologyConfig;
use crate::keys::PublicKey;

/// Discovery topic.
pub type Topic = [u8; 32];

/// Topic a space is discovered under. The space key itself never reaches
/// the discovery layer.
pub fn discovery_topic(space_key: &PublicKey) -> Topic {
    Sha256::digest(space_key.as_bytes()).into()
}

/// An open, message-oriented connection to a peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one message.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next message. Fails with `Disconnected` once either side
    /// closed the connection.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Close both directions.
    async fn close(&self);

    fn remote_peer(&self) -> PublicKey;

    fn is_connected(&self) -> bool;
}

/// Receives the connections a swarm opens for a topic.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// `initiator` is true on the side that opened the connection.
    async fn on_connection(&self, connection: Arc<dyn Connection>, initiator: bool);
}

pub struct JoinOptions {
    pub topic: Topic,
    pub peer_id: PublicKey,
    pub topology: TopologyConfig,
    pub handler: Arc<dyn ConnectionHandler>,
}

#[async_trait]
pub trait Swarm: Send + Sync {
    async fn join(&self, options: JoinOptions) -> Result<(), TransportError>;

    /// Leave a topic and close every connection made through it.
    async fn leave(&self, topic: &Topic, peer_id: &PublicKey) -> Result<(), TransportError>;
}
