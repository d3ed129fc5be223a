//! In-process swarm
//!
//! Every `SimSwarm` handle shares one simulated network. Joining a topic
//! connects the new peer to peers already on it, within the joiner's
//! topology limits. Used for tests and the demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use super::transport::{Connection, ConnectionHandler, JoinOptions, Swarm, Topic};
use super::TransportError;
use crate::config::TopologyConfig;
use crate::keys::PublicKey;

struct Member {
    peer_id: PublicKey,
    topology: TopologyConfig,
    handler: Arc<dyn ConnectionHandler>,
    connections: Vec<Arc<SimConnection>>,
}

impl Member {
    fn live_connections(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    fn is_connected_to(&self, peer: &PublicKey) -> bool {
        self.connections
            .iter()
            .any(|c| c.is_connected() && c.remote_peer == *peer)
    }
}

/// Shared simulated network.
#[derive(Clone, Default)]
pub struct SimSwarm {
    topics: Arc<Mutex<HashMap<Topic, Vec<Member>>>>,
}

impl SimSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers currently joined to `topic`.
    pub async fn peers(&self, topic: &Topic) -> Vec<PublicKey> {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .map(|members| members.iter().map(|m| m.peer_id).collect())
            .unwrap_or_default()
    }

    /// Open connections held by `peer_id` on `topic`.
    pub async fn connection_count(&self, topic: &Topic, peer_id: &PublicKey) -> usize {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .and_then(|members| members.iter().find(|m| m.peer_id == *peer_id))
            .map(Member::live_connections)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Swarm for SimSwarm {
    async fn join(&self, options: JoinOptions) -> Result<(), TransportError> {
        let JoinOptions {
            topic,
            peer_id,
            topology,
            handler,
        } = options;

        let mut to_notify = Vec::new();
        {
            let mut topics = self.topics.lock().await;
            let members = topics.entry(topic).or_default();
            if members.iter().any(|m| m.peer_id == peer_id) {
                return Err(TransportError::AlreadyJoined);
            }

            let mut joiner = Member {
                peer_id,
                topology: topology.clone(),
                handler: Arc::clone(&handler),
                connections: Vec::new(),
            };

            let candidates = members.iter_mut().take(topology.sample_size);
            for remote in candidates {
                if joiner.live_connections() >= topology.originate_connections.min(topology.max_peers) {
                    break;
                }
                if remote.live_connections() >= remote.topology.max_peers {
                    continue;
                }
                let (local, other) = SimConnection::pair(peer_id, remote.peer_id);
                joiner.connections.push(Arc::clone(&local));
                remote.connections.push(Arc::clone(&other));
                to_notify.push((Arc::clone(&handler), local, true));
                to_notify.push((Arc::clone(&remote.handler), other, false));
            }

            log::debug!(
                "Peer {} joined topic with {} connections",
                peer_id.truncate(),
                joiner.connections.len()
            );
            members.push(joiner);
        }

        // Handlers run outside the lock; they may call back into the swarm.
        for (handler, connection, initiator) in to_notify {
            tokio::spawn(async move {
                handler.on_connection(connection, initiator).await;
            });
        }
        Ok(())
    }

    async fn leave(&self, topic: &Topic, peer_id: &PublicKey) -> Result<(), TransportError> {
        let leaving = {
            let mut topics = self.topics.lock().await;
            let Some(members) = topics.get_mut(topic) else {
                return Ok(());
            };
            let Some(pos) = members.iter().position(|m| m.peer_id == *peer_id) else {
                return Ok(());
            };
            let leaving = members.remove(pos);
            for member in members.iter_mut() {
                member.connections.retain(|c| c.remote_peer != *peer_id);
            }
            if members.is_empty() {
                topics.remove(topic);
            }
            leaving
        };

        for connection in leaving.connections {
            connection.close().await;
        }
        Ok(())
    }
}

/// One end of a simulated connection.
pub struct SimConnection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: Arc<watch::Sender<bool>>,
    remote_peer: PublicKey,
}

impl SimConnection {
    /// Connected pair: the first end belongs to `a` and talks to `b`.
    pub fn pair(a: PublicKey, b: PublicKey) -> (Arc<SimConnection>, Arc<SimConnection>) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let end_a = Arc::new(SimConnection {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            closed: Arc::clone(&closed),
            remote_peer: b,
        });
        let end_b = Arc::new(SimConnection {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            closed,
            remote_peer: a,
        });
        (end_a, end_b)
    }
}

#[async_trait]
impl Connection for SimConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Disconnected);
        }
        let mut rx = self.rx.lock().await;
        let received = tokio::select! {
            data = rx.recv() => data.ok_or(TransportError::Disconnected),
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Disconnected),
        };
        received
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn remote_peer(&self) -> PublicKey {
        self.remote_peer
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Collect(mpsc::UnboundedSender<(Arc<dyn Connection>, bool)>);

    #[async_trait]
    impl ConnectionHandler for Collect {
        async fn on_connection(&self, connection: Arc<dyn Connection>, initiator: bool) {
            let _ = self.0.send((connection, initiator));
        }
    }

    fn options(
        topic: Topic,
        topology: TopologyConfig,
    ) -> (JoinOptions, mpsc::UnboundedReceiver<(Arc<dyn Connection>, bool)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = JoinOptions {
            topic,
            peer_id: PublicKey::random(),
            topology,
            handler: Arc::new(Collect(tx)),
        };
        (options, rx)
    }

    #[tokio::test]
    async fn test_join_connects_peers_on_the_same_topic() {
        let swarm = SimSwarm::new();
        let (a, mut a_rx) = options([1; 32], TopologyConfig::default());
        let (b, mut b_rx) = options([1; 32], TopologyConfig::default());
        let (c, _c_rx) = options([2; 32], TopologyConfig::default());
        let (a_id, b_id) = (a.peer_id, b.peer_id);
        swarm.join(a).await.unwrap();
        swarm.join(b).await.unwrap();
        swarm.join(c).await.unwrap();

        let (to_b, a_initiated) = a_rx.recv().await.unwrap();
        let (to_a, b_initiated) = b_rx.recv().await.unwrap();
        assert!(!a_initiated);
        assert!(b_initiated);
        assert_eq!(to_b.remote_peer(), b_id);
        assert_eq!(to_a.remote_peer(), a_id);

        to_a.send(b"ping").await.unwrap();
        assert_eq!(to_b.recv().await.unwrap(), b"ping");
        assert_eq!(swarm.peers(&[1; 32]).await.len(), 2);
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (a, b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        let pending = tokio::spawn(async move { b.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().await;
        assert_eq!(pending.await.unwrap(), Err(TransportError::Disconnected));
        assert_eq!(a.send(b"late").await, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_originate_limit() {
        let swarm = SimSwarm::new();
        let topic = [3; 32];
        for _ in 0..3 {
            let (opts, _rx) = options(topic, TopologyConfig::default());
            swarm.join(opts).await.unwrap();
        }
        let (late, _rx) = options(topic, TopologyConfig::default());
        let late_id = late.peer_id;
        swarm.join(late).await.unwrap();
        assert_eq!(swarm.connection_count(&topic, &late_id).await, 2);
    }

    #[tokio::test]
    async fn test_leave_closes_connections() {
        let swarm = SimSwarm::new();
        let topic = [4; 32];
        let (a, mut a_rx) = options(topic, TopologyConfig::default());
        let (b, _b_rx) = options(topic, TopologyConfig::default());
        let b_id = b.peer_id;
        swarm.join(a).await.unwrap();
        swarm.join(b).await.unwrap();
        let (to_b, _) = a_rx.recv().await.unwrap();

        swarm.leave(&topic, &b_id).await.unwrap();
        assert!(!to_b.is_connected());
        assert_eq!(swarm.peers(&topic).await.len(), 1);
    }

    #[tokio::test]
    async fn test_double_join_is_rejected() {
        let swarm = SimSwarm::new();
        let (a, _rx) = options([5; 32], TopologyConfig::default());
        let peer_id = a.peer_id;
        swarm.join(a).await.unwrap();
        let (mut again, _rx2) = options([5; 32], TopologyConfig::default());
        again.peer_id = peer_id;
        assert_eq!(swarm.join(again).await, Err(TransportError::AlreadyJoined));
    }
}
