//! Feed replication over one session
//!
//! Both sides announce how much of each shared feed they hold. On an
//! announce, the side holding the feed streams the missing blocks and keeps
//! following local appends until the session ends. Nothing is sent or
//! accepted before `enable`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::messages::{ReplicatorMessage, WireMessage};
use super::transport::Connection;
use crate::feed::{Feed, Seq};
use crate::keys::PublicKey;

#[derive(Default)]
struct ReplicatorState {
    enabled: bool,
    stopped: bool,
    feeds: HashMap<PublicKey, Arc<Feed>>,
    /// Lengths the remote announced.
    remote_lengths: HashMap<PublicKey, u64>,
    pushers: HashMap<PublicKey, JoinHandle<()>>,
    announcers: Vec<JoinHandle<()>>,
}

pub struct ReplicatorExtension {
    connection: Arc<dyn Connection>,
    state: Mutex<ReplicatorState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ReplicatorExtension {
    pub fn new(connection: Arc<dyn Connection>, feeds: impl IntoIterator<Item = Arc<Feed>>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = ReplicatorState {
            feeds: feeds.into_iter().map(|f| (f.key(), f)).collect(),
            ..Default::default()
        };
        Arc::new(Self {
            connection,
            state: Mutex::new(state),
            shutdown_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ReplicatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn feeds(&self) -> Vec<PublicKey> {
        let mut keys: Vec<_> = self.lock().feeds.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn has_feed(&self, key: &PublicKey) -> bool {
        self.lock().feeds.contains_key(key)
    }

    /// Share another feed over this session. Returns false if it was
    /// already shared.
    pub fn add_feed(self: &Arc<Self>, feed: Arc<Feed>) -> bool {
        let mut state = self.lock();
        if state.stopped || state.feeds.contains_key(&feed.key()) {
            return false;
        }
        state.feeds.insert(feed.key(), Arc::clone(&feed));
        if state.enabled {
            self.announce(&mut state, vec![Arc::clone(&feed)]);
            if let Some(&from) = state.remote_lengths.get(&feed.key()) {
                self.start_pusher(&mut state, feed, from);
            }
        }
        true
    }

    /// Start replicating. Announces every shared feed.
    pub fn enable(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.enabled || state.stopped {
            return;
        }
        state.enabled = true;

        let feeds: Vec<Arc<Feed>> = state.feeds.values().cloned().collect();
        self.announce(&mut state, feeds.clone());
        for feed in feeds {
            if let Some(&from) = state.remote_lengths.get(&feed.key()) {
                self.start_pusher(&mut state, feed, from);
            }
        }
    }

    fn announce(&self, state: &mut ReplicatorState, feeds: Vec<Arc<Feed>>) {
        state.announcers.retain(|task| !task.is_finished());
        let connection = Arc::clone(&self.connection);
        state.announcers.push(tokio::spawn(async move {
            for feed in feeds {
                let message = WireMessage::from(ReplicatorMessage::Announce {
                    feed_key: feed.key(),
                    length: feed.len(),
                });
                if let Err(e) = send(&*connection, &message).await {
                    log::debug!("Announce of {} not sent: {}", feed.key().truncate(), e);
                    return;
                }
            }
        }));
    }

    fn start_pusher(&self, state: &mut ReplicatorState, feed: Arc<Feed>, from: Seq) {
        if let Some(pusher) = state.pushers.get(&feed.key()) {
            if !pusher.is_finished() {
                return;
            }
        }
        let key = feed.key();
        let task = tokio::spawn(push(
            Arc::clone(&self.connection),
            feed,
            from,
            self.shutdown_tx.subscribe(),
        ));
        state.pushers.insert(key, task);
    }

    /// Handle a replication message from the remote.
    pub fn handle_message(self: &Arc<Self>, message: ReplicatorMessage) {
        let mut state = self.lock();
        if state.stopped {
            return;
        }
        match message {
            ReplicatorMessage::Announce { feed_key, length } => {
                state.remote_lengths.insert(feed_key, length);
                if !state.enabled {
                    return;
                }
                if let Some(feed) = state.feeds.get(&feed_key).cloned() {
                    self.start_pusher(&mut state, feed, length);
                }
            }
            ReplicatorMessage::Block { feed_key, seq, message } => {
                if !state.enabled {
                    log::warn!("Dropping block {} of {} before authentication", seq, feed_key.truncate());
                    return;
                }
                let Some(feed) = state.feeds.get(&feed_key).cloned() else {
                    log::debug!("Dropping block of unshared feed {}", feed_key.truncate());
                    return;
                };
                if feed.is_writable() {
                    log::warn!("Dropping remote block {} for local feed {}", seq, feed_key.truncate());
                    return;
                }
                drop(state);
                match feed.put(seq, message) {
                    Ok(true) => log::trace!("Stored block {} of {}", seq, feed_key.truncate()),
                    Ok(false) => {}
                    Err(e) => log::warn!("Rejected block: {}", e),
                }
            }
        }
    }

    /// Stop every pusher and wait for them.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut state = self.lock();
            state.stopped = true;
            let mut tasks: Vec<_> = state.pushers.drain().map(|(_, task)| task).collect();
            tasks.append(&mut state.announcers);
            tasks
        };
        let _ = self.shutdown_tx.send(());
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn send(connection: &dyn Connection, message: &WireMessage) -> Result<(), super::TransportError> {
    connection.send(&message.encode()?).await
}

/// Stream `feed` from `next` on, following appends.
async fn push(connection: Arc<dyn Connection>, feed: Arc<Feed>, mut next: Seq, mut shutdown: broadcast::Receiver<()>) {
    let key = feed.key();
    let mut length = feed.watch_len();
    loop {
        let available = *length.borrow_and_update();
        while next < available {
            let Some(message) = feed.get(next) else {
                break;
            };
            let block = WireMessage::from(ReplicatorMessage::Block {
                feed_key: key,
                seq: next,
                message,
            });
            if let Err(e) = send(&*connection, &block).await {
                log::debug!("Stopped pushing {}: {}", key.truncate(), e);
                return;
            }
            next += 1;
        }

        tokio::select! {
            changed = length.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedMessage, Timeframe};
    use crate::item::ItemMutation;
    use crate::protocol::simulated::SimConnection;
    use std::time::Duration;

    fn entry(n: u64) -> FeedMessage {
        FeedMessage::data(Timeframe::new(), ItemMutation::new(format!("obj-{}", n)), None)
    }

    /// Route messages from `conn` into `replicator` until it closes.
    fn pump(conn: Arc<SimConnection>, replicator: Arc<ReplicatorExtension>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(data) = conn.recv().await {
                if let Ok(WireMessage::Replicator(message)) = WireMessage::decode(&data) {
                    replicator.handle_message(message);
                }
            }
        })
    }

    async fn wait_len(feed: &Feed, len: u64) {
        let mut rx = feed.watch_len();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|l| *l >= len))
            .await
            .expect("feed did not catch up")
            .unwrap();
    }

    #[tokio::test]
    async fn test_enabled_sides_exchange_blocks() {
        let key = PublicKey::random();
        let source = Arc::new(Feed::new(key, true));
        source.append(entry(0)).unwrap();
        source.append(entry(1)).unwrap();
        let copy = Arc::new(Feed::new(key, false));

        let (a, b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        let left = ReplicatorExtension::new(Arc::clone(&a) as Arc<dyn Connection>, vec![Arc::clone(&source)]);
        let right = ReplicatorExtension::new(Arc::clone(&b) as Arc<dyn Connection>, Vec::new());
        pump(Arc::clone(&a), Arc::clone(&left));
        pump(Arc::clone(&b), Arc::clone(&right));

        left.enable();
        right.enable();
        // Feeds added after enabling are announced too.
        right.add_feed(Arc::clone(&copy));
        wait_len(&copy, 2).await;

        // Later appends follow.
        source.append(entry(2)).unwrap();
        wait_len(&copy, 3).await;
        assert_eq!(copy.get(2), Some(entry(2)));

        left.stop().await;
        right.stop().await;
    }

    #[tokio::test]
    async fn test_nothing_flows_until_enabled() {
        let key = PublicKey::random();
        let source = Arc::new(Feed::new(key, true));
        source.append(entry(0)).unwrap();
        let copy = Arc::new(Feed::new(key, false));

        let (a, b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        let left = ReplicatorExtension::new(Arc::clone(&a) as Arc<dyn Connection>, vec![Arc::clone(&source)]);
        let right = ReplicatorExtension::new(Arc::clone(&b) as Arc<dyn Connection>, vec![Arc::clone(&copy)]);
        pump(Arc::clone(&a), Arc::clone(&left));
        pump(Arc::clone(&b), Arc::clone(&right));

        // Only one side enabled: its announce is remembered, but the other
        // side neither pushes nor accepts.
        right.enable();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(copy.is_empty());

        left.enable();
        wait_len(&copy, 1).await;

        left.stop().await;
        right.stop().await;
    }

    #[tokio::test]
    async fn test_remote_blocks_for_local_feed_are_dropped() {
        let key = PublicKey::random();
        let own = Arc::new(Feed::new(key, true));
        own.append(entry(0)).unwrap();

        let (a, _b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        let replicator = ReplicatorExtension::new(a as Arc<dyn Connection>, vec![Arc::clone(&own)]);
        replicator.enable();
        replicator.handle_message(ReplicatorMessage::Block {
            feed_key: key,
            seq: 1,
            message: entry(99),
        });

        assert_eq!(own.len(), 1);
        assert_eq!(own.append(entry(1)).unwrap(), 1);
        assert_eq!(own.get(1), Some(entry(1)));
        replicator.stop().await;
    }

    #[tokio::test]
    async fn test_add_feed_is_idempotent() {
        let (a, _b) = SimConnection::pair(PublicKey::random(), PublicKey::random());
        let feed = Arc::new(Feed::new(PublicKey::random(), false));
        let replicator = ReplicatorExtension::new(a as Arc<dyn Connection>, vec![Arc::clone(&feed)]);
        assert!(!replicator.add_feed(Arc::clone(&feed)));
        assert_eq!(replicator.feeds(), vec![feed.key()]);
        replicator.stop().await;
        assert!(!replicator.add_feed(Arc::new(Feed::new(PublicKey::random(), false))));
    }
}
