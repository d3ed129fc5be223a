//! Feed storage
//!
//! `FeedStore` is the seam to a real append-only log store. `MemoryFeedStore`
//! keeps everything in process memory and is what tests and the demo use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use super::{FeedError, FeedMessage, Seq};
use crate::keys::PublicKey;

/// A single feed. Cheap to share behind an `Arc`.
pub struct Feed {
    key: PublicKey,
    writable: bool,
    messages: Mutex<Vec<FeedMessage>>,
    length: watch::Sender<u64>,
}

impl Feed {
    pub fn new(key: PublicKey, writable: bool) -> Self {
        let (length, _) = watch::channel(0);
        Self {
            key,
            writable,
            messages: Mutex::new(Vec::new()),
            length,
        }
    }

    pub fn key(&self) -> PublicKey {
        self.key
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> u64 {
        *self.length.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a message authored locally. Returns its seq.
    pub fn append(&self, message: FeedMessage) -> Result<Seq, FeedError> {
        if !self.writable {
            return Err(FeedError::NotWritable(self.key));
        }
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = messages.len() as Seq;
        messages.push(message);
        self.length.send_replace(seq + 1);
        Ok(seq)
    }

    /// Store a replicated message.
    ///
    /// Returns `Ok(true)` when the message was appended, `Ok(false)` when
    /// `seq` is already present. Feeds written by this device take no
    /// replicated blocks.
    pub fn put(&self, seq: Seq, message: FeedMessage) -> Result<bool, FeedError> {
        if self.writable {
            return Err(FeedError::LocalWriter(self.key));
        }
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let expected = messages.len() as Seq;
        if seq < expected {
            return Ok(false);
        }
        if seq > expected {
            return Err(FeedError::OutOfOrder {
                feed: self.key,
                expected,
                got: seq,
            });
        }
        messages.push(message);
        self.length.send_replace(expected + 1);
        Ok(true)
    }

    pub fn get(&self, seq: Seq) -> Option<FeedMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(seq as usize)
            .cloned()
    }

    /// Watch the feed length. The receiver sees every length change.
    pub fn watch_len(&self) -> watch::Receiver<u64> {
        self.length.subscribe()
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.key)
            .field("writable", &self.writable)
            .field("len", &self.len())
            .finish()
    }
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Open (creating if needed) a feed. Asking for a writable feed requires
    /// holding its secret key in a real store.
    async fn open_feed(&self, key: PublicKey, writable: bool) -> Result<Arc<Feed>, FeedError>;

    async fn open_read_only_feed(&self, key: PublicKey) -> Result<Arc<Feed>, FeedError> {
        self.open_feed(key, false).await
    }
}

/// In-memory feed store. Opening the same key twice returns the same feed.
#[derive(Default)]
pub struct MemoryFeedStore {
    feeds: RwLock<HashMap<PublicKey, Arc<Feed>>>,
}

impl MemoryFeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn feed_keys(&self) -> Vec<PublicKey> {
        self.feeds.read().await.keys().copied().collect()
    }
}

#[async_trait]
impl FeedStore for MemoryFeedStore {
    async fn open_feed(&self, key: PublicKey, writable: bool) -> Result<Arc<Feed>, FeedError> {
        let mut feeds = self.feeds.write().await;
        if let Some(feed) = feeds.get(&key) {
            if writable && !feed.is_writable() {
                return Err(FeedError::NotWritable(key));
            }
            return Ok(Arc::clone(feed));
        }
        let feed = Arc::new(Feed::new(key, writable));
        feeds.insert(key, Arc::clone(&feed));
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Assertion, Credential};
    use crate::feed::Timeframe;
    use crate::identity::KeyPair;

    fn message() -> FeedMessage {
        let space = KeyPair::generate();
        let credential = Credential::issue(
            &space,
            space.public_key(),
            Assertion::SpaceGenesis {
                space_key: space.public_key(),
            },
        )
        .unwrap();
        FeedMessage::credential(Timeframe::new(), credential)
    }

    #[test]
    fn test_append_assigns_dense_seqs() {
        let feed = Feed::new(PublicKey::random(), true);
        assert_eq!(feed.append(message()).unwrap(), 0);
        assert_eq!(feed.append(message()).unwrap(), 1);
        assert_eq!(feed.len(), 2);
        assert!(feed.get(1).is_some());
        assert!(feed.get(2).is_none());
    }

    #[test]
    fn test_read_only_feed_rejects_append() {
        let key = PublicKey::random();
        let feed = Feed::new(key, false);
        assert_eq!(feed.append(message()), Err(FeedError::NotWritable(key)));
    }

    #[test]
    fn test_put_accepts_next_ignores_duplicates_rejects_gaps() {
        let feed = Feed::new(PublicKey::random(), false);
        assert_eq!(feed.put(0, message()), Ok(true));
        assert_eq!(feed.put(0, message()), Ok(false));
        assert!(matches!(
            feed.put(5, message()),
            Err(FeedError::OutOfOrder { expected: 1, got: 5, .. })
        ));
        assert_eq!(feed.put(1, message()), Ok(true));
        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_writable_feed_rejects_put() {
        let key = PublicKey::random();
        let feed = Feed::new(key, true);
        assert_eq!(feed.put(0, message()), Err(FeedError::LocalWriter(key)));
        assert!(feed.is_empty());
        assert_eq!(feed.append(message()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watch_len_sees_appends() {
        let feed = Feed::new(PublicKey::random(), true);
        let mut rx = feed.watch_len();
        feed.append(message()).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_returns_same_feed() {
        let store = MemoryFeedStore::new();
        let key = PublicKey::random();
        let a = store.open_feed(key, true).await.unwrap();
        let b = store.open_read_only_feed(key).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.feed_keys().await, vec![key]);
    }
}
