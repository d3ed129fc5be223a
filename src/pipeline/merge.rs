//! Causal merge of a growing set of feeds
//!
//! `FeedSetIterator` yields the entries of all its feeds as one stream in
//! which no entry comes before anything its timeframe depends on. Feeds can
//! be added at any time, including from the code consuming the stream.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::feed::{Feed, FeedBlock, Seq, Timeframe};
use crate::keys::PublicKey;

struct Cursor {
    feed: Arc<Feed>,
    next: Seq,
    forwarder: JoinHandle<()>,
}

struct State {
    cursors: BTreeMap<PublicKey, Cursor>,
    /// Everything yielded so far, plus the start timeframe.
    timeframe: Timeframe,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    /// Woken on feed growth, feed addition and close.
    notify: Notify,
}

pub struct FeedSetIterator {
    inner: Arc<Inner>,
}

impl FeedSetIterator {
    /// Iterator that skips everything covered by `start`.
    pub fn new(start: Timeframe) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    cursors: BTreeMap::new(),
                    timeframe: start,
                    closed: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a feed to the set. Returns false if it was already present.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_feed(&self, feed: Arc<Feed>) -> bool {
        let mut state = self.lock();
        if state.closed || state.cursors.contains_key(&feed.key()) {
            return false;
        }

        let key = feed.key();
        let next = state.timeframe.get(&key).map_or(0, |seq| seq + 1);
        let forwarder = spawn_forwarder(&feed, Arc::downgrade(&self.inner));
        state.cursors.insert(
            key,
            Cursor {
                feed,
                next,
                forwarder,
            },
        );
        drop(state);

        log::debug!("Merging feed {}", key.truncate());
        self.inner.notify.notify_one();
        true
    }

    pub fn has_feed(&self, key: &PublicKey) -> bool {
        self.lock().cursors.contains_key(key)
    }

    pub fn feeds(&self) -> Vec<PublicKey> {
        self.lock().cursors.keys().copied().collect()
    }

    /// Timeframe of everything yielded so far.
    pub fn timeframe(&self) -> Timeframe {
        self.lock().timeframe.clone()
    }

    /// Next entry whose dependencies have all been yielded. Waits for one to
    /// become available; returns `None` once the iterator is closed.
    pub async fn next(&self) -> Option<FeedBlock> {
        loop {
            match self.try_next() {
                Ok(Some(block)) => return Some(block),
                Ok(None) => self.inner.notify.notified().await,
                Err(Closed) => return None,
            }
        }
    }

    /// Next ready entry without waiting.
    pub fn try_next(&self) -> Result<Option<FeedBlock>, Closed> {
        let mut state = self.lock();
        if state.closed {
            return Err(Closed);
        }

        let State {
            cursors, timeframe, ..
        } = &mut *state;

        for (key, cursor) in cursors.iter_mut() {
            if cursor.next >= cursor.feed.len() {
                continue;
            }
            let Some(message) = cursor.feed.get(cursor.next) else {
                continue;
            };
            if !Timeframe::dependencies(&message.timeframe, timeframe).is_empty() {
                continue;
            }

            let block = FeedBlock {
                feed_key: *key,
                seq: cursor.next,
                message,
            };
            timeframe.observe(*key, cursor.next);
            cursor.next += 1;
            return Ok(Some(block));
        }
        Ok(None)
    }

    /// Stop the iterator. Pending and future `next` calls return `None`.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for cursor in state.cursors.values() {
            cursor.forwarder.abort();
        }
        drop(state);
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Drop for FeedSetIterator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returned by `try_next` after `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// Wake the iterator whenever `feed` grows.
fn spawn_forwarder(feed: &Feed, inner: Weak<Inner>) -> JoinHandle<()> {
    let mut len = feed.watch_len();
    tokio::spawn(async move {
        while len.changed().await.is_ok() {
            match inner.upgrade() {
                Some(inner) => inner.notify.notify_one(),
                None => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedMessage;
    use crate::item::ItemMutation;
    use std::time::Duration;

    fn msg(tf: Timeframe, label: &str) -> FeedMessage {
        FeedMessage::data(tf, ItemMutation::new(label), None)
    }

    fn label(block: &FeedBlock) -> String {
        match &block.message.payload {
            crate::feed::Payload::Data(d) => d.mutation.object_id.clone(),
            _ => unreachable!(),
        }
    }

    fn feed(b: u8) -> Arc<Feed> {
        Arc::new(Feed::new(PublicKey::from_bytes([b; 32]), true))
    }

    #[tokio::test]
    async fn test_yields_all_entries_of_one_feed_in_order() {
        let a = feed(1);
        a.append(msg(Timeframe::new(), "a0")).unwrap();
        a.append(msg(Timeframe::new(), "a1")).unwrap();

        let it = FeedSetIterator::new(Timeframe::new());
        it.add_feed(Arc::clone(&a));
        assert_eq!(label(&it.next().await.unwrap()), "a0");
        assert_eq!(label(&it.next().await.unwrap()), "a1");
        assert_eq!(it.try_next(), Ok(None));
        assert_eq!(it.timeframe(), Timeframe::at(a.key(), 1));
    }

    #[tokio::test]
    async fn test_waits_for_dependencies_from_other_feeds() {
        let a = feed(1);
        let b = feed(2);
        // b0 depends on a0, which has not been written yet.
        b.append(msg(Timeframe::at(a.key(), 0), "b0")).unwrap();

        let it = FeedSetIterator::new(Timeframe::new());
        it.add_feed(Arc::clone(&a));
        it.add_feed(Arc::clone(&b));
        assert_eq!(it.try_next(), Ok(None));

        a.append(msg(Timeframe::new(), "a0")).unwrap();
        assert_eq!(label(&it.next().await.unwrap()), "a0");
        assert_eq!(label(&it.next().await.unwrap()), "b0");
    }

    #[tokio::test]
    async fn test_wakes_on_append() {
        let a = feed(1);
        let it = Arc::new(FeedSetIterator::new(Timeframe::new()));
        it.add_feed(Arc::clone(&a));

        let reader = {
            let it = Arc::clone(&it);
            tokio::spawn(async move { it.next().await.map(|b| label(&b)) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.append(msg(Timeframe::new(), "late")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_feeds_added_while_consuming_are_merged() {
        let a = feed(1);
        let b = feed(2);
        a.append(msg(Timeframe::new(), "a0")).unwrap();
        b.append(msg(Timeframe::new(), "b0")).unwrap();

        let it = FeedSetIterator::new(Timeframe::new());
        it.add_feed(Arc::clone(&a));
        let first = it.next().await.unwrap();
        assert_eq!(label(&first), "a0");

        // Adding from the consumer, between two `next` calls.
        assert!(it.add_feed(Arc::clone(&b)));
        assert!(!it.add_feed(Arc::clone(&b)));
        assert_eq!(label(&it.next().await.unwrap()), "b0");
    }

    #[tokio::test]
    async fn test_start_timeframe_skips_processed_entries() {
        let a = feed(1);
        for i in 0..3 {
            a.append(msg(Timeframe::new(), &format!("a{}", i))).unwrap();
        }
        let it = FeedSetIterator::new(Timeframe::at(a.key(), 1));
        it.add_feed(Arc::clone(&a));
        assert_eq!(label(&it.next().await.unwrap()), "a2");
    }

    #[tokio::test]
    async fn test_close_releases_waiting_consumer() {
        let it = Arc::new(FeedSetIterator::new(Timeframe::new()));
        it.add_feed(feed(1));
        let reader = {
            let it = Arc::clone(&it);
            tokio::spawn(async move { it.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        it.close();
        assert!(reader.await.unwrap().is_none());
        assert!(!it.add_feed(feed(2)));
    }
}
