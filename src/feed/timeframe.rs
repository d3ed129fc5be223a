//! Causal context tracking via Timeframes
//!
//! A Timeframe records, for every feed a writer had observed, the highest
//! sequence number it had seen. Comparing timeframes tells whether one entry
//! causally depends on another or whether the two are concurrent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::keys::PublicKey;

/// Sequence number within a feed. The first entry of a feed has seq 0.
pub type Seq = u64;

/// Per-feed high-water marks.
///
/// A feed missing from the map means nothing from it has been seen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    frames: BTreeMap<PublicKey, Seq>,
}

impl Timeframe {
    /// Create an empty timeframe (has seen nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a timeframe that has seen up to `seq` of `feed`
    pub fn at(feed: PublicKey, seq: Seq) -> Self {
        let mut tf = Self::new();
        tf.frames.insert(feed, seq);
        tf
    }

    /// Highest seq seen from a feed, if any.
    pub fn get(&self, feed: &PublicKey) -> Option<Seq> {
        self.frames.get(feed).copied()
    }

    /// Overwrite the high-water mark of a feed.
    pub fn set(&mut self, feed: PublicKey, seq: Seq) {
        self.frames.insert(feed, seq);
    }

    /// Record having seen `seq` of `feed`. Never moves backwards.
    pub fn observe(&mut self, feed: PublicKey, seq: Seq) {
        let current = self.frames.entry(feed).or_insert(seq);
        if seq > *current {
            *current = seq;
        }
    }

    /// Merge another timeframe into this one (take max per feed)
    pub fn merge(&mut self, other: &Timeframe) {
        for (feed, seq) in &other.frames {
            self.observe(*feed, *seq);
        }
    }

    /// Copy with `feed` left out.
    pub fn without(&self, feed: &PublicKey) -> Timeframe {
        let mut frames = self.frames.clone();
        frames.remove(feed);
        Timeframe { frames }
    }

    /// Merged copy of two timeframes.
    pub fn merged(a: &Timeframe, b: &Timeframe) -> Timeframe {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    /// Whether this timeframe has seen `seq` of `feed`.
    pub fn has_seen(&self, feed: &PublicKey, seq: Seq) -> bool {
        self.get(feed).is_some_and(|s| s >= seq)
    }

    /// Entries of `needed` that `have` does not cover yet.
    ///
    /// An empty result means everything `needed` refers to has been observed.
    pub fn dependencies(needed: &Timeframe, have: &Timeframe) -> Timeframe {
        let frames = needed
            .frames
            .iter()
            .filter(|(feed, seq)| !have.has_seen(feed, **seq))
            .map(|(feed, seq)| (*feed, *seq))
            .collect();
        Timeframe { frames }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn feeds(&self) -> impl Iterator<Item = &PublicKey> {
        self.frames.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PublicKey, &Seq)> {
        self.frames.iter()
    }

    /// Total number of entries covered, assuming seqs are dense from 0.
    pub fn total_messages(&self) -> u64 {
        self.frames.values().map(|s| s + 1).sum()
    }
}

impl FromIterator<(PublicKey, Seq)> for Timeframe {
    fn from_iter<I: IntoIterator<Item = (PublicKey, Seq)>>(iter: I) -> Self {
        let mut tf = Timeframe::new();
        for (feed, seq) in iter {
            tf.observe(feed, seq);
        }
        tf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PublicKey {
        PublicKey::from_bytes([b; 32])
    }

    #[test]
    fn test_observe_and_get() {
        let mut tf = Timeframe::new();
        assert_eq!(tf.get(&key(1)), None);

        tf.observe(key(1), 5);
        assert_eq!(tf.get(&key(1)), Some(5));

        // Doesn't go backwards
        tf.observe(key(1), 3);
        assert_eq!(tf.get(&key(1)), Some(5));

        // Set does
        tf.set(key(1), 2);
        assert_eq!(tf.get(&key(1)), Some(2));
    }

    #[test]
    fn test_seq_zero_counts_as_seen() {
        let tf = Timeframe::at(key(1), 0);
        assert!(tf.has_seen(&key(1), 0));
        assert!(!tf.has_seen(&key(1), 1));
        assert!(!Timeframe::new().has_seen(&key(1), 0));
    }

    #[test]
    fn test_dependencies() {
        let needed: Timeframe = [(key(1), 4), (key(2), 1)].into_iter().collect();
        let have: Timeframe = [(key(1), 4), (key(2), 0)].into_iter().collect();

        let deps = Timeframe::dependencies(&needed, &have);
        assert_eq!(deps, Timeframe::at(key(2), 1));

        let deps = Timeframe::dependencies(&have, &needed);
        assert!(deps.is_empty());
    }

    #[test]
    fn test_dependency_on_unknown_feed() {
        let needed = Timeframe::at(key(3), 0);
        let deps = Timeframe::dependencies(&needed, &Timeframe::new());
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn test_merge_takes_max() {
        let a: Timeframe = [(key(1), 4), (key(2), 1)].into_iter().collect();
        let b: Timeframe = [(key(1), 2), (key(3), 7)].into_iter().collect();
        let m = Timeframe::merged(&a, &b);
        assert_eq!(m.get(&key(1)), Some(4));
        assert_eq!(m.get(&key(2)), Some(1));
        assert_eq!(m.get(&key(3)), Some(7));
        assert_eq!(m.total_messages(), 5 + 2 + 8);
    }

    #[test]
    fn test_json_round_trip_with_key_map() {
        let tf: Timeframe = [(key(1), 4), (key(2), 1)].into_iter().collect();
        let json = serde_json::to_string(&tf).unwrap();
        let back: Timeframe = serde_json::from_str(&json).unwrap();
        assert_eq!(tf, back);
    }
}
