//! Deterministic causal ordering of mutations
//!
//! A `MutationQueue` holds two lists:
//! - `confirmed`: entries observed on feeds, kept in one causal order that
//!   every peer computes identically from the same set of entries.
//! - `optimistic`: entries written locally that have not been observed on a
//!   feed yet, in the order they were written.
//!
//! Pushing never touches model state. The caller receives a `PushOutcome` and
//! decides whether to apply the entry incrementally or replay everything.

use thiserror::Error;

use crate::feed::{Seq, Timeframe};
use crate::keys::PublicKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderingError {
    #[error("Optimistic mutation has no client tag")]
    MissingClientTag,

    #[error("Duplicate optimistic client tag: {0}")]
    DuplicateClientTag(String),

    #[error("Confirmed mutation carries multiple client tags: {0:?}")]
    MultipleClientTags(Vec<String>),
}

/// A mutation observed at `seq` of `feed_key`.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmedMutation<M> {
    pub feed_key: PublicKey,
    pub seq: Seq,
    pub timeframe: Timeframe,
    pub client_tag: Vec<String>,
    pub mutation: M,
}

/// A locally written mutation awaiting confirmation.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimisticMutation<M> {
    pub client_tag: Vec<String>,
    pub mutation: M,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushOutcome {
    /// Position the entry was inserted at in the confirmed list.
    pub insertion_index: usize,
    /// State derived by appending is stale and must be rebuilt.
    pub reorder: bool,
    /// The entry is new to this peer and has not been applied yet.
    pub apply: bool,
}

/// Timeframe an entry must have observed to be ordered strictly after `entry`.
fn frontier<M>(entry: &ConfirmedMutation<M>) -> Timeframe {
    let mut frontier = entry.timeframe.clone();
    if entry.seq > 0 {
        frontier.observe(entry.feed_key, entry.seq - 1);
    }
    frontier
}

/// Position at which `new` belongs in `existing`.
///
/// Entries after the last one from the same feed are candidates. `new` goes
/// before the first candidate it is concurrent with and whose feed key sorts
/// after its own. A real dependency always keeps `new` after its dependency.
pub fn get_insertion_index<M>(existing: &[ConfirmedMutation<M>], new: &ConfirmedMutation<M>) -> usize {
    let start = existing
        .iter()
        .rposition(|entry| entry.feed_key == new.feed_key)
        .map_or(0, |i| i + 1);

    for (offset, candidate) in existing[start..].iter().enumerate() {
        let concurrent = Timeframe::dependencies(&new.timeframe, &frontier(candidate)).is_empty();
        if concurrent && new.feed_key < candidate.feed_key {
            return start + offset;
        }
    }

    existing.len()
}

#[derive(Clone, Debug)]
pub struct MutationQueue<M> {
    confirmed: Vec<ConfirmedMutation<M>>,
    optimistic: Vec<OptimisticMutation<M>>,
}

impl<M> Default for MutationQueue<M> {
    fn default() -> Self {
        Self {
            confirmed: Vec::new(),
            optimistic: Vec::new(),
        }
    }
}

impl<M> MutationQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirmed(&self) -> &[ConfirmedMutation<M>] {
        &self.confirmed
    }

    pub fn optimistic(&self) -> &[OptimisticMutation<M>] {
        &self.optimistic
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.optimistic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty() && self.optimistic.is_empty()
    }

    /// Confirmed entries in order, then optimistic ones.
    pub fn mutations(&self) -> impl Iterator<Item = &M> {
        self.confirmed
            .iter()
            .map(|e| &e.mutation)
            .chain(self.optimistic.iter().map(|e| &e.mutation))
    }

    pub fn push_optimistic(&mut self, entry: OptimisticMutation<M>) -> Result<(), OrderingError> {
        if entry.client_tag.is_empty() {
            return Err(OrderingError::MissingClientTag);
        }
        for tag in &entry.client_tag {
            if self.optimistic.iter().any(|e| e.client_tag.contains(tag)) {
                return Err(OrderingError::DuplicateClientTag(tag.clone()));
            }
        }
        self.optimistic.push(entry);
        Ok(())
    }

    pub fn push_confirmed(&mut self, entry: ConfirmedMutation<M>) -> Result<PushOutcome, OrderingError> {
        if entry.client_tag.len() > 1 {
            return Err(OrderingError::MultipleClientTags(entry.client_tag));
        }

        let optimistic_index = entry.client_tag.first().and_then(|tag| {
            self.optimistic
                .iter()
                .position(|e| e.client_tag.contains(tag))
        });
        if let Some(index) = optimistic_index {
            self.optimistic.remove(index);
        }

        let previous_len = self.confirmed.len();
        let insertion_index = get_insertion_index(&self.confirmed, &entry);
        self.confirmed.insert(insertion_index, entry);

        let reorder = insertion_index != previous_len
            || optimistic_index.is_some_and(|i| i > 0)
            || (optimistic_index.is_none() && !self.optimistic.is_empty());

        Ok(PushOutcome {
            insertion_index,
            reorder,
            apply: optimistic_index.is_none(),
        })
    }

    /// Forget confirmed history, e.g. when a newer snapshot replaces it.
    pub fn reset_confirmed(&mut self) {
        self.confirmed.clear();
    }
}
