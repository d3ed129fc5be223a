//! Per-object replay engine
//!
//! An `Item` keeps an immutable base (`ItemSnapshot`), a `MutationQueue` of
//! everything observed after that base, and a live state derived from both.
//! Cheap appends apply a single mutation; anything else rebuilds the live
//! state from the base.

use super::{ItemError, ItemMutation, ItemSnapshot, ItemState, ObjectId};
use crate::feed::{Seq, Timeframe};
use crate::keys::PublicKey;
use crate::models::{ErasedStateMachine, ModelConstructor};
use crate::ordering::{ConfirmedMutation, MutationQueue, OptimisticMutation, PushOutcome};

/// State derived by replay.
struct LiveState {
    parent_id: Option<ObjectId>,
    deleted: bool,
    machine: Option<Box<dyn ErasedStateMachine>>,
}

impl LiveState {
    fn empty() -> Self {
        Self {
            parent_id: None,
            deleted: false,
            machine: None,
        }
    }
}

fn apply_mutation(id: &str, live: &mut LiveState, mutation: &ItemMutation) {
    match mutation.action {
        Some(super::ItemAction::Delete) => live.deleted = true,
        Some(super::ItemAction::Restore) => live.deleted = false,
        None => {}
    }

    if let Some(parent_id) = &mutation.parent_id {
        live.parent_id = Some(parent_id.clone());
    }

    if let Some(payload) = &mutation.model {
        let machine = match live.machine.as_mut() {
            Some(machine) => machine,
            None => panic!("Model mutation for object {} applied without a model", id),
        };
        if let Err(e) = machine.process_encoded(payload) {
            log::warn!("Skipping undecodable model mutation for {}: {}", id, e);
        }
    }
}

pub struct Item {
    id: ObjectId,
    initial: ItemSnapshot,
    queue: MutationQueue<ItemMutation>,
    constructor: Option<ModelConstructor>,
    live: LiveState,
}

impl Item {
    /// Create an uninitialized item from its base state.
    pub fn new(initial: ItemSnapshot) -> Self {
        Self {
            id: initial.object_id.clone(),
            initial,
            queue: MutationQueue::new(),
            constructor: None,
            live: LiveState::empty(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn model_type(&self) -> Option<&str> {
        self.initial.model_type()
    }

    pub fn is_initialized(&self) -> bool {
        self.constructor.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.live.deleted
    }

    pub fn parent_id(&self) -> Option<&ObjectId> {
        self.live.parent_id.as_ref()
    }

    pub fn initial(&self) -> &ItemSnapshot {
        &self.initial
    }

    pub fn queue(&self) -> &MutationQueue<ItemMutation> {
        &self.queue
    }

    /// Live model state, if the item is initialized with model `M`.
    pub fn state<M: 'static>(&self) -> Option<&M> {
        self.live.machine.as_ref()?.as_any().downcast_ref::<M>()
    }

    /// Attach the model and derive the live state.
    ///
    /// # Panics
    /// If the item is already initialized or the model contradicts the
    /// genesis model type.
    pub fn initialize(&mut self, constructor: ModelConstructor) {
        assert!(
            self.constructor.is_none(),
            "Item {} is already initialized",
            self.id
        );
        let type_name = constructor().type_name();
        if let Some(model_type) = self.model_type() {
            assert_eq!(
                model_type, type_name,
                "Model type mismatch for item {}",
                self.id
            );
        }
        self.constructor = Some(constructor);
        self.reset_state();
    }

    /// Queue a locally written mutation and apply it right away.
    pub fn process_optimistic_mutation(
        &mut self,
        client_tag: String,
        mutation: ItemMutation,
    ) -> Result<(), ItemError> {
        self.queue.push_optimistic(OptimisticMutation {
            client_tag: vec![client_tag],
            mutation: mutation.clone(),
        })?;
        if self.is_initialized() {
            apply_mutation(&self.id, &mut self.live, &mutation);
        }
        Ok(())
    }

    /// Queue a mutation observed on a feed.
    pub fn process_message(
        &mut self,
        feed_key: PublicKey,
        seq: Seq,
        timeframe: Timeframe,
        client_tag: Option<String>,
        mutation: ItemMutation,
    ) -> Result<PushOutcome, ItemError> {
        let outcome = self.queue.push_confirmed(ConfirmedMutation {
            feed_key,
            seq,
            timeframe,
            client_tag: client_tag.into_iter().collect(),
            mutation: mutation.clone(),
        })?;

        if !self.is_initialized() {
            return Ok(outcome);
        }
        if outcome.reorder {
            log::debug!("Replaying {} after reorder", self.id);
            self.reset_state();
        } else if outcome.apply {
            apply_mutation(&self.id, &mut self.live, &mutation);
        }
        Ok(outcome)
    }

    /// Rebuild the live state from the base plus everything queued.
    fn reset_state(&mut self) {
        let Some(constructor) = self.constructor else {
            return;
        };

        let base = self.initial.snapshot.clone().unwrap_or_default();
        let mut live = LiveState {
            parent_id: base.parent_id,
            deleted: base.deleted,
            machine: Some(constructor()),
        };
        if let (Some(model), Some(machine)) = (&base.model, live.machine.as_mut()) {
            if let Err(e) = machine.reset_encoded(model) {
                log::warn!("Could not restore model state of {}: {}", self.id, e);
            }
        }

        for mutation in self.initial.mutations.iter().chain(self.queue.mutations()) {
            apply_mutation(&self.id, &mut live, mutation);
        }
        self.live = live;
    }

    /// Capture the current state.
    ///
    /// Models that can snapshot themselves produce a compact snapshot of the
    /// live state. Otherwise the snapshot is the base plus every confirmed
    /// mutation, to be replayed on restore.
    pub fn create_snapshot(&self) -> ItemSnapshot {
        let direct = self.live.machine.as_ref().and_then(|machine| {
            machine
                .snapshot_encoded()
                .map_err(|e| log::warn!("Could not snapshot model of {}: {}", self.id, e))
                .ok()
                .flatten()
        });

        match direct {
            Some(model) => ItemSnapshot {
                object_id: self.id.clone(),
                genesis: self.initial.genesis.clone(),
                snapshot: Some(ItemState {
                    parent_id: self.live.parent_id.clone(),
                    deleted: self.live.deleted,
                    model: Some(model),
                }),
                mutations: Vec::new(),
                meta: None,
            },
            None => ItemSnapshot {
                object_id: self.id.clone(),
                genesis: self.initial.genesis.clone(),
                snapshot: self.initial.snapshot.clone(),
                mutations: self
                    .initial
                    .mutations
                    .iter()
                    .chain(self.queue.confirmed().iter().map(|e| &e.mutation))
                    .cloned()
                    .collect(),
                meta: None,
            },
        }
    }

    /// Replace the base state.
    ///
    /// The queue survives only when the new base acknowledges this peer's own
    /// optimistic genesis; any other base invalidates confirmed history.
    pub fn reset_to_snapshot(&mut self, snapshot: ItemSnapshot) {
        let acknowledges_own_genesis = match (&self.initial.meta, &snapshot.meta) {
            (Some(prior), Some(new)) => {
                prior.client_tag.is_some()
                    && prior.feed_key.is_none()
                    && new.client_tag == prior.client_tag
            }
            _ => false,
        };
        let needs_reset = !acknowledges_own_genesis;

        self.initial = snapshot;
        if needs_reset {
            self.queue.reset_confirmed();
            self.reset_state();
        }
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("model_type", &self.model_type())
            .field("initialized", &self.is_initialized())
            .field("deleted", &self.live.deleted)
            .field("parent_id", &self.live.parent_id)
            .field("queued", &self.queue.len())
            .finish()
    }
}
