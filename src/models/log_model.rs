//! Append-only text log model
//!
//! Entries are kept in application order. The model has no snapshot of its
//! own, so items of this type are snapshotted as their mutation log.

use super::{Model, StateMachine};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogModel {
    entries: Vec<String>,
}

impl LogModel {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

impl StateMachine for LogModel {
    type Mutation = String;
    type Snapshot = Vec<String>;

    fn process(&mut self, entry: String) {
        self.entries.push(entry);
    }

    fn reset(&mut self, snapshot: Vec<String>) {
        self.entries = snapshot;
    }
}

impl Model for LogModel {
    const TYPE_NAME: &'static str = "feedspace:log";
}
