//! Write-behind log of block changes made since the last save.
//!
//! The log holds intent, not history: each coordinate has at most one
//! outstanding operation, and every new operation is folded into it with
//! [`coalesce`].

use ahash::AHashMap;
use location_schema::{ChangeOp, LocationKey};
use tracing::warn;

/// What to do with the log entry for a coordinate after a new operation arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Replace (or create) the entry with this operation.
    Store(ChangeOp),
    /// Leave the existing entry as it is.
    Keep,
    /// Remove the entry; the changes cancelled out.
    Drop,
    /// The pair cannot arise from the manager's API. The existing entry is left as it is.
    Unexpected,
}

/// Fold `incoming` into the `existing` pending operation.
pub fn coalesce(existing: Option<ChangeOp>, incoming: ChangeOp) -> Transition {
    use ChangeOp::{Delete, Insert, Update};

    match (existing, incoming) {
        (None, op) => Transition::Store(op),

        (Some(Insert), Insert) => Transition::Unexpected,
        (Some(Update), Insert) => Transition::Unexpected,
        (Some(Delete), Insert) => Transition::Store(Update),

        (Some(Insert), Update) => Transition::Keep,
        (Some(Update), Update) => Transition::Keep,
        (Some(Delete), Update) => Transition::Unexpected,

        (Some(Insert), Delete) => Transition::Drop,
        (Some(Update), Delete) => Transition::Store(Delete),
        (Some(Delete), Delete) => Transition::Keep,
    }
}

#[derive(Debug, Default)]
pub struct PendingChanges {
    entries: AHashMap<LocationKey, ChangeOp>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, op: ChangeOp, key: &LocationKey) -> Transition {
        let existing = self.entries.get(key).copied();
        let transition = coalesce(existing, op);
        match transition {
            Transition::Store(next) => {
                self.entries.insert(key.clone(), next);
            }
            Transition::Drop => {
                self.entries.remove(key);
            }
            Transition::Keep => {}
            Transition::Unexpected => {
                warn!(
                    target: "block_store::location",
                    %key,
                    existing = ?existing,
                    incoming = %op,
                    "pending.unexpected_transition"
                );
            }
        }
        transition
    }

    pub fn get(&self, key: &LocationKey) -> Option<ChangeOp> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Takes every entry, leaving the log empty. Order is by key so flushes are reproducible.
    pub fn drain(&mut self) -> Vec<(LocationKey, ChangeOp)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }
}
