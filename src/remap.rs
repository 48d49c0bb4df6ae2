//! # Identity Remap
//!
//! Maps the ids carried by incoming deliveries onto the id of the stored
//! record they were merged into, so later references can be rewritten.
//! Store ids of deleted duplicates are kept apart: the two id spaces overlap,
//! and a delivery id must never be read as a store id.

use crate::model::{RecordId, Value};
use hashbrown::HashMap;

#[derive(Debug, Clone, Default)]
struct RemapState {
    /// Delivery id -> stored id
    deliveries: HashMap<RecordId, RecordId>,
    /// Deleted store id -> surviving store id
    superseded: HashMap<RecordId, RecordId>,
}

#[derive(Debug, Clone, Default)]
pub struct IdentityRemap {
    state: RemapState,
    snapshot: Option<RemapState>,
}

impl IdentityRemap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the stored id a delivery was merged into. Missing delivery
    /// ids are ignored.
    pub fn assign(&mut self, from: Option<RecordId>, to: RecordId) {
        let Some(from) = from else {
            return;
        };
        if let Some(previous) = self.state.deliveries.insert(from, to) {
            if previous != to {
                tracing::debug!(%from, %previous, %to, "identity remap replaced");
            }
        }
    }

    /// Record that a stored duplicate was deleted in favour of `survivor`
    pub fn supersede(&mut self, deleted: RecordId, survivor: RecordId) {
        if deleted != survivor {
            self.state.superseded.insert(deleted, survivor);
        }
    }

    /// Stored id a delivery id was merged into, if any
    pub fn get(&self, id: RecordId) -> Option<RecordId> {
        self.state.deliveries.get(&id).copied()
    }

    /// Stored id for a delivery id; unmapped ids are returned unchanged
    pub fn resolve(&self, id: RecordId) -> RecordId {
        self.get(id).unwrap_or(id)
    }

    /// Final survivor of a deleted store id, following chains of deletions
    pub fn survivor_of(&self, id: RecordId) -> RecordId {
        let mut current = id;
        // a chain can never be longer than the map; stop there on a cycle
        for _ in 0..=self.state.superseded.len() {
            match self.state.superseded.get(&current) {
                Some(next) if *next != id => current = *next,
                _ => break,
            }
        }
        current
    }

    /// Rewrite a reference carried by a delivery; other values are returned
    /// as-is
    pub fn translate(&self, value: &Value) -> Value {
        match value {
            Value::Ref(id) => Value::Ref(self.resolve(*id)),
            other => other.clone(),
        }
    }

    /// Number of mapped delivery ids
    pub fn len(&self) -> usize {
        self.state.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.deliveries.is_empty()
    }

    /// Delivery mappings ordered by delivery id
    pub fn entries(&self) -> Vec<(RecordId, RecordId)> {
        let mut entries: Vec<_> = self.state.deliveries.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort();
        entries
    }

    /// Snapshot the mappings at the start of a transaction
    pub fn begin(&mut self) {
        self.snapshot = Some(self.state.clone());
    }

    /// Keep the mappings made since `begin`
    pub fn commit(&mut self) {
        self.snapshot = None;
    }

    /// Discard the mappings made since `begin`
    pub fn rollback(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.state = snapshot;
        }
    }
}
