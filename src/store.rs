//! # Store Module
//!
//! The primary record store seam and an in-memory implementation with
//! snapshot transactions.

use crate::model::{Record, RecordId, Value};
use crate::transaction::Transactional;
use anyhow::{anyhow, ensure, Result};
use hashbrown::HashMap;

/// Primary persistence for merged records
pub trait RecordStore: Transactional + Send {
    /// Persist a record, assigning an id when it has none
    fn store(&mut self, record: &mut Record) -> Result<RecordId>;

    /// Remove a record, returning whether it existed
    fn delete(&mut self, id: RecordId) -> Result<bool>;

    fn get(&self, id: RecordId) -> Result<Option<Record>>;

    /// Records whose named fields hold the example values, ordered by id.
    ///
    /// A scalar field matches on equality, a collection field on membership.
    fn find_by_example(&self, example: &[(&str, &Value)]) -> Result<Vec<Record>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    records: HashMap<RecordId, Record>,
    next_record_id: u32,
}

/// In-memory record store
#[derive(Debug)]
pub struct Store {
    state: StoreState,
    snapshot: Option<StoreState>,
    closed: bool,
}

impl Store {
    /// Create a new store
    pub fn new() -> Self {
        Self {
            state: StoreState {
                records: HashMap::new(),
                next_record_id: 1,
            },
            snapshot: None,
            closed: false,
        }
    }

    /// All records ordered by id
    pub fn records(&self) -> Vec<&Record> {
        let mut records: Vec<&Record> = self.state.records.values().collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn next_record_id(&self) -> u32 {
        self.state.next_record_id
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed, "record store is closed");
        Ok(())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_example(record: &Record, example: &[(&str, &Value)]) -> bool {
    example.iter().all(|(field, value)| {
        record.scalar(field) == Some(*value)
            || record
                .collection(field)
                .map(|values| values.contains(*value))
                .unwrap_or(false)
    })
}

impl RecordStore for Store {
    fn store(&mut self, record: &mut Record) -> Result<RecordId> {
        self.ensure_open()?;
        let id = match record.id {
            Some(id) => {
                self.state.next_record_id = self.state.next_record_id.max(id.0 + 1);
                id
            }
            None => {
                let id = RecordId(self.state.next_record_id);
                self.state.next_record_id += 1;
                record.id = Some(id);
                id
            }
        };
        self.state.records.insert(id, record.clone());
        Ok(id)
    }

    fn delete(&mut self, id: RecordId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.records.remove(&id).is_some())
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.ensure_open()?;
        Ok(self.state.records.get(&id).cloned())
    }

    fn find_by_example(&self, example: &[(&str, &Value)]) -> Result<Vec<Record>> {
        self.ensure_open()?;
        if example.is_empty() {
            return Ok(Vec::new());
        }
        let mut found: Vec<Record> = self
            .state
            .records
            .values()
            .filter(|record| matches_example(record, example))
            .cloned()
            .collect();
        found.sort_by_key(|record| record.id);
        Ok(found)
    }

    fn len(&self) -> usize {
        self.state.records.len()
    }
}

impl Transactional for Store {
    fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        ensure!(self.snapshot.is_none(), "record store transaction already in progress");
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("no record store transaction in progress"))
    }

    fn abort_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| anyhow!("no record store transaction in progress"))?;
        self.state = snapshot;
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gene(symbol: &str) -> Record {
        Record::new(["Gene"]).with_scalar("symbol", Value::text(symbol))
    }

    #[test]
    fn test_store_creation() {
        let store = Store::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_store_assigns_ids() {
        let mut store = Store::new();
        let mut first = gene("eve");
        let mut second = gene("ftz");

        let first_id = store.store(&mut first).unwrap();
        let second_id = store.store(&mut second).unwrap();
        assert_eq!(first.id, Some(first_id));
        assert_ne!(first_id, second_id);
        assert_eq!(store.len(), 2);

        // storing again with an id overwrites in place
        first.set_scalar("symbol", Some(Value::text("even-skipped")));
        assert_eq!(store.store(&mut first).unwrap(), first_id);
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get(first_id).unwrap().unwrap().scalar("symbol"),
            Some(&Value::text("even-skipped"))
        );
    }

    #[test]
    fn test_explicit_ids_advance_counter() {
        let mut store = Store::new();
        let mut record = gene("eve").with_id(RecordId(10));
        store.store(&mut record).unwrap();
        let mut next = gene("ftz");
        assert_eq!(store.store(&mut next).unwrap(), RecordId(11));
    }

    #[test]
    fn test_find_by_example() {
        let mut store = Store::new();
        let mut eve = gene("eve").with_collection("synonyms", [Value::text("E2")]);
        let mut ftz = gene("ftz");
        store.store(&mut eve).unwrap();
        store.store(&mut ftz).unwrap();

        let symbol = Value::text("eve");
        let found = store.find_by_example(&[("symbol", &symbol)]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, eve.id);

        let synonym = Value::text("E2");
        let found = store.find_by_example(&[("synonyms", &synonym)]).unwrap();
        assert_eq!(found.len(), 1);

        assert!(store.find_by_example(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let mut store = Store::new();
        let mut record = gene("eve");
        let id = store.store(&mut record).unwrap();
        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn test_abort_restores_snapshot() {
        let mut store = Store::new();
        let mut kept = gene("eve");
        store.store(&mut kept).unwrap();

        store.begin_transaction().unwrap();
        let mut dropped = gene("ftz");
        store.store(&mut dropped).unwrap();
        store.delete(kept.id.unwrap()).unwrap();
        store.abort_transaction().unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.get(kept.id.unwrap()).unwrap().is_some());
        assert!(store.abort_transaction().is_err());
    }

    #[test]
    fn test_closed_store_rejects_operations() {
        let mut store = Store::new();
        store.close().unwrap();
        let mut record = gene("eve");
        assert!(store.store(&mut record).is_err());
        assert!(store.begin_transaction().is_err());
    }
}
