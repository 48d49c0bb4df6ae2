//! # Provenance Ledger
//!
//! Records, per (record, field), which source supplied the field's current
//! value. [`LedgerStore`] is the storage seam; [`Ledger`] is the adapter the
//! reconciler talks to. It owns the source registry, a read cache, and the
//! overlay for records known to be brand-new.

use crate::config::DEFAULT_LEDGER_CACHE_CAPACITY;
use crate::error::{MergeError, MergeResult};
use crate::model::{RecordId, SourceId};
use crate::schema::ID_FIELD;
use crate::source::{Source, SourceRegistry};
use crate::transaction::Transactional;
use anyhow::{anyhow, bail, ensure, Result};
use hashbrown::HashMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use tracing::debug;

/// Model name every ledger store must declare
pub const PROVENANCE_MODEL: &str = "provenance";

/// Storage for sources and provenance entries
pub trait LedgerStore: Transactional + Send {
    /// Name of the model the store was created for
    fn model_name(&self) -> &str;

    fn source_by_key(&self, name: &str, skeleton: bool) -> Result<Option<Source>>;

    fn source_by_id(&self, id: SourceId) -> Result<Option<Source>>;

    /// Insert-if-absent: returns the existing source when the key is taken
    fn create_source(&mut self, name: &str, skeleton: bool) -> Result<Source>;

    fn get_entry(&self, record: RecordId, field: &str) -> Result<Option<SourceId>>;

    fn put_entry(&mut self, record: RecordId, field: &str, source: SourceId) -> Result<()>;

    /// Drop every entry of a record, returning how many were removed
    fn remove_entries(&mut self, record: RecordId) -> Result<usize>;
}

#[derive(Debug, Clone, Default)]
struct LedgerState {
    sources: Vec<Source>,
    entries: HashMap<(RecordId, String), SourceId>,
}

/// In-memory ledger store with snapshot transactions
#[derive(Debug)]
pub struct MemoryLedger {
    model: String,
    state: LedgerState,
    snapshot: Option<LedgerState>,
    closed: bool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_model(PROVENANCE_MODEL)
    }

    /// Ledger declaring an arbitrary model name
    pub fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            state: LedgerState::default(),
            snapshot: None,
            closed: false,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.state.entries.len()
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed, "ledger store is closed");
        Ok(())
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Transactional for MemoryLedger {
    fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        ensure!(self.snapshot.is_none(), "ledger transaction already in progress");
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| anyhow!("no ledger transaction in progress"))
    }

    fn abort_transaction(&mut self) -> Result<()> {
        self.ensure_open()?;
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| anyhow!("no ledger transaction in progress"))?;
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

impl LedgerStore for MemoryLedger {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn source_by_key(&self, name: &str, skeleton: bool) -> Result<Option<Source>> {
        self.ensure_open()?;
        Ok(self
            .state
            .sources
            .iter()
            .find(|s| s.name == name && s.skeleton == skeleton)
            .cloned())
    }

    fn source_by_id(&self, id: SourceId) -> Result<Option<Source>> {
        self.ensure_open()?;
        Ok(self.state.sources.iter().find(|s| s.id == id).cloned())
    }

    fn create_source(&mut self, name: &str, skeleton: bool) -> Result<Source> {
        if let Some(existing) = self.source_by_key(name, skeleton)? {
            return Ok(existing);
        }
        let id = SourceId(self.state.sources.len() as u32 + 1);
        let source = Source::new(id, name, skeleton);
        self.state.sources.push(source.clone());
        Ok(source)
    }

    fn get_entry(&self, record: RecordId, field: &str) -> Result<Option<SourceId>> {
        self.ensure_open()?;
        Ok(self
            .state
            .entries
            .get(&(record, field.to_string()))
            .copied())
    }

    fn put_entry(&mut self, record: RecordId, field: &str, source: SourceId) -> Result<()> {
        self.ensure_open()?;
        self.state
            .entries
            .insert((record, field.to_string()), source);
        Ok(())
    }

    fn remove_entries(&mut self, record: RecordId) -> Result<usize> {
        self.ensure_open()?;
        let before = self.state.entries.len();
        self.state.entries.retain(|(id, _), _| *id != record);
        Ok(before - self.state.entries.len())
    }
}

/// Adapter over a [`LedgerStore`] used by the reconciler
pub struct Ledger {
    store: Box<dyn LedgerStore>,
    sources: SourceRegistry,
    cache: LruCache<(RecordId, String), Option<SourceId>>,
    /// Records known to have no rows in the store beyond those written here
    fresh: HashMap<RecordId, HashMap<String, SourceId>>,
}

impl Ledger {
    /// Wrap a store, failing fast unless it uses the provenance model
    pub fn new(store: Box<dyn LedgerStore>) -> MergeResult<Self> {
        Self::with_cache_capacity(store, DEFAULT_LEDGER_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(
        store: Box<dyn LedgerStore>,
        cache_capacity: usize,
    ) -> MergeResult<Self> {
        if store.model_name() != PROVENANCE_MODEL {
            return Err(MergeError::configuration(format!(
                "ledger store must use the {PROVENANCE_MODEL} model - currently using {}",
                store.model_name()
            )));
        }
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            store,
            sources: SourceRegistry::new(),
            cache: LruCache::new(capacity),
            fresh: HashMap::new(),
        })
    }

    pub fn main_source(&mut self, name: &str) -> Result<Source> {
        self.sources.main_source(self.store.as_mut(), name)
    }

    pub fn skeleton_source(&mut self, name: &str) -> Result<Source> {
        self.sources.skeleton_source(self.store.as_mut(), name)
    }

    /// Source that supplied the current value of a field
    pub fn get_source(&mut self, record: RecordId, field: &str) -> Result<Option<Source>> {
        check_field(field)?;
        let source_id = if let Some(rows) = self.fresh.get(&record) {
            rows.get(field).copied()
        } else {
            let key = (record, field.to_string());
            if let Some(cached) = self.cache.get(&key).copied() {
                cached
            } else {
                let loaded = self.store.get_entry(record, field)?;
                self.cache.put(key, loaded);
                loaded
            }
        };
        source_id
            .map(|id| self.sources.by_id(self.store.as_ref(), id))
            .transpose()
    }

    pub fn set_source(&mut self, record: RecordId, field: &str, source: &Source) -> Result<()> {
        check_field(field)?;
        self.store.put_entry(record, field, source.id)?;
        if let Some(rows) = self.fresh.get_mut(&record) {
            rows.insert(field.to_string(), source.id);
        }
        self.cache.put((record, field.to_string()), Some(source.id));
        Ok(())
    }

    /// Mark an id as brand-new so reads skip the store until the next
    /// commit or abort. Safe to omit; ignored outside a transaction, where
    /// nothing would ever release the overlay.
    pub fn clear(&mut self, record: RecordId) {
        if !self.store.is_in_transaction() {
            return;
        }
        self.fresh.entry(record).or_default();
    }

    /// Number of ids currently answered from the overlay
    pub fn fresh_count(&self) -> usize {
        self.fresh.len()
    }

    pub fn is_fresh(&self, record: RecordId) -> bool {
        self.fresh.contains_key(&record)
    }

    /// Drop the rows of a deleted record
    pub fn remove_record(&mut self, record: RecordId) -> Result<usize> {
        let removed = self.store.remove_entries(record)?;
        self.fresh.remove(&record);
        let stale: Vec<(RecordId, String)> = self
            .cache
            .iter()
            .filter(|((id, _), _)| *id == record)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.cache.pop(&key);
        }
        Ok(removed)
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    fn reset_caches(&mut self) {
        self.cache.clear();
        self.fresh.clear();
        self.sources.invalidate();
    }
}

fn check_field(field: &str) -> Result<()> {
    if field == ID_FIELD {
        bail!("the {ID_FIELD:?} field carries no provenance");
    }
    Ok(())
}

impl Transactional for Ledger {
    fn begin_transaction(&mut self) -> Result<()> {
        self.store.begin_transaction()
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.store.commit_transaction()?;
        self.fresh.clear();
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<()> {
        let result = self.store.abort_transaction();
        self.reset_caches();
        debug!("ledger caches reset after abort");
        result
    }

    fn is_in_transaction(&self) -> bool {
        self.store.is_in_transaction()
    }

    fn close(&mut self) -> Result<()> {
        self.reset_caches();
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Ledger {
        Ledger::new(Box::new(MemoryLedger::new())).unwrap()
    }

    #[test]
    fn test_model_name_precondition() {
        let result = Ledger::new(Box::new(MemoryLedger::with_model("genomic")));
        match result {
            Err(MergeError::Configuration(message)) => assert!(message.contains("genomic")),
            _ => panic!("expected configuration error"),
        }
    }

    #[test]
    fn test_set_and_get_source() {
        let mut ledger = ledger();
        let source = ledger.main_source("GenBank").unwrap();
        assert_eq!(ledger.get_source(RecordId(1), "symbol").unwrap(), None);

        ledger.set_source(RecordId(1), "symbol", &source).unwrap();
        assert_eq!(ledger.get_source(RecordId(1), "symbol").unwrap(), Some(source.clone()));

        let other = ledger.main_source("RefSeq").unwrap();
        ledger.set_source(RecordId(1), "symbol", &other).unwrap();
        assert_eq!(ledger.get_source(RecordId(1), "symbol").unwrap(), Some(other));
    }

    #[test]
    fn test_id_field_is_never_tracked() {
        let mut ledger = ledger();
        let source = ledger.main_source("GenBank").unwrap();
        assert!(ledger.set_source(RecordId(1), ID_FIELD, &source).is_err());
        assert!(ledger.get_source(RecordId(1), ID_FIELD).is_err());
    }

    #[test]
    fn test_fresh_records_read_from_overlay() {
        let mut ledger = ledger();
        ledger.begin_transaction().unwrap();
        let source = ledger.main_source("GenBank").unwrap();
        ledger.clear(RecordId(5));
        assert!(ledger.is_fresh(RecordId(5)));

        ledger.set_source(RecordId(5), "symbol", &source).unwrap();
        assert_eq!(ledger.get_source(RecordId(5), "symbol").unwrap(), Some(source));
        assert_eq!(ledger.get_source(RecordId(5), "name").unwrap(), None);
        assert!(ledger.store().get_entry(RecordId(5), "symbol").unwrap().is_some());
    }

    #[test]
    fn test_clear_outside_transaction_keeps_no_overlay() {
        let mut ledger = ledger();
        let source = ledger.main_source("GenBank").unwrap();
        for id in 1..=100 {
            ledger.clear(RecordId(id));
            ledger.set_source(RecordId(id), "symbol", &source).unwrap();
        }
        assert_eq!(ledger.fresh_count(), 0);
        assert!(!ledger.is_fresh(RecordId(1)));
        assert_eq!(ledger.get_source(RecordId(100), "symbol").unwrap(), Some(source));
    }

    #[test]
    fn test_commit_ends_fresh_overlay() {
        let mut ledger = ledger();
        ledger.begin_transaction().unwrap();
        let source = ledger.main_source("GenBank").unwrap();
        ledger.clear(RecordId(2));
        ledger.set_source(RecordId(2), "symbol", &source).unwrap();
        ledger.commit_transaction().unwrap();

        assert!(!ledger.is_fresh(RecordId(2)));
        assert_eq!(ledger.get_source(RecordId(2), "symbol").unwrap(), Some(source));
    }

    #[test]
    fn test_abort_discards_rows_and_caches() {
        let mut ledger = ledger();
        ledger.begin_transaction().unwrap();
        let source = ledger.main_source("GenBank").unwrap();
        ledger.set_source(RecordId(3), "symbol", &source).unwrap();
        ledger.abort_transaction().unwrap();

        assert_eq!(ledger.get_source(RecordId(3), "symbol").unwrap(), None);
        assert_eq!(ledger.store().source_by_key("GenBank", false).unwrap(), None);
    }

    #[test]
    fn test_remove_record() {
        let mut ledger = ledger();
        let source = ledger.main_source("GenBank").unwrap();
        ledger.set_source(RecordId(4), "symbol", &source).unwrap();
        ledger.set_source(RecordId(4), "name", &source).unwrap();
        ledger.set_source(RecordId(9), "name", &source).unwrap();

        assert_eq!(ledger.remove_record(RecordId(4)).unwrap(), 2);
        assert_eq!(ledger.get_source(RecordId(4), "symbol").unwrap(), None);
        assert!(ledger.get_source(RecordId(9), "name").unwrap().is_some());
    }

    #[test]
    fn test_memory_ledger_transactions() {
        let mut store = MemoryLedger::new();
        assert!(store.commit_transaction().is_err());
        store.begin_transaction().unwrap();
        assert!(store.begin_transaction().is_err());
        store.put_entry(RecordId(1), "symbol", SourceId(1)).unwrap();
        store.abort_transaction().unwrap();
        assert_eq!(store.entry_count(), 0);

        store.close().unwrap();
        assert!(store.get_entry(RecordId(1), "symbol").is_err());
    }
}
