//! # Source Registry
//!
//! Provenance origins. A source is identified by its name and its skeleton
//! flag; lookup-or-create is idempotent on that pair.

use crate::ledger::LedgerStore;
use crate::model::SourceId;
use anyhow::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named provenance origin
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    /// Partial, placeholder contribution rather than a full one
    pub skeleton: bool,
}

impl Source {
    pub fn new(id: SourceId, name: impl Into<String>, skeleton: bool) -> Self {
        Self {
            id,
            name: name.into(),
            skeleton,
        }
    }

    pub fn is_main(&self) -> bool {
        !self.skeleton
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skeleton {
            write!(f, "{} (skeleton)", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// In-memory view over the sources held by the ledger store.
///
/// The store's `create_source` is insert-if-absent, so concurrent or
/// repeated lookups never produce two sources for the same key.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    by_key: RwLock<HashMap<(String, bool), Source>>,
    by_id: RwLock<HashMap<SourceId, Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_source(&self, store: &mut dyn LedgerStore, name: &str) -> Result<Source> {
        self.lookup_or_create(store, name, false)
    }

    pub fn skeleton_source(&self, store: &mut dyn LedgerStore, name: &str) -> Result<Source> {
        self.lookup_or_create(store, name, true)
    }

    /// Resolve a source id recorded in the ledger
    pub fn by_id(&self, store: &dyn LedgerStore, id: SourceId) -> Result<Source> {
        if let Some(source) = self.by_id.read().get(&id) {
            return Ok(source.clone());
        }
        match store.source_by_id(id)? {
            Some(source) => {
                self.remember(&source);
                Ok(source)
            }
            None => bail!("ledger references unknown source {id}"),
        }
    }

    /// Forget cached sources, e.g. after a rollback removed some of them
    pub fn invalidate(&self) {
        self.by_key.write().clear();
        self.by_id.write().clear();
    }

    fn lookup_or_create(
        &self,
        store: &mut dyn LedgerStore,
        name: &str,
        skeleton: bool,
    ) -> Result<Source> {
        if name.is_empty() {
            bail!("source name must not be empty");
        }
        if let Some(source) = self.by_key.read().get(&(name.to_string(), skeleton)) {
            return Ok(source.clone());
        }
        let source = match store.source_by_key(name, skeleton)? {
            Some(existing) => existing,
            None => {
                let created = store.create_source(name, skeleton)?;
                tracing::debug!(source = %created, id = %created.id, "registered source");
                created
            }
        };
        self.remember(&source);
        Ok(source)
    }

    fn remember(&self, source: &Source) {
        self.by_key
            .write()
            .insert((source.name.clone(), source.skeleton), source.clone());
        self.by_id.write().insert(source.id, source.clone());
    }
}
