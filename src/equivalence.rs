//! # Equivalence Module
//!
//! Decides which stored records describe the same entity as an incoming one.
//! The reconciler only depends on [`EquivalenceOracle`]; [`KeyEquivalence`]
//! matches on identity keys declared per facet.

use crate::model::{Facet, Record, Value};
use crate::source::Source;
use crate::store::RecordStore;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finds the equivalence set of an incoming record
pub trait EquivalenceOracle: Send + Sync {
    /// Stored records equivalent to `record`, ordered by id
    fn find_equivalent(
        &self,
        store: &dyn RecordStore,
        record: &Record,
        source: &Source,
    ) -> Result<Vec<Record>>;
}

/// An identity key defines which fields must match for records to be considered the same entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    /// Human-readable name for this identity key
    pub name: String,
    /// Facet the incoming record must satisfy for the key to apply
    pub facet: Facet,
    /// The scalar fields that form the key
    pub fields: Vec<String>,
    /// Source names the key is restricted to; empty applies to every source
    #[serde(default)]
    pub sources: Vec<String>,
}

impl IdentityKey {
    /// Create a new identity key
    pub fn new(name: &str, facet: impl Into<Facet>, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            facet: facet.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            sources: Vec::new(),
        }
    }

    /// Restrict the key to records loaded from the named sources
    pub fn for_sources(mut self, sources: &[&str]) -> Self {
        self.sources = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn applies_to(&self, record: &Record, source: &Source) -> bool {
        record.facets.contains(&self.facet)
            && (self.sources.is_empty() || self.sources.iter().any(|s| *s == source.name))
    }

    /// Key values of a record, `None` when any key field is unset
    pub fn values<'a>(&'a self, record: &'a Record) -> Option<Vec<(&'a str, &'a Value)>> {
        self.fields
            .iter()
            .map(|field| record.scalar(field).map(|value| (field.as_str(), value)))
            .collect()
    }
}

/// Equivalence by identity keys
#[derive(Debug, Clone, Default)]
pub struct KeyEquivalence {
    keys: Vec<IdentityKey>,
}

impl KeyEquivalence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: Vec<IdentityKey>) -> Result<Self> {
        let mut equivalence = Self::new();
        for key in keys {
            equivalence.add_key(key)?;
        }
        Ok(equivalence)
    }

    /// Add an identity key
    pub fn add_key(&mut self, key: IdentityKey) -> Result<()> {
        if key.fields.is_empty() {
            bail!("identity key {} has no fields", key.name);
        }
        self.keys.push(key);
        Ok(())
    }

    pub fn keys(&self) -> &[IdentityKey] {
        &self.keys
    }
}

impl EquivalenceOracle for KeyEquivalence {
    fn find_equivalent(
        &self,
        store: &dyn RecordStore,
        record: &Record,
        source: &Source,
    ) -> Result<Vec<Record>> {
        let mut found = BTreeMap::new();
        for key in self.keys.iter().filter(|key| key.applies_to(record, source)) {
            let Some(example) = key.values(record) else {
                continue;
            };
            for candidate in store.find_by_example(&example)? {
                if let Some(id) = candidate.id {
                    found.entry(id).or_insert(candidate);
                }
            }
        }
        Ok(found.into_values().collect())
    }
}
