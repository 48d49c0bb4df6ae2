//! # Field Priority Resolver
//!
//! Orders the records competing for a scalar field by the priority of the
//! source that supplied each one's value. Priorities are configured as source
//! name lists, highest first, per field (`"Gene.symbol"`), per facet
//! (`"Gene"`) or as a default. `"*"` stands for every source not listed.

use crate::error::{MergeError, MergeResult};
use crate::model::{RecordId, SourceId};
use crate::schema::FieldDescriptor;
use crate::source::Source;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Placeholder for every source absent from a priority list
pub const WILDCARD: &str = "*";

/// Source priority lists, highest priority first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Fallback order for fields without a more specific entry
    pub default: Vec<String>,
    /// Order per facet name
    pub facets: BTreeMap<String, Vec<String>>,
    /// Order per qualified field name ("Facet.field")
    pub fields: BTreeMap<String, Vec<String>>,
}

fn to_order(order: &[&str]) -> Vec<String> {
    order.iter().map(|name| name.to_string()).collect()
}

impl PriorityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, order: &[&str]) -> Self {
        self.default = to_order(order);
        self
    }

    pub fn with_facet(mut self, facet: &str, order: &[&str]) -> Self {
        self.facets.insert(facet.to_string(), to_order(order));
        self
    }

    pub fn with_field(mut self, qualified_field: &str, order: &[&str]) -> Self {
        self.fields
            .insert(qualified_field.to_string(), to_order(order));
        self
    }

    /// Most specific order configured for a field
    pub fn order_for(&self, field: &FieldDescriptor) -> Option<&[String]> {
        self.fields
            .get(&field.qualified_name())
            .or_else(|| self.facets.get(field.facet.as_str()))
            .map(Vec::as_slice)
            .or_else(|| (!self.default.is_empty()).then_some(self.default.as_slice()))
    }

    /// Reject malformed lists: empty names or a name listed twice
    pub fn validate(&self) -> MergeResult<()> {
        let lists = std::iter::once(("default", &self.default))
            .chain(self.facets.iter().map(|(k, v)| (k.as_str(), v)))
            .chain(self.fields.iter().map(|(k, v)| (k.as_str(), v)));
        for (key, order) in lists {
            let mut seen = BTreeSet::new();
            for name in order {
                if name.is_empty() {
                    return Err(MergeError::configuration(format!(
                        "priority list {key} contains an empty source name"
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(MergeError::configuration(format!(
                        "priority list {key} names {name} twice"
                    )));
                }
            }
        }
        for key in self.fields.keys() {
            if !key.contains('.') {
                return Err(MergeError::configuration(format!(
                    "field priority key {key} is not of the form Facet.field"
                )));
            }
        }
        Ok(())
    }
}

/// Which record a contribution comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Candidate {
    /// The record being stored
    Incoming,
    /// A member of the equivalence set, by position
    Equivalent(usize),
}

/// One record competing for a field, with the source its value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contributor {
    pub candidate: Candidate,
    pub record_id: Option<RecordId>,
    /// `None` for stored records without a provenance entry for the field
    pub source: Option<Source>,
}

impl Contributor {
    pub fn incoming(record_id: Option<RecordId>, source: Source) -> Self {
        Self {
            candidate: Candidate::Incoming,
            record_id,
            source: Some(source),
        }
    }

    pub fn equivalent(index: usize, record_id: Option<RecordId>, source: Option<Source>) -> Self {
        Self {
            candidate: Candidate::Equivalent(index),
            record_id,
            source,
        }
    }

    /// Untracked contributions lose to skeleton ones, which lose to main ones
    fn tier(&self) -> u8 {
        match &self.source {
            None => 0,
            Some(source) if source.skeleton => 1,
            Some(_) => 2,
        }
    }
}

/// Ranks contributors by configured source priority
#[derive(Debug, Clone, Default)]
pub struct PriorityResolver {
    config: PriorityConfig,
}

impl PriorityResolver {
    pub fn new(config: PriorityConfig) -> MergeResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    /// Order contributors for a field, winner first.
    ///
    /// Distinct sources in the same tier are compared by their position in
    /// the configured order; equal positions or missing configuration are
    /// configuration errors. Contributions from the same source prefer the
    /// incoming record, then the lower record id.
    pub fn rank(
        &self,
        field: &FieldDescriptor,
        mut contributors: Vec<Contributor>,
    ) -> MergeResult<Vec<Contributor>> {
        let positions = self.positions(field, &contributors)?;
        contributors.sort_by_key(|c| {
            let position = c
                .source
                .as_ref()
                .and_then(|s| positions.get(&s.id).copied())
                .unwrap_or(0);
            (Reverse(c.tier()), position, c.candidate, c.record_id)
        });
        Ok(contributors)
    }

    /// Highest-ranked contributor, if any
    pub fn winner(
        &self,
        field: &FieldDescriptor,
        contributors: Vec<Contributor>,
    ) -> MergeResult<Option<Contributor>> {
        Ok(self.rank(field, contributors)?.into_iter().next())
    }

    fn positions(
        &self,
        field: &FieldDescriptor,
        contributors: &[Contributor],
    ) -> MergeResult<HashMap<SourceId, usize>> {
        let mut tiers: BTreeMap<u8, BTreeMap<SourceId, &Source>> = BTreeMap::new();
        for contributor in contributors {
            if let Some(source) = &contributor.source {
                tiers
                    .entry(contributor.tier())
                    .or_default()
                    .insert(source.id, source);
            }
        }

        let mut positions = HashMap::new();
        for sources in tiers.values().filter(|sources| sources.len() > 1) {
            let order = self.config.order_for(field).ok_or_else(|| {
                MergeError::configuration(format!(
                    "no source priority configured for {} but {} sources supply it",
                    field.qualified_name(),
                    sources.len()
                ))
            })?;
            let mut taken: HashMap<usize, &Source> = HashMap::new();
            for source in sources.values() {
                let position = position_in(order, field, source)?;
                if let Some(other) = taken.insert(position, source) {
                    return Err(MergeError::configuration(format!(
                        "sources {} and {} have equal priority for {}",
                        other.name,
                        source.name,
                        field.qualified_name()
                    )));
                }
                positions.insert(source.id, position);
            }
        }
        Ok(positions)
    }
}

fn position_in(order: &[String], field: &FieldDescriptor, source: &Source) -> MergeResult<usize> {
    order
        .iter()
        .position(|name| *name == source.name)
        .or_else(|| order.iter().position(|name| name == WILDCARD))
        .ok_or_else(|| {
            MergeError::configuration(format!(
                "source {} has no priority for {} and the list has no \"{WILDCARD}\" entry",
                source.name,
                field.qualified_name()
            ))
        })
}
