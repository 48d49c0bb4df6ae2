//! # Schema Module
//!
//! Registry-driven model description. Each facet declares a fixed, ordered
//! list of field descriptors; a record's fields are the union of the fields of
//! its facets. The reconciler consults the model only through
//! [`ModelReflector`].

use crate::model::Facet;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The identity pseudo-field. Never declared, tracked or priority-resolved.
pub const ID_FIELD: &str = "id";

/// How a field holds its values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Single value, chosen by source priority
    Scalar,
    /// Multi-valued, merged by union
    Collection,
}

/// Identifies a field and the facet declaring it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub facet: Facet,
}

impl FieldDescriptor {
    pub fn scalar(facet: impl Into<Facet>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Scalar,
            facet: facet.into(),
        }
    }

    pub fn collection(facet: impl Into<Facet>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Collection,
            facet: facet.into(),
        }
    }

    pub fn is_collection(&self) -> bool {
        self.kind == FieldKind::Collection
    }

    /// Qualified name used by priority configuration ("Gene.symbol")
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.facet, self.name)
    }
}

/// Read access to the model, consumed by the reconciler
pub trait ModelReflector: Send + Sync {
    /// Fields of a composite type, in stable order, without duplicates
    fn fields_of(&self, facets: &BTreeSet<Facet>) -> Result<Vec<FieldDescriptor>>;

    /// Whether any facet of the type declares the named field
    fn declares_field(&self, facets: &BTreeSet<Facet>, name: &str) -> Result<bool> {
        Ok(self.fields_of(facets)?.iter().any(|f| f.name == name))
    }

    fn is_collection(&self, descriptor: &FieldDescriptor) -> bool {
        descriptor.is_collection()
    }

    /// Composite type of several types
    fn union_type(&self, types: &[&BTreeSet<Facet>]) -> BTreeSet<Facet> {
        types
            .iter()
            .flat_map(|facets| facets.iter().cloned())
            .collect()
    }
}

/// Field declaration used when building a schema from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: FieldKind,
}

fn default_kind() -> FieldKind {
    FieldKind::Scalar
}

/// Static registry of facets and their fields
#[derive(Debug, Clone, Default)]
pub struct Schema {
    facets: BTreeMap<Facet, Vec<FieldDescriptor>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a facet with its ordered fields.
    ///
    /// A field name shared by several facets must have the same kind
    /// everywhere, since the merged record holds it once.
    pub fn add_facet(&mut self, facet: impl Into<Facet>, fields: &[FieldSpec]) -> Result<()> {
        let facet = facet.into();
        if self.facets.contains_key(&facet) {
            bail!("facet {facet} declared twice");
        }
        let mut seen = BTreeSet::new();
        let mut descriptors = Vec::with_capacity(fields.len());
        for spec in fields {
            if spec.name == ID_FIELD {
                bail!("facet {facet} declares the reserved field {ID_FIELD:?}");
            }
            if !seen.insert(spec.name.as_str()) {
                bail!("facet {facet} declares field {} twice", spec.name);
            }
            if let Some(existing) = self.find_field(&spec.name) {
                if existing.kind != spec.kind {
                    bail!(
                        "field {} is {:?} in {} but {:?} in {facet}",
                        spec.name,
                        existing.kind,
                        existing.facet,
                        spec.kind
                    );
                }
            }
            descriptors.push(FieldDescriptor {
                name: spec.name.clone(),
                kind: spec.kind,
                facet: facet.clone(),
            });
        }
        self.facets.insert(facet, descriptors);
        Ok(())
    }

    /// Builder-style helper: scalar and collection field names
    pub fn with_facet(mut self, facet: &str, scalars: &[&str], collections: &[&str]) -> Result<Self> {
        let fields: Vec<FieldSpec> = scalars
            .iter()
            .map(|name| FieldSpec {
                name: name.to_string(),
                kind: FieldKind::Scalar,
            })
            .chain(collections.iter().map(|name| FieldSpec {
                name: name.to_string(),
                kind: FieldKind::Collection,
            }))
            .collect();
        self.add_facet(facet, &fields)?;
        Ok(self)
    }

    pub fn facet_fields(&self, facet: &Facet) -> Option<&[FieldDescriptor]> {
        self.facets.get(facet).map(Vec::as_slice)
    }

    pub fn facets(&self) -> impl Iterator<Item = &Facet> + '_ {
        self.facets.keys()
    }

    fn find_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.facets
            .values()
            .flat_map(|fields| fields.iter())
            .find(|field| field.name == name)
    }
}

impl ModelReflector for Schema {
    fn fields_of(&self, facets: &BTreeSet<Facet>) -> Result<Vec<FieldDescriptor>> {
        let mut seen = BTreeSet::new();
        let mut fields = Vec::new();
        for facet in facets {
            let declared = self
                .facets
                .get(facet)
                .ok_or_else(|| anyhow!("unknown facet {facet}"))?;
            for field in declared {
                if seen.insert(field.name.clone()) {
                    fields.push(field.clone());
                }
            }
        }
        Ok(fields)
    }

    fn declares_field(&self, facets: &BTreeSet<Facet>, name: &str) -> Result<bool> {
        for facet in facets {
            let declared = self
                .facets
                .get(facet)
                .ok_or_else(|| anyhow!("unknown facet {facet}"))?;
            if declared.iter().any(|field| field.name == name) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
