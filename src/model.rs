//! # Data Model
//!
//! Core data structures for record reconciliation: record and source
//! identifiers, type facets, field values and the record itself.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Compact identifier for records, assigned by the primary store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u32);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Compact identifier for provenance sources, assigned by the ledger store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A type facet a record satisfies (e.g. "Gene", "Protein").
///
/// A record's dynamic type is the set of its facets; merging records unions
/// their facet sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Facet(pub String);

impl Facet {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Facet {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A single field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Int(i64),
    Bool(bool),
    /// Reference to another record by identity
    Ref(RecordId),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Ref(id) => write!(f, "&{id}"),
        }
    }
}

/// The content of one field: a nullable scalar or a set of values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Scalar(Option<Value>),
    Collection(BTreeSet<Value>),
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => value.as_ref(),
            Self::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Self::Collection(values) => Some(values),
            Self::Scalar(_) => None,
        }
    }
}

/// A typed bag of named field values with an optional identity
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    /// Identity, `None` until the primary store assigns one
    #[serde(default)]
    pub id: Option<RecordId>,
    /// Dynamic type set
    pub facets: BTreeSet<Facet>,
    /// Field values keyed by field name
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record satisfying the given facets
    pub fn new<I, F>(facets: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Facet>,
    {
        Self {
            id: None,
            facets: facets.into_iter().map(Into::into).collect(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_scalar(mut self, name: &str, value: Value) -> Self {
        self.set_scalar(name, Some(value));
        self
    }

    pub fn with_collection<I>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.fields.insert(
            name.to_string(),
            FieldValue::Collection(values.into_iter().collect()),
        );
        self
    }

    pub fn set_scalar(&mut self, name: &str, value: Option<Value>) {
        self.fields
            .insert(name.to_string(), FieldValue::Scalar(value));
    }

    pub fn set_field(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Scalar value of a field, `None` when unset, null or a collection
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).and_then(FieldValue::as_scalar)
    }

    pub fn collection(&self, name: &str) -> Option<&BTreeSet<Value>> {
        self.fields.get(name).and_then(FieldValue::as_collection)
    }

    pub fn has_facet(&self, facet: &str) -> bool {
        self.facets.iter().any(|f| f.as_str() == facet)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{id}")?,
            None => f.write_str("R?")?,
        }
        let facets: Vec<&str> = self.facets.iter().map(Facet::as_str).collect();
        write!(f, "[{}]", facets.join("+"))
    }
}
