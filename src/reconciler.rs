//! # Record Reconciler
//!
//! Merges an incoming record with the stored records equivalent to it. Each
//! scalar field takes the value of the highest-priority source, collections
//! take the union, and the ledger records which source supplied each field of
//! the surviving record. Superseded duplicates are deleted and their ids are
//! remapped onto the survivor.

use crate::config::MergeConfig;
use crate::equivalence::{EquivalenceOracle, KeyEquivalence};
use crate::error::{MergeError, MergeResult, StoreKind};
use crate::ledger::{Ledger, LedgerStore, MemoryLedger};
use crate::model::{Facet, FieldValue, Record, RecordId, Value};
use crate::persistence::{PersistentLedger, PersistentOpenOptions};
use crate::priority::{Candidate, Contributor, PriorityConfig, PriorityResolver};
use crate::remap::IdentityRemap;
use crate::schema::{FieldDescriptor, ModelReflector, ID_FIELD};
use crate::source::Source;
use crate::store::{RecordStore, Store};
use crate::transaction::{TransactionCoordinator, TransactionState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// How an incoming record's contribution is attributed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
    /// Full contribution from the main source
    Source,
    /// Partial contribution from the skeleton source
    Skeleton,
    /// Re-store of data that already lives in the store; no remap, no
    /// re-prioritisation of provenance
    FromDb,
}

/// Result of storing one record
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The canonical record after the merge
    pub record: Record,
    /// The single equivalent was returned unchanged
    pub short_circuited: bool,
    /// Equivalents removed from the primary store
    pub deleted: Vec<RecordId>,
}

/// A merged field value with the source to attribute it to
struct Resolved {
    value: FieldValue,
    source: Option<Source>,
}

/// Merges deliveries into the primary store and tracks field provenance
pub struct Reconciler {
    primary: Box<dyn RecordStore>,
    ledger: Ledger,
    model: Arc<dyn ModelReflector>,
    oracle: Box<dyn EquivalenceOracle>,
    priorities: PriorityResolver,
    remap: IdentityRemap,
    transactions: TransactionCoordinator,
}

impl Reconciler {
    /// Assemble a reconciler. Fails fast on an invalid priority configuration
    /// or a ledger store created for another model.
    pub fn new(
        primary: Box<dyn RecordStore>,
        ledger_store: Box<dyn LedgerStore>,
        model: Arc<dyn ModelReflector>,
        oracle: Box<dyn EquivalenceOracle>,
        priorities: PriorityConfig,
    ) -> MergeResult<Self> {
        let ledger = Ledger::new(ledger_store)?;
        Self::with_ledger(primary, ledger, model, oracle, priorities)
    }

    /// Assemble a reconciler around an already wrapped ledger
    pub fn with_ledger(
        primary: Box<dyn RecordStore>,
        ledger: Ledger,
        model: Arc<dyn ModelReflector>,
        oracle: Box<dyn EquivalenceOracle>,
        priorities: PriorityConfig,
    ) -> MergeResult<Self> {
        Ok(Self {
            primary,
            ledger,
            model,
            oracle,
            priorities: PriorityResolver::new(priorities)?,
            remap: IdentityRemap::new(),
            transactions: TransactionCoordinator::new(),
        })
    }

    /// Bootstrap every collaborator from configuration: schema, identity
    /// keys, priorities and the ledger backend. The primary store is
    /// in-memory.
    pub fn from_config(config: &MergeConfig) -> MergeResult<Self> {
        config.validate()?;
        if config.schema.is_empty() {
            return Err(MergeError::configuration("no facets declared in [schema]"));
        }
        let schema = config.build_schema()?;
        let oracle = KeyEquivalence::with_keys(config.identity_keys.clone())
            .map_err(|e| MergeError::configuration(e.to_string()))?;

        let ledger_store: Box<dyn LedgerStore> = match &config.ledger.path {
            Some(path) => {
                let options = PersistentOpenOptions {
                    repair: false,
                    model: config.ledger.model.clone(),
                    write_buffer_mb: config.ledger.write_buffer_mb,
                    max_background_jobs: config.ledger.max_background_jobs,
                };
                Box::new(
                    PersistentLedger::open_with_options(path, options)
                        .map_err(|e| MergeError::store(StoreKind::Ledger, "open", e))?,
                )
            }
            None => Box::new(MemoryLedger::with_model(&config.ledger.model)),
        };
        let ledger = Ledger::with_cache_capacity(ledger_store, config.ledger.cache_capacity)?;

        Self::with_ledger(
            Box::new(Store::new()),
            ledger,
            Arc::new(schema),
            Box::new(oracle),
            config.priorities.clone(),
        )
    }

    /// Look up or create the main source with this name
    pub fn main_source(&mut self, name: &str) -> MergeResult<Source> {
        self.transactions.ensure_open()?;
        self.ledger
            .main_source(name)
            .map_err(|e| MergeError::store(StoreKind::Ledger, "main source", e))
    }

    /// Look up or create the skeleton source with this name
    pub fn skeleton_source(&mut self, name: &str) -> MergeResult<Source> {
        self.transactions.ensure_open()?;
        self.ledger
            .skeleton_source(name)
            .map_err(|e| MergeError::store(StoreKind::Ledger, "skeleton source", e))
    }

    /// Store a record, merging it with its equivalents. `None` stores nothing.
    pub fn store(
        &mut self,
        record: Option<&Record>,
        source: &Source,
        skeleton_source: &Source,
        load_type: LoadType,
    ) -> MergeResult<Option<Record>> {
        match record {
            Some(record) => Ok(Some(
                self.store_record(record, source, skeleton_source, load_type)?
                    .record,
            )),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, record, source, skeleton_source), fields(record = %record, source = %source), level = "debug")]
    pub fn store_record(
        &mut self,
        record: &Record,
        source: &Source,
        skeleton_source: &Source,
        load_type: LoadType,
    ) -> MergeResult<MergeOutcome> {
        self.transactions.ensure_open()?;

        let equivalents = self
            .oracle
            .find_equivalent(self.primary.as_ref(), record, source)
            .map_err(|e| MergeError::store(StoreKind::Oracle, "find equivalent", e))?;
        let new_id = equivalents.first().and_then(|equivalent| equivalent.id);
        let governing = match load_type {
            LoadType::Source => source,
            LoadType::Skeleton | LoadType::FromDb => skeleton_source,
        };

        let types: Vec<&BTreeSet<Facet>> = std::iter::once(&record.facets)
            .chain(equivalents.iter().map(|equivalent| &equivalent.facets))
            .collect();
        let facets = self.model.union_type(&types);
        let fields = self
            .model
            .fields_of(&facets)
            .map_err(|e| MergeError::store(StoreKind::Model, "enumerate fields", e))?;

        // Gather contributions first: the short-circuit must fire before
        // anything is written.
        let mut plan: Vec<(FieldDescriptor, Vec<Contributor>)> = Vec::with_capacity(fields.len());
        for field in fields.into_iter().filter(|field| field.name != ID_FIELD) {
            let mut contributors = Vec::new();
            if self.declares(&record.facets, &field)? {
                contributors.push(Contributor::incoming(record.id, governing.clone()));
            }
            for (index, equivalent) in equivalents.iter().enumerate() {
                let tracked = match equivalent.id {
                    Some(id) => self
                        .ledger
                        .get_source(id, &field.name)
                        .map_err(|e| MergeError::store(StoreKind::Ledger, "read provenance", e))?,
                    None => None,
                };
                if equivalents.len() == 1 {
                    if let (Some(tracked), Some(id)) = (&tracked, equivalent.id) {
                        let same_source = tracked == source
                            || (tracked == skeleton_source && load_type != LoadType::Source);
                        if same_source {
                            if load_type != LoadType::FromDb {
                                self.remap.assign(record.id, id);
                            }
                            debug!(existing = %id, field = %field.name, "short-circuit to existing record");
                            return Ok(MergeOutcome {
                                record: equivalent.clone(),
                                short_circuited: true,
                                deleted: Vec::new(),
                            });
                        }
                    }
                }
                if self.declares(&equivalent.facets, &field)? {
                    contributors.push(Contributor::equivalent(index, equivalent.id, tracked));
                }
            }
            plan.push((field, contributors));
        }

        let mut merged = Record {
            id: new_id,
            facets,
            fields: BTreeMap::new(),
        };
        let mut attributions = Vec::with_capacity(plan.len());
        for (field, contributors) in plan {
            let resolved = if self.model.is_collection(&field) {
                self.merge_collection(&field, record, &equivalents, contributors, load_type)
            } else {
                self.resolve_scalar(&field, record, &equivalents, contributors, load_type)?
            };
            merged.set_field(&field.name, resolved.value);
            if let Some(source) = resolved.source {
                attributions.push((field.name, source));
            }
        }

        let merged_id = self
            .primary
            .store(&mut merged)
            .map_err(|e| MergeError::store(StoreKind::Primary, "store", e))?;
        if new_id.is_none() {
            self.ledger.clear(merged_id);
        }
        for (field, source) in &attributions {
            self.ledger
                .set_source(merged_id, field, source)
                .map_err(|e| MergeError::store(StoreKind::Ledger, "write provenance", e))?;
        }

        let mut deleted = Vec::new();
        for superseded in equivalents.iter().skip(1).filter_map(|equivalent| equivalent.id) {
            self.primary
                .delete(superseded)
                .map_err(|e| MergeError::store(StoreKind::Primary, "delete", e))?;
            self.ledger
                .remove_record(superseded)
                .map_err(|e| MergeError::store(StoreKind::Ledger, "remove provenance", e))?;
            deleted.push(superseded);
        }

        if load_type != LoadType::FromDb {
            self.remap.assign(record.id, merged_id);
            for superseded in &deleted {
                self.remap.supersede(*superseded, merged_id);
            }
        }
        debug!(
            merged = %merged_id,
            equivalents = equivalents.len(),
            deleted = deleted.len(),
            "record stored"
        );

        Ok(MergeOutcome {
            record: merged,
            short_circuited: false,
            deleted,
        })
    }

    pub fn begin_transaction(&mut self) -> MergeResult<()> {
        self.transactions
            .begin(self.primary.as_mut(), &mut self.ledger)?;
        self.remap.begin();
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> MergeResult<()> {
        let result = self
            .transactions
            .commit(self.primary.as_mut(), &mut self.ledger);
        // a ledger commit failure comes after the primary store committed,
        // so the remaps describe committed records
        match &result {
            Ok(()) => self.remap.commit(),
            Err(e) if e.store_kind() == Some(StoreKind::Ledger) => self.remap.commit(),
            Err(_) => {}
        }
        result
    }

    /// Abort both stores and forget the remaps made since begin
    pub fn abort_transaction(&mut self) -> MergeResult<()> {
        let result = self
            .transactions
            .abort(self.primary.as_mut(), &mut self.ledger);
        self.remap.rollback();
        result
    }

    /// Close both stores. A second call does nothing.
    pub fn close(&mut self) -> MergeResult<()> {
        if self.transactions.state() == TransactionState::Active {
            self.remap.rollback();
        }
        self.transactions
            .close(self.primary.as_mut(), &mut self.ledger)
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.transactions.state()
    }

    /// Source that supplied the current value of a field
    pub fn provenance(&mut self, record: RecordId, field: &str) -> MergeResult<Option<Source>> {
        self.transactions.ensure_open()?;
        self.ledger
            .get_source(record, field)
            .map_err(|e| MergeError::store(StoreKind::Ledger, "read provenance", e))
    }

    pub fn remap(&self) -> &IdentityRemap {
        &self.remap
    }

    pub fn primary(&self) -> &dyn RecordStore {
        self.primary.as_ref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn priorities(&self) -> &PriorityResolver {
        &self.priorities
    }

    fn declares(&self, facets: &BTreeSet<Facet>, field: &FieldDescriptor) -> MergeResult<bool> {
        self.model
            .declares_field(facets, &field.name)
            .map_err(|e| MergeError::store(StoreKind::Model, "declares field", e))
    }

    fn incoming_value(&self, value: &Value, load_type: LoadType) -> Value {
        match load_type {
            LoadType::FromDb => value.clone(),
            LoadType::Source | LoadType::Skeleton => self.remap.translate(value),
        }
    }

    fn merge_collection(
        &self,
        field: &FieldDescriptor,
        record: &Record,
        equivalents: &[Record],
        contributors: Vec<Contributor>,
        load_type: LoadType,
    ) -> Resolved {
        let mut values = BTreeSet::new();
        let mut source = None;
        for (position, contributor) in contributors.into_iter().enumerate() {
            match contributor.candidate {
                Candidate::Incoming => {
                    if let Some(incoming) = record.collection(&field.name) {
                        values.extend(
                            incoming
                                .iter()
                                .map(|value| self.incoming_value(value, load_type)),
                        );
                    }
                }
                Candidate::Equivalent(index) => {
                    if let Some(stored) = equivalents[index].collection(&field.name) {
                        values.extend(stored.iter().cloned());
                    }
                }
            }
            if position == 0 {
                source = contributor.source;
            }
        }
        Resolved {
            value: FieldValue::Collection(values),
            source,
        }
    }

    fn resolve_scalar(
        &self,
        field: &FieldDescriptor,
        record: &Record,
        equivalents: &[Record],
        contributors: Vec<Contributor>,
        load_type: LoadType,
    ) -> MergeResult<Resolved> {
        let Some(winner) = self.priorities.winner(field, contributors)? else {
            return Ok(Resolved {
                value: FieldValue::Scalar(None),
                source: None,
            });
        };
        let value = match winner.candidate {
            Candidate::Incoming => record
                .scalar(&field.name)
                .map(|value| self.incoming_value(value, load_type)),
            Candidate::Equivalent(index) => equivalents[index].scalar(&field.name).cloned(),
        };
        Ok(Resolved {
            value: FieldValue::Scalar(value),
            source: winner.source,
        })
    }
}
