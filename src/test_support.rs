use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use provmerge::equivalence::{IdentityKey, KeyEquivalence};
use provmerge::ledger::{LedgerStore, MemoryLedger};
use provmerge::model::{Record, RecordId, SourceId, Value};
use provmerge::priority::PriorityConfig;
use provmerge::schema::Schema;
use provmerge::source::Source;
use provmerge::store::{RecordStore, Store};
use provmerge::transaction::Transactional;
use provmerge::Reconciler;

/// Gene, Protein and Chromosome facets. `synonyms` is shared by Gene and
/// Protein so merged Gene+Protein records exercise the type union.
pub fn gene_schema() -> Schema {
    Schema::new()
        .with_facet(
            "Gene",
            &["symbol", "name", "description", "chromosome"],
            &["synonyms", "publications"],
        )
        .and_then(|schema| schema.with_facet("Protein", &["accession", "length"], &["synonyms"]))
        .and_then(|schema| schema.with_facet("Chromosome", &["identifier"], &[]))
        .expect("valid schema")
}

pub fn gene_keys() -> KeyEquivalence {
    KeyEquivalence::with_keys(vec![
        IdentityKey::new("gene_symbol", "Gene", &["symbol"]),
        IdentityKey::new("protein_accession", "Protein", &["accession"]),
        IdentityKey::new("chromosome_identifier", "Chromosome", &["identifier"]),
    ])
    .expect("valid identity keys")
}

/// RefSeq over GenBank everywhere, except that GenBank names win
#[allow(dead_code)]
pub fn default_priorities() -> PriorityConfig {
    PriorityConfig::new()
        .with_default(&["RefSeq", "GenBank", "*"])
        .with_field("Gene.name", &["GenBank", "RefSeq", "*"])
}

#[allow(dead_code)]
pub fn reconciler_with(priorities: PriorityConfig) -> Reconciler {
    build_reconciler(Box::new(Store::new()), Box::new(MemoryLedger::new()), priorities)
}

#[allow(dead_code)]
pub fn default_reconciler() -> Reconciler {
    reconciler_with(default_priorities())
}

pub fn build_reconciler(
    primary: Box<dyn RecordStore>,
    ledger: Box<dyn LedgerStore>,
    priorities: PriorityConfig,
) -> Reconciler {
    Reconciler::new(
        primary,
        ledger,
        Arc::new(gene_schema()),
        Box::new(gene_keys()),
        priorities,
    )
    .expect("reconciler")
}

#[allow(dead_code)]
pub fn gene(symbol: &str, name: &str) -> Record {
    Record::new(["Gene"])
        .with_scalar("symbol", Value::text(symbol))
        .with_scalar("name", Value::text(name))
}

#[allow(dead_code)]
pub fn protein(accession: &str, length: i64) -> Record {
    Record::new(["Protein"])
        .with_scalar("accession", Value::text(accession))
        .with_scalar("length", Value::Int(length))
}

/// Which operations of a wrapped store should fail
#[derive(Debug, Default, Clone, Copy)]
pub struct Failures {
    pub begin: bool,
    pub commit: bool,
    pub abort: bool,
    pub write: bool,
}

/// Shared switchboard so a test can flip failures after handing the store
/// to a reconciler
#[derive(Debug, Default, Clone)]
pub struct FailureSwitch(Arc<Mutex<Failures>>);

#[allow(dead_code)]
impl FailureSwitch {
    pub fn set(&self, failures: Failures) {
        *self.0.lock() = failures;
    }

    pub fn get(&self) -> Failures {
        *self.0.lock()
    }
}

fn check(enabled: bool, what: &str) -> Result<()> {
    if enabled {
        bail!("injected {what} failure");
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum TxOp {
    Begin,
    Commit,
    Abort,
}

fn guarded<T: Transactional>(inner: &mut T, switch: &FailureSwitch, op: TxOp) -> Result<()> {
    let failures = switch.get();
    match op {
        TxOp::Begin => {
            check(failures.begin, "begin")?;
            inner.begin_transaction()
        }
        TxOp::Commit => {
            check(failures.commit, "commit")?;
            inner.commit_transaction()
        }
        TxOp::Abort => {
            // the inner store still rolls back so its snapshot is released
            let result = inner.abort_transaction();
            check(failures.abort, "abort")?;
            result
        }
    }
}

/// In-memory primary store with injectable failures
pub struct FlakyStore {
    inner: Store,
    switch: FailureSwitch,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new(switch: FailureSwitch) -> Self {
        Self {
            inner: Store::new(),
            switch,
        }
    }
}

impl Transactional for FlakyStore {
    fn begin_transaction(&mut self) -> Result<()> {
        guarded(&mut self.inner, &self.switch, TxOp::Begin)
    }

    fn commit_transaction(&mut self) -> Result<()> {
        guarded(&mut self.inner, &self.switch, TxOp::Commit)
    }

    fn abort_transaction(&mut self) -> Result<()> {
        guarded(&mut self.inner, &self.switch, TxOp::Abort)
    }

    fn is_in_transaction(&self) -> bool {
        self.inner.is_in_transaction()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl RecordStore for FlakyStore {
    fn store(&mut self, record: &mut Record) -> Result<RecordId> {
        check(self.switch.get().write, "store")?;
        self.inner.store(record)
    }

    fn delete(&mut self, id: RecordId) -> Result<bool> {
        check(self.switch.get().write, "delete")?;
        self.inner.delete(id)
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.inner.get(id)
    }

    fn find_by_example(&self, example: &[(&str, &Value)]) -> Result<Vec<Record>> {
        self.inner.find_by_example(example)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

/// In-memory ledger store with injectable failures
pub struct FlakyLedger {
    inner: MemoryLedger,
    switch: FailureSwitch,
}

#[allow(dead_code)]
impl FlakyLedger {
    pub fn new(switch: FailureSwitch) -> Self {
        Self {
            inner: MemoryLedger::new(),
            switch,
        }
    }
}

impl Transactional for FlakyLedger {
    fn begin_transaction(&mut self) -> Result<()> {
        guarded(&mut self.inner, &self.switch, TxOp::Begin)
    }

    fn commit_transaction(&mut self) -> Result<()> {
        guarded(&mut self.inner, &self.switch, TxOp::Commit)
    }

    fn abort_transaction(&mut self) -> Result<()> {
        guarded(&mut self.inner, &self.switch, TxOp::Abort)
    }

    fn is_in_transaction(&self) -> bool {
        self.inner.is_in_transaction()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

impl LedgerStore for FlakyLedger {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn source_by_key(&self, name: &str, skeleton: bool) -> Result<Option<Source>> {
        self.inner.source_by_key(name, skeleton)
    }

    fn source_by_id(&self, id: SourceId) -> Result<Option<Source>> {
        self.inner.source_by_id(id)
    }

    fn create_source(&mut self, name: &str, skeleton: bool) -> Result<Source> {
        self.inner.create_source(name, skeleton)
    }

    fn get_entry(&self, record: RecordId, field: &str) -> Result<Option<SourceId>> {
        self.inner.get_entry(record, field)
    }

    fn put_entry(&mut self, record: RecordId, field: &str, source: SourceId) -> Result<()> {
        check(self.switch.get().write, "put entry")?;
        self.inner.put_entry(record, field, source)
    }

    fn remove_entries(&mut self, record: RecordId) -> Result<usize> {
        check(self.switch.get().write, "remove entries")?;
        self.inner.remove_entries(record)
    }
}

/// A generated record with the name of the source that delivers it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: Record,
    pub source: &'static str,
}

const SOURCES: [&str; 3] = ["RefSeq", "GenBank", "Ensembl"];

/// Gene records drawn from a pool of `count * (1 - overlap)` symbols, so
/// roughly `overlap` of the deliveries hit an existing entity
#[allow(dead_code)]
pub fn generate_deliveries(count: u32, overlap_probability: f64, seed: u64) -> Vec<Delivery> {
    let mut rng = StdRng::seed_from_u64(seed);
    let distinct = ((count as f64) * (1.0 - overlap_probability)).max(1.0) as u32;
    (0..count)
        .map(|i| {
            let symbol = format!("g{:06}", rng.random_range(0..distinct));
            let source = SOURCES[rng.random_range(0..SOURCES.len())];
            let mut record = gene(&symbol, &format!("{source} gene {i}"))
                .with_collection("synonyms", [Value::text(format!("{symbol}-{source}"))]);
            if rng.random_bool(0.3) {
                record.set_scalar("description", Some(Value::text(format!("from {source}"))));
            }
            Delivery { record, source }
        })
        .collect()
}
