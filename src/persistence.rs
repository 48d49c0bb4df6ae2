use crate::config::{DEFAULT_BACKGROUND_JOBS, DEFAULT_LEDGER_MODEL, DEFAULT_WRITE_BUFFER_MB};
use crate::ledger::LedgerStore;
use crate::model::{RecordId, SourceId};
use crate::source::Source;
use crate::transaction::Transactional;
use anyhow::{anyhow, bail, ensure, Result};
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

const CF_SOURCES: &str = "sources";
const CF_SOURCE_IDS: &str = "source_ids";
const CF_PROVENANCE: &str = "provenance";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_NEXT_SOURCE_ID: &[u8] = b"next_source_id";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    model: String,
    app_version: String,
}

#[derive(Debug, Clone)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    /// Model name recorded when the database is created
    pub model: String,
    pub write_buffer_mb: usize,
    pub max_background_jobs: i32,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            model: DEFAULT_LEDGER_MODEL.to_string(),
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
        }
    }
}

/// Writes buffered by an open transaction
#[derive(Debug, Default)]
struct Overlay {
    sources: Vec<Source>,
    /// `None` marks a removed entry
    entries: BTreeMap<(RecordId, String), Option<SourceId>>,
    /// Records whose committed rows are all removed
    removed_records: BTreeSet<RecordId>,
    next_source_id_at_begin: u32,
}

/// RocksDB-backed ledger store.
///
/// Outside a transaction every write goes straight to the database. Inside
/// one, writes collect in an overlay that is applied as a single batch on
/// commit and dropped on abort.
pub struct PersistentLedger {
    db: Option<DB>,
    model: String,
    next_source_id: u32,
    overlay: Option<Overlay>,
}

impl PersistentLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref(), &options)?;
        let model = validate_or_init_manifest(&db, &options.model)?;
        let next_source_id = load_metadata::<u32>(&db, KEY_NEXT_SOURCE_ID)?.unwrap_or(1);
        debug!(path = %path.as_ref().display(), %model, next_source_id, "opened ledger database");
        Ok(Self {
            db: Some(db),
            model,
            next_source_id,
            overlay: None,
        })
    }

    /// Committed provenance rows
    pub fn entry_count(&self) -> Result<usize> {
        let db = self.db()?;
        let cf = cf(db, CF_PROVENANCE)?;
        let mut count = 0;
        for entry in db.iterator_cf(cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&self) -> Result<()> {
        self.db()?.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(self.db()?)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn db(&self) -> Result<&DB> {
        self.db
            .as_ref()
            .ok_or_else(|| anyhow!("ledger database is closed"))
    }

    fn stored_source(&self, id: SourceId) -> Result<Option<Source>> {
        let db = self.db()?;
        match db.get_cf(cf(db, CF_SOURCES)?, id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fields of a record visible to the current transaction
    fn visible_fields(&self, record: RecordId) -> Result<BTreeSet<String>> {
        let mut fields = BTreeSet::new();
        let removed = self
            .overlay
            .as_ref()
            .map(|overlay| overlay.removed_records.contains(&record))
            .unwrap_or(false);
        if !removed {
            fields.extend(stored_fields(self.db()?, record)?);
        }
        if let Some(overlay) = &self.overlay {
            for ((id, field), entry) in overlay.entries.range(range_of(record)) {
                debug_assert_eq!(*id, record);
                match entry {
                    Some(_) => fields.insert(field.clone()),
                    None => fields.remove(field),
                };
            }
        }
        Ok(fields)
    }
}

impl Drop for PersistentLedger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl Transactional for PersistentLedger {
    fn begin_transaction(&mut self) -> Result<()> {
        self.db()?;
        ensure!(self.overlay.is_none(), "ledger transaction already in progress");
        self.overlay = Some(Overlay {
            next_source_id_at_begin: self.next_source_id,
            ..Overlay::default()
        });
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        let db = self.db()?;
        let overlay = self
            .overlay
            .as_ref()
            .ok_or_else(|| anyhow!("no ledger transaction in progress"))?;

        let provenance = cf(db, CF_PROVENANCE)?;
        let mut batch = WriteBatch::default();
        for record in &overlay.removed_records {
            for field in stored_fields(db, *record)? {
                batch.delete_cf(provenance, entry_key(*record, &field));
            }
        }
        for ((record, field), entry) in &overlay.entries {
            match entry {
                Some(source) => {
                    batch.put_cf(provenance, entry_key(*record, field), bincode::serialize(source)?)
                }
                None => batch.delete_cf(provenance, entry_key(*record, field)),
            }
        }
        for source in &overlay.sources {
            put_source(db, &mut batch, source)?;
        }
        batch.put_cf(
            cf(db, CF_METADATA)?,
            KEY_NEXT_SOURCE_ID,
            bincode::serialize(&self.next_source_id)?,
        );
        let writes = batch.len();
        db.write(batch)?;
        self.overlay = None;
        debug!(writes, "ledger transaction committed");
        Ok(())
    }

    fn abort_transaction(&mut self) -> Result<()> {
        self.db()?;
        let overlay = self
            .overlay
            .take()
            .ok_or_else(|| anyhow!("no ledger transaction in progress"))?;
        self.next_source_id = overlay.next_source_id_at_begin;
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.overlay.is_some()
    }

    fn close(&mut self) -> Result<()> {
        if self.overlay.take().is_some() {
            debug!("closing ledger database with an open transaction; pending writes dropped");
        }
        if let Some(db) = self.db.take() {
            db.flush()?;
        }
        Ok(())
    }
}

impl LedgerStore for PersistentLedger {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn source_by_key(&self, name: &str, skeleton: bool) -> Result<Option<Source>> {
        if let Some(overlay) = &self.overlay {
            if let Some(source) = overlay
                .sources
                .iter()
                .find(|s| s.name == name && s.skeleton == skeleton)
            {
                return Ok(Some(source.clone()));
            }
        }
        let db = self.db()?;
        match db.get_cf(cf(db, CF_SOURCE_IDS)?, source_key(name, skeleton))? {
            Some(bytes) => self.stored_source(SourceId(decode_id(&bytes)?)),
            None => Ok(None),
        }
    }

    fn source_by_id(&self, id: SourceId) -> Result<Option<Source>> {
        if let Some(overlay) = &self.overlay {
            if let Some(source) = overlay.sources.iter().find(|s| s.id == id) {
                return Ok(Some(source.clone()));
            }
        }
        self.stored_source(id)
    }

    fn create_source(&mut self, name: &str, skeleton: bool) -> Result<Source> {
        if let Some(existing) = self.source_by_key(name, skeleton)? {
            return Ok(existing);
        }
        let source = Source::new(SourceId(self.next_source_id), name, skeleton);
        self.next_source_id += 1;
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.sources.push(source.clone());
            return Ok(source);
        }
        let db = self.db()?;
        let mut batch = WriteBatch::default();
        put_source(db, &mut batch, &source)?;
        batch.put_cf(
            cf(db, CF_METADATA)?,
            KEY_NEXT_SOURCE_ID,
            bincode::serialize(&self.next_source_id)?,
        );
        db.write(batch)?;
        Ok(source)
    }

    fn get_entry(&self, record: RecordId, field: &str) -> Result<Option<SourceId>> {
        let db = self.db()?;
        if let Some(overlay) = &self.overlay {
            if let Some(entry) = overlay.entries.get(&(record, field.to_string())) {
                return Ok(*entry);
            }
            if overlay.removed_records.contains(&record) {
                return Ok(None);
            }
        }
        match db.get_cf(cf(db, CF_PROVENANCE)?, entry_key(record, field))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_entry(&mut self, record: RecordId, field: &str, source: SourceId) -> Result<()> {
        if field.is_empty() {
            bail!("provenance entry for {record} has an empty field name");
        }
        if let Some(overlay) = self.overlay.as_mut() {
            overlay
                .entries
                .insert((record, field.to_string()), Some(source));
            return Ok(());
        }
        let db = self.db()?;
        db.put_cf(
            cf(db, CF_PROVENANCE)?,
            entry_key(record, field),
            bincode::serialize(&source)?,
        )?;
        Ok(())
    }

    fn remove_entries(&mut self, record: RecordId) -> Result<usize> {
        let visible = self.visible_fields(record)?;
        if let Some(overlay) = self.overlay.as_mut() {
            let pending: Vec<(RecordId, String)> = overlay
                .entries
                .range(range_of(record))
                .map(|(key, _)| key.clone())
                .collect();
            for key in pending {
                overlay.entries.remove(&key);
            }
            overlay.removed_records.insert(record);
            return Ok(visible.len());
        }
        let db = self.db()?;
        let provenance = cf(db, CF_PROVENANCE)?;
        let mut batch = WriteBatch::default();
        for field in &visible {
            batch.delete_cf(provenance, entry_key(record, field));
        }
        db.write(batch)?;
        Ok(visible.len())
    }
}

fn open_db(path: &Path, options: &PersistentOpenOptions) -> Result<DB> {
    let mut db_options = Options::default();
    db_options.create_if_missing(true);
    db_options.create_missing_column_families(true);
    db_options.set_paranoid_checks(true);
    db_options.set_write_buffer_size(options.write_buffer_mb * 1024 * 1024);
    db_options.set_max_background_jobs(options.max_background_jobs);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_SOURCES, Options::default()),
        ColumnFamilyDescriptor::new(CF_SOURCE_IDS, Options::default()),
        ColumnFamilyDescriptor::new(CF_PROVENANCE, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&db_options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| anyhow!("missing column family {name}"))
}

/// Record id (big-endian) followed by the field name
fn entry_key(record: RecordId, field: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + field.len());
    key.extend_from_slice(&record.0.to_be_bytes());
    key.extend_from_slice(field.as_bytes());
    key
}

/// Skeleton flag followed by the source name
fn source_key(name: &str, skeleton: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(u8::from(skeleton));
    key.extend_from_slice(name.as_bytes());
    key
}

fn decode_id(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| anyhow!("malformed id of {} bytes", bytes.len()))?;
    Ok(u32::from_be_bytes(raw))
}

fn range_of(
    record: RecordId,
) -> std::ops::RangeInclusive<(RecordId, String)> {
    // field names are never empty, and char::MAX sorts after every real name
    (record, String::new())..=(record, char::MAX.to_string())
}

fn put_source(db: &DB, batch: &mut WriteBatch, source: &Source) -> Result<()> {
    batch.put_cf(
        cf(db, CF_SOURCES)?,
        source.id.0.to_be_bytes(),
        bincode::serialize(source)?,
    );
    batch.put_cf(
        cf(db, CF_SOURCE_IDS)?,
        source_key(&source.name, source.skeleton),
        source.id.0.to_be_bytes(),
    );
    Ok(())
}

fn stored_fields(db: &DB, record: RecordId) -> Result<Vec<String>> {
    let provenance = cf(db, CF_PROVENANCE)?;
    let prefix = record.0.to_be_bytes();
    let mut fields = Vec::new();
    for entry in db.iterator_cf(provenance, IteratorMode::From(&prefix, Direction::Forward)) {
        let (key, _) = entry?;
        if !key.starts_with(&prefix) {
            break;
        }
        fields.push(String::from_utf8(key[prefix.len()..].to_vec())?);
    }
    Ok(fields)
}

/// Check the format version and return the recorded model name, writing a
/// manifest for `model` on first open
fn validate_or_init_manifest(db: &DB, model: &str) -> Result<String> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(manifest.model);
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        model: model.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(manifest.model)
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}
