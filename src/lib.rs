//! # provmerge
//!
//! Priority-based record reconciliation with per-field provenance tracking.
//!
//! Records describing the same entity arrive independently from several data
//! sources. Each incoming record is merged with the stored records judged
//! equivalent to it: scalar fields take the value supplied by the
//! highest-priority source, collections take the union, and a separate
//! provenance ledger remembers which source supplied every field. Superseded
//! duplicates are deleted and their ids remapped onto the survivor. The
//! primary store and the ledger share one transaction boundary.
//!
//! ```no_run
//! use provmerge::{LoadType, MergeConfig, Reconciler};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MergeConfig::from_env(Some("provmerge.toml"))?;
//! let mut reconciler = Reconciler::from_config(&config)?;
//! let genbank = reconciler.main_source("GenBank")?;
//! let skeleton = reconciler.skeleton_source("GenBank")?;
//! let record = serde_json::from_str(r#"{"facets":["Gene"],"fields":{}}"#)?;
//!
//! reconciler.begin_transaction()?;
//! reconciler.store(Some(&record), &genbank, &skeleton, LoadType::Source)?;
//! reconciler.commit_transaction()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod equivalence;
pub mod error;
pub mod ledger;
pub mod model;
pub mod persistence;
pub mod priority;
pub mod reconciler;
pub mod remap;
pub mod schema;
pub mod source;
pub mod store;
pub mod transaction;

// Re-export main types for convenience
pub use config::{ConfigError, MergeConfig};
pub use equivalence::{EquivalenceOracle, IdentityKey, KeyEquivalence};
pub use error::{MergeError, MergeResult, StoreKind};
pub use ledger::{Ledger, LedgerStore, MemoryLedger, PROVENANCE_MODEL};
pub use model::{Facet, FieldValue, Record, RecordId, SourceId, Value};
pub use persistence::PersistentLedger;
pub use priority::{PriorityConfig, PriorityResolver};
pub use reconciler::{LoadType, MergeOutcome, Reconciler};
pub use remap::IdentityRemap;
pub use schema::{FieldDescriptor, FieldKind, ModelReflector, Schema};
pub use source::Source;
pub use store::{RecordStore, Store};
pub use transaction::{TransactionCoordinator, Transactional};
