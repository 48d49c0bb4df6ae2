//! Default constants for provmerge configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Ledger Defaults
// =============================================================================

/// Default capacity of the provenance read cache, in (record, field) entries.
/// Larger values avoid store lookups when equivalents are re-merged often.
pub const DEFAULT_LEDGER_CACHE_CAPACITY: usize = 100_000;

/// Model name written into new ledger databases
pub const DEFAULT_LEDGER_MODEL: &str = crate::ledger::PROVENANCE_MODEL;

// =============================================================================
// Persistent Ledger Defaults (RocksDB)
// =============================================================================

/// Default write buffer size in MB
pub const DEFAULT_WRITE_BUFFER_MB: usize = 64;

/// Default number of background compaction jobs
pub const DEFAULT_BACKGROUND_JOBS: i32 = 2;

// =============================================================================
// Environment
// =============================================================================

/// Prefix of environment variables layered over the config file
pub const ENV_PREFIX: &str = "PROVMERGE_";

/// Separator between nested keys in environment variable names,
/// e.g. `PROVMERGE_LEDGER__CACHE_CAPACITY`
pub const ENV_SEPARATOR: &str = "__";
