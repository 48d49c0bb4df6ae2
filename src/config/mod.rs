//! Unified configuration for the reconciler and the loader.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (provmerge.toml)
//! ```toml
//! [ledger]
//! path = "/var/lib/provmerge/ledger"
//! cache_capacity = 50000
//!
//! [schema]
//! Gene = [
//!     { name = "symbol" },
//!     { name = "name" },
//!     { name = "synonyms", kind = "collection" },
//! ]
//!
//! [[identity_keys]]
//! name = "gene_symbol"
//! facet = "Gene"
//! fields = ["symbol"]
//!
//! [priorities]
//! default = ["RefSeq", "*"]
//!
//! [priorities.fields]
//! "Gene.name" = ["GenBank", "RefSeq"]
//! ```

mod defaults;

pub use defaults::*;

use crate::equivalence::IdentityKey;
use crate::error::MergeError;
use crate::priority::PriorityConfig;
use crate::schema::{FieldSpec, Schema};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration: model, equivalence, priorities and ledger backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Provenance ledger backend
    pub ledger: LedgerConfig,
    /// Facet name -> ordered field declarations
    pub schema: BTreeMap<String, Vec<FieldSpec>>,
    /// Identity keys of the equivalence oracle
    pub identity_keys: Vec<IdentityKey>,
    /// Source priority lists
    pub priorities: PriorityConfig,
}

impl MergeConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(MergeConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with PROVMERGE_ prefix
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Parse a TOML document, without environment layering
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(MergeConfig::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the schema declared by the `[schema]` table
    pub fn build_schema(&self) -> Result<Schema, ConfigError> {
        let mut schema = Schema::new();
        for (facet, fields) in &self.schema {
            schema
                .add_facet(facet.as_str(), fields)
                .map_err(|e| ConfigError::new(e.to_string()))?;
        }
        Ok(schema)
    }

    /// Cross-check the sections against each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.cache_capacity == 0 {
            return Err(ConfigError::new("ledger.cache_capacity must be positive"));
        }
        self.priorities
            .validate()
            .map_err(|e| ConfigError::new(e.to_string()))?;
        for key in &self.identity_keys {
            let Some(fields) = self.schema.get(key.facet.as_str()) else {
                return Err(ConfigError::new(format!(
                    "identity key {} refers to undeclared facet {}",
                    key.name, key.facet
                )));
            };
            if key.fields.is_empty() {
                return Err(ConfigError::new(format!(
                    "identity key {} has no fields",
                    key.name
                )));
            }
            if let Some(missing) = key
                .fields
                .iter()
                .find(|field| !fields.iter().any(|spec| spec.name == **field))
            {
                return Err(ConfigError::new(format!(
                    "identity key {} uses field {missing} not declared by {}",
                    key.name, key.facet
                )));
            }
        }
        Ok(())
    }
}

/// Provenance ledger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// RocksDB directory; in-memory ledger when unset
    pub path: Option<PathBuf>,
    /// Capacity of the provenance read cache
    pub cache_capacity: usize,
    /// Model name the ledger store is created for
    pub model: String,
    /// RocksDB write buffer size in MB
    pub write_buffer_mb: usize,
    /// Maximum number of background compaction jobs
    pub max_background_jobs: i32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_capacity: DEFAULT_LEDGER_CACHE_CAPACITY,
            model: DEFAULT_LEDGER_MODEL.to_string(),
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger: Option<LedgerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<usize>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

impl From<ConfigError> for MergeError {
    fn from(e: ConfigError) -> Self {
        MergeError::Configuration(e.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    const GENE_CONFIG: &str = r#"
        [ledger]
        cache_capacity = 64

        [schema]
        Gene = [
            { name = "symbol" },
            { name = "name" },
            { name = "synonyms", kind = "collection" },
        ]

        [[identity_keys]]
        name = "gene_symbol"
        facet = "Gene"
        fields = ["symbol"]

        [priorities]
        default = ["RefSeq", "*"]

        [priorities.fields]
        "Gene.name" = ["GenBank", "RefSeq"]
    "#;

    #[test]
    fn test_default_config() {
        let config = MergeConfig::default();
        assert_eq!(config.ledger.cache_capacity, DEFAULT_LEDGER_CACHE_CAPACITY);
        assert_eq!(config.ledger.model, "provenance");
        assert!(config.ledger.path.is_none());
        assert!(config.schema.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let config = MergeConfig::from_toml_str(GENE_CONFIG).unwrap();
        assert_eq!(config.ledger.cache_capacity, 64);
        assert_eq!(config.ledger.model, DEFAULT_LEDGER_MODEL);
        assert_eq!(config.schema["Gene"][2].kind, FieldKind::Collection);
        assert_eq!(config.identity_keys[0].fields, vec!["symbol".to_string()]);
        assert_eq!(config.priorities.fields["Gene.name"][0], "GenBank");

        let schema = config.build_schema().unwrap();
        assert_eq!(schema.facets().count(), 1);
    }

    #[test]
    fn test_identity_key_must_match_schema() {
        let toml = r#"
            [schema]
            Gene = [{ name = "symbol" }]

            [[identity_keys]]
            name = "by_accession"
            facet = "Gene"
            fields = ["accession"]
        "#;
        let err = MergeConfig::from_toml_str(toml).unwrap_err();
        assert!(err.message.contains("accession"));
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let toml = r#"
            [priorities]
            default = ["RefSeq", "RefSeq"]
        "#;
        assert!(MergeConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_load_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provmerge.toml");
        std::fs::write(&path, GENE_CONFIG).unwrap();

        let overrides = ConfigOverrides {
            ledger: Some(LedgerOverrides {
                path: Some(dir.path().join("ledger")),
                cache_capacity: None,
            }),
        };
        let config = MergeConfig::load(path.to_str(), overrides).unwrap();
        assert_eq!(config.ledger.path, Some(dir.path().join("ledger")));
        assert_eq!(config.ledger.cache_capacity, 64);
    }

    #[test]
    fn test_config_error_converts_to_merge_error() {
        let err: MergeError = ConfigError::new("bad").into();
        assert!(err.is_configuration());
    }
}
