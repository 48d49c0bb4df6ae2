//! Error types for the reconciliation engine.

use std::fmt;
use thiserror::Error;

/// Result type for reconciliation operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// The collaborator a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// The primary record store
    Primary,
    /// The provenance ledger store
    Ledger,
    /// The equivalence oracle
    Oracle,
    /// The model reflector
    Model,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Primary => "primary",
            Self::Ledger => "ledger",
            Self::Oracle => "equivalence oracle",
            Self::Model => "model",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the reconciler and its coordinator.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Fatal misconfiguration: ledger model mismatch, unresolvable priority
    /// tie, invalid schema or configuration file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A collaborator failed during an operation.
    #[error("{store} failure during {operation}: {source}")]
    Store {
        store: StoreKind,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The reconciler has been closed.
    #[error("reconciler is closed")]
    Closed,
}

impl MergeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn store(store: StoreKind, operation: &'static str, source: anyhow::Error) -> Self {
        Self::Store {
            store,
            operation,
            source,
        }
    }

    /// The failing store, if this is a store failure
    pub fn store_kind(&self) -> Option<StoreKind> {
        match self {
            Self::Store { store, .. } => Some(*store),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
