//! # Transaction Coordinator
//!
//! Drives the primary store and the provenance ledger through one shared
//! transaction boundary. Begin and commit go to the primary store first and
//! the ledger second. This is sequential, not a two-phase commit: a ledger
//! failure after a successful primary commit leaves the stores diverged, which
//! is logged and reported as a ledger failure.

use crate::error::{MergeError, MergeResult, StoreKind};
use anyhow::Result;
use tracing::{debug, error, warn};

/// Transaction verbs shared by the primary store and the ledger store
pub trait Transactional {
    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn abort_transaction(&mut self) -> Result<()>;
    fn is_in_transaction(&self) -> bool;
    /// Release the store handle
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    Closed,
}

/// Tracks the shared transaction state of the two stores.
#[derive(Debug)]
pub struct TransactionCoordinator {
    state: TransactionState,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn ensure_open(&self) -> MergeResult<()> {
        if self.state == TransactionState::Closed {
            return Err(MergeError::Closed);
        }
        Ok(())
    }

    pub fn begin<P, L>(&mut self, primary: &mut P, ledger: &mut L) -> MergeResult<()>
    where
        P: Transactional + ?Sized,
        L: Transactional + ?Sized,
    {
        self.ensure_open()?;
        primary
            .begin_transaction()
            .map_err(|e| MergeError::store(StoreKind::Primary, "begin transaction", e))?;
        if let Err(e) = ledger.begin_transaction() {
            if let Err(rollback) = primary.abort_transaction() {
                warn!(error = %rollback, "failed to roll back primary store after ledger begin failure");
            }
            return Err(MergeError::store(StoreKind::Ledger, "begin transaction", e));
        }
        self.state = TransactionState::Active;
        debug!("transaction started");
        Ok(())
    }

    pub fn commit<P, L>(&mut self, primary: &mut P, ledger: &mut L) -> MergeResult<()>
    where
        P: Transactional + ?Sized,
        L: Transactional + ?Sized,
    {
        self.ensure_open()?;
        primary
            .commit_transaction()
            .map_err(|e| MergeError::store(StoreKind::Primary, "commit transaction", e))?;
        if let Err(e) = ledger.commit_transaction() {
            error!(
                error = %e,
                "primary store committed but ledger commit failed; provenance diverged from data"
            );
            return Err(MergeError::store(StoreKind::Ledger, "commit transaction", e));
        }
        self.state = TransactionState::Idle;
        debug!("transaction committed");
        Ok(())
    }

    /// Abort both stores. The ledger is aborted even when the primary abort
    /// fails; the first failure is returned.
    pub fn abort<P, L>(&mut self, primary: &mut P, ledger: &mut L) -> MergeResult<()>
    where
        P: Transactional + ?Sized,
        L: Transactional + ?Sized,
    {
        self.ensure_open()?;
        let primary_result = primary
            .abort_transaction()
            .map_err(|e| MergeError::store(StoreKind::Primary, "abort transaction", e));
        let ledger_result = ledger
            .abort_transaction()
            .map_err(|e| MergeError::store(StoreKind::Ledger, "abort transaction", e));
        self.state = TransactionState::Idle;
        debug!("transaction aborted");
        primary_result.and(ledger_result)
    }

    /// Close both stores. Closing twice is a no-op.
    pub fn close<P, L>(&mut self, primary: &mut P, ledger: &mut L) -> MergeResult<()>
    where
        P: Transactional + ?Sized,
        L: Transactional + ?Sized,
    {
        if self.state == TransactionState::Closed {
            return Ok(());
        }
        if self.state == TransactionState::Active {
            warn!("closing with a transaction in progress");
        }
        self.state = TransactionState::Closed;
        let primary_result = primary
            .close()
            .map_err(|e| MergeError::store(StoreKind::Primary, "close", e));
        let ledger_result = ledger
            .close()
            .map_err(|e| MergeError::store(StoreKind::Ledger, "close", e));
        primary_result.and(ledger_result)
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
