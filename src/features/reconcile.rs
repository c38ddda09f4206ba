use std::fmt;

use parking_lot::Mutex;
use rust_decimal::prelude::*;

use super::account::AccountId;
use super::transaction::TransactionId;
use super::transfer::{Stage, TransferEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconciliationId(ulid::Ulid);

impl ReconciliationId {
    fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl fmt::Display for ReconciliationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A balance change still owed to an account to undo part of a failed transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Compensation {
    pub account_id: AccountId,
    pub delta: Decimal,
}

/// A transfer that failed after writing and could not be rolled back on the spot.
#[derive(Debug, Clone)]
pub struct PendingReconciliation {
    pub id: ReconciliationId,
    pub transaction_id: TransactionId,
    /// Step at which the transfer gave up
    pub stage: Stage,
    /// Still to apply, in order
    pub compensations: Vec<Compensation>,
    pub reason: String,
}

impl PendingReconciliation {
    pub(crate) fn new(
        transaction_id: TransactionId,
        stage: Stage,
        compensations: Vec<Compensation>,
        reason: String,
    ) -> Self {
        Self {
            id: ReconciliationId::new(),
            transaction_id,
            stage,
            compensations,
            reason,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReconciliationQueue {
    entries: Mutex<Vec<PendingReconciliation>>,
}

impl ReconciliationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn park(&self, entry: PendingReconciliation) -> ReconciliationId {
        let id = entry.id;
        self.entries.lock().push(entry);
        id
    }

    pub(crate) fn pending(&self) -> Vec<PendingReconciliation> {
        self.entries.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn take_all(&self) -> Vec<PendingReconciliation> {
        std::mem::take(&mut *self.entries.lock())
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct ReconcileReport {
    pub repaired: Vec<ReconciliationId>,
    pub still_pending: Vec<ReconciliationId>,
}

impl TransferEngine {
    pub fn pending_reconciliations(&self) -> Vec<PendingReconciliation> {
        self.reconciliation.pending()
    }

    pub fn reconciliation_backlog(&self) -> usize {
        self.reconciliation.len()
    }

    /// Repair pass over parked transfers. Entries that still cannot be applied go back
    /// on the queue with whatever compensations remain.
    pub fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for mut entry in self.reconciliation.take_all() {
            match self.repair(&mut entry) {
                Ok(()) => {
                    info!(
                        "Reconciled transfer {} ({})",
                        entry.transaction_id, entry.id
                    );
                    report.repaired.push(entry.id);
                }
                Err(reason) => {
                    warn!("Reconciliation {} still pending: {reason}", entry.id);
                    entry.reason = reason;
                    report.still_pending.push(entry.id);
                    self.reconciliation.park(entry);
                }
            }
        }

        report
    }

    fn repair(&self, entry: &mut PendingReconciliation) -> Result<(), String> {
        while let Some(compensation) = entry.compensations.first().cloned() {
            let _guard = self
                .locks
                .acquire(&[compensation.account_id], self.config.lock_timeout)
                .map_err(|id| format!("account {id} is busy"))?;

            let current = self
                .persist(Stage::Compensate, || {
                    self.accounts.find_by_id(compensation.account_id)
                })
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("account {} no longer exists", compensation.account_id))?;

            let restored = current
                .apply(compensation.delta)
                .map_err(|e| e.to_string())?;
            self.persist(Stage::Compensate, || self.accounts.save(&restored))
                .map_err(|e| e.to_string())?;

            debug!(
                "Applied {} to account {} for {}",
                compensation.delta, compensation.account_id, entry.id
            );
            entry.compensations.remove(0);
        }

        Ok(())
    }
}
