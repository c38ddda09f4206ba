use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rust_decimal::prelude::*;
use thiserror::Error;

use super::account::{Account, AccountError, AccountId, AccountNumber};
use super::config::EngineConfig;
use super::locks::AccountLocks;
use super::reconcile::{
    Compensation, PendingReconciliation, ReconciliationId, ReconciliationQueue,
};
use super::store::{AccountStore, StoreError, StoreResult, TransactionLog};
use super::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Sender,
    Receiver,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Sender => f.write_str("Sender"),
            Party::Receiver => f.write_str("Receiver"),
        }
    }
}

/// Store interaction a transfer was performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lookup,
    DebitSender,
    CreditReceiver,
    AppendTransaction,
    Compensate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Stage::Lookup => "look up account",
            Stage::DebitSender => "update sender",
            Stage::CreditReceiver => "update receiver",
            Stage::AppendTransaction => "record transaction",
            Stage::Compensate => "roll back transfer",
        };
        f.write_str(stage)
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{party} account {account_number} not found")]
    AccountNotFound {
        party: Party,
        account_number: AccountNumber,
    },

    #[error("Invalid amount - {0}")]
    InvalidAmount(String),

    #[error("Cannot transfer from account {0} to itself")]
    SameAccount(AccountNumber),

    #[error(
        "You cannot transfer {requested}. It is more than {available} available in account {account_number}"
    )]
    InsufficientCredit {
        account_number: AccountNumber,
        requested: Decimal,
        available: Decimal,
    },

    /// The store failed. With a reconciliation id, the transfer left writes behind
    /// that are parked for the repair pass.
    #[error("Failed to {stage} - {source}")]
    PersistenceFailure {
        stage: Stage,
        #[source]
        source: StoreError,
        reconciliation: Option<ReconciliationId>,
    },

    #[error("Account {account_id} stayed contended after {attempts} attempts")]
    ConcurrencyConflict { account_id: AccountId, attempts: u32 },

    #[error("Transfer cancelled before any write")]
    Cancelled,
}

impl TransferError {
    /// Request refused before anything was written.
    pub fn is_rejection(&self) -> bool {
        use TransferError::*;
        matches!(
            self,
            AccountNotFound { .. }
                | InvalidAmount(_)
                | SameAccount(_)
                | InsufficientCredit { .. }
                | Cancelled
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::PersistenceFailure { .. } | TransferError::ConcurrencyConflict { .. }
        )
    }

    /// Writes could not be undone and are waiting on [`TransferEngine::reconcile`].
    pub fn needs_investigation(&self) -> bool {
        matches!(
            self,
            TransferError::PersistenceFailure {
                reconciliation: Some(_),
                ..
            }
        )
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub sender_account: AccountNumber,
    pub receiver_account: AccountNumber,
    pub amount: Decimal,
}

impl TransferRequest {
    pub fn new(
        sender_account: impl Into<AccountNumber>,
        receiver_account: impl Into<AccountNumber>,
        amount: Decimal,
    ) -> Self {
        Self {
            sender_account: sender_account.into(),
            receiver_account: receiver_account.into(),
            amount,
        }
    }

    /// NaN and infinities have no decimal form and are refused.
    pub fn from_float(
        sender_account: impl Into<AccountNumber>,
        receiver_account: impl Into<AccountNumber>,
        amount: f64,
    ) -> TransferResult<Self> {
        let amount = Decimal::from_f64(amount)
            .ok_or_else(|| TransferError::InvalidAmount(format!("{amount} is not a finite number")))?;
        Ok(Self::new(sender_account, receiver_account, amount))
    }

    /// Reads an amount as written in an input file. Decimal notation is taken exactly;
    /// anything else must at least be a finite float.
    pub fn parse(
        sender_account: impl Into<AccountNumber>,
        receiver_account: impl Into<AccountNumber>,
        amount: &str,
    ) -> TransferResult<Self> {
        let amount = amount.trim();
        if let Ok(exact) = Decimal::from_str(amount) {
            return Ok(Self::new(sender_account, receiver_account, exact));
        }

        let float = amount
            .parse::<f64>()
            .map_err(|_| TransferError::InvalidAmount(format!("'{amount}' is not a number")))?;
        Self::from_float(sender_account, receiver_account, float)
    }
}

/// Caller-side abort switch. Honoured until the first write of a transfer.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum AttemptError {
    /// Lost a race on this account. Nothing is left applied.
    Conflict(AccountId),
    Failed(TransferError),
}

impl From<TransferError> for AttemptError {
    fn from(e: TransferError) -> Self {
        AttemptError::Failed(e)
    }
}

/// Moves credit between accounts of a shared store.
pub struct TransferEngine {
    pub(crate) accounts: Arc<dyn AccountStore>,
    log: Arc<dyn TransactionLog>,
    pub(crate) locks: AccountLocks,
    pub(crate) reconciliation: ReconciliationQueue,
    pub(crate) config: EngineConfig,
}

impl TransferEngine {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        log: Arc<dyn TransactionLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            accounts,
            log,
            locks: AccountLocks::new(),
            reconciliation: ReconciliationQueue::new(),
            config,
        }
    }

    pub fn transfer(&self, request: &TransferRequest) -> TransferResult<Transaction> {
        self.transfer_cancellable(request, &Cancellation::new())
    }

    /// Debits the sender, credits the receiver and records the entry, all or nothing.
    ///
    /// Both accounts stay locked from the balance check until the entry is recorded
    /// or every applied write has been undone. A write that can neither complete nor
    /// be undone is parked for [`TransferEngine::reconcile`] and reported through
    /// [`TransferError::needs_investigation`].
    pub fn transfer_cancellable(
        &self,
        request: &TransferRequest,
        cancellation: &Cancellation,
    ) -> TransferResult<Transaction> {
        let sender = self.resolve(&request.sender_account, Party::Sender)?;
        let receiver = self.resolve(&request.receiver_account, Party::Receiver)?;

        if request.amount <= Decimal::ZERO {
            return Err(TransferError::InvalidAmount(format!(
                "{} must be greater than zero",
                request.amount
            )));
        }

        if sender.id() == receiver.id() {
            return Err(TransferError::SameAccount(request.sender_account.clone()));
        }

        let mut attempts = 1;
        loop {
            if cancellation.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            match self.attempt(request, sender.id(), receiver.id(), cancellation) {
                Ok(transaction) => return Ok(transaction),
                Err(AttemptError::Failed(e)) => return Err(e),
                Err(AttemptError::Conflict(account_id)) => {
                    if attempts >= self.config.conflict_retries {
                        return Err(TransferError::ConcurrencyConflict {
                            account_id,
                            attempts,
                        });
                    }
                    warn!(
                        "Transfer {} -> {} lost a race on account {account_id}, retrying",
                        request.sender_account, request.receiver_account
                    );
                    attempts += 1;
                }
            }
        }
    }

    /// Current committed state of the account behind `number`.
    pub fn resolve(&self, number: &AccountNumber, party: Party) -> TransferResult<Account> {
        self.persist(Stage::Lookup, || self.accounts.find_by_account_number(number))
            .map_err(|source| TransferError::PersistenceFailure {
                stage: Stage::Lookup,
                source,
                reconciliation: None,
            })?
            .ok_or_else(|| TransferError::AccountNotFound {
                party,
                account_number: number.clone(),
            })
    }

    fn reload(&self, id: AccountId, party: Party, number: &AccountNumber) -> TransferResult<Account> {
        self.persist(Stage::Lookup, || self.accounts.find_by_id(id))
            .map_err(|source| TransferError::PersistenceFailure {
                stage: Stage::Lookup,
                source,
                reconciliation: None,
            })?
            .ok_or_else(|| TransferError::AccountNotFound {
                party,
                account_number: number.clone(),
            })
    }

    fn attempt(
        &self,
        request: &TransferRequest,
        sender_id: AccountId,
        receiver_id: AccountId,
        cancellation: &Cancellation,
    ) -> Result<Transaction, AttemptError> {
        let _guards = self
            .locks
            .acquire(&[sender_id, receiver_id], self.config.lock_timeout)
            .map_err(AttemptError::Conflict)?;

        // Balances read before the locks may be stale.
        let sender = self.reload(sender_id, Party::Sender, &request.sender_account)?;
        let receiver = self.reload(receiver_id, Party::Receiver, &request.receiver_account)?;

        let debited = sender.debit(request.amount).map_err(|e| match e {
            AccountError::InsufficientCredit {
                requested,
                available,
            } => TransferError::InsufficientCredit {
                account_number: request.sender_account.clone(),
                requested,
                available,
            },
        })?;
        let credited = receiver.credit(request.amount);

        if cancellation.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }

        // From here on the transfer runs to a definite outcome.
        let transaction = Transaction::new(sender_id, receiver_id, request.amount);
        debug!(
            "Transfer {}: {} from {} to {}",
            transaction.id(),
            request.amount,
            sender_id,
            receiver_id
        );

        let saved_sender = self
            .persist(Stage::DebitSender, || self.accounts.save(&debited))
            .map_err(|e| self.abort(&transaction, Stage::DebitSender, e, vec![]))?;

        let saved_receiver = self
            .persist(Stage::CreditReceiver, || self.accounts.save(&credited))
            .map_err(|e| {
                self.abort(
                    &transaction,
                    Stage::CreditReceiver,
                    e,
                    vec![saved_sender.clone()],
                )
            })?;

        self.persist(Stage::AppendTransaction, || self.log.append(&transaction))
            .map_err(|e| {
                self.abort(
                    &transaction,
                    Stage::AppendTransaction,
                    e,
                    vec![saved_sender, saved_receiver],
                )
            })?;

        info!(
            "Transferred {} from {} to {} ({})",
            request.amount,
            request.sender_account,
            request.receiver_account,
            transaction.id()
        );
        Ok(transaction)
    }

    /// Undoes `applied` (in write order) after the write at `stage` failed.
    fn abort(
        &self,
        transaction: &Transaction,
        stage: Stage,
        cause: StoreError,
        applied: Vec<Account>,
    ) -> AttemptError {
        let reconciliation = self.roll_back(transaction, stage, &cause, applied);

        match cause {
            StoreError::VersionConflict { id, .. } if reconciliation.is_none() => {
                AttemptError::Conflict(id)
            }
            source => AttemptError::Failed(TransferError::PersistenceFailure {
                stage,
                source,
                reconciliation,
            }),
        }
    }

    fn roll_back(
        &self,
        transaction: &Transaction,
        stage: Stage,
        cause: &StoreError,
        applied: Vec<Account>,
    ) -> Option<ReconciliationId> {
        let undo: Vec<(Account, Compensation)> = applied
            .into_iter()
            .rev()
            .map(|account| {
                let delta = if account.id() == transaction.sender_id() {
                    transaction.amount()
                } else {
                    -transaction.amount()
                };
                let compensation = Compensation {
                    account_id: account.id(),
                    delta,
                };
                (account, compensation)
            })
            .collect();

        for (done, (account, compensation)) in undo.iter().enumerate() {
            let result = account
                .apply(compensation.delta)
                .map_err(|e| StoreError::Rejected(e.to_string()))
                .and_then(|restored| {
                    self.persist(Stage::Compensate, || self.accounts.save(&restored))
                });

            if let Err(e) = result {
                let remaining = undo[done..].iter().map(|(_, c)| c.clone()).collect();
                let id = self.reconciliation.park(PendingReconciliation::new(
                    transaction.id(),
                    stage,
                    remaining,
                    format!("failed to {stage} ({cause}), rollback failed ({e})"),
                ));
                error!(
                    "Transfer {} left partially applied, parked as {id}: {e}",
                    transaction.id()
                );
                return Some(id);
            }

            debug!(
                "Rolled back {} on account {} for transfer {}",
                compensation.delta,
                compensation.account_id,
                transaction.id()
            );
        }

        None
    }

    /// Runs a store call with bounded retries of transient failures.
    pub(crate) fn persist<T>(
        &self,
        stage: Stage,
        mut call: impl FnMut() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.persist_retries => {
                    let backoff = self.config.retry_backoff * attempt;
                    if started.elapsed() + backoff >= self.config.persist_timeout {
                        warn!("Giving up on {stage} after {attempt} attempts: {e}");
                        return Err(e);
                    }
                    warn!("Attempt {attempt} to {stage} failed, retrying: {e}");
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
