use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rust_decimal::prelude::*;
use thiserror::Error;

use super::{
    account::{Account, AccountId, AccountNumber},
    transaction::{Transaction, TransactionId},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Stale write on account {id}: read at version {expected}, store holds {found}")]
    VersionConflict {
        id: AccountId,
        expected: u64,
        found: u64,
    },

    #[error("Account {0} does not exist")]
    NotFound(AccountId),

    #[error("Write rejected - {0}")]
    Rejected(String),

    /// Transient backend failure. Safe to retry.
    #[error("Store unavailable - {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Point lookups and versioned point updates of accounts.
///
/// Reads must return the latest committed record.
pub trait AccountStore: Send + Sync {
    fn find_by_account_number(&self, number: &AccountNumber) -> StoreResult<Option<Account>>;

    fn find_by_id(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// Compare-and-swap on the account's version. Returns the stored record carrying
    /// the bumped version.
    fn save(&self, account: &Account) -> StoreResult<Account>;
}

/// Append-only record of completed transfers.
pub trait TransactionLog: Send + Sync {
    /// Re-appending an identical entry is a no-op, so retried appends never duplicate.
    fn append(&self, transaction: &Transaction) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct Accounts {
    by_id: BTreeMap<AccountId, Account>,
    by_number: BTreeMap<AccountNumber, AccountId>,
}

/// How long a store call waits on the store's own guards before reporting itself busy.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(500);

/// In-memory account store and transaction log.
#[derive(Debug)]
pub struct Store {
    accounts: RwLock<Accounts>,
    transactions: RwLock<BTreeMap<TransactionId, Transaction>>,
    busy_timeout: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self::with_busy_timeout(DEFAULT_BUSY_TIMEOUT)
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trait calls that cannot get at the data within `busy_timeout` fail with
    /// [`StoreError::Unavailable`] instead of waiting.
    pub fn with_busy_timeout(busy_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::default(),
            transactions: RwLock::default(),
            busy_timeout,
        }
    }

    fn read_accounts(&self) -> StoreResult<RwLockReadGuard<'_, Accounts>> {
        self.accounts
            .try_read_for(self.busy_timeout)
            .ok_or_else(|| StoreError::Unavailable("account table busy".into()))
    }

    fn write_accounts(&self) -> StoreResult<RwLockWriteGuard<'_, Accounts>> {
        self.accounts
            .try_write_for(self.busy_timeout)
            .ok_or_else(|| StoreError::Unavailable("account table busy".into()))
    }

    /// Seeds an account. Account numbers must be unique.
    pub fn open_account(
        &self,
        number: AccountNumber,
        initial_balance: Decimal,
    ) -> StoreResult<Account> {
        if initial_balance < Decimal::ZERO {
            return Err(StoreError::Rejected(format!(
                "negative opening balance {initial_balance} for account {number}"
            )));
        }

        let mut accounts = self.accounts.write();
        if accounts.by_number.contains_key(&number) {
            return Err(StoreError::Rejected(format!(
                "account number {number} is already taken"
            )));
        }

        let next = accounts.by_id.keys().next_back().map_or(1, |id| id.0 + 1);
        let account = Account::new(AccountId(next), number.clone(), initial_balance);
        accounts.by_number.insert(number, account.id());
        accounts.by_id.insert(account.id(), account.clone());
        Ok(account)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.read().by_id.values().cloned().collect()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.read().values().cloned().collect()
    }

    pub fn total_balance(&self) -> Decimal {
        self.accounts
            .read()
            .by_id
            .values()
            .map(Account::balance)
            .sum()
    }
}

impl AccountStore for Store {
    fn find_by_account_number(&self, number: &AccountNumber) -> StoreResult<Option<Account>> {
        let accounts = self.read_accounts()?;
        Ok(accounts
            .by_number
            .get(number)
            .and_then(|id| accounts.by_id.get(id))
            .cloned())
    }

    fn find_by_id(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.read_accounts()?.by_id.get(&id).cloned())
    }

    fn save(&self, account: &Account) -> StoreResult<Account> {
        if account.balance() < Decimal::ZERO {
            return Err(StoreError::Rejected(format!(
                "negative balance {} for account {}",
                account.balance(),
                account.id()
            )));
        }

        let mut accounts = self.write_accounts()?;
        let stored = accounts
            .by_id
            .get_mut(&account.id())
            .ok_or(StoreError::NotFound(account.id()))?;

        if stored.version() != account.version() {
            return Err(StoreError::VersionConflict {
                id: account.id(),
                expected: account.version(),
                found: stored.version(),
            });
        }

        *stored = account.clone().with_version(account.version() + 1);
        Ok(stored.clone())
    }
}

impl TransactionLog for Store {
    fn append(&self, transaction: &Transaction) -> StoreResult<()> {
        let mut transactions = self
            .transactions
            .try_write_for(self.busy_timeout)
            .ok_or_else(|| StoreError::Unavailable("transaction log busy".into()))?;
        match transactions.get(&transaction.id()) {
            Some(existing) if existing == transaction => Ok(()),
            Some(_) => Err(StoreError::Rejected(format!(
                "transaction {} already recorded with different content",
                transaction.id()
            ))),
            None => {
                transactions.insert(transaction.id(), transaction.clone());
                Ok(())
            }
        }
    }
}
