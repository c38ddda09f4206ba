use std::fmt;

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Primary key of an account. Assigned by the store, never changes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct AccountId(pub(crate) u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The externally facing number transfers are addressed with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[serde(transparent)]
pub struct AccountNumber(String);

impl AccountNumber {
    pub fn new(number: impl Into<String>) -> Self {
        Self(number.into())
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountNumber {
    fn from(number: &str) -> Self {
        Self::new(number)
    }
}

#[derive(Error, Debug, PartialEq)]
pub(crate) enum AccountError {
    #[error("You cannot debit {requested}. It is more than {available} available in the account")]
    InsufficientCredit {
        requested: Decimal,
        available: Decimal,
    },
}

type AccountResult<T> = Result<T, AccountError>;

/// Credit holding account
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Account {
    id: AccountId,

    account_number: AccountNumber,

    /// Credit units held by the account. Never negative.
    #[serde(serialize_with = "round_serialize")]
    balance: Decimal,

    /// Version the record was read at. The store bumps it on every save and refuses
    /// saves made against a version that is no longer current.
    #[serde(skip)]
    version: u64,
}

fn round_serialize<S>(amount: &Decimal, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    // Serialize to 4 decimal
    let rounded_amount = amount.round_dp(4).to_string();
    s.serialize_str(rounded_amount.as_str())
}

impl Account {
    pub(crate) fn new(id: AccountId, account_number: AccountNumber, balance: Decimal) -> Self {
        Self {
            id,
            account_number,
            balance,
            version: 0,
        }
    }

    pub(crate) fn debit(&self, amount: Decimal) -> AccountResult<Self> {
        if self.balance < amount {
            return Err(AccountError::InsufficientCredit {
                requested: amount,
                available: self.balance,
            });
        }

        Ok(Self {
            balance: self.balance - amount,
            ..self.clone()
        })
    }

    pub(crate) fn credit(&self, amount: Decimal) -> Self {
        Self {
            balance: self.balance + amount,
            ..self.clone()
        }
    }

    /// Applies a signed balance change, refusing to go below zero.
    pub(crate) fn apply(&self, delta: Decimal) -> AccountResult<Self> {
        if delta < Decimal::ZERO {
            self.debit(-delta)
        } else {
            Ok(self.credit(delta))
        }
    }

    /// Stamp produced by the store after a successful save.
    pub(crate) fn with_version(self, version: u64) -> Self {
        Self { version, ..self }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn account_number(&self) -> &AccountNumber {
        &self.account_number
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}
