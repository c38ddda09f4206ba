use std::fmt;

use rust_decimal::prelude::*;
use serde::{Serialize, Serializer};

use super::account::AccountId;

/// Globally unique and sortable by creation time. Generated without coordination.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ledger entry for one completed transfer.
///
/// Fields are private and there are no setters: once built, an entry is only ever
/// appended to the log and read back.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Transaction {
    id: TransactionId,

    #[serde(rename = "sender")]
    sender_id: AccountId,

    #[serde(rename = "receiver")]
    receiver_id: AccountId,

    /// Always strictly positive
    #[serde(serialize_with = "amount_serialize")]
    amount: Decimal,
}

fn amount_serialize<S>(amount: &Decimal, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(amount.normalize().to_string().as_str())
}

impl Transaction {
    pub(crate) fn new(sender_id: AccountId, receiver_id: AccountId, amount: Decimal) -> Self {
        Self {
            id: TransactionId::new(),
            sender_id,
            receiver_id,
            amount,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn sender_id(&self) -> AccountId {
        self.sender_id
    }

    pub fn receiver_id(&self) -> AccountId {
        self.receiver_id
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn every_entry_gets_its_own_id() {
        let first = Transaction::new(AccountId(1), AccountId(2), dec!(5));
        let second = Transaction::new(AccountId(1), AccountId(2), dec!(5));
        assert_ne!(first.id(), second.id());
        assert_ne!(first, second);
    }

    #[test]
    fn serializes_parties_and_amount() {
        let tx = Transaction::new(AccountId(7), AccountId(9), dec!(300.50));
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["sender"], 7);
        assert_eq!(value["receiver"], 9);
        assert_eq!(value["amount"], "300.5");
        assert_eq!(value["id"], tx.id().to_string());
    }
}
