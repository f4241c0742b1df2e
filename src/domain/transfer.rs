use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Account, AccountId, Cents, Entry};

pub type TransferId = i64;

/// Immutable record of one transfer operation. Backed by exactly two entries
/// (a debit on `from_account_id`, a credit on `to_account_id`) written in the
/// same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: TransferId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    /// Always positive
    pub amount: Cents,
    pub created_at: DateTime<Utc>,
}

impl Transfer {
    /// True when `a` and `b` are the debit/credit pair this transfer produced.
    pub fn is_backed_by(&self, a: &Entry, b: &Entry) -> bool {
        let (debit, credit) = if a.is_debit() { (a, b) } else { (b, a) };
        debit.account_id == self.from_account_id
            && credit.account_id == self.to_account_id
            && debit.amount == -self.amount
            && credit.amount == self.amount
    }

    /// The account whose balance row is locked first: the lower id.
    pub fn lock_order(&self) -> (AccountId, AccountId) {
        lock_order(self.from_account_id, self.to_account_id)
    }
}

/// Global acquisition order for a pair of account rows. Every transaction
/// that touches two accounts locks them in ascending id order, so two
/// transfers over the same pair can never wait on each other in a cycle.
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Everything a committed transfer produced, as seen right after the
/// balance updates. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(from: AccountId, to: AccountId, amount: Cents) -> Transfer {
        Transfer {
            id: 1,
            from_account_id: from,
            to_account_id: to,
            amount,
            created_at: Utc::now(),
        }
    }

    fn entry(id: i64, account_id: AccountId, amount: Cents) -> Entry {
        Entry {
            id,
            account_id,
            amount,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_lock_order_is_ascending() {
        assert_eq!(lock_order(1, 2), (1, 2));
        assert_eq!(lock_order(9, 3), (3, 9));
        assert_eq!(lock_order(4, 4), (4, 4));
        assert_eq!(transfer(5, 2, 10).lock_order(), (2, 5));
    }

    #[test]
    fn test_entry_pairing() {
        let t = transfer(1, 2, 30);

        assert!(t.is_backed_by(&entry(1, 1, -30), &entry(2, 2, 30)));
        assert!(t.is_backed_by(&entry(2, 2, 30), &entry(1, 1, -30)));
        assert!(!t.is_backed_by(&entry(1, 1, -30), &entry(2, 2, 29)));
        assert!(!t.is_backed_by(&entry(1, 2, -30), &entry(2, 1, 30)));
    }
}
