use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Cents, Currency};

pub type AccountId = i64;

/// A ledger account. The balance is owned by the store and only ever changes
/// through a signed delta applied in the same statement that locks the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner: String,
    pub balance: Cents,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: AccountId, owner: impl Into<String>, balance: Cents, currency: Currency) -> Self {
        Self {
            id,
            owner: owner.into(),
            balance,
            currency,
            created_at: Utc::now(),
        }
    }

    /// Copy of this account with `delta` applied to the balance.
    pub fn with_delta(&self, delta: Cents) -> Self {
        Self {
            balance: self.balance + delta,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_delta_keeps_identity() {
        let account = Account::new(7, "alice", 100, Currency::Usd);
        let debited = account.with_delta(-30);

        assert_eq!(debited.id, 7);
        assert_eq!(debited.owner, "alice");
        assert_eq!(debited.balance, 70);
        assert_eq!(debited.created_at, account.created_at);
        assert_eq!(account.balance, 100);
    }
}
