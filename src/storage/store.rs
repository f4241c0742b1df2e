use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::domain::{Account, AccountId, Cents, Entry, Transfer};

use super::{StoreError, StoreResult};

/// Data-access primitives available inside a transaction.
///
/// Implementations never do balance arithmetic on a previously read value:
/// `add_account_balance` applies the delta and returns the updated row in one
/// step, and is the only place an account's balance changes.
#[async_trait]
pub trait Queries: Send {
    /// Insert a transfer row. Fails with `ConstraintViolation` when either
    /// account does not exist or the amount is not positive.
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> StoreResult<Transfer>;

    /// Insert an entry row. No balance side effect.
    async fn create_entry(&mut self, account_id: AccountId, amount: Cents) -> StoreResult<Entry>;

    /// Apply `balance += delta` and return the row as updated. Holds the
    /// account's row lock until the enclosing transaction ends.
    async fn add_account_balance(
        &mut self,
        account_id: AccountId,
        delta: Cents,
    ) -> StoreResult<Account>;

    async fn get_account(&mut self, account_id: AccountId) -> StoreResult<Account>;
}

/// A unit of work run by [`Store::execute`]. It borrows the transaction's
/// query handle, so it cannot leak it past the transaction.
pub type UnitOfWork<'t, T, E> = BoxFuture<'t, Result<T, E>>;

/// Runs units of work inside a single transaction.
pub trait Store: Send + Sync {
    /// Begin a transaction, hand its query handle to `work`, then commit if
    /// `work` succeeds or roll back if it fails. Dropping the returned future
    /// before it completes also rolls back.
    fn execute<'s, T, E, F>(&'s self, work: F) -> BoxFuture<'s, Result<T, E>>
    where
        T: Send + 's,
        E: From<StoreError> + Send + 's,
        F: for<'t> FnOnce(&'t mut dyn Queries) -> UnitOfWork<'t, T, E> + Send + 's;
}
