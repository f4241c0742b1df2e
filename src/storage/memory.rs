//! In-memory ledger store.
//!
//! A deterministic stand-in for the SQL store. It models the locking a
//! relational store applies to `add_account_balance`: each account row has an
//! exclusive lock, taken on first balance update and held until the
//! transaction commits or rolls back. A transaction that locks rows in the
//! wrong order can therefore really deadlock here, which is what the
//! lock-ordering tests rely on.
//!
//! Every lock acquisition is appended to a log, and failures can be queued
//! for a specific operation to exercise rollback paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;

use crate::domain::{Account, AccountId, Cents, Currency, Entry, Transfer};

use super::{Queries, Store, StoreError, StoreResult, UnitOfWork};

/// A repository operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateTransfer,
    CreateEntry,
    AddAccountBalance,
    GetAccount,
    Commit,
}

/// One row-lock acquisition, in the order it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEvent {
    pub tx_id: u64,
    pub account_id: AccountId,
}

#[derive(Default)]
struct Ledger {
    accounts: BTreeMap<AccountId, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
}

#[derive(Default)]
struct Inner {
    ledger: Mutex<Ledger>,
    row_locks: Mutex<HashMap<AccountId, Arc<RowLock<()>>>>,
    lock_log: Mutex<Vec<LockEvent>>,
    faults: Mutex<VecDeque<(Operation, StoreError)>>,
    next_tx: AtomicU64,
    next_account: AtomicU64,
    next_entry: AtomicU64,
    next_transfer: AtomicU64,
}

impl Inner {
    fn take_fault(&self, op: Operation) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        match faults.iter().position(|(target, _)| *target == op) {
            Some(index) => match faults.remove(index) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn row_lock(&self, account_id: AccountId) -> Arc<RowLock<()>> {
        self.row_locks
            .lock()
            .entry(account_id)
            .or_insert_with(|| Arc::new(RowLock::new(())))
            .clone()
    }

    fn next_id(counter: &AtomicU64) -> i64 {
        (counter.fetch_add(1, Ordering::SeqCst) + 1) as i64
    }
}

/// Shared-state in-memory store. Clones share the same ledger.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_account(&self, owner: &str, currency: Currency, balance: Cents) -> Account {
        let id = Inner::next_id(&self.inner.next_account);
        let account = Account::new(id, owner, balance, currency);
        self.inner
            .ledger
            .lock()
            .accounts
            .insert(id, account.clone());
        account
    }

    /// Committed state of an account.
    pub fn account(&self, id: AccountId) -> Option<Account> {
        self.inner.ledger.lock().accounts.get(&id).cloned()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.inner.ledger.lock().entries.clone()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.inner.ledger.lock().transfers.clone()
    }

    pub fn total_balance(&self) -> Cents {
        self.inner
            .ledger
            .lock()
            .accounts
            .values()
            .map(|a| a.balance)
            .sum()
    }

    /// Every row-lock acquisition so far, oldest first.
    pub fn lock_log(&self) -> Vec<LockEvent> {
        self.inner.lock_log.lock().clone()
    }

    /// Make the next call of `op` (in any transaction) fail with `err`.
    /// Queued failures are consumed one per call, in order.
    pub fn fail_next(&self, op: Operation, err: StoreError) {
        self.inner.faults.lock().push_back((op, err));
    }

    fn begin(&self) -> MemoryTransaction {
        let tx_id = self.inner.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        MemoryTransaction {
            inner: Arc::clone(&self.inner),
            tx_id,
            held: HashMap::new(),
            transfers: Vec::new(),
            entries: Vec::new(),
            deltas: BTreeMap::new(),
        }
    }
}

impl Store for MemoryStore {
    fn execute<'s, T, E, F>(&'s self, work: F) -> BoxFuture<'s, Result<T, E>>
    where
        T: Send + 's,
        E: From<StoreError> + Send + 's,
        F: for<'t> FnOnce(&'t mut dyn Queries) -> UnitOfWork<'t, T, E> + Send + 's,
    {
        Box::pin(async move {
            let mut tx = self.begin();
            let value = work(&mut tx).await?;
            tx.commit().map_err(E::from)?;
            Ok(value)
        })
    }
}

/// Writes staged by one open transaction. Nothing is visible to other
/// transactions until `commit`; dropping it discards the writes and releases
/// the row locks.
pub struct MemoryTransaction {
    inner: Arc<Inner>,
    tx_id: u64,
    held: HashMap<AccountId, OwnedMutexGuard<()>>,
    transfers: Vec<Transfer>,
    entries: Vec<Entry>,
    deltas: BTreeMap<AccountId, Cents>,
}

impl MemoryTransaction {
    fn account_exists(&self, id: AccountId) -> bool {
        self.inner.ledger.lock().accounts.contains_key(&id)
    }

    /// Committed row plus this transaction's own pending delta.
    fn visible_account(&self, id: AccountId) -> StoreResult<Account> {
        let committed = self
            .inner
            .ledger
            .lock()
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("account", id))?;
        let pending = self.deltas.get(&id).copied().unwrap_or(0);
        Ok(committed.with_delta(pending))
    }

    async fn lock_row(&mut self, account_id: AccountId) {
        if self.held.contains_key(&account_id) {
            return;
        }
        let guard = self.inner.row_lock(account_id).lock_owned().await;
        self.inner.lock_log.lock().push(LockEvent {
            tx_id: self.tx_id,
            account_id,
        });
        debug!(tx_id = self.tx_id, account_id, "Row lock acquired");
        self.held.insert(account_id, guard);
    }

    fn commit(self) -> StoreResult<()> {
        self.inner.take_fault(Operation::Commit)?;

        let mut ledger = self.inner.ledger.lock();
        for (id, delta) in &self.deltas {
            if let Some(account) = ledger.accounts.get_mut(id) {
                account.balance += delta;
            }
        }
        ledger.transfers.extend(self.transfers.iter().cloned());
        ledger.entries.extend(self.entries.iter().cloned());
        drop(ledger);
        // Row locks are released when `self.held` drops, after the writes
        // above are visible.
        Ok(())
    }
}

#[async_trait]
impl Queries for MemoryTransaction {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> StoreResult<Transfer> {
        self.inner.take_fault(Operation::CreateTransfer)?;
        if !self.account_exists(from_account_id) || !self.account_exists(to_account_id) {
            return Err(StoreError::ConstraintViolation(
                "transfers.account_id references a missing account".to_string(),
            ));
        }
        if amount <= 0 {
            return Err(StoreError::ConstraintViolation(
                "transfers.amount must be positive".to_string(),
            ));
        }

        let transfer = Transfer {
            id: Inner::next_id(&self.inner.next_transfer),
            from_account_id,
            to_account_id,
            amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn create_entry(&mut self, account_id: AccountId, amount: Cents) -> StoreResult<Entry> {
        self.inner.take_fault(Operation::CreateEntry)?;
        if !self.account_exists(account_id) {
            return Err(StoreError::ConstraintViolation(
                "entries.account_id references a missing account".to_string(),
            ));
        }

        let entry = Entry {
            id: Inner::next_id(&self.inner.next_entry),
            account_id,
            amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn add_account_balance(
        &mut self,
        account_id: AccountId,
        delta: Cents,
    ) -> StoreResult<Account> {
        if !self.account_exists(account_id) {
            return Err(StoreError::not_found("account", account_id));
        }
        self.lock_row(account_id).await;
        self.inner.take_fault(Operation::AddAccountBalance)?;
        // Let other transactions run while this one holds the lock, the way a
        // round trip to a real store would.
        tokio::task::yield_now().await;

        *self.deltas.entry(account_id).or_insert(0) += delta;
        self.visible_account(account_id)
    }

    async fn get_account(&mut self, account_id: AccountId) -> StoreResult<Account> {
        self.inner.take_fault(Operation::GetAccount)?;
        self.visible_account(account_id)
    }
}
