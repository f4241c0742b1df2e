use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::domain::{Account, AccountId, Cents, TransferResult};
use crate::storage::{Queries, Store, StoreError};

use super::{AppError, TransferMetrics};

/// How the orchestrator treats conflicts and slow transactions.
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Total tries for one transfer when the store reports a conflict.
    pub max_attempts: u32,
    /// Pause before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    /// Deadline for the work inside one transaction, excluding the commit.
    pub timeout: Option<Duration>,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            timeout: None,
        }
    }
}

impl TransferPolicy {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Moves money between two accounts in one store transaction.
///
/// The service holds no balances of its own: every read and write goes
/// through the store inside the transaction, and all collaborators are passed
/// in by the caller.
#[derive(Clone)]
pub struct TransferService<S> {
    store: S,
    policy: TransferPolicy,
    metrics: Arc<TransferMetrics>,
}

impl<S: Store> TransferService<S> {
    pub fn new(store: S, policy: TransferPolicy, metrics: Arc<TransferMetrics>) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<TransferMetrics> {
        &self.metrics
    }

    /// Transfer `amount` from one account to another.
    ///
    /// Writes one transfer row, a debit and a credit entry, and applies both
    /// balance deltas, all in one transaction. Either all five writes commit
    /// or none do. Store conflicts are retried up to
    /// [`TransferPolicy::max_attempts`] times; every other error aborts and is
    /// returned as is.
    #[instrument(skip(self), fields(attempts = tracing::field::Empty))]
    pub async fn transfer(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> Result<TransferResult, AppError> {
        let started = Instant::now();
        let result = self
            .transfer_with_retry(from_account_id, to_account_id, amount)
            .await;
        self.metrics.record_outcome(result.is_ok(), started.elapsed());

        match &result {
            Ok(outcome) => info!(
                transfer_id = outcome.transfer.id,
                from_balance = outcome.from_account.balance,
                to_balance = outcome.to_account.balance,
                "Transfer committed"
            ),
            Err(err) => warn!(error = %err, kind = ?err.kind(), "Transfer aborted"),
        }
        result
    }

    async fn transfer_with_retry(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> Result<TransferResult, AppError> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            tracing::Span::current().record("attempts", attempt);
            match self.run_once(from_account_id, to_account_id, amount).await {
                Err(AppError::TransactionConflict { message, .. }) if attempt < max_attempts => {
                    warn!(attempt, error = %message, "Transfer conflicted, retrying");
                    self.metrics.record_retry();
                    tokio::time::sleep(self.policy.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(AppError::TransactionConflict { message, .. }) => {
                    return Err(AppError::TransactionConflict {
                        attempts: attempt,
                        message,
                    });
                }
                other => return other,
            }
        }
    }

    async fn run_once(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> Result<TransferResult, AppError> {
        let timeout = self.policy.timeout;
        self.store
            .execute(move |q| {
                Box::pin(transfer_tx(q, from_account_id, to_account_id, amount, timeout))
            })
            .await
    }
}

/// The body of one transfer transaction.
async fn transfer_tx(
    q: &mut dyn Queries,
    from_account_id: AccountId,
    to_account_id: AccountId,
    amount: Cents,
    timeout: Option<Duration>,
) -> Result<TransferResult, AppError> {
    let work = write_transfer(q, from_account_id, to_account_id, amount);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| AppError::Timeout(limit))?,
        None => work.await,
    }
}

async fn write_transfer(
    q: &mut dyn Queries,
    from_account_id: AccountId,
    to_account_id: AccountId,
    amount: Cents,
) -> Result<TransferResult, AppError> {
    let transfer = match q.create_transfer(from_account_id, to_account_id, amount).await {
        Ok(transfer) => transfer,
        Err(StoreError::ConstraintViolation(message)) => {
            return Err(explain_rejected_transfer(q, from_account_id, to_account_id, message).await);
        }
        Err(err) => return Err(err.into()),
    };

    let from_entry = q.create_entry(from_account_id, -amount).await?;
    let to_entry = q.create_entry(to_account_id, amount).await?;

    // Lower account id first, whichever side of the transfer it is on. A
    // self-transfer credits before it debits.
    let (first_id, second_id) = transfer.lock_order();
    let debit_first = first_id == from_account_id && first_id != second_id;
    let (first_delta, second_delta) = if debit_first {
        (-amount, amount)
    } else {
        (amount, -amount)
    };
    let (first, second) = add_money(q, first_id, first_delta, second_id, second_delta).await?;
    let (from_account, to_account) = if debit_first {
        (first, second)
    } else {
        (second, first)
    };

    Ok(TransferResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

/// Apply two deltas in the given order and return both updated rows.
async fn add_money(
    q: &mut dyn Queries,
    first_id: AccountId,
    first_delta: Cents,
    second_id: AccountId,
    second_delta: Cents,
) -> Result<(Account, Account), StoreError> {
    debug!(first = first_id, second = second_id, "Applying balance deltas");
    let first = q.add_account_balance(first_id, first_delta).await?;
    let second = q.add_account_balance(second_id, second_delta).await?;
    Ok((first, second))
}

/// The transfer insert was refused by a constraint. Report which account is
/// missing when that is the cause.
async fn explain_rejected_transfer(
    q: &mut dyn Queries,
    from_account_id: AccountId,
    to_account_id: AccountId,
    message: String,
) -> AppError {
    for id in [from_account_id, to_account_id] {
        match q.get_account(id).await {
            Ok(_) => {}
            Err(StoreError::NotFound { .. }) => return AppError::account_not_found(id),
            Err(err) => return err.into(),
        }
    }
    AppError::ConstraintViolation(message)
}
