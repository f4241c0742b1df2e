use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::domain::{
    build_integrity_report, Account, AccountId, Cents, Currency, Entry, IntegrityReport,
    Transfer, TransferResult,
};
use crate::storage::{DbConfig, SqlStore};

use super::{AppError, MetricsSnapshot, TransferMetrics, TransferPolicy, TransferService};

/// Application service over the SQLite ledger.
/// This is the primary interface for any client (CLI, API, etc.): it checks
/// what the transfer core takes as given (accounts exist, currencies match)
/// and then hands off to [`TransferService`].
#[derive(Clone)]
pub struct LedgerService {
    store: SqlStore,
    transfers: TransferService<SqlStore>,
}

impl LedgerService {
    pub fn new(store: SqlStore, policy: TransferPolicy, metrics: Arc<TransferMetrics>) -> Self {
        let transfers = TransferService::new(store.clone(), policy, metrics);
        Self { store, transfers }
    }

    /// Open the database described by `config`, applying the schema.
    pub async fn open(config: &DbConfig, policy: TransferPolicy) -> Result<Self, AppError> {
        let store = SqlStore::connect(config).await?;
        store.migrate().await?;
        Ok(Self::new(store, policy, Arc::new(TransferMetrics::new())))
    }

    /// Create (if needed) and migrate the database at `path`.
    pub async fn init(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let store = SqlStore::init(&DbConfig::new(path.as_ref())).await?;
        Ok(Self::new(
            store,
            TransferPolicy::default(),
            Arc::new(TransferMetrics::new()),
        ))
    }

    /// Open an existing database at `path` with default settings.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let store = SqlStore::connect(&DbConfig::new(path.as_ref())).await?;
        Ok(Self::new(
            store,
            TransferPolicy::default(),
            Arc::new(TransferMetrics::new()),
        ))
    }

    pub fn transfer_service(&self) -> &TransferService<SqlStore> {
        &self.transfers
    }

    // ========================
    // Account operations
    // ========================

    pub async fn create_account(
        &self,
        owner: &str,
        currency: Currency,
        balance: Cents,
    ) -> Result<Account, AppError> {
        let owner = owner.trim();
        if owner.is_empty() {
            return Err(AppError::InvalidArgument(
                "account owner must not be empty".to_string(),
            ));
        }
        if balance < 0 {
            return Err(AppError::InvalidAmount(
                "opening balance must not be negative".to_string(),
            ));
        }

        let account = self.store.create_account(owner, currency, balance).await?;
        debug!(account_id = account.id, owner, %currency, "Account created");
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account, AppError> {
        Ok(self.store.get_account(id).await?)
    }

    pub async fn list_accounts(&self, owner: Option<&str>) -> Result<Vec<Account>, AppError> {
        Ok(self.store.list_accounts(owner).await?)
    }

    // ========================
    // Transfer operations
    // ========================

    /// Validate both accounts against `currency`, then transfer.
    pub async fn transfer(
        &self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
        currency: Currency,
    ) -> Result<TransferResult, AppError> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        self.valid_account(from_account_id, currency).await?;
        self.valid_account(to_account_id, currency).await?;

        self.transfers
            .transfer(from_account_id, to_account_id, amount)
            .await
    }

    async fn valid_account(&self, id: AccountId, currency: Currency) -> Result<Account, AppError> {
        let account = self.get_account(id).await?;
        if account.currency != currency {
            return Err(AppError::CurrencyMismatch {
                account_id: id,
                expected: currency,
                actual: account.currency,
            });
        }
        Ok(account)
    }

    /// Audit trail for one account.
    pub async fn list_entries(&self, account_id: AccountId) -> Result<Vec<Entry>, AppError> {
        self.get_account(account_id).await?;
        Ok(self.store.list_entries(account_id).await?)
    }

    pub async fn list_all_entries(&self) -> Result<Vec<Entry>, AppError> {
        Ok(self.store.list_all_entries().await?)
    }

    pub async fn list_transfers(
        &self,
        account_id: Option<AccountId>,
    ) -> Result<Vec<Transfer>, AppError> {
        if let Some(id) = account_id {
            self.get_account(id).await?;
        }
        Ok(self.store.list_transfers(account_id).await?)
    }

    // ========================
    // Integrity & metrics
    // ========================

    pub async fn check_integrity(&self) -> Result<IntegrityReport, AppError> {
        let stats = self.store.integrity_stats().await?;
        let accounts = self.store.list_accounts(None).await?;
        Ok(build_integrity_report(&accounts, &stats))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.transfers.metrics().snapshot()
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
