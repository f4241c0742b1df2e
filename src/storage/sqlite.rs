use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::domain::{
    Account, AccountId, Cents, Currency, Entry, IntegrityStats, Transfer,
};

use super::{MIGRATION_001_INITIAL, Queries, Store, StoreError, StoreResult, UnitOfWork};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// Connection settings for the SQLite ledger.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,
    /// Each concurrent transfer holds one connection for its whole transaction.
    pub max_connections: u32,
    /// How long a writer waits on the database lock before the store reports
    /// a conflict.
    pub busy_timeout: Duration,
    pub create_if_missing: bool,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            create_if_missing: false,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.database_path)
            .create_if_missing(self.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(self.busy_timeout)
    }
}

/// SQLite-backed ledger store.
#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.connect_options())
            .await?;
        debug!(
            path = %config.database_path.display(),
            max_connections = config.max_connections,
            "Connected to ledger database"
        );
        Ok(Self::new(pool))
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Connect (creating the file when missing) and migrate.
    pub async fn init(config: &DbConfig) -> StoreResult<Self> {
        let config = config.clone().create_if_missing(true);
        let store = Self::connect(&config).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ========================
    // Account administration
    // ========================

    /// Open a new account with an initial balance. Account creation sits
    /// outside the transfer core and writes no entry.
    pub async fn create_account(
        &self,
        owner: &str,
        currency: Currency,
        balance: Cents,
    ) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, balance, currency, created_at) VALUES (?, ?, ?, ?) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(owner)
        .bind(balance)
        .bind(currency.code())
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        row_to_account(&row)
    }

    pub async fn get_account(&self, id: AccountId) -> StoreResult<Account> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("account", id))?;

        row_to_account(&row)
    }

    pub async fn list_accounts(&self, owner: Option<&str>) -> StoreResult<Vec<Account>> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query(&format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = ? ORDER BY id"
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_account).collect()
    }

    // ========================
    // Ledger queries
    // ========================

    /// Entries for one account in the order they were written.
    pub async fn list_entries(&self, account_id: AccountId) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = ? ORDER BY id"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    pub async fn list_all_entries(&self) -> StoreResult<Vec<Entry>> {
        let rows = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Transfers touching `account_id` as source or destination, or every
    /// transfer when no account is given.
    pub async fn list_transfers(&self, account_id: Option<AccountId>) -> StoreResult<Vec<Transfer>> {
        let rows = match account_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE from_account_id = ? OR to_account_id = ? ORDER BY id"
                ))
                .bind(id)
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {TRANSFER_COLUMNS} FROM transfers ORDER BY id"))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_transfer).collect()
    }

    pub async fn integrity_stats(&self) -> StoreResult<IntegrityStats> {
        let account_count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM accounts")
            .fetch_one(&self.pool)
            .await?
            .get("count");

        let transfer_count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM transfers")
            .fetch_one(&self.pool)
            .await?
            .get("count");

        let entries = sqlx::query("SELECT COUNT(*) AS count, COALESCE(SUM(amount), 0) AS net FROM entries")
            .fetch_one(&self.pool)
            .await?;

        let invalid_amounts: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM transfers WHERE amount <= 0")
                .fetch_one(&self.pool)
                .await?
                .get("count");

        let dangling_transfers: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM transfers t
            WHERE NOT EXISTS (SELECT 1 FROM accounts a WHERE a.id = t.from_account_id)
               OR NOT EXISTS (SELECT 1 FROM accounts a WHERE a.id = t.to_account_id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(IntegrityStats {
            account_count,
            transfer_count,
            entry_count: entries.get("count"),
            entry_net: entries.get("net"),
            invalid_amounts,
            dangling_transfers,
        })
    }
}

impl Store for SqlStore {
    fn execute<'s, T, E, F>(&'s self, work: F) -> BoxFuture<'s, Result<T, E>>
    where
        T: Send + 's,
        E: From<StoreError> + Send + 's,
        F: for<'t> FnOnce(&'t mut dyn Queries) -> UnitOfWork<'t, T, E> + Send + 's,
    {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| E::from(StoreError::from(e)))?;
            debug!("Transaction started");

            let mut scope = SqlTransaction { tx };
            match work(&mut scope).await {
                Ok(value) => {
                    scope
                        .tx
                        .commit()
                        .await
                        .map_err(|e| E::from(StoreError::from(e)))?;
                    debug!("Transaction committed");
                    Ok(value)
                }
                Err(err) => {
                    // A failed rollback still discards the work: the
                    // connection drops the transaction when returned.
                    if let Err(rollback_err) = scope.tx.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    } else {
                        debug!("Transaction rolled back");
                    }
                    Err(err)
                }
            }
        })
    }
}

/// Query handle bound to one open SQLite transaction.
pub struct SqlTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl Queries for SqlTransaction {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: Cents,
    ) -> StoreResult<Transfer> {
        let row = sqlx::query(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at) VALUES (?, ?, ?, ?) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_transfer(&row)
    }

    async fn create_entry(&mut self, account_id: AccountId, amount: Cents) -> StoreResult<Entry> {
        let row = sqlx::query(&format!(
            "INSERT INTO entries (account_id, amount, created_at) VALUES (?, ?, ?) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(account_id)
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_entry(&row)
    }

    async fn add_account_balance(
        &mut self,
        account_id: AccountId,
        delta: Cents,
    ) -> StoreResult<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + ? WHERE id = ? RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(delta)
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StoreError::not_found("account", account_id))?;

        row_to_account(&row)
    }

    async fn get_account(&mut self, account_id: AccountId) -> StoreResult<Account> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::not_found("account", account_id))?;

        row_to_account(&row)
    }
}

fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Query(format!("Invalid timestamp '{}': {}", value, e)))
}

fn row_to_account(row: &SqliteRow) -> StoreResult<Account> {
    let currency: String = row.try_get("currency")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Account {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency: currency
            .parse()
            .map_err(|e: crate::domain::UnsupportedCurrency| StoreError::Query(e.to_string()))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_entry(row: &SqliteRow) -> StoreResult<Entry> {
    let created_at: String = row.try_get("created_at")?;

    Ok(Entry {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_transfer(row: &SqliteRow) -> StoreResult<Transfer> {
    let created_at: String = row.try_get("created_at")?;

    Ok(Transfer {
        id: row.try_get("id")?,
        from_account_id: row.try_get("from_account_id")?,
        to_account_id: row.try_get("to_account_id")?,
        amount: row.try_get("amount")?,
        created_at: parse_timestamp(&created_at)?,
    })
}
