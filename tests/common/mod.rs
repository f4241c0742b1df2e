// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use simplebank::application::{LedgerService, TransferPolicy};
use simplebank::domain::{Account, Currency};
use simplebank::storage::{DbConfig, UnitOfWork};
use tempfile::TempDir;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = LedgerService::init(&db_path).await?;
    Ok((service, temp_dir))
}

/// Same as [`test_service`] with a custom transfer policy and a pool large
/// enough for the concurrency tests.
pub async fn test_service_with(policy: TransferPolicy) -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let config = DbConfig::new(temp_dir.path().join("test.db"))
        .create_if_missing(true)
        .max_connections(10)
        .busy_timeout(Duration::from_secs(10));
    let service = LedgerService::open(&config, policy).await?;
    Ok((service, temp_dir))
}

/// Pin a unit of work so the closure handed to `Store::execute` has a
/// nameable return type.
pub fn boxed<'t, T, E>(
    fut: impl Future<Output = Result<T, E>> + Send + 't,
) -> UnitOfWork<'t, T, E> {
    Box::pin(fut)
}

/// Test fixture: two USD accounts holding 100 and 50.
pub struct StandardAccounts;

impl StandardAccounts {
    pub async fn create(service: &LedgerService) -> Result<(Account, Account)> {
        let alice = service.create_account("alice", Currency::Usd, 100).await?;
        let bob = service.create_account("bob", Currency::Usd, 50).await?;
        Ok((alice, bob))
    }
}
