mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{boxed, test_service_with, StandardAccounts};
use simplebank::application::{AppError, TransferMetrics, TransferPolicy, TransferService};
use simplebank::domain::{AccountId, Currency};
use simplebank::storage::memory::{LockEvent, Operation};
use simplebank::storage::{MemoryStore, Store, StoreError};
use tokio::sync::{oneshot, Barrier};
use tokio::task::JoinSet;

const SQLITE_ALTERNATING_TRANSFERS: usize = 300;
const MEMORY_ALTERNATING_TRANSFERS: u64 = 400;

fn policy() -> TransferPolicy {
    TransferPolicy::default()
        .max_attempts(10)
        .retry_backoff(Duration::from_millis(5))
        .timeout(Some(Duration::from_secs(10)))
}

fn memory_service(store: &MemoryStore) -> TransferService<MemoryStore> {
    TransferService::new(store.clone(), policy(), Arc::new(TransferMetrics::new()))
}

fn locks_of(log: &[LockEvent], tx_id: u64) -> Vec<AccountId> {
    log.iter()
        .filter(|event| event.tx_id == tx_id)
        .map(|event| event.account_id)
        .collect()
}

// ========================
// SQLite store
// ========================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_one_direction() -> Result<()> {
    let (service, _temp) = test_service_with(policy()).await?;
    let (alice, bob) = StandardAccounts::create(&service).await?;

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let service = service.clone();
        tasks.spawn(async move { service.transfer(alice.id, bob.id, 1, Currency::Usd).await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    assert_eq!(service.get_account(alice.id).await?.balance, 90);
    assert_eq!(service.get_account(bob.id).await?.balance, 60);
    assert_eq!(service.list_transfers(None).await?.len(), 10);
    assert_eq!(service.list_all_entries().await?.len(), 20);
    assert_eq!(service.metrics().transfers_succeeded, 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_both_directions() -> Result<()> {
    let (service, _temp) = test_service_with(policy()).await?;
    let (alice, bob) = StandardAccounts::create(&service).await?;

    let mut tasks = JoinSet::new();
    for n in 0..SQLITE_ALTERNATING_TRANSFERS {
        let service = service.clone();
        let (from, to) = if n % 2 == 0 {
            (alice.id, bob.id)
        } else {
            (bob.id, alice.id)
        };
        tasks.spawn(async move { service.transfer(from, to, 3, Currency::Usd).await });
    }

    let all_done = async {
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }
        anyhow::Ok(())
    };
    tokio::time::timeout(Duration::from_secs(120), all_done).await??;

    // Half each way cancel out.
    assert_eq!(service.get_account(alice.id).await?.balance, 100);
    assert_eq!(service.get_account(bob.id).await?.balance, 50);

    let metrics = service.metrics();
    assert_eq!(metrics.transfers_succeeded, SQLITE_ALTERNATING_TRANSFERS as u64);
    assert_eq!(metrics.transfers_failed, 0);

    let report = service.check_integrity().await?;
    assert!(report.is_healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.transfer_count, SQLITE_ALTERNATING_TRANSFERS as i64);
    assert_eq!(report.entry_count, 2 * SQLITE_ALTERNATING_TRANSFERS as i64);
    assert_eq!(report.entry_net, 0);
    assert_eq!(report.balance_by_currency.get(&Currency::Usd), Some(&150));
    Ok(())
}

// ========================
// In-memory store
// ========================

#[tokio::test]
async fn test_lock_order_is_independent_of_direction() {
    let store = MemoryStore::new();
    let a = store.create_account("alice", Currency::Usd, 100);
    let b = store.create_account("bob", Currency::Usd, 50);
    let service = memory_service(&store);

    service.transfer(a.id, b.id, 10).await.unwrap();
    service.transfer(b.id, a.id, 10).await.unwrap();

    let log = store.lock_log();
    assert_eq!(locks_of(&log, 1), vec![a.id, b.id]);
    assert_eq!(locks_of(&log, 2), vec![a.id, b.id]);
}

#[tokio::test]
async fn test_fault_after_entries_rolls_back_everything() {
    let store = MemoryStore::new();
    let a = store.create_account("alice", Currency::Usd, 100);
    let b = store.create_account("bob", Currency::Usd, 50);
    store.fail_next(
        Operation::AddAccountBalance,
        StoreError::Query("disk full".into()),
    );

    let err = memory_service(&store)
        .transfer(a.id, b.id, 30)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Database(_)));
    assert_eq!(store.account(a.id).unwrap().balance, 100);
    assert_eq!(store.account(b.id).unwrap().balance, 50);
    assert!(store.transfers().is_empty());
    assert!(store.entries().is_empty());
}

#[tokio::test]
async fn test_fault_on_second_balance_update_rolls_back_first() {
    let store = MemoryStore::new();
    let a = store.create_account("alice", Currency::Usd, 100);
    let b = store.create_account("bob", Currency::Usd, 50);

    // Fail after the first balance update has been staged.
    let result: Result<(), AppError> = store
        .execute(move |q| {
            boxed(async move {
                q.create_transfer(a.id, b.id, 30).await?;
                q.create_entry(a.id, -30).await?;
                q.create_entry(b.id, 30).await?;
                q.add_account_balance(a.id, -30).await?;
                Err(AppError::Connectivity("connection reset".into()))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(store.account(a.id).unwrap().balance, 100);
    assert!(store.entries().is_empty());

    // Locks were released with the rolled back transaction.
    memory_service(&store).transfer(b.id, a.id, 5).await.unwrap();
    assert_eq!(store.account(a.id).unwrap().balance, 105);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alternating_transfers_do_not_deadlock() {
    let store = MemoryStore::new();
    let a = store.create_account("alice", Currency::Usd, 1_000);
    let b = store.create_account("bob", Currency::Usd, 1_000);
    let service = memory_service(&store);

    let mut tasks = JoinSet::new();
    for n in 0..MEMORY_ALTERNATING_TRANSFERS {
        let service = service.clone();
        let (from, to) = if n % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        tasks.spawn(async move { service.transfer(from, to, 7).await });
    }

    let all_done = async {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(10), all_done)
        .await
        .expect("transfers deadlocked");

    assert_eq!(store.account(a.id).unwrap().balance, 1_000);
    assert_eq!(store.account(b.id).unwrap().balance, 1_000);
    assert_eq!(store.total_balance(), 2_000);
    assert_eq!(store.transfers().len() as u64, MEMORY_ALTERNATING_TRANSFERS);

    // Every transaction took the lower id first.
    let log = store.lock_log();
    for tx_id in 1..=MEMORY_ALTERNATING_TRANSFERS {
        assert_eq!(locks_of(&log, tx_id), vec![a.id, b.id]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conservation_across_many_accounts() {
    let store = MemoryStore::new();
    let accounts: Vec<_> = (0..5)
        .map(|n| store.create_account(&format!("owner-{n}"), Currency::Eur, 500))
        .collect();
    let service = memory_service(&store);

    let mut tasks = JoinSet::new();
    for n in 0..100usize {
        let service = service.clone();
        let from = accounts[n % 5].id;
        let to = accounts[(n * 3 + 1) % 5].id;
        let amount = (n as i64 % 13) + 1;
        tasks.spawn(async move { service.transfer(from, to, amount).await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    assert_eq!(store.total_balance(), 2_500);
    assert_eq!(store.entries().iter().map(|e| e.amount).sum::<i64>(), 0);
    assert_eq!(store.entries().len(), 200);
}

/// The double really deadlocks when two transactions lock in opposite order,
/// so the tests above would catch a missing ordering rule.
#[tokio::test]
async fn test_opposite_lock_order_deadlocks_in_memory_store() {
    let store = MemoryStore::new();
    let a = store.create_account("alice", Currency::Usd, 100);
    let b = store.create_account("bob", Currency::Usd, 50);
    let barrier = Arc::new(Barrier::new(2));

    let lock_pair = |first: AccountId, second: AccountId| {
        let barrier = Arc::clone(&barrier);
        store.execute(move |q| {
            boxed(async move {
                q.add_account_balance(first, -1).await?;
                barrier.wait().await;
                q.add_account_balance(second, 1).await?;
                Ok::<_, StoreError>(())
            })
        })
    };

    let both = async { tokio::join!(lock_pair(a.id, b.id), lock_pair(b.id, a.id)) };
    let outcome = tokio::time::timeout(Duration::from_millis(200), both).await;
    assert!(outcome.is_err(), "opposite lock order should block");

    // Dropping the stuck transactions released their locks and staged writes.
    assert_eq!(store.account(a.id).unwrap().balance, 100);
    memory_service(&store).transfer(a.id, b.id, 10).await.unwrap();
    assert_eq!(store.account(b.id).unwrap().balance, 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_while_waiting_on_row_lock_rolls_back() {
    let store = MemoryStore::new();
    let a = store.create_account("alice", Currency::Usd, 100);
    let b = store.create_account("bob", Currency::Usd, 50);

    // Another transaction holds bob's row until told to finish.
    let (locked_tx, locked_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let holder_store = store.clone();
    let holder = tokio::spawn(async move {
        holder_store
            .execute(move |q| {
                boxed(async move {
                    q.add_account_balance(b.id, 0).await?;
                    let _ = locked_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, StoreError>(())
                })
            })
            .await
    });
    locked_rx.await.unwrap();

    let limit = Duration::from_millis(50);
    let service = TransferService::new(
        store.clone(),
        TransferPolicy::default().timeout(Some(limit)),
        Arc::new(TransferMetrics::new()),
    );

    let err = service.transfer(a.id, b.id, 30).await.unwrap_err();

    assert!(err.kind().is_retryable());
    match err {
        AppError::Timeout(elapsed) => assert_eq!(elapsed, limit),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(store.account(a.id).unwrap().balance, 100);
    assert_eq!(store.account(b.id).unwrap().balance, 50);
    assert!(store.transfers().is_empty());
    assert!(store.entries().is_empty());
    assert_eq!(service.metrics().snapshot().transfers_failed, 1);

    release_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();

    let result = service.transfer(a.id, b.id, 30).await.unwrap();
    assert_eq!(result.from_account.balance, 70);
    assert_eq!(result.to_account.balance, 80);
    assert_eq!(store.transfers().len(), 1);
}
