use std::sync::Arc;
use std::time::Duration;
use worker_lease::storage::memory::MemoryStorage;
use worker_lease::{
    DistributedLock, DistributedLockError, DistributedLockStore, StoreOptions, SystemClock,
    TokioClock,
};

#[tokio::test]
async fn only_one_of_many_racing_locks_wins() {
    let store: Arc<dyn DistributedLockStore> = Arc::new(MemoryStorage::new(Arc::new(SystemClock)));
    let locks: Vec<_> = (0..8).map(|_| Arc::new(DistributedLock::new(store.clone()))).collect();

    let attempts: Vec<_> = locks
        .iter()
        .cloned()
        .map(|lock| tokio::spawn(async move { lock.acquire("billing-export").await }))
        .collect();

    let mut guards = Vec::new();
    let mut lost = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(guard) => guards.push(guard),
            Err(DistributedLockError::NotAcquired { source: None, .. }) => lost += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(guards.len(), 1);
    assert_eq!(guards[0].lock_name(), "billing-export");
    assert_eq!(lost, 7);
    for guard in guards {
        guard.release().await;
    }
}

#[tokio::test]
async fn distinct_names_do_not_contend() {
    let store: Arc<dyn DistributedLockStore> = Arc::new(MemoryStorage::new(Arc::new(SystemClock)));
    let (first, second) = (DistributedLock::new(store.clone()), DistributedLock::new(store));

    let a = first.acquire("billing-export").await.unwrap();
    let b = second.acquire("ledger-rollup").await.unwrap();

    a.release().await;
    b.release().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_claim_becomes_reclaimable_after_ttl() {
    let clock = Arc::new(TokioClock::starting_at(chrono::Utc::now()));
    let options = StoreOptions {
        lock_claim_ttl: Some(Duration::from_secs(30)),
        ..StoreOptions::default()
    };
    let store: Arc<dyn DistributedLockStore> = Arc::new(MemoryStorage::with_options(clock, options));
    let (first, second) = (DistributedLock::new(store.clone()), DistributedLock::new(store));

    // held guard whose release never reaches the store
    let guard = first.acquire("billing-export").await.unwrap();
    std::mem::forget(guard);

    assert!(matches!(
        second.acquire("billing-export").await,
        Err(DistributedLockError::NotAcquired { .. })
    ));

    tokio::time::sleep(Duration::from_secs(31)).await;
    let guard = second.acquire("billing-export").await.unwrap();
    guard.release().await;
}
