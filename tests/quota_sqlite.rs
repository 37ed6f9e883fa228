#![cfg(feature = "store-sqlite")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use outreach_quota::{
    AccountKey, Clock, DegradeReason, GuardConfig, GuardParts, ManualClock, MemoryCacheBackend,
    Meter, MeteredOutput, QuotaGuard, SqliteUsageStore, UsageRecord, UsageStore,
};

const NOON_2024_03_01: u64 = 1_709_294_400;

async fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteUsageStore> {
    let store = SqliteUsageStore::new(dir.path().join("usage.sqlite"))
        .with_timeout(Duration::from_secs(10));
    store.init().await.expect("init");
    Arc::new(store)
}

fn guard_on(store: Arc<SqliteUsageStore>, clock: Arc<ManualClock>) -> QuotaGuard {
    QuotaGuard::with_parts(
        GuardConfig::default(),
        GuardParts {
            cache_backend: Arc::new(MemoryCacheBackend::new(clock.clone())),
            clock,
            store,
        },
    )
}

fn account(raw: &str) -> AccountKey {
    AccountKey::parse(raw).expect("account")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_sum_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let acct = account("busy@example.com");
    let day = ManualClock::new(NOON_2024_03_01).today();

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let store = Arc::clone(&store);
        let acct = acct.clone();
        tasks.push(tokio::spawn(async move {
            store.increment(&acct, day, Meter::GenerationTokens, 1).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("increment");
    }

    let row = store.read(&acct, day).await.expect("read").expect("row");
    assert_eq!(row.generation_tokens, 100);
    assert_eq!(row.news_lookups, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_guard_increments_sum_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let clock = Arc::new(ManualClock::new(NOON_2024_03_01));
    let guard = Arc::new(guard_on(store.clone(), clock.clone()));
    let acct = account("busy@example.com");

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let guard = Arc::clone(&guard);
        let acct = acct.clone();
        tasks.push(tokio::spawn(async move {
            guard.record_usage(&acct, Meter::NewsLookups, 1).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("record");
    }

    let status = guard.check_limits(&acct).await.expect("check");
    assert_eq!(status.news_lookups_used, 50);
}

#[tokio::test]
async fn first_check_of_the_day_creates_zero_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let clock = Arc::new(ManualClock::new(NOON_2024_03_01));
    let guard = guard_on(store.clone(), clock.clone());
    let acct = account("fresh@example.com");

    assert!(store.read(&acct, clock.today()).await.expect("read").is_none());

    let status = guard.check_limits(&acct).await.expect("check");
    assert_eq!(status.generation_tokens_used, 0);
    assert_eq!(status.news_lookups_used, 0);
    assert!(!status.generation_tokens_limit_reached);
    assert!(!status.news_lookups_limit_reached);

    let row = store.read(&acct, clock.today()).await.expect("read");
    assert_eq!(row, Some(UsageRecord::zero(acct, clock.today())));
}

#[tokio::test]
async fn ninety_sixth_lookup_is_refused_before_the_call() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let clock = Arc::new(ManualClock::new(NOON_2024_03_01));
    let guard = guard_on(store.clone(), clock.clone());
    let acct = account("reporter@example.com");
    let calls = AtomicUsize::new(0);
    let lookup = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(MeteredOutput::new(vec!["headline".to_string()], 1))
    };

    for _ in 0..95 {
        let outcome = guard
            .run_metered(&acct, Meter::NewsLookups, lookup, |_| Vec::new())
            .await
            .expect("run");
        assert!(!outcome.is_degraded());
    }
    let status = guard.check_limits(&acct).await.expect("check");
    assert!(status.news_lookups_limit_reached);
    assert!(!status.generation_tokens_limit_reached);

    let outcome = guard
        .run_metered(&acct, Meter::NewsLookups, lookup, |_| Vec::new())
        .await
        .expect("run");
    assert_eq!(
        outcome.degrade_reason(),
        Some(DegradeReason::LimitReached(Meter::NewsLookups))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 95);

    let row = store
        .read(&acct, clock.today())
        .await
        .expect("read")
        .expect("row");
    assert_eq!(row.news_lookups, 95);
}

#[tokio::test]
async fn limit_clears_on_the_next_utc_day() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open_store(&dir).await;
    let clock = Arc::new(ManualClock::new(NOON_2024_03_01));
    let guard = guard_on(store.clone(), clock.clone());
    let acct = account("reporter@example.com");

    guard
        .record_usage(&acct, Meter::GenerationTokens, 100_000)
        .await
        .expect("record");
    assert!(guard.check_limits(&acct).await.expect("check").generation_tokens_limit_reached);

    clock.advance(Duration::from_secs(12 * 60 * 60));
    let status = guard.check_limits(&acct).await.expect("check");
    assert!(!status.generation_tokens_limit_reached);
    assert_eq!(status.generation_tokens_used, 0);

    let days = store.list_for_date(status.date).await.expect("list");
    assert_eq!(days.len(), 1);
}

#[tokio::test]
async fn counters_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let acct = account("durable@example.com");
    let day = ManualClock::new(NOON_2024_03_01).today();

    {
        let store = open_store(&dir).await;
        store
            .increment(&acct, day, Meter::GenerationTokens, 750)
            .await
            .expect("increment");
    }

    let reopened = open_store(&dir).await;
    let row = reopened.read(&acct, day).await.expect("read").expect("row");
    assert_eq!(row.generation_tokens, 750);
}
