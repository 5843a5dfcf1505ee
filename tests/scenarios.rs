//! End-to-end admission scenarios across buckets, groups, stores and the
//! limiter facade.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;

use quotaguard::error::{QuotaError, Result};
use quotaguard::ratelimit::{
    Bucket, BucketGroup, CapacityGroup, DistributedBucketGroup, FixedCost, LimitSettings,
    LockPolicy, RateLimiter,
};
use quotaguard::store::{LockOptions, MemoryStore, SharedStore};

const T0: f64 = 1_700_000_000.0;
const WINDOW: Duration = Duration::from_secs(1);

fn shared_group(
    store: &Arc<MemoryStore>,
    namespace: &str,
    rate_limit: f64,
    policy: LockPolicy,
) -> DistributedBucketGroup<1> {
    DistributedBucketGroup::from_limits(
        store.clone(),
        namespace,
        [("requests", rate_limit)],
        WINDOW,
        policy,
        LockOptions::default(),
    )
}

#[test]
fn test_single_resource_refills_after_one_second() {
    let group = BucketGroup::new([Bucket::new(60.0, WINDOW, T0)]);

    assert!(group.try_consume_at(&[1.0], T0));
    assert!(!group.try_consume_at(&[1.0], T0));
    assert_eq!(group.capacities_at(T0), [0.0]);
    assert!(group.try_consume_at(&[1.0], T0 + 1.0));
}

#[test]
fn test_dual_resource_admission_is_conjunctive() {
    let group = BucketGroup::new([
        Bucket::new(3500.0, WINDOW, T0),
        Bucket::new(90_000.0, WINDOW, T0),
    ]);

    // Leave plenty of requests but only 50 tokens
    assert!(group.try_consume_at(&[1.0, 1450.0], T0));
    assert!(!group.try_consume_at(&[1.0, 100.0], T0));

    // The denied attempt took nothing from the request bucket
    let [requests, tokens] = group.capacities_at(T0);
    assert!((requests - (3500.0 / 60.0 - 1.0)).abs() < 1e-9);
    assert_eq!(tokens, 50.0);

    // 50 more tokens arrive after 50 / 1500 seconds
    assert!(!group.try_consume_at(&[1.0, 100.0], T0 + 0.03));
    assert!(group.try_consume_at(&[1.0, 100.0], T0 + 0.04));
}

#[tokio::test]
async fn test_dual_resource_waiter_polls_until_tokens_recover() {
    let limiter =
        RateLimiter::local(LimitSettings::new(3500, 90_000), Arc::new(FixedCost(100))).unwrap();

    // Drain the token bucket while leaving request capacity
    limiter.wait_for_capacity(1500).await.unwrap();

    let start = Instant::now();
    limiter.wait_for_capacity(100).await.unwrap();

    // 100 tokens take 1/15 s to replenish
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_strict_instances_never_jointly_over_admit() {
    let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(1)));
    // Two instances configured independently, sharing only the namespace
    let first = shared_group(&store, "shared", 600.0, LockPolicy::Strict);
    let second = shared_group(&store, "shared", 600.0, LockPolicy::Strict);
    let capacity_max = first.capacity_limits()[0];

    let contenders = [&first, &second].into_iter().flat_map(|group| {
        (0..8).map(move |_| async move { group.try_consume_at(&[1.0], T0).await })
    });
    let outcomes = join_all(contenders).await;

    let admitted = outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .filter(|admitted| *admitted)
        .count() as f64;
    assert!(admitted <= capacity_max);
    assert_eq!(admitted, capacity_max);
}

#[tokio::test]
async fn test_strict_uneven_amounts_stay_within_capacity() {
    let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(1)));
    let first = shared_group(&store, "uneven", 300.0, LockPolicy::Strict);
    let second = shared_group(&store, "uneven", 300.0, LockPolicy::Strict);

    let (a, b) = futures::join!(
        first.try_consume_at(&[3.0], T0),
        second.try_consume_at(&[4.0], T0),
    );

    let total: f64 = [(a.unwrap(), 3.0), (b.unwrap(), 4.0)]
        .iter()
        .filter(|(admitted, _)| *admitted)
        .map(|(_, amount)| amount)
        .sum();
    assert!(total <= first.capacity_limits()[0]);
    assert!(total > 0.0);
}

#[tokio::test]
async fn test_best_effort_over_admission_is_bounded() {
    for round in 0..5 {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(2)));
        let namespace = format!("race-{}", round);
        let first = shared_group(&store, &namespace, 240.0, LockPolicy::BestEffort);
        let second = shared_group(&store, &namespace, 240.0, LockPolicy::BestEffort);
        let capacity_max = first.capacity_limits()[0];

        let amounts = [3.0, 2.0];
        let first_amounts = [amounts[0]];
        let second_amounts = [amounts[1]];
        let (a, b) = futures::join!(
            first.try_consume_at(&first_amounts, T0),
            second.try_consume_at(&second_amounts, T0),
        );

        let joint: f64 = [a.unwrap(), b.unwrap()]
            .iter()
            .zip(amounts.iter())
            .filter(|(admitted, _)| **admitted)
            .map(|(_, amount)| amount)
            .sum();
        assert!(joint > 0.0);
        assert!(joint <= capacity_max + amounts[0].min(amounts[1]));

        // Whatever the racers left behind is still admissible at the same
        // instant, including a decrement lost to the later write
        let mut drained = 0.0;
        while first.try_consume_at(&[1.0], T0).await.unwrap() {
            drained += 1.0;
        }

        let total = joint + drained;
        assert!(total >= capacity_max);
        assert!(total <= capacity_max + amounts[0].max(amounts[1]));
    }
}

#[tokio::test]
async fn test_distributed_limiter_shares_quota_between_instances() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let settings = LimitSettings::new(60, 6000);
    let make = || {
        RateLimiter::distributed(
            settings,
            Arc::new(FixedCost(10)),
            store.clone(),
            "team",
            LockPolicy::Strict,
            LockOptions::default(),
        )
        .unwrap()
    };
    let first = make();
    let second = make();

    first.wait_for_capacity(10).await.unwrap();

    // The single request slot is spent for both instances
    let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
    let err = second.wait_for_capacity_until(10, deadline).await.unwrap_err();
    assert!(matches!(err, QuotaError::DeadlineExceeded));
}

/// A store whose every command fails as if the server were gone.
struct UnreachableStore;

fn connection_refused() -> QuotaError {
    QuotaError::from(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl SharedStore for UnreachableStore {
    async fn get_many(&self, _keys: &[String]) -> Result<Vec<Option<String>>> {
        Err(connection_refused())
    }

    async fn set_many(&self, _entries: &[(String, String)]) -> Result<()> {
        Err(connection_refused())
    }

    async fn try_lock(&self, _name: &str, _token: &str, _lease: Duration) -> Result<bool> {
        Err(connection_refused())
    }

    async fn unlock(&self, _name: &str, _token: &str) -> Result<bool> {
        Err(connection_refused())
    }
}

#[tokio::test]
async fn test_store_failure_surfaces_instead_of_waiting() {
    for policy in [LockPolicy::Strict, LockPolicy::BestEffort] {
        let limiter = RateLimiter::distributed(
            LimitSettings::new(60, 6000),
            Arc::new(FixedCost(1)),
            Arc::new(UnreachableStore),
            "down",
            policy,
            LockOptions::default(),
        )
        .unwrap();

        let err = limiter.wait_for_capacity(1).await.unwrap_err();
        assert!(matches!(err, QuotaError::Store(_)));
        assert!(err.is_retryable());
    }
}

#[tokio::test]
async fn test_held_lock_reports_unavailable() {
    let store = Arc::new(MemoryStore::new());
    let options = LockOptions {
        lease: Duration::from_secs(5),
        acquire_timeout: Duration::from_millis(50),
        retry_interval: Duration::from_millis(5),
    };
    let group = DistributedBucketGroup::from_limits(
        store.clone(),
        "busy",
        [("requests", 60.0)],
        WINDOW,
        LockPolicy::Strict,
        options,
    );

    assert!(store
        .try_lock(&group.lock_key(), "someone-else", Duration::from_secs(5))
        .await
        .unwrap());

    let err = group.try_consume_at(&[1.0], T0).await.unwrap_err();
    assert!(matches!(err, QuotaError::LockUnavailable { .. }));
}
