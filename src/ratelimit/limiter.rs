//! Rate limiter facade enforcing a request quota and a token quota together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::backend::CapacityGroup;
use super::distributed::{DistributedBucketGroup, LockPolicy};
use super::estimator::{CallKind, CallShape, CostEstimator, TokenEstimator};
use super::group::BucketGroup;
use crate::error::{QuotaError, Result};
use crate::store::{LockOptions, SharedStore};

/// Resource name of the request-count dimension.
pub const REQUESTS_RESOURCE: &str = "requests";
/// Resource name of the token-cost dimension.
pub const TOKENS_RESOURCE: &str = "tokens";

/// Default integration window in seconds.
const DEFAULT_BUCKET_SIZE_SECS: f64 = 1.0;

fn default_bucket_size_secs() -> f64 {
    DEFAULT_BUCKET_SIZE_SECS
}

/// Per-minute quotas and the bucket integration window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Requests allowed per minute
    pub request_limit: u64,
    /// Tokens allowed per minute
    pub token_limit: u64,
    /// How many seconds of quota a bucket can hold
    #[serde(default = "default_bucket_size_secs")]
    pub bucket_size_secs: f64,
}

impl LimitSettings {
    /// Limits with the default one-second window.
    pub fn new(request_limit: u64, token_limit: u64) -> Self {
        Self {
            request_limit,
            token_limit,
            bucket_size_secs: DEFAULT_BUCKET_SIZE_SECS,
        }
    }

    /// Provider defaults for a call kind.
    pub fn for_kind(kind: CallKind) -> Self {
        let (request_limit, token_limit) = kind.default_limits();
        Self::new(request_limit, token_limit)
    }

    /// Replace the integration window.
    pub fn with_bucket_size(mut self, bucket_size_secs: f64) -> Self {
        self.bucket_size_secs = bucket_size_secs;
        self
    }

    /// Reject limits that would make a bucket unusable.
    pub fn validate(&self) -> Result<()> {
        if self.request_limit == 0 {
            return Err(QuotaError::Config("request_limit must be positive".to_string()));
        }
        if self.token_limit == 0 {
            return Err(QuotaError::Config("token_limit must be positive".to_string()));
        }
        self.bucket_size()?;
        Ok(())
    }

    /// The integration window, rejected if it is not a positive duration.
    pub fn bucket_size(&self) -> Result<Duration> {
        match Duration::try_from_secs_f64(self.bucket_size_secs) {
            Ok(window) if !window.is_zero() => Ok(window),
            _ => Err(QuotaError::Config(format!(
                "bucket_size_secs must be a positive number of seconds, got {}",
                self.bucket_size_secs
            ))),
        }
    }

    /// Sleep between attempts: on average one request slot replenishes per
    /// interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / self.request_limit as f64)
    }

    /// Per-minute limits in dimension order.
    fn rate_limits(&self) -> [f64; 2] {
        [self.request_limit as f64, self.token_limit as f64]
    }
}

/// Proof that a call was admitted.
///
/// Capacity is consumed on admission, so there is nothing to give back: the
/// value can simply be dropped once the call has been made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an admission is only useful if the admitted call is then made"]
pub struct Admission {
    cost: u64,
}

impl Admission {
    /// Tokens charged for the admitted call.
    pub fn cost(&self) -> u64 {
        self.cost
    }
}

/// Admission control for a rate-limited API.
///
/// Every call consumes one unit of the request bucket and its estimated cost
/// from the token bucket, all or nothing. The group `G` decides whether the
/// buckets live in this process or in a shared store. Waiters are not served
/// in arrival order.
pub struct RateLimiter<G> {
    settings: LimitSettings,
    estimator: Arc<dyn CostEstimator>,
    group: G,
    poll_interval: Duration,
}

/// A limiter whose buckets live in this process.
pub type LocalRateLimiter = RateLimiter<BucketGroup<2>>;

/// A limiter whose buckets live in a shared store.
pub type DistributedRateLimiter = RateLimiter<DistributedBucketGroup<2>>;

impl<G: std::fmt::Debug> std::fmt::Debug for RateLimiter<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("settings", &self.settings)
            .field("group", &self.group)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl RateLimiter<BucketGroup<2>> {
    /// Create an in-process limiter.
    pub fn local(settings: LimitSettings, estimator: Arc<dyn CostEstimator>) -> Result<Self> {
        settings.validate()?;
        let group = BucketGroup::from_limits(settings.rate_limits(), settings.bucket_size()?);
        Self::with_group(settings, estimator, group)
    }

    /// In-process limiter with the provider defaults and token estimator for
    /// `kind`.
    pub fn for_kind(kind: CallKind) -> Result<Self> {
        Self::local(LimitSettings::for_kind(kind), Arc::new(TokenEstimator::new(kind)?))
    }
}

impl RateLimiter<DistributedBucketGroup<2>> {
    /// Create a limiter sharing its quota with every instance that uses the
    /// same store and `bucket_key`.
    pub fn distributed(
        settings: LimitSettings,
        estimator: Arc<dyn CostEstimator>,
        store: Arc<dyn SharedStore>,
        bucket_key: &str,
        policy: LockPolicy,
        lock_options: LockOptions,
    ) -> Result<Self> {
        settings.validate()?;
        let bucket_size = settings.bucket_size()?;
        if bucket_key.is_empty() {
            return Err(QuotaError::Config("bucket_key must not be empty".to_string()));
        }

        let [request_limit, token_limit] = settings.rate_limits();
        let group = DistributedBucketGroup::from_limits(
            store,
            bucket_key,
            [
                (REQUESTS_RESOURCE, request_limit),
                (TOKENS_RESOURCE, token_limit),
            ],
            bucket_size,
            policy,
            lock_options,
        );
        Self::with_group(settings, estimator, group)
    }

    /// Shared limiter with the provider defaults, token estimator and default
    /// namespace for `kind`.
    pub fn for_kind_distributed(
        kind: CallKind,
        store: Arc<dyn SharedStore>,
        policy: LockPolicy,
    ) -> Result<Self> {
        Self::distributed(
            LimitSettings::for_kind(kind),
            Arc::new(TokenEstimator::new(kind)?),
            store,
            kind.default_bucket_key(),
            policy,
            LockOptions::default(),
        )
    }
}

impl<G: CapacityGroup<2>> RateLimiter<G> {
    /// Wire an estimator to an existing two-dimensional group
    /// (requests first, tokens second).
    pub fn with_group(
        settings: LimitSettings,
        estimator: Arc<dyn CostEstimator>,
        group: G,
    ) -> Result<Self> {
        settings.validate()?;
        let poll_interval = settings.poll_interval();
        debug!(
            request_limit = settings.request_limit,
            token_limit = settings.token_limit,
            bucket_size_secs = settings.bucket_size_secs,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Rate limiter created"
        );
        Ok(Self {
            settings,
            estimator,
            group,
            poll_interval,
        })
    }

    /// The configured limits.
    pub fn settings(&self) -> &LimitSettings {
        &self.settings
    }

    /// Sleep between admission attempts.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The underlying bucket group.
    pub fn group(&self) -> &G {
        &self.group
    }

    /// Price a call without admitting it.
    pub fn estimate(&self, shape: &CallShape) -> Result<u64> {
        self.estimator.estimate(shape)
    }

    /// Current `[requests, tokens]` capacity.
    pub async fn capacities(&self) -> Result<[f64; 2]> {
        self.group.capacities().await
    }

    /// Wait until one request and `cost` tokens can be consumed, then
    /// consume them.
    pub async fn wait_for_capacity(&self, cost: u64) -> Result<()> {
        self.group
            .wait_for_capacity(&amounts(cost), self.poll_interval)
            .await
    }

    /// Thread-blocking form of [`wait_for_capacity`](Self::wait_for_capacity).
    ///
    /// For a distributed group this runs its own runtime and panics if called
    /// from inside a tokio runtime; use the async form there.
    pub fn wait_for_capacity_blocking(&self, cost: u64) -> Result<()> {
        self.group
            .wait_for_capacity_blocking(&amounts(cost), self.poll_interval)
    }

    /// Wait for capacity unless `shutdown` resolves first.
    pub async fn wait_for_capacity_with_shutdown<F>(&self, cost: u64, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.group
            .wait_for_capacity_with_shutdown(&amounts(cost), self.poll_interval, shutdown)
            .await
    }

    /// Wait for capacity until `deadline`.
    pub async fn wait_for_capacity_until(
        &self,
        cost: u64,
        deadline: tokio::time::Instant,
    ) -> Result<()> {
        self.group
            .wait_for_capacity_until(&amounts(cost), self.poll_interval, deadline)
            .await
    }

    /// Price `shape` and wait until one request and its cost are consumed.
    ///
    /// Returns the cost charged.
    #[instrument(skip(self, shape), fields(kind = %shape.kind()))]
    pub async fn admit(&self, shape: &CallShape) -> Result<u64> {
        let cost = self.estimate(shape)?;
        self.wait_for_capacity(cost).await?;
        debug!(cost = cost, "Call admitted");
        Ok(cost)
    }

    /// Scoped form of [`admit`](Self::admit).
    pub async fn limit(&self, shape: &CallShape) -> Result<Admission> {
        let cost = self.admit(shape).await?;
        Ok(Admission { cost })
    }

    /// Thread-blocking form of [`limit`](Self::limit).
    ///
    /// Same runtime caveat as
    /// [`wait_for_capacity_blocking`](Self::wait_for_capacity_blocking).
    #[instrument(skip(self, shape), fields(kind = %shape.kind()))]
    pub fn limit_blocking(&self, shape: &CallShape) -> Result<Admission> {
        let cost = self.estimate(shape)?;
        self.wait_for_capacity_blocking(cost)?;
        debug!(cost = cost, "Call admitted");
        Ok(Admission { cost })
    }

    /// Admit `shape`, then run `call`.
    pub async fn run_limited<F, T>(&self, shape: &CallShape, call: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _admission = self.limit(shape).await?;
        Ok(call.await)
    }

    /// Admit `shape` (blocking), then run `call`.
    pub fn run_limited_blocking<F, T>(&self, shape: &CallShape, call: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let _admission = self.limit_blocking(shape)?;
        Ok(call())
    }
}

/// Bucket amounts for one call of `cost` tokens.
fn amounts(cost: u64) -> [f64; 2] {
    [1.0, cost as f64]
}
