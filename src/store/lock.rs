//! Leased mutual-exclusion locks held in the shared store.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::SharedStore;
use crate::error::{QuotaError, Result};

/// Timing parameters for leased locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long a held lock survives if its holder never releases it
    pub lease: Duration,
    /// How long to keep retrying before reporting the lock unavailable
    pub acquire_timeout: Duration,
    /// Base delay between acquisition attempts (a random jitter of up to the
    /// same amount is added)
    pub retry_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(10),
        }
    }
}

/// A lock currently held by this process.
///
/// Dropping a `StoreLock` does not release it; call
/// [`release`](StoreLock::release) or let the lease run out.
#[derive(Debug)]
#[must_use = "a held lock blocks other processes until released or expired"]
pub struct StoreLock {
    name: String,
    token: String,
}

impl StoreLock {
    /// Name of the lock key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock if this holder still owns it.
    pub async fn release(self, store: &dyn SharedStore) -> Result<bool> {
        let released = store.unlock(&self.name, &self.token).await?;
        if released {
            trace!(lock = %self.name, "Released lock");
        } else {
            warn!(lock = %self.name, "Lock lease expired before release");
        }
        Ok(released)
    }
}

/// Acquire the lock `name`, retrying until `options.acquire_timeout`.
///
/// Fails with [`QuotaError::LockUnavailable`] rather than proceeding without
/// the lock.
pub async fn acquire_lock(
    store: &dyn SharedStore,
    name: &str,
    options: &LockOptions,
) -> Result<StoreLock> {
    let token = uuid::Uuid::new_v4().to_string();
    let started = Instant::now();
    let retry_ms = options.retry_interval.as_millis() as u64;

    loop {
        if store.try_lock(name, &token, options.lease).await? {
            trace!(lock = %name, waited_ms = started.elapsed().as_millis() as u64, "Acquired lock");
            return Ok(StoreLock {
                name: name.to_string(),
                token,
            });
        }

        let waited = started.elapsed();
        if waited >= options.acquire_timeout {
            debug!(lock = %name, waited_ms = waited.as_millis() as u64, "Lock unavailable");
            return Err(QuotaError::LockUnavailable {
                lock: name.to_string(),
                waited,
            });
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=retry_ms);
        tokio::time::sleep(options.retry_interval + Duration::from_millis(jitter_ms)).await;
    }
}
