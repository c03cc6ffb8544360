//! Per-key failure backoff for requeues.

#![forbid(unsafe_code)]

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Decides how long a failed key waits before it is added again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next requeue of `key`; records one more failure.
    fn when(&self, key: &K) -> Duration;
    fn forget(&self, key: &K);
    fn num_requeues(&self, key: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`.
pub struct ExponentialBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash> ExponentialBackoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Eq + Hash> Default for ExponentialBackoff<K> {
    fn default() -> Self { Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY) }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ExponentialBackoff<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let base = u64::try_from(self.base.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(base.saturating_mul(factor)).min(self.max)
    }

    fn forget(&self, key: &K) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied().unwrap_or(0)
    }
}
