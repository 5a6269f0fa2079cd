//! Per-key rate limiters that come and go with their keys.
//!
//! A [`KeyedRateLimiter`] creates a limiter the first time a key is seen and
//! evicts it once it has been idle (full capacity, nobody waiting) for a
//! grace period. Eviction is scheduled by one of two interchangeable
//! [`EvictionScheduler`]s.

mod heap;
mod registry;
mod task;

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

pub use heap::HeapScheduler;
pub use registry::LimiterFactory;
pub use task::TaskScheduler;

use registry::Registry;

use crate::config::{EvictionStrategy, KeyedConfig, LimiterConfig};
use crate::error::Result;
use crate::ratelimit::{Limiter, RateLimiter};

/// Default time an idle limiter is retained.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Schedules eviction checks for idle per-key limiters.
pub trait EvictionScheduler<K, L>: Send + Sync {
    /// (Re)schedule the eviction check for `limiter`, superseding any earlier
    /// schedule for `key`.
    fn schedule(&self, key: &K, limiter: &Arc<L>);

    /// Whether an eviction check is pending for this exact instance.
    fn watches(&self, key: &K, limiter: &Arc<L>) -> bool;

    /// Whether any eviction check is pending for `key`.
    fn is_scheduled(&self, key: &K) -> bool;

    /// Number of keys with a pending eviction check.
    fn scheduled_len(&self) -> usize;
}

/// Time from now until `limiter` may be evicted, if left alone.
pub(crate) fn idle_deadline<L: RateLimiter>(limiter: &L, grace_period: Duration) -> Duration {
    match limiter.time_to_unused() {
        Ok(until_unused) => until_unused.saturating_add(grace_period),
        Err(e) => {
            warn!(error = %e, "Could not compute time to unused, retrying after grace period");
            grace_period
        }
    }
}

/// Shortest wait before looking again at a limiter that was busy at its deadline.
pub(crate) const RECHECK_FLOOR: Duration = Duration::from_millis(1);

/// Like [`idle_deadline`], but never zero, so a busy limiter is not polled in
/// a tight loop when the grace period is zero.
pub(crate) fn recheck_deadline<L: RateLimiter>(limiter: &L, grace_period: Duration) -> Duration {
    idle_deadline(limiter, grace_period).max(RECHECK_FLOOR)
}

/// A registry of lazily created, lazily evicted limiters, one per key.
///
/// Must be used from within a Tokio runtime: eviction runs on background
/// tasks, which are aborted when the registry is dropped.
pub struct KeyedRateLimiter<K, L> {
    registry: Arc<Registry<K, L>>,
    scheduler: Box<dyn EvictionScheduler<K, L>>,
    grace_period: Duration,
}

impl<K, L> KeyedRateLimiter<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    /// Create a keyed limiter using the heap-scheduled eviction strategy.
    pub fn new<F>(factory: F, grace_period: Duration) -> Self
    where
        F: Fn(&K) -> Result<L> + Send + Sync + 'static,
    {
        Self::with_strategy(factory, grace_period, EvictionStrategy::Heap)
    }

    /// Create a keyed limiter with an explicit eviction strategy.
    pub fn with_strategy<F>(factory: F, grace_period: Duration, strategy: EvictionStrategy) -> Self
    where
        F: Fn(&K) -> Result<L> + Send + Sync + 'static,
    {
        let registry = Arc::new(Registry::new(Box::new(factory)));
        let scheduler: Box<dyn EvictionScheduler<K, L>> = match strategy {
            EvictionStrategy::Task => Box::new(TaskScheduler::new(registry.clone(), grace_period)),
            EvictionStrategy::Heap => Box::new(HeapScheduler::new(registry.clone(), grace_period)),
        };

        Self {
            registry,
            scheduler,
            grace_period,
        }
    }

    /// Wait until `amount` can be consumed from `key`'s limiter.
    pub async fn acquire(&self, key: &K, amount: f64) -> Result<()> {
        let pinned = self.registry.pin(key)?;
        // Cover the wait itself: if this future is dropped mid-wait there is
        // no rescheduling afterwards.
        if !self.scheduler.watches(key, &pinned.limiter) {
            self.scheduler.schedule(key, &pinned.limiter);
        }

        let result = pinned.limiter.acquire(amount).await;
        trace!(key = ?key, amount, ok = result.is_ok(), "Keyed acquire finished");
        self.scheduler.schedule(key, &pinned.limiter);
        result
    }

    /// Consume `amount` from `key`'s limiter if it is available right now.
    pub fn acquire_nowait(&self, key: &K, amount: f64) -> Result<bool> {
        let pinned = self.registry.pin(key)?;
        let result = pinned.limiter.acquire_nowait(amount);
        trace!(key = ?key, amount, admitted = ?result.as_ref().ok(), "Keyed acquire_nowait");
        self.scheduler.schedule(key, &pinned.limiter);
        result
    }

    /// Return the limiter for `key`, creating it if needed.
    pub fn get_or_create(&self, key: &K) -> Result<Arc<L>> {
        let limiter = self.registry.get_or_create(key)?;
        if !self.scheduler.watches(key, &limiter) {
            self.scheduler.schedule(key, &limiter);
        }
        Ok(limiter)
    }

    /// The live limiter for `key`, if any.
    pub fn get(&self, key: &K) -> Option<Arc<L>> {
        self.registry.get(key)
    }

    /// Whether `key` currently has a live limiter.
    pub fn contains_key(&self, key: &K) -> bool {
        self.registry.get(key).is_some()
    }

    /// Number of live limiters.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no limiter is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an eviction check is pending for `key`.
    pub fn is_scheduled(&self, key: &K) -> bool {
        self.scheduler.is_scheduled(key)
    }

    /// Number of keys with a pending eviction check.
    pub fn scheduled_len(&self) -> usize {
        self.scheduler.scheduled_len()
    }

    /// How long an idle limiter is retained.
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }
}

impl<K> KeyedRateLimiter<K, Limiter>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a keyed limiter whose per-key limiters are built from configuration.
    pub fn from_config(limiter: &LimiterConfig, keyed: &KeyedConfig) -> Result<Self> {
        // Surface bad limiter parameters now rather than on first use.
        Limiter::from_config(limiter)?;

        let limiter = limiter.clone();
        Ok(Self::with_strategy(
            move |_key: &K| Limiter::from_config(&limiter),
            keyed.grace_period()?,
            keyed.strategy,
        ))
    }
}
