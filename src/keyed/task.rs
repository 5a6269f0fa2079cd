//! Per-key watcher eviction: one background task per active key.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::trace;

use super::registry::Registry;
use super::{idle_deadline, recheck_deadline, EvictionScheduler};
use crate::ratelimit::RateLimiter;

/// Spawns a watcher task per key, replacing it on every reschedule.
///
/// Simple, but the number of sleeping tasks grows with the number of
/// active keys.
pub struct TaskScheduler<K, L>
where
    K: Eq + Hash,
{
    shared: Arc<Watchers<K, L>>,
}

struct Watchers<K, L> {
    registry: Arc<Registry<K, L>>,
    watchers: DashMap<K, Watcher<L>>,
    grace_period: Duration,
    next_id: AtomicU64,
}

struct Watcher<L> {
    id: u64,
    limiter: Arc<L>,
    handle: AbortHandle,
}

impl<K, L> TaskScheduler<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    pub(crate) fn new(registry: Arc<Registry<K, L>>, grace_period: Duration) -> Self {
        Self {
            shared: Arc::new(Watchers {
                registry,
                watchers: DashMap::new(),
                grace_period,
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<K, L> EvictionScheduler<K, L> for TaskScheduler<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    fn schedule(&self, key: &K, limiter: &Arc<L>) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        // Hold the entry while spawning so a watcher that finishes at once
        // cannot try to deregister before it has been registered.
        let entry = self.shared.watchers.entry(key.clone());
        let handle = tokio::spawn(watch(
            self.shared.clone(),
            key.clone(),
            limiter.clone(),
            id,
        ))
        .abort_handle();
        let watcher = Watcher {
            id,
            limiter: limiter.clone(),
            handle,
        };

        match entry {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(watcher);
                previous.handle.abort();
                trace!(key = ?key, replaced = previous.id, id, "Replaced eviction watcher");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(watcher);
                trace!(key = ?key, id, "Started eviction watcher");
            }
        }
    }

    fn watches(&self, key: &K, limiter: &Arc<L>) -> bool {
        self.shared
            .watchers
            .get(key)
            .map(|watcher| Arc::ptr_eq(&watcher.limiter, limiter))
            .unwrap_or(false)
    }

    fn is_scheduled(&self, key: &K) -> bool {
        self.shared.watchers.contains_key(key)
    }

    fn scheduled_len(&self) -> usize {
        self.shared.watchers.len()
    }
}

impl<K, L> Drop for TaskScheduler<K, L>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for watcher in self.shared.watchers.iter() {
            watcher.handle.abort();
        }
    }
}

/// Sleep until the limiter should be idle, then evict it if it is.
///
/// A limiter that is still registered but busy keeps being watched, so a
/// caller that abandons its wait cannot strand the entry.
async fn watch<K, L>(shared: Arc<Watchers<K, L>>, key: K, limiter: Arc<L>, id: u64)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    let mut wait = idle_deadline(&*limiter, shared.grace_period);
    loop {
        tokio::time::sleep(wait).await;

        if shared.registry.evict_if_idle(&key, &limiter) {
            break;
        }
        if !shared.registry.is_current(&key, &limiter) {
            trace!(key = ?key, id, "Watched limiter was replaced");
            break;
        }
        trace!(key = ?key, id, waiters = limiter.waiters(), "Limiter still busy");
        wait = recheck_deadline(&*limiter, shared.grace_period);
    }

    shared.watchers.remove_if(&key, |_, watcher| watcher.id == id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TokenBucket;

    fn scheduler() -> (Arc<Registry<String, TokenBucket>>, TaskScheduler<String, TokenBucket>) {
        let registry = Arc::new(Registry::new(Box::new(|_key: &String| {
            TokenBucket::new(10.0, 10.0)
        })));
        let scheduler = TaskScheduler::new(registry.clone(), Duration::from_secs(1));
        (registry, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_evicts_idle_limiter() {
        let (registry, scheduler) = scheduler();
        let key = "client".to_string();

        let limiter = registry.get_or_create(&key).unwrap();
        assert!(limiter.acquire_nowait(5.0).unwrap());
        scheduler.schedule(&key, &limiter);
        assert!(scheduler.watches(&key, &limiter));

        // 0.5s to refill plus the 1s grace period.
        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registry.len(), 0);
        assert_eq!(scheduler.scheduled_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_watcher() {
        let (registry, scheduler) = scheduler();
        let key = "client".to_string();

        let limiter = registry.get_or_create(&key).unwrap();
        scheduler.schedule(&key, &limiter);
        let first = scheduler.shared.watchers.get(&key).unwrap().id;

        tokio::time::sleep(Duration::from_millis(800)).await;
        scheduler.schedule(&key, &limiter);
        let second = scheduler.shared.watchers.get(&key).unwrap().id;
        assert_ne!(first, second);
        assert_eq!(scheduler.scheduled_len(), 1);

        // The first watcher would have fired at 1.0s.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.len(), 0);
        assert_eq!(scheduler.scheduled_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_limiter_keeps_being_watched() {
        let (registry, scheduler) = scheduler();
        let key = "client".to_string();

        let limiter = registry.get_or_create(&key).unwrap();
        scheduler.schedule(&key, &limiter);
        let waiting = limiter.admission().enter_wait();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.len(), 1);
        assert!(scheduler.is_scheduled(&key));

        drop(waiting);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(registry.len(), 0);
        assert!(!scheduler.is_scheduled(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_watcher_spares_recreated_limiter() {
        let (registry, scheduler) = scheduler();
        let key = "client".to_string();

        let stale = registry.get_or_create(&key).unwrap();
        scheduler.schedule(&key, &stale);
        assert!(registry.evict_if_idle(&key, &stale));

        let fresh = registry.get_or_create(&key).unwrap();
        assert!(fresh.acquire_nowait(10.0).unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(registry.is_current(&key, &fresh));
        assert!(!scheduler.is_scheduled(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_limiter_with_zero_grace_is_polled_gently() {
        let registry = Arc::new(Registry::new(Box::new(|_key: &String| {
            TokenBucket::new(10.0, 10.0)
        })));
        let scheduler = TaskScheduler::new(registry.clone(), Duration::ZERO);
        let key = "client".to_string();

        let limiter = registry.get_or_create(&key).unwrap();
        let waiting = limiter.admission().enter_wait();
        scheduler.schedule(&key, &limiter);

        let start = tokio::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(start.elapsed() < Duration::from_millis(11));
        assert_eq!(registry.len(), 1);
        assert!(scheduler.watches(&key, &limiter));

        drop(waiting);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.len(), 0);
        assert!(!scheduler.is_scheduled(&key));
    }
}
