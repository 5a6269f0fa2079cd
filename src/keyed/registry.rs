//! Key to limiter map with get-or-create and identity-checked eviction.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// Builds the limiter for a key on first use.
pub type LimiterFactory<K, L> = Box<dyn Fn(&K) -> Result<L> + Send + Sync>;

/// Shared state behind a keyed limiter, also held by its eviction tasks.
pub(crate) struct Registry<K, L> {
    limiters: DashMap<K, Arc<L>>,
    factory: LimiterFactory<K, L>,
}

impl<K, L> Registry<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    pub(crate) fn new(factory: LimiterFactory<K, L>) -> Self {
        Self {
            limiters: DashMap::new(),
            factory,
        }
    }

    /// Return the live limiter for `key`, creating it if needed.
    ///
    /// The factory runs under the map's entry lock, so concurrent first use
    /// of one key builds exactly one limiter.
    pub(crate) fn get_or_create(&self, key: &K) -> Result<Arc<L>> {
        if let Some(limiter) = self.limiters.get(key) {
            return Ok(limiter.clone());
        }

        match self.limiters.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let limiter = Arc::new((self.factory)(key)?);
                debug!(
                    key = ?key,
                    capacity = limiter.capacity(),
                    "Creating new rate limiter"
                );
                entry.insert(limiter.clone());
                Ok(limiter)
            }
        }
    }

    /// Get or create the limiter for `key` and hold it busy until the
    /// returned pin is dropped.
    ///
    /// The waiter count is raised before re-checking that the instance is
    /// still registered. Eviction only removes idle instances under the map
    /// lock, so once this returns the pinned limiter cannot be evicted.
    pub(crate) fn pin(&self, key: &K) -> Result<Pinned<L>> {
        loop {
            let limiter = self.get_or_create(key)?;
            let pinned = Pinned::new(limiter);
            if self.is_current(key, &pinned.limiter) {
                return Ok(pinned);
            }
            debug!(key = ?key, "Limiter evicted while pinning, retrying");
        }
    }

    /// Whether `limiter` is the instance currently registered for `key`.
    pub(crate) fn is_current(&self, key: &K, limiter: &Arc<L>) -> bool {
        self.limiters
            .get(key)
            .map(|current| Arc::ptr_eq(current.value(), limiter))
            .unwrap_or(false)
    }

    /// Remove `limiter` if it is still the one registered for `key` and idle.
    pub(crate) fn evict_if_idle(&self, key: &K, limiter: &Arc<L>) -> bool {
        let removed = self
            .limiters
            .remove_if(key, |_, current| {
                Arc::ptr_eq(current, limiter) && current.is_unused()
            })
            .is_some();
        if removed {
            debug!(key = ?key, "Evicted idle rate limiter");
        }
        removed
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<L>> {
        self.limiters.get(key).map(|limiter| limiter.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.limiters.len()
    }
}

/// A limiter held busy so it cannot be evicted while in use.
pub(crate) struct Pinned<L: RateLimiter> {
    pub(crate) limiter: Arc<L>,
}

impl<L: RateLimiter> Pinned<L> {
    fn new(limiter: Arc<L>) -> Self {
        limiter.admission().pin();
        Self { limiter }
    }
}

impl<L: RateLimiter> Drop for Pinned<L> {
    fn drop(&mut self) {
        self.limiter.admission().unpin();
    }
}
