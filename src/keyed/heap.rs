//! Heap-scheduled eviction: one background task shared by every key.
//!
//! Deadlines go into a min-heap. The worker sleeps until the earliest one
//! and is woken early when a push lands in front of it, so background work
//! scales with key churn rather than with the number of live keys.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use super::registry::Registry;
use super::{idle_deadline, recheck_deadline, EvictionScheduler};
use crate::ratelimit::{deadline_after, RateLimiter};

/// Evicts idle limiters from a single task driven by a deadline heap.
pub struct HeapScheduler<K, L> {
    shared: Arc<HeapShared<K, L>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct HeapShared<K, L> {
    registry: Arc<Registry<K, L>>,
    grace_period: Duration,
    queue: Mutex<Queue<K, L>>,
    wake: Notify,
}

struct Queue<K, L> {
    heap: BinaryHeap<Deadline<K, L>>,
    /// Most recent schedule per key; heap entries that do not match are stale.
    latest: HashMap<K, Scheduled<L>>,
    next_seq: u64,
}

struct Scheduled<L> {
    seq: u64,
    limiter: Arc<L>,
}

struct Deadline<K, L> {
    at: Instant,
    seq: u64,
    key: K,
    limiter: Arc<L>,
}

impl<K, L> PartialEq for Deadline<K, L> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K, L> Eq for Deadline<K, L> {}

impl<K, L> PartialOrd for Deadline<K, L> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K, L> Ord for Deadline<K, L> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earlier deadline = greater, so the max-heap pops it first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K, L> Queue<K, L>
where
    K: Eq + Hash + Clone,
{
    /// Record a new deadline for `key`. Returns whether it is now the earliest.
    fn push(&mut self, key: &K, limiter: &Arc<L>, at: Instant) -> bool {
        let seq = self.next_seq;
        self.next_seq += 1;

        let becomes_head = self.heap.peek().map_or(true, |head| at < head.at);
        self.latest.insert(
            key.clone(),
            Scheduled {
                seq,
                limiter: limiter.clone(),
            },
        );
        self.heap.push(Deadline {
            at,
            seq,
            key: key.clone(),
            limiter: limiter.clone(),
        });
        becomes_head
    }

    fn pop_due(&mut self, now: Instant) -> Option<Deadline<K, L>> {
        if self.heap.peek()?.at <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    fn is_latest(&self, due: &Deadline<K, L>) -> bool {
        self.latest
            .get(&due.key)
            .map_or(false, |scheduled| scheduled.seq == due.seq)
    }
}

impl<K, L> HeapScheduler<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    pub(crate) fn new(registry: Arc<Registry<K, L>>, grace_period: Duration) -> Self {
        Self {
            shared: Arc::new(HeapShared {
                registry,
                grace_period,
                queue: Mutex::new(Queue {
                    heap: BinaryHeap::new(),
                    latest: HashMap::new(),
                    next_seq: 0,
                }),
                wake: Notify::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Number of heap entries, stale ones included.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            trace!("Starting eviction worker");
            *worker = Some(tokio::spawn(run(self.shared.clone())));
        }
    }
}

impl<K, L> EvictionScheduler<K, L> for HeapScheduler<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    fn schedule(&self, key: &K, limiter: &Arc<L>) {
        self.ensure_worker();

        let at = deadline_after(
            Instant::now(),
            idle_deadline(&**limiter, self.shared.grace_period),
        );
        let becomes_head = self.shared.queue.lock().push(key, limiter, at);
        trace!(key = ?key, becomes_head, "Scheduled eviction check");
        if becomes_head {
            self.shared.wake.notify_one();
        }
    }

    fn watches(&self, key: &K, limiter: &Arc<L>) -> bool {
        self.shared
            .queue
            .lock()
            .latest
            .get(key)
            .map_or(false, |scheduled| Arc::ptr_eq(&scheduled.limiter, limiter))
    }

    fn is_scheduled(&self, key: &K) -> bool {
        self.shared.queue.lock().latest.contains_key(key)
    }

    fn scheduled_len(&self) -> usize {
        self.shared.queue.lock().latest.len()
    }
}

impl<K, L> Drop for HeapScheduler<K, L> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

impl<K, L> HeapShared<K, L>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    /// Process every deadline that has passed.
    fn expire(&self, now: Instant) {
        let mut queue = self.queue.lock();
        let mut busy = Vec::new();
        while let Some(due) = queue.pop_due(now) {
            if !queue.is_latest(&due) {
                trace!(key = ?due.key, seq = due.seq, "Discarding superseded deadline");
                continue;
            }

            if self.registry.evict_if_idle(&due.key, &due.limiter) {
                queue.latest.remove(&due.key);
            } else if self.registry.is_current(&due.key, &due.limiter) {
                // Still registered but busy. Keep watching so an abandoned
                // wait cannot strand the entry.
                trace!(key = ?due.key, waiters = due.limiter.waiters(), "Limiter still busy");
                busy.push(due);
            } else {
                trace!(key = ?due.key, "Scheduled limiter was replaced");
                queue.latest.remove(&due.key);
            }
        }

        // Pushed after the drain so this pass cannot pop them again.
        for due in busy {
            let at = deadline_after(now, recheck_deadline(&*due.limiter, self.grace_period));
            queue.push(&due.key, &due.limiter, at);
        }
    }
}

async fn run<K, L>(shared: Arc<HeapShared<K, L>>)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    L: RateLimiter + 'static,
{
    loop {
        let next = shared.queue.lock().heap.peek().map(|head| head.at);
        match next {
            None => shared.wake.notified().await,
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => shared.expire(Instant::now()),
                    _ = shared.wake.notified() => {
                        trace!("Earlier deadline pushed, rescheduling");
                    }
                }
            }
        }
    }
}
