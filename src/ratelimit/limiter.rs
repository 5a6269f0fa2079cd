//! The rate limiter contract.
//!
//! Algorithms implement the minimal capability set (`capacity`, `available`,
//! `consume`, `time_to_available`) and embed an [`Admission`]. Everything a
//! caller actually uses (`acquire_nowait`, the waiting `acquire`, idleness
//! checks) is derived once here as default methods.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{LimiterError, Result};

/// Admission bookkeeping shared by every limiter.
///
/// Holds the lock that makes check-then-consume atomic, and the count of
/// callers currently parked inside `acquire`.
#[derive(Debug, Default)]
pub struct Admission {
    gate: Mutex<()>,
    waiters: AtomicUsize,
}

impl Admission {
    /// Create empty admission bookkeeping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callers currently suspended in (or pinned to) this limiter.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Register a waiter for as long as the returned guard lives.
    pub fn enter_wait(&self) -> WaiterGuard<'_> {
        self.pin();
        WaiterGuard { admission: self }
    }

    pub(crate) fn pin(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decrements the waiter count on drop, including when an `acquire` future
/// is dropped mid-wait.
#[derive(Debug)]
pub struct WaiterGuard<'a> {
    admission: &'a Admission,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.admission.unpin();
    }
}

/// Trait implemented by every rate limiting algorithm.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Maximum quantity this limiter can ever admit at once.
    fn capacity(&self) -> f64;

    /// Quantity that could be admitted right now.
    fn available(&self) -> f64;

    /// Debit `amount` without any admission check.
    fn consume(&self, amount: f64);

    /// Time until `available() >= amount`, assuming nothing else is consumed.
    fn time_to_available(&self, amount: f64) -> Result<Duration>;

    /// Admission bookkeeping embedded in the implementation.
    fn admission(&self) -> &Admission;

    /// Reject amounts that are negative, not finite, or above capacity.
    fn validate(&self, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(LimiterError::InvalidAmount(amount));
        }
        let capacity = self.capacity();
        if amount > capacity {
            return Err(LimiterError::ExceedsCapacity {
                requested: amount,
                capacity,
            });
        }
        Ok(())
    }

    /// Consume `amount` if it is available right now.
    ///
    /// Returns `Ok(false)` without side effects when there is not enough
    /// capacity.
    fn acquire_nowait(&self, amount: f64) -> Result<bool> {
        self.validate(amount)?;

        let _gate = self.admission().gate.lock();
        let available = self.available();
        if amount > available {
            trace!(amount, available, "Admission denied");
            return Ok(false);
        }
        self.consume(amount);
        trace!(amount, available, "Admission granted");
        Ok(true)
    }

    /// Wait until `amount` can be consumed, then consume it.
    ///
    /// Waiters are not served in FIFO order: each one recomputes its own wait
    /// and whichever recheck sees enough capacity first wins.
    async fn acquire(&self, amount: f64) -> Result<()> {
        self.validate(amount)?;

        let _waiting = self.admission().enter_wait();
        loop {
            if self.acquire_nowait(amount)? {
                return Ok(());
            }
            let wait = self.time_to_available(amount)?;
            trace!(amount, wait_ms = wait.as_millis() as u64, "Waiting for capacity");
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Time until the limiter is back at full capacity.
    fn time_to_unused(&self) -> Result<Duration> {
        let capacity = self.capacity();
        if self.available() >= capacity {
            return Ok(Duration::ZERO);
        }
        self.time_to_available(capacity)
    }

    /// Number of callers currently waiting on this limiter.
    fn waiters(&self) -> usize {
        self.admission().waiters()
    }

    /// Full capacity and nobody waiting.
    fn is_unused(&self) -> bool {
        self.available() >= self.capacity() && self.waiters() == 0
    }
}
