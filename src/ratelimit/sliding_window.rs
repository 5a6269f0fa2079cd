//! Sliding window rate limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::clock::{deadline_after, default_clock, Clock};
use super::limiter::{Admission, RateLimiter};
use crate::config::SlidingWindowConfig;
use crate::error::{LimiterError, Result};

/// A log of past consumptions, each of which stops counting against
/// capacity once its window has passed.
///
/// Every entry gets the same window length, so expiry times are
/// non-decreasing in insertion order and pruning only ever touches the front.
#[derive(Debug)]
pub struct SlidingWindow {
    /// Maximum amount admitted within any one window
    capacity: f64,
    /// How long a consumption counts against capacity
    window: Duration,
    /// (amount, expiry) in insertion order
    log: Mutex<VecDeque<(f64, Instant)>>,
    clock: Arc<dyn Clock>,
    admission: Admission,
}

impl SlidingWindow {
    /// Create an empty window using the default clock.
    pub fn new(capacity: f64, window: Duration) -> Result<Self> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(LimiterError::Config(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        if window.is_zero() {
            return Err(LimiterError::Config(
                "window must be longer than zero".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            window,
            log: Mutex::new(VecDeque::new()),
            clock: default_clock(),
            admission: Admission::new(),
        })
    }

    /// Create a window from configuration.
    pub fn from_config(config: &SlidingWindowConfig) -> Result<Self> {
        if !(config.window_secs.is_finite() && config.window_secs > 0.0) {
            return Err(LimiterError::Config(format!(
                "window_secs must be a positive number, got {}",
                config.window_secs
            )));
        }
        let window = Duration::try_from_secs_f64(config.window_secs).map_err(|_| {
            LimiterError::Config(format!(
                "window_secs is too large, got {}",
                config.window_secs
            ))
        })?;
        Self::new(config.capacity, window)
    }

    /// Use a custom time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of consumptions still counting against capacity.
    pub fn len(&self) -> usize {
        let mut log = self.log.lock();
        Self::prune(&mut log, self.clock.now());
        log.len()
    }

    /// Whether no consumption currently counts against capacity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(log: &mut VecDeque<(f64, Instant)>, now: Instant) {
        while matches!(log.front(), Some(&(_, expiry)) if expiry <= now) {
            log.pop_front();
        }
    }

    fn available_at(&self, log: &mut VecDeque<(f64, Instant)>, now: Instant) -> f64 {
        Self::prune(log, now);
        self.capacity - log.iter().map(|(amount, _)| amount).sum::<f64>()
    }
}

impl RateLimiter for SlidingWindow {
    fn capacity(&self) -> f64 {
        self.capacity
    }

    fn available(&self) -> f64 {
        let mut log = self.log.lock();
        self.available_at(&mut log, self.clock.now())
    }

    fn consume(&self, amount: f64) {
        let expiry = deadline_after(self.clock.now(), self.window);
        self.log.lock().push_back((amount, expiry));
    }

    fn time_to_available(&self, amount: f64) -> Result<Duration> {
        if amount > self.capacity {
            return Err(LimiterError::ExceedsCapacity {
                requested: amount,
                capacity: self.capacity,
            });
        }

        let now = self.clock.now();
        let mut log = self.log.lock();
        let mut available = self.available_at(&mut log, now);
        if available >= amount {
            return Ok(Duration::ZERO);
        }

        for &(freed, expiry) in log.iter() {
            available += freed;
            if available >= amount {
                return Ok(expiry.saturating_duration_since(now));
            }
        }

        warn!(
            amount,
            available,
            entries = log.len(),
            "Sliding window log exhausted before reaching requested availability"
        );
        Err(LimiterError::Invariant(format!(
            "sliding window reached only {} of {} after expiring every entry",
            available, amount
        )))
    }

    fn admission(&self) -> &Admission {
        &self.admission
    }
}
