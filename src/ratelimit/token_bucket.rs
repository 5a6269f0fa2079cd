//! Token bucket rate limiter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::clock::{default_clock, Clock};
use super::limiter::{Admission, RateLimiter};
use crate::config::TokenBucketConfig;
use crate::error::{LimiterError, Result};

/// A bucket that refills continuously at a fixed rate up to its capacity.
///
/// Refill is lazy: the fill level is brought up to date from the elapsed
/// time whenever it is read or debited. No background timer is involved.
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum number of tokens the bucket can hold
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
    admission: Admission,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket using the default clock.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(LimiterError::Config(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(LimiterError::Config(format!(
                "refill_rate must be a positive number, got {}",
                refill_rate
            )));
        }

        let clock = default_clock();
        Ok(Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: clock.now(),
            }),
            clock,
            admission: Admission::new(),
        })
    }

    /// Create a bucket from configuration.
    pub fn from_config(config: &TokenBucketConfig) -> Result<Self> {
        let bucket = Self::new(config.capacity, config.refill_rate)?;
        match config.starting_tokens {
            Some(tokens) => bucket.with_starting_tokens(tokens),
            None => Ok(bucket),
        }
    }

    /// Start the bucket at `tokens` instead of full.
    pub fn with_starting_tokens(self, tokens: f64) -> Result<Self> {
        if !(tokens.is_finite() && (0.0..=self.capacity).contains(&tokens)) {
            return Err(LimiterError::Config(format!(
                "starting_tokens must be within [0, {}], got {}",
                self.capacity, tokens
            )));
        }
        self.state.lock().tokens = tokens;
        Ok(self)
    }

    /// Use a custom time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.state.get_mut().last_refill = clock.now();
        self.clock = clock;
        self
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Current fill level.
    pub fn tokens(&self) -> f64 {
        self.available()
    }

    /// Full and with nobody waiting.
    ///
    /// A bucket with waiters is about to be drained, so it never counts as full.
    pub fn is_full(&self) -> bool {
        self.is_unused()
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.last_refill = now;

        if elapsed.is_zero() {
            return;
        }
        let refilled = state.tokens + elapsed.as_secs_f64() * self.refill_rate;
        state.tokens = refilled.min(self.capacity);
    }
}

impl RateLimiter for TokenBucket {
    fn capacity(&self) -> f64 {
        self.capacity
    }

    fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn consume(&self, amount: f64) {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens -= amount;
    }

    fn time_to_available(&self, amount: f64) -> Result<Duration> {
        if amount > self.capacity {
            return Err(LimiterError::ExceedsCapacity {
                requested: amount,
                capacity: self.capacity,
            });
        }

        let missing = amount - self.available();
        if missing <= 0.0 {
            return Ok(Duration::ZERO);
        }
        // Saturate waits too long to represent; tokio sleeps clamp them anyway.
        Ok(Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX))
    }

    fn admission(&self) -> &Admission {
        &self.admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    fn assert_took(elapsed: Duration, expected: f64) {
        let actual = elapsed.as_secs_f64();
        assert!(
            (actual - expected).abs() < 0.01,
            "expected {}s, took {}s",
            expected,
            actual
        );
    }

    #[test]
    fn test_bucket_rejects_bad_config() {
        assert!(matches!(
            TokenBucket::new(0.0, 1.0),
            Err(LimiterError::Config(_))
        ));
        assert!(matches!(
            TokenBucket::new(10.0, -1.0),
            Err(LimiterError::Config(_))
        ));
        assert!(TokenBucket::new(10.0, 1.0)
            .unwrap()
            .with_starting_tokens(11.0)
            .is_err());
    }

    #[test]
    fn test_unrepresentable_wait_saturates() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(1e20, 0.5).unwrap().with_clock(clock);

        assert!(bucket.acquire_nowait(1e20).unwrap());
        assert_eq!(bucket.time_to_unused().unwrap(), Duration::MAX);
        assert_eq!(bucket.time_to_available(1e20).unwrap(), Duration::MAX);
        assert_eq!(bucket.time_to_available(1.0).unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn test_bucket_refills_linearly() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(10.0, 1.0).unwrap().with_clock(clock.clone());

        assert_eq!(bucket.available(), 10.0);

        bucket.consume(5.0);
        assert_eq!(bucket.available(), 5.0);
        assert_eq!(bucket.time_to_available(3.0).unwrap(), Duration::ZERO);

        clock.advance(Duration::from_secs(2));
        assert_approx(bucket.available(), 7.0);

        bucket.consume(7.0);
        assert_approx(bucket.available(), 0.0);
        assert_approx(bucket.time_to_available(10.0).unwrap().as_secs_f64(), 10.0);

        clock.advance(Duration::from_secs(5));
        assert_approx(bucket.available(), 5.0);
        assert_approx(bucket.time_to_available(10.0).unwrap().as_secs_f64(), 5.0);

        clock.advance(Duration::from_secs(5));
        assert_approx(bucket.available(), 10.0);
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(10.0, 1.0).unwrap().with_clock(clock.clone());

        clock.advance(Duration::from_secs(60));
        assert_eq!(bucket.available(), 10.0);
    }

    #[test]
    fn test_bucket_acquire_nowait() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(10.0, 1.0).unwrap().with_clock(clock.clone());

        assert!(bucket.acquire_nowait(5.0).unwrap());
        assert_eq!(bucket.tokens(), 5.0);

        assert!(!bucket.acquire_nowait(6.0).unwrap());
        assert_eq!(bucket.tokens(), 5.0);

        clock.advance(Duration::from_secs(5));
        assert!(bucket.acquire_nowait(6.0).unwrap());
        assert_approx(bucket.tokens(), 4.0);
        assert!(bucket.acquire_nowait(4.0).unwrap());
    }

    #[test]
    fn test_bucket_time_to_available_beyond_capacity() {
        let bucket = TokenBucket::new(10.0, 1.0).unwrap();
        assert!(matches!(
            bucket.time_to_available(11.0),
            Err(LimiterError::ExceedsCapacity { .. })
        ));
    }

    #[test]
    fn test_bucket_full_behaviour() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::new(10.0, 10.0)
            .unwrap()
            .with_starting_tokens(0.0)
            .unwrap()
            .with_clock(clock.clone());

        assert!(!bucket.is_full());

        clock.advance(Duration::from_millis(500));
        assert!(!bucket.is_full());

        clock.advance(Duration::from_millis(500));
        assert!(bucket.is_full());

        let _waiting = bucket.admission().enter_wait();
        assert!(!bucket.is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(5.0, 5.0)
            .unwrap()
            .with_starting_tokens(0.0)
            .unwrap();

        let start = Instant::now();
        bucket.acquire(3.0).await.unwrap();
        assert_took(start.elapsed(), 0.6);

        let second = Instant::now();
        bucket.acquire(2.0).await.unwrap();
        assert_took(second.elapsed(), 0.4);
        assert_took(start.elapsed(), 1.0);

        tokio::time::sleep(Duration::from_secs(1)).await;

        let third = Instant::now();
        bucket.acquire(5.0).await.unwrap();
        assert_eq!(third.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_acquire() {
        let bucket = Arc::new(
            TokenBucket::new(10.0, 10.0)
                .unwrap()
                .with_starting_tokens(0.0)
                .unwrap(),
        );
        let start = Instant::now();

        let waits = futures::future::join_all((0..2).map(|_| {
            let bucket = bucket.clone();
            tokio::spawn(async move {
                let begun = Instant::now();
                bucket.acquire(5.0).await.unwrap();
                begun.elapsed().as_secs_f64()
            })
        }))
        .await;

        let mut waits: Vec<f64> = waits.into_iter().map(|w| w.unwrap()).collect();
        waits.sort_by(|a, b| a.partial_cmp(b).unwrap());

        assert!((waits[0] - 0.5).abs() < 0.01, "first waiter took {}", waits[0]);
        assert!((waits[1] - 1.0).abs() < 0.01, "second waiter took {}", waits[1]);
        assert_took(start.elapsed(), 1.0);
        assert_eq!(bucket.waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_more_than_capacity() {
        let bucket = TokenBucket::new(10.0, 10.0)
            .unwrap()
            .with_starting_tokens(0.0)
            .unwrap();

        assert!(bucket.acquire_nowait(11.0).is_err());
        assert!(bucket.acquire(11.0).await.is_err());
        assert_eq!(bucket.tokens(), 0.0);
    }
}
