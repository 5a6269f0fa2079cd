//! Rate limiting algorithms and the contract they share.

mod clock;
mod limiter;
mod sliding_window;
mod token_bucket;

use std::sync::Arc;
use std::time::Duration;

pub use clock::{default_clock, Clock, ManualClock, TokioClock};
pub(crate) use clock::deadline_after;
pub use limiter::{Admission, RateLimiter, WaiterGuard};
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::config::LimiterConfig;
use crate::error::Result;

/// Either algorithm behind one concrete type.
///
/// Useful when the algorithm is picked from configuration at runtime.
#[derive(Debug)]
pub enum Limiter {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
}

impl Limiter {
    /// Build a limiter from configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        match config {
            LimiterConfig::TokenBucket(cfg) => TokenBucket::from_config(cfg).map(Limiter::TokenBucket),
            LimiterConfig::SlidingWindow(cfg) => {
                SlidingWindow::from_config(cfg).map(Limiter::SlidingWindow)
            }
        }
    }

    /// Use a custom time source.
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        match self {
            Limiter::TokenBucket(l) => Limiter::TokenBucket(l.with_clock(clock)),
            Limiter::SlidingWindow(l) => Limiter::SlidingWindow(l.with_clock(clock)),
        }
    }

    fn inner(&self) -> &dyn RateLimiter {
        match self {
            Limiter::TokenBucket(l) => l,
            Limiter::SlidingWindow(l) => l,
        }
    }
}

impl RateLimiter for Limiter {
    fn capacity(&self) -> f64 {
        self.inner().capacity()
    }

    fn available(&self) -> f64 {
        self.inner().available()
    }

    fn consume(&self, amount: f64) {
        self.inner().consume(amount)
    }

    fn time_to_available(&self, amount: f64) -> Result<Duration> {
        self.inner().time_to_available(amount)
    }

    fn admission(&self) -> &Admission {
        self.inner().admission()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SlidingWindowConfig, TokenBucketConfig};

    #[test]
    fn test_limiter_from_token_bucket_config() {
        let config = LimiterConfig::TokenBucket(TokenBucketConfig {
            capacity: 10.0,
            refill_rate: 2.0,
            starting_tokens: Some(4.0),
        });
        let clock = ManualClock::new();
        let limiter = Limiter::from_config(&config).unwrap().with_clock(clock.clone());

        assert!(matches!(limiter, Limiter::TokenBucket(_)));
        assert_eq!(limiter.capacity(), 10.0);
        assert_eq!(limiter.available(), 4.0);
        assert_eq!(limiter.time_to_unused().unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_limiter_from_sliding_window_config() {
        let config = LimiterConfig::SlidingWindow(SlidingWindowConfig {
            capacity: 3.0,
            window_secs: 2.0,
        });
        let clock = ManualClock::new();
        let limiter = Limiter::from_config(&config).unwrap().with_clock(clock.clone());

        assert!(limiter.acquire_nowait(3.0).unwrap());
        assert!(!limiter.acquire_nowait(1.0).unwrap());
        assert_eq!(limiter.time_to_unused().unwrap(), Duration::from_secs(2));
        assert!(!limiter.is_unused());

        clock.advance(Duration::from_secs(2));
        assert!(limiter.is_unused());
    }
}
