//! Lazylimit - In-process admission control
//!
//! This crate provides token bucket and sliding window rate limiters that
//! decide, per caller, whether work may proceed now or must wait, plus a
//! keyed registry that lazily creates one limiter per key and evicts it once
//! it has gone idle.

pub mod config;
pub mod error;
pub mod keyed;
pub mod ratelimit;

pub use config::{EvictionStrategy, KeyedConfig, LazyLimitConfig, LimiterConfig};
pub use error::{LimiterError, Result};
pub use keyed::{EvictionScheduler, KeyedRateLimiter};
pub use ratelimit::{Clock, Limiter, ManualClock, RateLimiter, SlidingWindow, TokenBucket};
