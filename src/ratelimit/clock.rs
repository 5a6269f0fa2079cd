//! Time sources for rate limiters.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// A monotonic time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant according to this clock.
    fn now(&self) -> Instant;
}

/// The default clock, backed by tokio's monotonic time.
///
/// Under `tokio::time::pause` this clock follows the runtime's virtual time,
/// so limiter arithmetic and `acquire` sleeps stay in lockstep.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a manual clock starting at the current instant.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

/// The clock used when none is supplied.
pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(TokioClock)
}

/// Longest offset a deadline is placed at; tokio clamps far sleeps the same way.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + after`, clamped to the far future instead of overflowing.
pub(crate) fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}
