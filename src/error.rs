//! Error types for lazylimit.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Request amount is negative or not a finite number
    #[error("Request amount must be a non-negative number, got {0}")]
    InvalidAmount(f64),

    /// Request amount can never be satisfied by this limiter
    #[error("Requested amount ({requested}) exceeds limiter capacity ({capacity})")]
    ExceedsCapacity { requested: f64, capacity: f64 },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal bookkeeping is inconsistent
    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    /// Errors raised by a caller-supplied limiter factory
    #[error("Limiter factory error: {0}")]
    Factory(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error was caused by the caller's request amount.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            LimiterError::InvalidAmount(_) | LimiterError::ExceedsCapacity { .. }
        )
    }
}

/// Result type alias for lazylimit operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
