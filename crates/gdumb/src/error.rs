//! Error types for the replay memory

use thiserror::Error;

/// GDumb errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GDumbError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed sample
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Memory and class counts disagree. The memory that reported this is
    /// poisoned and rejects all further work.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Error raised by a training callback
    #[error("Training error: {0}")]
    Training(String),
}

/// Result type for replay memory operations
pub type Result<T> = std::result::Result<T, GDumbError>;
