use thiserror::Error;

/// Canonical rill error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RillError::Plan`]: query shape/name/type issues discovered before execution
/// - [`RillError::Source`]: I/O or protocol failure reported by a source adapter
/// - [`RillError::Runtime`]: expression evaluation or operator failures after
///   materialization succeeded
/// - [`RillError::InvalidConfig`]: source/engine configuration contract violations
/// - [`RillError::Cancelled`]: the root context was cancelled
/// - [`RillError::Io`]: raw filesystem IO failures from std APIs
///
/// End-of-stream is deliberately not an error: a bounded node signals
/// exhaustion by returning normally from `produce`.
#[derive(Debug, Error)]
pub enum RillError {
    /// Invalid or inconsistent source/engine configuration.
    ///
    /// Examples:
    /// - missing required `path` for a CSV source
    /// - malformed Redis address
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Planning or materialization failures.
    ///
    /// Examples:
    /// - unknown source or function name
    /// - wrong argument count for a function
    /// - invalid pushdown constant
    #[error("plan error: {0}")]
    Plan(String),

    /// Failure inside a source adapter during a scan.
    ///
    /// `transient` marks failure classes (network resets) the adapter may
    /// retry once before surfacing the error.
    #[error("source error: {message}")]
    Source {
        /// Human-readable failure description.
        message: String,
        /// Whether the failure class is considered retryable.
        transient: bool,
    },

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - division by zero
    /// - type mismatch during expression evaluation
    /// - non-integer LIMIT value
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The root cancellation token was triggered.
    #[error("query cancelled")]
    Cancelled,

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RillError {
    /// Build a non-transient source error.
    pub fn source(message: impl Into<String>) -> Self {
        RillError::Source {
            message: message.into(),
            transient: false,
        }
    }

    /// Build a transient (retry-once) source error.
    pub fn transient_source(message: impl Into<String>) -> Self {
        RillError::Source {
            message: message.into(),
            transient: true,
        }
    }
}

/// Standard rill result alias.
pub type Result<T> = std::result::Result<T, RillError>;
