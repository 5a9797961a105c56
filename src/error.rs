//! Error types for Centella operations

use thiserror::Error;

/// Result type for Centella operations
pub type Result<T> = std::result::Result<T, KernelError>;

/// Errors raised at the public kernel boundary.
///
/// The kernels themselves assume validated inputs and perform no checks in
/// hot loops; every contract violation is caught before a kernel runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    /// Shape descriptor violates a kernel precondition
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    /// Buffer length does not match what the shape descriptor requires
    #[error("Buffer size mismatch: expected at least {expected}, got {actual}")]
    SizeMismatch {
        /// Minimum length required by the shape/view
        expected: usize,
        /// Actual buffer length
        actual: usize,
    },

    /// Worker-thread pool could not be constructed
    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}
