//! Error types for pipe construction.

use thiserror::Error;

/// Errors that can occur while constructing a [`crate::Pipe`].
#[derive(Debug, Error)]
pub enum PipeError {
    /// The element type has zero size, so a circular buffer of it is meaningless.
    #[error("cannot create a pipe of a zero-sized element type")]
    ZeroSizedElement,

    /// The initial buffer allocation failed.
    #[error("failed to allocate the initial buffer: {0}")]
    AllocationFailed(#[from] std::collections::TryReserveError),
}
