//! Error types for gemmly operations.
//!
//! Every failure the engine can report is detected before any block of C is
//! written: precondition violations at call entry, allocation failures during
//! the scratch-acquisition phase that precedes compute.

use thiserror::Error;

/// Errors that can occur during gemmly operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GemmError {
    /// Memory allocation failed.
    #[error("Memory allocation failed: {message} (requested {requested_size} bytes with {requested_alignment} byte alignment)")]
    AllocationError {
        /// The size that was requested to be allocated.
        requested_size: usize,
        /// The alignment that was requested.
        requested_alignment: usize,
        /// Human-readable error message.
        message: String,
    },
    /// Invalid layout parameters were provided.
    #[error("Invalid memory layout: {message} (size: {size}, alignment: {alignment})")]
    LayoutError {
        /// The size parameter that caused the error.
        size: usize,
        /// The alignment parameter that caused the error.
        alignment: usize,
        /// Human-readable error message.
        message: String,
    },
    /// Input validation error.
    #[error("Validation error: {message}")]
    ValidationError {
        /// Human-readable error message.
        message: String,
    },
    /// The storage layout of an operand is not supported by the engine.
    #[error("Unsupported storage layout: {message}")]
    UnsupportedLayout {
        /// Human-readable error message.
        message: String,
    },
    /// A reordered operand was produced with a different layout than the
    /// current context expects.
    #[error("Reordered operand layout mismatch: {message}")]
    ReorderMismatch {
        /// Human-readable error message.
        message: String,
    },
    /// A block-size set violates the tiling invariants.
    #[error("Invalid block sizes: {message}")]
    InvalidBlockSizes {
        /// Human-readable error message.
        message: String,
    },
}

/// Result type alias for gemmly operations.
pub type Result<T> = std::result::Result<T, GemmError>;

/// Creates an allocation error.
pub fn allocation_error(size: usize, alignment: usize, message: impl Into<String>) -> GemmError {
    GemmError::AllocationError {
        requested_size: size,
        requested_alignment: alignment,
        message: message.into(),
    }
}

/// Creates a layout error.
pub fn layout_error(size: usize, alignment: usize, message: impl Into<String>) -> GemmError {
    GemmError::LayoutError {
        size,
        alignment,
        message: message.into(),
    }
}

/// Creates a validation error.
pub fn validation_error(message: impl Into<String>) -> GemmError {
    GemmError::ValidationError {
        message: message.into(),
    }
}

pub(crate) fn unsupported_layout(message: impl Into<String>) -> GemmError {
    GemmError::UnsupportedLayout {
        message: message.into(),
    }
}

pub(crate) fn reorder_mismatch(message: impl Into<String>) -> GemmError {
    GemmError::ReorderMismatch {
        message: message.into(),
    }
}

pub(crate) fn invalid_block_sizes(message: impl Into<String>) -> GemmError {
    GemmError::InvalidBlockSizes {
        message: message.into(),
    }
}
