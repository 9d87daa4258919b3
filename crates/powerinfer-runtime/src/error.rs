//! Error types for the sparse inference runtime
//!
//! Internally every fallible operation returns [`Result`] carrying a
//! [`RuntimeError`]. At the host boundary the error is flattened into the
//! two-field [`PowerInferError`] value that embedders consume.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Coarse classification of a [`RuntimeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocator exhausted or scratch workspace too small
    ResourceExhaustion,
    /// A chunk name or id was never registered
    UnknownIdentity,
    /// Caller violated a documented precondition
    Precondition,
    /// Reading from the backing store failed
    Io,
    /// Invalid configuration
    Config,
}

/// Main error type for the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The system allocator could not satisfy an aligned allocation
    #[error("Allocation failed: {size} bytes aligned to {alignment}")]
    Allocation {
        /// Requested size after rounding
        size: usize,
        /// Requested alignment
        alignment: usize,
    },

    /// Alignment is zero or not a power of two
    #[error("Invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(usize),

    /// The compute workspace cannot hold the packing and temp buffers
    #[error("The compute buffer is too small: need {required} bytes, have {available}")]
    WorkspaceTooSmall {
        /// Bytes the operation needs
        required: usize,
        /// Bytes the caller provided
        available: usize,
    },

    /// A weight chunk name or id was never registered
    #[error("Unknown weight chunk: {0}")]
    UnknownChunk(String),

    /// A weight chunk name was registered twice
    #[error("Duplicate weight chunk: {0}")]
    DuplicateChunk(String),

    /// Input or output length does not match the configured shape
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which buffer mismatched
        what: &'static str,
        /// Expected element count
        expected: usize,
        /// Actual element count
        actual: usize,
    },

    /// The kernel has no implementation for this quantization type
    #[error("Unsupported quantization type {qtype} for {operation}")]
    UnsupportedType {
        /// Name of the quantization type
        qtype: &'static str,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Caller violated a documented precondition
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Reading a chunk from the backing store failed
    #[error("Paging read failed at offset {offset} ({len} bytes): {source}")]
    PagingRead {
        /// Aligned file offset of the read
        offset: u64,
        /// Aligned length of the read
        len: usize,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The backing store ended before the requested range was covered
    #[error("Short read at offset {offset}: needed {needed} bytes, got {got}")]
    ShortRead {
        /// Logical offset of the request
        offset: u64,
        /// Bytes needed to cover the logical range
        needed: usize,
        /// Bytes actually read
        got: usize,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other I/O errors (config files, store setup)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Classify this error according to the runtime's failure taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Allocation { .. } | RuntimeError::WorkspaceTooSmall { .. } => {
                ErrorKind::ResourceExhaustion
            }
            RuntimeError::UnknownChunk(_) => ErrorKind::UnknownIdentity,
            RuntimeError::InvalidAlignment(_)
            | RuntimeError::DuplicateChunk(_)
            | RuntimeError::DimensionMismatch { .. }
            | RuntimeError::UnsupportedType { .. }
            | RuntimeError::Precondition(_) => ErrorKind::Precondition,
            RuntimeError::PagingRead { .. } | RuntimeError::ShortRead { .. } | RuntimeError::Io(_) => {
                ErrorKind::Io
            }
            RuntimeError::Config(_) | RuntimeError::Serialization(_) => ErrorKind::Config,
        }
    }

    /// Shorthand for a dimension mismatch
    pub(crate) fn dims(what: &'static str, expected: usize, actual: usize) -> Self {
        RuntimeError::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }
}

/// Flat error value returned across the host boundary.
///
/// Mirrors the `{error, message}` pair embedders expect; never carries a
/// panic or exception across the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerInferError {
    /// `true` when the call failed
    pub error: bool,
    /// Human readable status, `"Success"` on success
    pub message: String,
}

impl PowerInferError {
    /// Successful status
    pub fn success() -> Self {
        Self {
            error: false,
            message: "Success".to_string(),
        }
    }

    /// Failed status with a message
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: message.into(),
        }
    }

    /// Whether the call succeeded
    pub fn is_ok(&self) -> bool {
        !self.error
    }
}

impl fmt::Display for PowerInferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.error {
            write!(f, "error: {}", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl From<RuntimeError> for PowerInferError {
    fn from(err: RuntimeError) -> Self {
        PowerInferError::failure(err.to_string())
    }
}

impl<T> From<Result<T>> for PowerInferError {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => PowerInferError::success(),
            Err(e) => e.into(),
        }
    }
}
