//! Host-side error types

/// Result type for host reflection operations
pub type HostResult<T> = Result<T, HostError>;

/// Errors raised by the host object system and reflection model
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    /// Handle does not address a live host object
    #[error("invalid or destroyed object handle")]
    InvalidHandle,

    /// Byte access outside an instance's storage
    #[error("field access at offset {offset}+{len} outside storage of {size} bytes")]
    OutOfBounds {
        /// Field offset
        offset: usize,
        /// Field byte length
        len: usize,
        /// Instance storage size
        size: usize,
    },

    /// A value of the wrong kind reached a typed slot
    #[error("value kind mismatch: expected {expected}, got {got}")]
    ValueKind {
        /// Expected kind name
        expected: String,
        /// Actual kind name
        got: String,
    },

    /// Text arena id did not resolve
    #[error("dangling text id {0}")]
    DanglingText(u32),

    /// A reflected invocation failed host-side
    #[error("invocation failed: {0}")]
    Invoke(String),

    /// A script callback invoked from host code failed
    #[error("script callback failed: {0}")]
    Script(String),
}
