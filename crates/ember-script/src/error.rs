//! Script runtime errors

/// Script execution result
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Script runtime errors
///
/// Everything except `OutOfMemory` and `Poisoned` is recoverable: the error
/// propagates to the nearest protected boundary and script (or the embedder)
/// may handle it. `OutOfMemory` permanently poisons the VM instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// Error raised by script code or a protocol hook
    #[error("{0}")]
    Runtime(String),

    /// A stack index addressed a slot outside the current frame
    #[error("stack index {0} out of range")]
    BadStackIndex(i32),

    /// A typed stack read found a value of the wrong shape
    #[error("expected {expected}, got {got}")]
    BadType {
        /// Expected shape name
        expected: &'static str,
        /// Actual shape name
        got: &'static str,
    },

    /// A heap handle addressed a freed or never-allocated slot
    #[error("invalid heap reference")]
    InvalidRef,

    /// Allocation refused by the memory account; the VM is now unusable
    #[error("out of memory (used {used} bytes, limit {limit} bytes)")]
    OutOfMemory {
        /// Bytes accounted at the time of refusal
        used: usize,
        /// Configured limit
        limit: usize,
    },

    /// Operation attempted on a VM that already failed fatally
    #[error("VM instance is no longer usable")]
    Poisoned,

    /// Allocation attempted from inside a finalizer or collection pass
    #[error("allocation during collection")]
    AllocInCollect,
}

impl ScriptError {
    /// Construct a runtime error with a formatted message.
    pub fn runtime(msg: impl Into<String>) -> Self {
        ScriptError::Runtime(msg.into())
    }

    /// True if the VM instance cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScriptError::OutOfMemory { .. } | ScriptError::Poisoned)
    }
}
