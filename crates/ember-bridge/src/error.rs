//! Bridge error taxonomy
//!
//! Everything except `Fatal` is recoverable: raised as a script-level
//! error at the dispatch boundary so script code may catch it, and never
//! allowed to unwind into host call frames. `Fatal` (allocation failure,
//! a panic crossing the boundary) permanently poisons the environment.

use ember_reflect::HostError;
use ember_script::ScriptError;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised by the marshaling and identity-management layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// A value's shape is incompatible with the expected host type
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type/kind name
        expected: String,
        /// Actual shape name
        got: String,
    },

    /// The host object behind a proxy is no longer valid
    #[error("stale proxy: host object no longer valid")]
    StaleProxy,

    /// A struct type crossed the boundary without prior registration
    #[error("unknown struct type '{0}'")]
    UnknownStructType(String),

    /// Reflective member lookup failed
    #[error("no such member '{member}' on {class}")]
    NoSuchMember {
        /// Class or struct type name
        class: String,
        /// Member name looked up
        member: String,
    },

    /// Write attempted on a read-only property
    #[error("member '{member}' on {class} is read-only")]
    ReadOnlyMember {
        /// Class or struct type name
        class: String,
        /// Member name
        member: String,
    },

    /// Call argument count violates the function descriptor
    #[error("arity mismatch: takes {required}..={accepted} arguments, got {got}")]
    ArityMismatch {
        /// Required parameter count
        required: usize,
        /// Total accepted parameter count
        accepted: usize,
        /// Supplied argument count
        got: usize,
    },

    /// A reverse-reference id did not resolve to a live entry
    #[error("unknown script reference {0}")]
    UnknownReference(u64),

    /// Script-level failure surfaced to the host
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// Host-side reflection failure
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// The environment can no longer run script
    #[error("fatal: {0}")]
    Fatal(String),
}

impl BridgeError {
    /// True when the environment must be treated as unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Fatal(_) => true,
            BridgeError::Script(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Raise a bridge error into the script layer at the dispatch boundary.
/// Script-originated errors pass through unchanged; everything else
/// becomes a script-visible error carrying the descriptive message.
impl From<BridgeError> for ScriptError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Script(inner) => inner,
            other => ScriptError::Runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_passes_through() {
        let inner = ScriptError::runtime("boom");
        let bridged = BridgeError::Script(inner);
        let back: ScriptError = bridged.into();
        assert_eq!(back.to_string(), "boom");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::Fatal("x".into()).is_fatal());
        assert!(BridgeError::Script(ScriptError::Poisoned).is_fatal());
        assert!(!BridgeError::StaleProxy.is_fatal());
        assert!(!BridgeError::Script(ScriptError::runtime("x")).is_fatal());
    }
}
