//! Ember script runtime
//!
//! An embeddable, dynamically-typed script runtime reduced to the surface
//! an embedding layer drives directly:
//! - NaN-boxed values and an evaluation stack with typed push/check
//!   primitives
//! - Tables (with weak-value mode) and a registry table for VM-owned
//!   auxiliary state
//! - Userdata with an extensible-object protocol
//!   (index / newindex / call / finalize hooks)
//! - Native closures with traced upvalues
//! - Explicit, host-driven mark-sweep collection with finalizers
//! - Memory accounting through a single realloc-style hook
//!
//! There is no interpreter, compiler, or standard library in this crate;
//! the runtime is consumed as an opaque value machine.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod heap;
pub mod memory;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{ScriptError, ScriptResult};
pub use heap::{NativeClosure, NativeFn, SlotData, Userdata};
pub use memory::MemoryAccount;
pub use table::{Table, TableKey};
pub use value::{Value, INT_MAX, INT_MIN};
pub use vm::{Hook, UserdataClass, UserdataClassId, Vm, VmId};
