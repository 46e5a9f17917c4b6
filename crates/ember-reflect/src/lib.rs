//! Ember host reflection model
//!
//! The host side of the script↔host boundary: runtime type descriptors
//! (classes, properties, functions, structured value types), a generic
//! invoke path, an interned symbol table, a byte-level property codec,
//! and the host object registry with its root-scanning collection pass.
//!
//! Bridging layers consume descriptors on demand — nothing here expects
//! member lookups to be cached, and classes/functions may keep being
//! registered while script runs.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod class;
pub mod codec;
pub mod error;
pub mod registry;
pub mod structs;
pub mod symbol;
pub mod types;

pub use class::{
    ClassBuilder, ClassDescriptor, FunctionBuilder, FunctionDescriptor, GetFn, InitFn, InvokeCtx,
    InvokeFn, ParamDescriptor, PropertyAccess, PropertyDescriptor, ScriptCallback, SetFn,
};
pub use error::{HostError, HostResult};
pub use registry::{HostHandle, HostRegistry, SharedRegistry, TextArena, TextEntry};
pub use structs::{StructBuilder, StructDescriptor, StructDropFn};
pub use symbol::Symbol;
pub use types::{HostValue, LocText, StructValue, TypeKind};
