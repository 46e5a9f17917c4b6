//! Ember bridge
//!
//! Bidirectional bridge between the `ember-script` runtime and a host
//! object system exposing the `ember-reflect` model. The bridge converts
//! values across the boundary, preserves host object identity across
//! repeated crossings, keeps host objects alive while script references
//! them (and script values alive while host code holds them), and
//! dispatches reflective property/function access through the VM's
//! extensible-object protocol.
//!
//! Neither side sees the other's memory model: the script collector owns
//! proxies and struct copies; the host collector learns about script-held
//! host objects through one root-enumeration hook.
//!
//! # Single-threading
//!
//! The whole bridge is single-threaded by contract — see
//! [`env::Environment`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod dispatch;
mod marshal;
mod proxy;
mod structs;

pub mod env;
pub mod error;

pub use env::{Environment, RefId, RefKind};
pub use error::{BridgeError, BridgeResult};

// The collaborator surfaces embedders need alongside the bridge.
pub use ember_reflect as reflect;
pub use ember_script as script;
