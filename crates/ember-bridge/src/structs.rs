//! Struct registry
//!
//! Tracks which structured value *types* have been bridged (instances are
//! owned by the script collector once pushed) and manages the two
//! instance forms: borrowed views into host storage and script-owned
//! copies released through the VM's finalization callback.

use std::ptr::NonNull;
use std::sync::Arc;

use ember_reflect::StructDescriptor;
use ember_script::{ScriptResult, Value, Vm};

use crate::env::EnvCore;
use crate::error::{BridgeError, BridgeResult};

/// Instance storage: a view into host-owned bytes or an owned copy.
pub(crate) enum StructStorage {
    /// Script-owned copy, freed exactly once via finalization.
    Owned(Box<[u8]>),
    /// View into storage the host guarantees outlives script use.
    Borrowed(NonNull<u8>, usize),
}

/// Payload of a struct-instance userdata.
pub(crate) struct StructInstance {
    pub ty: Arc<StructDescriptor>,
    data: StructStorage,
    finalized: bool,
}

impl StructInstance {
    pub(crate) fn bytes(&self) -> &[u8] {
        match &self.data {
            StructStorage::Owned(b) => b,
            // Caller of push_struct_borrowed guarantees validity for the
            // value's reachable lifetime.
            StructStorage::Borrowed(p, n) => unsafe { std::slice::from_raw_parts(p.as_ptr(), *n) },
        }
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            StructStorage::Owned(b) => b,
            StructStorage::Borrowed(p, n) => unsafe {
                std::slice::from_raw_parts_mut(p.as_ptr(), *n)
            },
        }
    }

    /// Run the type's drop hook on an owned copy, once. Borrowed views
    /// have nothing to release.
    pub(crate) fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if let StructStorage::Owned(bytes) = &mut self.data {
            if let Some(drop_fn) = self.ty.drop_fn() {
                drop_fn(bytes);
            }
        }
    }
}

/// Record that values of this type may cross the boundary. Idempotent;
/// re-registering the same name keeps the first descriptor.
pub(crate) fn register_struct_type(core: &EnvCore, desc: &Arc<StructDescriptor>) {
    core.structs
        .borrow_mut()
        .entry(desc.name().to_string())
        .or_insert_with(|| desc.clone());
}

fn ensure_registered(core: &EnvCore, desc: &Arc<StructDescriptor>) -> BridgeResult<()> {
    if core.structs.borrow().contains_key(desc.name()) {
        Ok(())
    } else {
        Err(BridgeError::UnknownStructType(desc.name().to_string()))
    }
}

fn ensure_size(desc: &Arc<StructDescriptor>, len: usize) -> BridgeResult<()> {
    if len == desc.size() {
        Ok(())
    } else {
        Err(BridgeError::TypeMismatch {
            expected: format!("struct<{}> ({} bytes)", desc.name(), desc.size()),
            got: format!("{len} bytes"),
        })
    }
}

fn push_instance(
    vm: &mut Vm,
    core: &EnvCore,
    desc: &Arc<StructDescriptor>,
    data: StructStorage,
) -> BridgeResult<Value> {
    let accounted = match &data {
        StructStorage::Owned(b) => b.len(),
        StructStorage::Borrowed(..) => 0,
    };
    Ok(vm.new_userdata(
        core.classes.struct_instance,
        Box::new(StructInstance {
            ty: desc.clone(),
            data,
            finalized: false,
        }),
        accounted,
    )?)
}

/// Push a script-owned copy of `bytes`. Mutating the source afterwards
/// does not affect the script-visible value.
pub(crate) fn push_struct_owned(
    vm: &mut Vm,
    core: &EnvCore,
    desc: &Arc<StructDescriptor>,
    bytes: &[u8],
) -> BridgeResult<Value> {
    ensure_registered(core, desc)?;
    ensure_size(desc, bytes.len())?;
    push_instance(
        vm,
        core,
        desc,
        StructStorage::Owned(bytes.to_vec().into_boxed_slice()),
    )
}

/// Push a view into host storage; reads and writes go straight through.
pub(crate) fn push_struct_borrowed(
    vm: &mut Vm,
    core: &EnvCore,
    desc: &Arc<StructDescriptor>,
    ptr: NonNull<u8>,
    len: usize,
) -> BridgeResult<Value> {
    ensure_registered(core, desc)?;
    ensure_size(desc, len)?;
    push_instance(vm, core, desc, StructStorage::Borrowed(ptr, len))
}

/// Finalization callback body for struct-instance userdata. Runs during
/// a collection pass: touches only the payload, no allocation, no
/// reentry into the VM.
pub(crate) fn on_finalize(vm: &mut Vm) -> ScriptResult<usize> {
    let target = vm.value_at(1)?;
    vm.with_userdata_mut::<StructInstance, _>(target, |inst| inst.finalize())?;
    Ok(0)
}
