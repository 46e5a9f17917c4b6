//! Reflective dispatcher
//!
//! Implements the VM's extensible-object protocol (index / newindex /
//! call / finalize) for the bridge's userdata classes. Every dispatch is
//! one synchronous sequence — fresh descriptor lookup, marshal, invoke,
//! marshal back — with no state carried between dispatches beyond the
//! registries; member thunks capture the member *name* and re-resolve the
//! descriptor at call time, since the reflection system may be extended
//! while script runs.
//!
//! All failures raise as script-level errors at the hook boundary; they
//! never unwind into host call frames.

use std::rc::Rc;
use std::sync::Arc;

use ember_reflect::{
    codec, ClassDescriptor, FunctionDescriptor, HostError, HostHandle, HostValue, InvokeCtx,
    PropertyAccess, ScriptCallback, StructDescriptor,
};
use ember_script::{
    NativeFn, ScriptError, ScriptResult, TableKey, UserdataClass, Value, Vm,
};

use crate::env::{env_core, BridgeClasses, EnvCore};
use crate::error::{BridgeError, BridgeResult};
use crate::marshal;
use crate::proxy;
use crate::structs::{self, StructInstance};

/// Payload of a class-object userdata (class-as-constructor).
pub(crate) struct ClassObject {
    pub class: Arc<ClassDescriptor>,
}

/// Payload of a struct-type userdata (struct-as-constructor).
pub(crate) struct StructTypeObject {
    pub ty: Arc<StructDescriptor>,
}

/// Register the bridge's userdata protocol classes with a fresh VM.
pub(crate) fn register_classes(vm: &mut Vm) -> BridgeClasses {
    let proxy = vm.register_class(UserdataClass {
        name: "host-object",
        index: Some(proxy_index),
        newindex: Some(proxy_newindex),
        call: None,
        finalize: None,
    });
    let struct_instance = vm.register_class(UserdataClass {
        name: "host-struct",
        index: Some(struct_index),
        newindex: Some(struct_newindex),
        call: None,
        finalize: Some(struct_finalize),
    });
    let class_object = vm.register_class(UserdataClass {
        name: "host-class",
        index: None,
        newindex: None,
        call: Some(class_call),
        finalize: None,
    });
    let struct_type = vm.register_class(UserdataClass {
        name: "host-struct-type",
        index: None,
        newindex: None,
        call: Some(struct_type_call),
        finalize: None,
    });
    BridgeClasses {
        proxy,
        struct_instance,
        class_object,
        struct_type,
    }
}

/// Push a class object; calling it constructs a host object.
pub(crate) fn push_class_object(
    vm: &mut Vm,
    core: &EnvCore,
    class: &Arc<ClassDescriptor>,
) -> BridgeResult<Value> {
    Ok(vm.new_userdata(
        core.classes.class_object,
        Box::new(ClassObject {
            class: class.clone(),
        }),
        std::mem::size_of::<ClassObject>(),
    )?)
}

/// Push a struct-type object; calling it constructs a default instance.
/// Pushing the type object bridges the type, so it is registered here.
pub(crate) fn push_struct_type_object(
    vm: &mut Vm,
    core: &EnvCore,
    desc: &Arc<StructDescriptor>,
) -> BridgeResult<Value> {
    structs::register_struct_type(core, desc);
    Ok(vm.new_userdata(
        core.classes.struct_type,
        Box::new(StructTypeObject { ty: desc.clone() }),
        std::mem::size_of::<StructTypeObject>(),
    )?)
}

fn is_table(vm: &Vm, v: Value) -> bool {
    vm.describe(v) == "table"
}

// ============================================================================
// Proxy hooks
// ============================================================================

fn proxy_index(vm: &mut Vm) -> ScriptResult<usize> {
    let core = env_core(vm)?;
    let target = vm.value_at(1)?;
    let name = vm.check_str(2)?;
    dispatch_proxy_index(vm, &core, target, &name).map_err(ScriptError::from)
}

fn dispatch_proxy_index(
    vm: &mut Vm,
    core: &EnvCore,
    target: Value,
    name: &str,
) -> BridgeResult<usize> {
    let (handle, class) = proxy::proxy_data(vm, core, target)?;
    if !core.host.borrow().is_valid(handle) {
        return Err(BridgeError::StaleProxy);
    }
    if let Some(prop) = class.find_property(name) {
        marshal::push_property_value(vm, core, handle, prop)?;
        return Ok(1);
    }
    if class.find_function(name).is_some() {
        let thunk = member_thunk(vm, target, name)?;
        vm.push_value(thunk);
        return Ok(1);
    }
    Err(BridgeError::NoSuchMember {
        class: class.name().to_string(),
        member: name.to_string(),
    })
}

fn proxy_newindex(vm: &mut Vm) -> ScriptResult<usize> {
    let core = env_core(vm)?;
    let target = vm.value_at(1)?;
    let name = vm.check_str(2)?;
    dispatch_proxy_newindex(vm, &core, target, &name).map_err(ScriptError::from)?;
    Ok(0)
}

fn dispatch_proxy_newindex(
    vm: &mut Vm,
    core: &EnvCore,
    target: Value,
    name: &str,
) -> BridgeResult<()> {
    let (handle, class) = proxy::proxy_data(vm, core, target)?;
    if !core.host.borrow().is_valid(handle) {
        return Err(BridgeError::StaleProxy);
    }
    let prop = class.find_property(name).ok_or_else(|| BridgeError::NoSuchMember {
        class: class.name().to_string(),
        member: name.to_string(),
    })?;
    if prop.read_only {
        return Err(BridgeError::ReadOnlyMember {
            class: class.name().to_string(),
            member: name.to_string(),
        });
    }
    let value = marshal::check_property_value(vm, core, 3, prop)?;
    core.host
        .borrow_mut()
        .set_property_value(handle, prop, &value)?;
    Ok(())
}

/// A bound thunk for a callable member: receiver in upvalue 0, member
/// name captured, descriptor re-resolved on every invocation.
fn member_thunk(vm: &mut Vm, receiver: Value, name: &str) -> BridgeResult<Value> {
    let member = name.to_string();
    let func: NativeFn = Rc::new(move |vm: &mut Vm| {
        let core = env_core(vm)?;
        let receiver = vm.upvalue(0)?;
        let nargs = vm.stack_size();
        member_call(vm, &core, receiver, &member, nargs).map_err(ScriptError::from)
    });
    Ok(vm.new_native(name, func, vec![receiver])?)
}

fn member_call(
    vm: &mut Vm,
    core: &EnvCore,
    receiver: Value,
    name: &str,
    nargs: usize,
) -> BridgeResult<usize> {
    let (handle, class) = proxy::proxy_data(vm, core, receiver)?;
    if !core.host.borrow().is_valid(handle) {
        return Err(BridgeError::StaleProxy);
    }
    let func = class.find_function(name).ok_or_else(|| BridgeError::NoSuchMember {
        class: class.name().to_string(),
        member: name.to_string(),
    })?;
    invoke_function(vm, core, Some(handle), func, nargs)
}

// ============================================================================
// Reflected invocation
// ============================================================================

fn host_err(e: impl std::fmt::Display) -> HostError {
    HostError::Script(e.to_string())
}

/// Host→script capability scoped to one reflected invocation.
struct CallbackShim<'a> {
    vm: &'a mut Vm,
    core: &'a EnvCore,
}

impl ScriptCallback for CallbackShim<'_> {
    fn call_reference(
        &mut self,
        reference: u64,
        args: &[HostValue],
    ) -> Result<Option<HostValue>, HostError> {
        let callee = self
            .vm
            .table_raw_get(self.core.ref_table, &TableKey::Int(reference as i64))
            .map_err(host_err)?;
        if callee.is_null() {
            return Err(HostError::Script(format!(
                "unknown script reference {reference}"
            )));
        }
        let mut script_args = Vec::with_capacity(args.len());
        for a in args {
            marshal::push_value(self.vm, self.core, a).map_err(host_err)?;
            script_args.push(self.vm.pop_value().map_err(host_err)?);
        }
        let results = self
            .vm
            .call_values(callee, &script_args)
            .map_err(host_err)?;
        match results.first() {
            Some(v) => marshal::value_to_host(self.vm, self.core, *v).map_err(host_err),
            None => Ok(None),
        }
    }
}

/// Build the argument frame positionally, invoke through the descriptor's
/// generic entry point, write out-params back, and marshal the return.
pub(crate) fn invoke_function(
    vm: &mut Vm,
    core: &EnvCore,
    recv: Option<HostHandle>,
    func: &FunctionDescriptor,
    nargs: usize,
) -> BridgeResult<usize> {
    let required = func.required_params();
    let accepted = func.params.len();
    if nargs < required || nargs > accepted {
        return Err(BridgeError::ArityMismatch {
            required,
            accepted,
            got: nargs,
        });
    }

    let mut frame: Vec<HostValue> = Vec::with_capacity(accepted);
    for (i, param) in func.params.iter().enumerate() {
        if i >= nargs {
            // The arity window guarantees this tail is default-valued.
            match &param.default {
                Some(d) => frame.push(d.clone()),
                None => frame.push(marshal::default_value(&param.ty)),
            }
            continue;
        }
        let idx = (i + 1) as i32;
        let arg = vm.value_at(idx)?;
        if param.out && is_table(vm, arg) {
            // Mutable container: input taken from slot 1 when present,
            // else the kind's zero value; the post-call value is written
            // back below.
            let slot = vm.table_raw_get(arg, &TableKey::Int(1))?;
            if slot.is_null() {
                frame.push(marshal::default_value(&param.ty));
            } else {
                vm.push_value(slot);
                let converted = marshal::check_value(vm, core, -1, &param.ty);
                vm.pop_value()?;
                frame.push(converted?);
            }
        } else {
            frame.push(marshal::check_value(vm, core, idx, &param.ty)?);
        }
    }

    let result = {
        let mut shim = CallbackShim { vm: &mut *vm, core };
        let mut ctx = InvokeCtx::new(&core.host, Some(&mut shim));
        (func.invoke)(&mut ctx, recv, &mut frame)?
    };

    // Out-params write back into table-typed arguments only; any other
    // argument shape drops the out value (documented limitation — the
    // table is the runtime's only mutable container).
    for (i, param) in func.params.iter().enumerate() {
        if !param.out || i >= nargs {
            continue;
        }
        let arg = vm.value_at((i + 1) as i32)?;
        if is_table(vm, arg) {
            marshal::push_value(vm, core, &frame[i])?;
            let v = vm.pop_value()?;
            vm.table_raw_set(arg, TableKey::Int(1), v)?;
        }
    }

    match result {
        Some(ret) => {
            marshal::push_value(vm, core, &ret)?;
            Ok(1)
        }
        None => Ok(0),
    }
}

// ============================================================================
// Struct-instance hooks
// ============================================================================

fn struct_index(vm: &mut Vm) -> ScriptResult<usize> {
    let core = env_core(vm)?;
    let target = vm.value_at(1)?;
    let name = vm.check_str(2)?;
    dispatch_struct_index(vm, &core, target, &name).map_err(ScriptError::from)
}

fn dispatch_struct_index(
    vm: &mut Vm,
    core: &EnvCore,
    target: Value,
    name: &str,
) -> BridgeResult<usize> {
    let ty = vm.with_userdata::<StructInstance, _>(target, |s| s.ty.clone())?;
    let field = ty.find_field(name).ok_or_else(|| BridgeError::NoSuchMember {
        class: ty.name().to_string(),
        member: name.to_string(),
    })?;
    let value = {
        let host = core.host.borrow();
        vm.with_userdata::<StructInstance, _>(target, |s| match &field.access {
            PropertyAccess::Offset(offset) => codec::read(s.bytes(), *offset, &field.ty, host.texts()),
            PropertyAccess::Accessor { get, .. } => Ok(get(s.bytes())),
        })??
    };
    marshal::push_value(vm, core, &value)?;
    Ok(1)
}

fn struct_newindex(vm: &mut Vm) -> ScriptResult<usize> {
    let core = env_core(vm)?;
    let target = vm.value_at(1)?;
    let name = vm.check_str(2)?;
    dispatch_struct_newindex(vm, &core, target, &name).map_err(ScriptError::from)?;
    Ok(0)
}

fn dispatch_struct_newindex(
    vm: &mut Vm,
    core: &EnvCore,
    target: Value,
    name: &str,
) -> BridgeResult<()> {
    let ty = vm.with_userdata::<StructInstance, _>(target, |s| s.ty.clone())?;
    let field = ty.find_field(name).ok_or_else(|| BridgeError::NoSuchMember {
        class: ty.name().to_string(),
        member: name.to_string(),
    })?;
    if field.read_only {
        return Err(BridgeError::ReadOnlyMember {
            class: ty.name().to_string(),
            member: name.to_string(),
        });
    }
    let value = marshal::check_value(vm, core, 3, &field.ty)?;
    {
        let mut host = core.host.borrow_mut();
        vm.with_userdata_mut::<StructInstance, _>(target, |s| match &field.access {
            PropertyAccess::Offset(offset) => {
                codec::write(s.bytes_mut(), *offset, &field.ty, &value, host.texts_mut())
            }
            PropertyAccess::Accessor { set, .. } => match set {
                Some(set) => set(s.bytes_mut(), &value),
                None => Err(HostError::Invoke(format!(
                    "field '{}' has no setter",
                    field.name
                ))),
            },
        })??;
    }
    Ok(())
}

fn struct_finalize(vm: &mut Vm) -> ScriptResult<usize> {
    structs::on_finalize(vm)
}

// ============================================================================
// Constructor hooks
// ============================================================================

fn class_call(vm: &mut Vm) -> ScriptResult<usize> {
    let core = env_core(vm)?;
    let target = vm.value_at(1)?;
    let class = vm.with_userdata::<ClassObject, _>(target, |c| c.class.clone())?;
    let handle = core.host.borrow_mut().create(&class);
    let proxy = proxy::obtain_proxy(vm, &core, handle).map_err(ScriptError::from)?;
    vm.push_value(proxy);
    Ok(1)
}

fn struct_type_call(vm: &mut Vm) -> ScriptResult<usize> {
    let core = env_core(vm)?;
    let target = vm.value_at(1)?;
    let ty = vm.with_userdata::<StructTypeObject, _>(target, |t| t.ty.clone())?;
    let instance = structs::push_struct_owned(vm, &core, &ty, &ty.default_bytes())
        .map_err(ScriptError::from)?;
    vm.push_value(instance);
    Ok(1)
}
