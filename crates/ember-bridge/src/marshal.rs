//! Value marshaler
//!
//! Converts values between the VM's stack representation and the host's
//! native representation. Primitives convert by value; the three
//! text-like host kinds copy bytes in both directions; object references
//! delegate to the proxy registry; struct values delegate to the struct
//! registry. Numeric coercion is deliberately narrow: integers widen to
//! float kinds, integral floats narrow to integer kinds, nothing else —
//! in particular no string↔number coercion, so declared-type violations
//! surface as `TypeMismatch` instead of being papered over.

use ember_reflect::{HostValue, LocText, StructValue, Symbol, TypeKind};
use ember_script::{Value, Vm, INT_MAX, INT_MIN};

use crate::env::EnvCore;
use crate::error::{BridgeError, BridgeResult};
use crate::proxy;
use crate::structs::{self, StructInstance};

fn mismatch(vm: &Vm, ty: &TypeKind, v: Value) -> BridgeError {
    BridgeError::TypeMismatch {
        expected: ty.name(),
        got: vm.describe(v).into(),
    }
}

/// An integer view of a script number: ints directly, floats only when
/// integral.
fn integer_of(v: Value) -> Option<i64> {
    if let Some(i) = v.as_int() {
        return Some(i);
    }
    let f = v.as_float()?;
    if f.is_finite() && f.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(&f) {
        Some(f as i64)
    } else {
        None
    }
}

/// Write a host value onto the VM stack as a script-representable value.
pub(crate) fn push_value(vm: &mut Vm, core: &EnvCore, value: &HostValue) -> BridgeResult<()> {
    match value {
        HostValue::Bool(b) => vm.push_bool(*b),
        HostValue::Int32(i) => vm.push_int(*i as i64)?,
        HostValue::Int64(i) => {
            if *i < INT_MIN || *i > INT_MAX {
                return Err(BridgeError::TypeMismatch {
                    expected: "script integer (48-bit)".into(),
                    got: format!("int64 {i}"),
                });
            }
            vm.push_int(*i)?;
        }
        HostValue::Float32(f) => vm.push_float(*f as f64),
        HostValue::Float64(f) => vm.push_float(*f),
        HostValue::Text(s) => vm.push_str(s)?,
        HostValue::LocText(t) => vm.push_str(&t.text)?,
        HostValue::Name(n) => vm.push_str(&n.resolve())?,
        HostValue::Object(None) => vm.push_null(),
        HostValue::Object(Some(h)) => {
            let proxy = proxy::obtain_proxy(vm, core, *h)?;
            vm.push_value(proxy);
        }
        HostValue::Struct(sv) => {
            let instance = structs::push_struct_owned(vm, core, &sv.ty, &sv.bytes)?;
            vm.push_value(instance);
        }
    }
    Ok(())
}

/// Read a stack value, converting it to the expected host kind; fails
/// with `TypeMismatch` when the shape is incompatible, `StaleProxy` when
/// an object argument's host object died.
pub(crate) fn check_value(
    vm: &mut Vm,
    core: &EnvCore,
    idx: i32,
    ty: &TypeKind,
) -> BridgeResult<HostValue> {
    let v = vm.value_at(idx)?;
    match ty {
        TypeKind::Bool => v
            .as_bool()
            .map(HostValue::Bool)
            .ok_or_else(|| mismatch(vm, ty, v)),
        TypeKind::Int32 => match integer_of(v) {
            Some(i) if i32::try_from(i).is_ok() => Ok(HostValue::Int32(i as i32)),
            _ => Err(mismatch(vm, ty, v)),
        },
        TypeKind::Int64 => integer_of(v)
            .map(HostValue::Int64)
            .ok_or_else(|| mismatch(vm, ty, v)),
        TypeKind::Float32 => {
            if let Some(f) = v.as_float() {
                Ok(HostValue::Float32(f as f32))
            } else if let Some(i) = v.as_int() {
                Ok(HostValue::Float32(i as f32))
            } else {
                Err(mismatch(vm, ty, v))
            }
        }
        TypeKind::Float64 => {
            if let Some(f) = v.as_float() {
                Ok(HostValue::Float64(f))
            } else if let Some(i) = v.as_int() {
                Ok(HostValue::Float64(i as f64))
            } else {
                Err(mismatch(vm, ty, v))
            }
        }
        TypeKind::Text => Ok(HostValue::Text(
            vm.str_value(v).map_err(|_| mismatch(vm, ty, v))?.to_owned(),
        )),
        TypeKind::LocText => Ok(HostValue::LocText(LocText::literal(
            vm.str_value(v).map_err(|_| mismatch(vm, ty, v))?,
        ))),
        TypeKind::Name => Ok(HostValue::Name(Symbol::intern(
            vm.str_value(v).map_err(|_| mismatch(vm, ty, v))?,
        ))),
        TypeKind::Object(expected) => {
            if v.is_null() {
                return Ok(HostValue::Object(None));
            }
            let (handle, class) = proxy::proxy_data(vm, core, v)
                .map_err(|_| mismatch(vm, ty, v))?;
            if !core.host.borrow().is_valid(handle) {
                return Err(BridgeError::StaleProxy);
            }
            if !class.assignable_to(expected) {
                return Err(BridgeError::TypeMismatch {
                    expected: ty.name(),
                    got: format!("object<{}>", class.name()),
                });
            }
            Ok(HostValue::Object(Some(handle)))
        }
        TypeKind::Struct(expected) => {
            if !vm.is_userdata_of(v, core.classes.struct_instance) {
                return Err(mismatch(vm, ty, v));
            }
            let (actual, bytes) =
                vm.with_userdata::<StructInstance, _>(v, |s| (s.ty.clone(), s.bytes().to_vec()))?;
            if !std::sync::Arc::ptr_eq(&actual, expected) {
                return Err(BridgeError::TypeMismatch {
                    expected: ty.name(),
                    got: format!("struct<{}>", actual.name()),
                });
            }
            Ok(HostValue::Struct(StructValue {
                ty: actual,
                bytes,
            }))
        }
    }
}

/// Generic property push: read through the property's access strategy,
/// then dispatch on the descriptor's kind.
pub(crate) fn push_property_value(
    vm: &mut Vm,
    core: &EnvCore,
    handle: ember_reflect::HostHandle,
    prop: &ember_reflect::PropertyDescriptor,
) -> BridgeResult<()> {
    let value = { core.host.borrow().property_value(handle, prop)? };
    push_value(vm, core, &value)
}

/// Generic property check: convert against the descriptor's declared
/// kind.
pub(crate) fn check_property_value(
    vm: &mut Vm,
    core: &EnvCore,
    idx: i32,
    prop: &ember_reflect::PropertyDescriptor,
) -> BridgeResult<HostValue> {
    check_value(vm, core, idx, &prop.ty)
}

/// Natural host mapping of a script value, used for script→host returns
/// where no declared kind exists (callback results). `None` for null.
pub(crate) fn value_to_host(
    vm: &Vm,
    core: &EnvCore,
    v: Value,
) -> BridgeResult<Option<HostValue>> {
    if v.is_null() {
        return Ok(None);
    }
    if let Some(b) = v.as_bool() {
        return Ok(Some(HostValue::Bool(b)));
    }
    if let Some(i) = v.as_int() {
        return Ok(Some(HostValue::Int64(i)));
    }
    if let Some(f) = v.as_float() {
        return Ok(Some(HostValue::Float64(f)));
    }
    if let Ok(s) = vm.str_value(v) {
        return Ok(Some(HostValue::Text(s.to_owned())));
    }
    if vm.is_userdata_of(v, core.classes.proxy) {
        let handle = proxy::resolve_host_handle(vm, core, v)?;
        return Ok(Some(HostValue::Object(Some(handle))));
    }
    if vm.is_userdata_of(v, core.classes.struct_instance) {
        let sv = vm.with_userdata::<StructInstance, _>(v, |s| StructValue {
            ty: s.ty.clone(),
            bytes: s.bytes().to_vec(),
        })?;
        return Ok(Some(HostValue::Struct(sv)));
    }
    Err(BridgeError::TypeMismatch {
        expected: "marshalable value".into(),
        got: vm.describe(v).into(),
    })
}

/// Zero/empty value of a kind, used to fill pure-out argument slots.
pub(crate) fn default_value(ty: &TypeKind) -> HostValue {
    match ty {
        TypeKind::Bool => HostValue::Bool(false),
        TypeKind::Int32 => HostValue::Int32(0),
        TypeKind::Int64 => HostValue::Int64(0),
        TypeKind::Float32 => HostValue::Float32(0.0),
        TypeKind::Float64 => HostValue::Float64(0.0),
        TypeKind::Text => HostValue::Text(String::new()),
        TypeKind::LocText => HostValue::LocText(LocText::literal("")),
        TypeKind::Name => HostValue::Name(Symbol::NONE),
        TypeKind::Object(_) => HostValue::Object(None),
        TypeKind::Struct(s) => HostValue::Struct(StructValue {
            ty: s.clone(),
            bytes: s.default_bytes(),
        }),
    }
}
