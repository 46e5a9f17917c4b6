//! Proxy registry
//!
//! Identity-preserving mapping between host objects and their script-side
//! proxies, plus the reverse-reference bookkeeping that keeps host
//! objects alive while script references them.
//!
//! Two tables, both in VM-managed storage:
//! - the proxy table is weak-valued and keyed by host handle bits, so the
//!   script collector may drop entries whose proxy became unreachable —
//!   `obtain_proxy` is therefore idempotent-with-possible-recreation;
//! - the reverse-reference table is strong and keyed by reference id,
//!   pinning script values host code holds across calls. A side map
//!   carries each entry's kind, owning context, count, and (for proxies)
//!   the host handle reported to the host collector.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use ember_reflect::{ClassDescriptor, HostHandle};
use ember_script::{TableKey, Value, Vm};

use crate::env::{EnvCore, RefId, RefInfo, RefKind};
use crate::error::{BridgeError, BridgeResult};

/// Payload of a proxy userdata.
pub(crate) struct ProxyData {
    pub handle: HostHandle,
    pub class: Arc<ClassDescriptor>,
}

/// Read a proxy's payload, failing with a shape mismatch otherwise.
pub(crate) fn proxy_data(
    vm: &Vm,
    core: &EnvCore,
    value: Value,
) -> BridgeResult<(HostHandle, Arc<ClassDescriptor>)> {
    if !vm.is_userdata_of(value, core.classes.proxy) {
        return Err(BridgeError::TypeMismatch {
            expected: "object proxy".into(),
            got: vm.describe(value).into(),
        });
    }
    Ok(vm.with_userdata::<ProxyData, _>(value, |p| (p.handle, p.class.clone()))?)
}

/// Look up or create the proxy for a host object, resolving members
/// through the object's runtime class. For a given (environment, host
/// object) pair at most one proxy exists at a time, so script-side
/// reference equality mirrors host identity.
pub(crate) fn obtain_proxy(
    vm: &mut Vm,
    core: &EnvCore,
    handle: HostHandle,
) -> BridgeResult<Value> {
    let class = core.host.borrow().class_of(handle)?;
    obtain_proxy_with(vm, core, handle, &class)
}

/// `obtain_proxy` with an explicit type descriptor, for callers that
/// already resolved one (e.g. a property's declared class).
pub(crate) fn obtain_proxy_with(
    vm: &mut Vm,
    core: &EnvCore,
    handle: HostHandle,
    class: &Arc<ClassDescriptor>,
) -> BridgeResult<Value> {
    let key = TableKey::Int(handle.bits() as i64);
    let existing = vm.table_raw_get(core.proxy_table, &key)?;
    if !existing.is_null() {
        return Ok(existing);
    }
    let proxy = vm.new_userdata(
        core.classes.proxy,
        Box::new(ProxyData {
            handle,
            class: class.clone(),
        }),
        std::mem::size_of::<ProxyData>(),
    )?;
    vm.table_raw_set(core.proxy_table, key, proxy)?;
    Ok(proxy)
}

/// The host handle behind a proxy, validated against the host registry.
pub(crate) fn resolve_host_handle(
    vm: &Vm,
    core: &EnvCore,
    value: Value,
) -> BridgeResult<HostHandle> {
    let (handle, _) = proxy_data(vm, core, value)?;
    if !core.host.borrow().is_valid(handle) {
        return Err(BridgeError::StaleProxy);
    }
    Ok(handle)
}

/// Pin a script value for host code. Counted: a second creation on the
/// same value reuses the entry. Safe to call while a host collection
/// pass is reading the root set — the info map is only touched between
/// visits.
pub(crate) fn create_reverse_reference(
    vm: &mut Vm,
    core: &EnvCore,
    value: Value,
    kind: RefKind,
    owner: &str,
) -> BridgeResult<RefId> {
    if !value.is_ref() {
        return Err(BridgeError::TypeMismatch {
            expected: "script object".into(),
            got: vm.describe(value).into(),
        });
    }
    if let Some(&id) = core.ref_by_value.borrow().get(&value.raw()) {
        if let Some(info) = core.ref_info.borrow_mut().get_mut(&id) {
            info.count += 1;
            return Ok(id);
        }
    }

    let host = if vm.is_userdata_of(value, core.classes.proxy) {
        Some(vm.with_userdata::<ProxyData, _>(value, |p| p.handle)?)
    } else {
        None
    };

    let id = core.next_ref.get();
    core.next_ref.set(id + 1);
    vm.table_raw_set(core.ref_table, TableKey::Int(id as i64), value)?;
    core.ref_info.borrow_mut().insert(
        id,
        RefInfo {
            kind,
            owner: owner.into(),
            count: 1,
            host,
            value_bits: value.raw(),
        },
    );
    core.ref_by_value.borrow_mut().insert(value.raw(), id);
    Ok(id)
}

/// Balance one creation. Underflow — releasing an id with no live entry
/// — is logged and otherwise ignored; other entries are unaffected.
pub(crate) fn release_reverse_reference(vm: &mut Vm, core: &EnvCore, id: RefId) {
    let cleared = {
        let mut info_map = core.ref_info.borrow_mut();
        match info_map.get_mut(&id) {
            None => {
                tracing::warn!(reference = id, "double release of reverse reference");
                return;
            }
            Some(info) => {
                info.count -= 1;
                if info.count == 0 {
                    let bits = info.value_bits;
                    info_map.remove(&id);
                    Some(bits)
                } else {
                    None
                }
            }
        }
    };
    if let Some(bits) = cleared {
        core.ref_by_value.borrow_mut().remove(&bits);
        if let Err(e) = vm.table_raw_set(core.ref_table, TableKey::Int(id as i64), Value::null()) {
            tracing::warn!(error = %e, reference = id, "failed to clear reverse-reference slot");
        }
    }
}

/// Visit every host handle with a positive reverse-reference count,
/// exactly once each, in unspecified order.
pub(crate) fn enumerate_roots(core: &EnvCore, mut visitor: impl FnMut(HostHandle)) {
    let mut seen: FxHashSet<HostHandle> = FxHashSet::default();
    for info in core.ref_info.borrow().values() {
        if info.count == 0 {
            continue;
        }
        if let Some(h) = info.host {
            if seen.insert(h) {
                visitor(h);
            }
        }
    }
}
