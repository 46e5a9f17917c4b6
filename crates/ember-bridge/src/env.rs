//! Environment: one VM instance plus the bridge state around it
//!
//! The environment owns the script VM, the identity tables (weak proxy
//! table, strong reverse-reference table, both living in the VM's
//! registry so its collector sees them), the struct-type registry, the
//! shared host-registry handle, and the panic/error boundary. While
//! alive it is registered in a process-wide `VmId → EnvCore` map so
//! VM-driven callbacks — which only receive a `&mut Vm` — can recover
//! their owning bridge state.
//!
//! # Threading contract
//!
//! Everything here is single-threaded: the VM, the registries, and the
//! host registry handle are mutated only from the thread driving script.
//! The process-wide map is lock-protected only because it is a static;
//! the environments inside it must still each be used from one thread.
//! Calling into an environment from several threads is a contract
//! violation with undefined results, not a recoverable error.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use ember_reflect::{
    ClassDescriptor, HostHandle, HostValue, SharedRegistry, StructDescriptor, TypeKind,
};
use ember_script::{
    MemoryAccount, ScriptError, ScriptResult, TableKey, UserdataClassId, Value, Vm, VmId,
};

use crate::dispatch;
use crate::error::{BridgeError, BridgeResult};
use crate::marshal;
use crate::proxy;
use crate::structs;

/// Reverse-reference id handed to host code.
pub type RefId = u64;

/// What a reverse reference refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// A proxy for a host object (reported to the host collector)
    Proxy,
    /// A callable script value held by host code
    Callback,
    /// Any other script value pinned by host code
    Value,
}

pub(crate) struct RefInfo {
    pub kind: RefKind,
    pub owner: Box<str>,
    pub count: u32,
    pub host: Option<HostHandle>,
    pub value_bits: u64,
}

/// Userdata class ids the bridge registers with its VM.
#[derive(Clone, Copy)]
pub(crate) struct BridgeClasses {
    pub proxy: UserdataClassId,
    pub struct_instance: UserdataClassId,
    pub class_object: UserdataClassId,
    pub struct_type: UserdataClassId,
}

/// Bridge state shared between the environment and VM-driven hooks.
pub(crate) struct EnvCore {
    pub vm_id: VmId,
    pub host: SharedRegistry,
    /// Weak-valued identity table: host handle bits → proxy userdata.
    pub proxy_table: Value,
    /// Strong table: reverse-reference id → pinned script value.
    pub ref_table: Value,
    pub ref_info: RefCell<FxHashMap<RefId, RefInfo>>,
    pub ref_by_value: RefCell<FxHashMap<u64, RefId>>,
    pub next_ref: Cell<RefId>,
    pub structs: RefCell<FxHashMap<String, Arc<StructDescriptor>>>,
    pub classes: BridgeClasses,
    pub dead: Cell<bool>,
}

/// Weak entry in the process-wide map.
///
/// Safety: entries are only dereferenced from the thread that owns the
/// corresponding environment (the VM is single-threaded by contract);
/// the map itself is lock-protected.
struct EnvRef(Weak<EnvCore>);

unsafe impl Send for EnvRef {}

static ENVIRONMENTS: Lazy<Mutex<FxHashMap<VmId, EnvRef>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

impl EnvCore {
    /// Recover the bridge state owning a VM instance.
    pub(crate) fn for_vm(id: VmId) -> Option<Rc<EnvCore>> {
        ENVIRONMENTS.lock().get(&id).and_then(|e| e.0.upgrade())
    }
}

/// Recover bridge state inside a VM-driven hook.
pub(crate) fn env_core(vm: &Vm) -> ScriptResult<Rc<EnvCore>> {
    EnvCore::for_vm(vm.id())
        .ok_or_else(|| ScriptError::runtime("no environment registered for this VM instance"))
}

const PROXY_TABLE_KEY: &str = "ember.proxy-table";
const REF_TABLE_KEY: &str = "ember.ref-table";

/// The bridge environment: one VM + registries + error boundary.
pub struct Environment {
    vm: Vm,
    core: Rc<EnvCore>,
}

impl Environment {
    /// Create an environment over a shared host registry, no memory limit.
    pub fn new(host: SharedRegistry) -> BridgeResult<Self> {
        Self::with_account(host, MemoryAccount::unlimited())
    }

    /// Create an environment charging script allocations to `account`.
    pub fn with_account(host: SharedRegistry, account: Rc<MemoryAccount>) -> BridgeResult<Self> {
        let mut vm = Vm::with_account(account)?;
        let classes = dispatch::register_classes(&mut vm);
        let proxy_table = vm.new_table(true)?;
        let ref_table = vm.new_table(false)?;
        let registry = vm.registry();
        vm.table_raw_set(registry, TableKey::str(PROXY_TABLE_KEY), proxy_table)?;
        vm.table_raw_set(registry, TableKey::str(REF_TABLE_KEY), ref_table)?;

        let core = Rc::new(EnvCore {
            vm_id: vm.id(),
            host,
            proxy_table,
            ref_table,
            ref_info: RefCell::new(FxHashMap::default()),
            ref_by_value: RefCell::new(FxHashMap::default()),
            next_ref: Cell::new(1),
            structs: RefCell::new(FxHashMap::default()),
            classes,
            dead: Cell::new(false),
        });
        ENVIRONMENTS
            .lock()
            .insert(core.vm_id, EnvRef(Rc::downgrade(&core)));
        tracing::debug!(vm_id = ?core.vm_id, "environment created");
        Ok(Self { vm, core })
    }

    /// Instance id of the owned VM.
    pub fn id(&self) -> VmId {
        self.core.vm_id
    }

    /// The shared host registry handle.
    pub fn host(&self) -> &SharedRegistry {
        &self.core.host
    }

    /// The owned VM (embedder escape hatch).
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// The owned VM, mutable (embedder escape hatch).
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Bytes of script memory currently accounted.
    pub fn memory_used(&self) -> usize {
        self.vm.mem_used()
    }

    /// False once a fatal error has poisoned the environment.
    pub fn is_usable(&self) -> bool {
        !self.core.dead.get() && !self.vm.is_dead()
    }

    /// Run a host-facing operation under the panic/error boundary: a
    /// panic or fatal error poisons the environment and surfaces as
    /// `BridgeError::Fatal` instead of unwinding into host frames.
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> BridgeResult<T>) -> BridgeResult<T> {
        if !self.is_usable() {
            return Err(BridgeError::Fatal("environment is unusable".into()));
        }
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => {
                if e.is_fatal() {
                    self.core.dead.set(true);
                    self.vm.poison();
                }
                Err(e)
            }
            Err(payload) => {
                self.core.dead.set(true);
                self.vm.poison();
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic crossed the script boundary".into());
                tracing::warn!(error = %msg, "panic at environment boundary");
                Err(BridgeError::Fatal(msg))
            }
        }
    }

    // ========================================================================
    // Proxies and reverse references
    // ========================================================================

    /// Identity-stable proxy for a host object: repeated calls with the
    /// same live handle return the same script value.
    pub fn obtain_proxy(&mut self, handle: HostHandle) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            proxy::obtain_proxy(&mut env.vm, &core, handle)
        })
    }

    /// [`Environment::obtain_proxy`] with an explicit type descriptor,
    /// when the caller already knows the static class of the handle.
    pub fn obtain_proxy_as(
        &mut self,
        handle: HostHandle,
        class: &Arc<ClassDescriptor>,
    ) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            proxy::obtain_proxy_with(&mut env.vm, &core, handle, class)
        })
    }

    /// Host handle behind a proxy; fails with `StaleProxy` once the host
    /// object has been destroyed.
    pub fn resolve_host_handle(&self, value: Value) -> BridgeResult<HostHandle> {
        proxy::resolve_host_handle(&self.vm, &self.core, value)
    }

    /// Pin a script value for host code, counted: repeated creation on
    /// the same value returns the same id with an incremented count.
    /// Proxy entries are reported to the host collector as roots.
    pub fn create_reverse_reference(
        &mut self,
        value: Value,
        kind: RefKind,
        owner: &str,
    ) -> BridgeResult<RefId> {
        self.guarded(|env| {
            let core = env.core.clone();
            proxy::create_reverse_reference(&mut env.vm, &core, value, kind, owner)
        })
    }

    /// Balance one `create_reverse_reference`. Releasing past zero is a
    /// logged no-op (`DoubleRelease`), never corruption.
    pub fn release_reverse_reference(&mut self, id: RefId) {
        let core = self.core.clone();
        proxy::release_reverse_reference(&mut self.vm, &core, id);
    }

    /// The pinned script value behind a reverse reference.
    pub fn reference_value(&self, id: RefId) -> BridgeResult<Value> {
        let v = self
            .vm
            .table_raw_get(self.core.ref_table, &TableKey::Int(id as i64))?;
        if v.is_null() {
            Err(BridgeError::UnknownReference(id))
        } else {
            Ok(v)
        }
    }

    /// Host-collector hook: visit every host handle kept alive by script
    /// references, each exactly once, in unspecified order.
    pub fn add_referenced_objects(&self, visitor: impl FnMut(HostHandle)) {
        proxy::enumerate_roots(&self.core, visitor);
    }

    /// Convenience: the current root report as a set (what a collection
    /// pass would receive).
    pub fn reported_roots(&self) -> FxHashSet<HostHandle> {
        let mut roots = FxHashSet::default();
        self.add_referenced_objects(|h| {
            roots.insert(h);
        });
        roots
    }

    // ========================================================================
    // Structs and classes
    // ========================================================================

    /// Record that values of `desc` may cross the boundary. Idempotent.
    pub fn register_struct_type(&mut self, desc: &Arc<StructDescriptor>) {
        structs::register_struct_type(&self.core, desc);
    }

    /// Push a script-owned copy of a struct value.
    pub fn push_struct_owned(
        &mut self,
        desc: &Arc<StructDescriptor>,
        bytes: &[u8],
    ) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            structs::push_struct_owned(&mut env.vm, &core, desc, bytes)
        })
    }

    /// Push a struct value viewing existing host storage.
    ///
    /// # Safety
    /// The storage behind `ptr` must stay valid (and unmoved) for as long
    /// as script code can reach the returned value.
    pub unsafe fn push_struct_borrowed(
        &mut self,
        desc: &Arc<StructDescriptor>,
        ptr: NonNull<u8>,
        len: usize,
    ) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            structs::push_struct_borrowed(&mut env.vm, &core, desc, ptr, len)
        })
    }

    /// Push a class object; calling it from script constructs a host
    /// object and yields its proxy.
    pub fn push_class(&mut self, class: &Arc<ClassDescriptor>) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            dispatch::push_class_object(&mut env.vm, &core, class)
        })
    }

    /// Push a struct-type object; calling it from script constructs a
    /// default-initialized owned instance.
    pub fn push_struct_type(&mut self, desc: &Arc<StructDescriptor>) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            dispatch::push_struct_type_object(&mut env.vm, &core, desc)
        })
    }

    // ========================================================================
    // Marshaling convenience
    // ========================================================================

    /// Convert a host value into a script value.
    pub fn make_value(&mut self, value: &HostValue) -> BridgeResult<Value> {
        self.guarded(|env| {
            let core = env.core.clone();
            marshal::push_value(&mut env.vm, &core, value)?;
            Ok(env.vm.pop_value()?)
        })
    }

    /// Convert a script value back to a host value of the expected kind.
    pub fn read_value(&mut self, value: Value, ty: &TypeKind) -> BridgeResult<HostValue> {
        self.guarded(|env| {
            let core = env.core.clone();
            env.vm.push_value(value);
            let out = marshal::check_value(&mut env.vm, &core, -1, ty);
            env.vm.pop_value()?;
            out
        })
    }

    // ========================================================================
    // Script-side operations (what script code would drive)
    // ========================================================================

    /// Attribute read on a script value through the object protocol.
    pub fn get_member(&mut self, obj: Value, name: &str) -> BridgeResult<Value> {
        self.guarded(|env| {
            let key = env.vm.new_str(name)?;
            Ok(env.vm.index(obj, key)?)
        })
    }

    /// Attribute write on a script value through the object protocol.
    pub fn set_member(&mut self, obj: Value, name: &str, value: Value) -> BridgeResult<()> {
        self.guarded(|env| {
            let key = env.vm.new_str(name)?;
            Ok(env.vm.new_index(obj, key, value)?)
        })
    }

    /// Call a callable script value with script-value arguments.
    pub fn call_script_value(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> BridgeResult<Vec<Value>> {
        self.guarded(|env| Ok(env.vm.call_values(callee, args)?))
    }

    /// Convenience: resolve member `name` on `obj` and call it — the
    /// script-side `obj:name(args)` sequence in one step.
    pub fn invoke_member(
        &mut self,
        obj: Value,
        name: &str,
        args: &[Value],
    ) -> BridgeResult<Vec<Value>> {
        self.guarded(|env| {
            let key = env.vm.new_str(name)?;
            let member = env.vm.index(obj, key)?;
            Ok(env.vm.call_values(member, args)?)
        })
    }

    /// Invoke a reverse-referenced script callback with host values,
    /// marshaling both directions.
    pub fn call_function(
        &mut self,
        reference: RefId,
        args: &[HostValue],
    ) -> BridgeResult<Option<HostValue>> {
        self.guarded(|env| {
            let core = env.core.clone();
            let callee = env.reference_value(reference)?;
            let mut script_args = Vec::with_capacity(args.len());
            for a in args {
                marshal::push_value(&mut env.vm, &core, a)?;
                script_args.push(env.vm.pop_value()?);
            }
            let results = env.vm.call_values(callee, &script_args)?;
            match results.first() {
                Some(v) => marshal::value_to_host(&env.vm, &core, *v),
                None => Ok(None),
            }
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run a collection pass on the script heap.
    pub fn collect_garbage(&mut self) -> BridgeResult<usize> {
        self.guarded(|env| Ok(env.vm.collect_garbage()?))
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        ENVIRONMENTS.lock().remove(&self.core.vm_id);
        self.core.dead.set(true);
        tracing::debug!(vm_id = ?self.core.vm_id, "environment destroyed");
    }
}
