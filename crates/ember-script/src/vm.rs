//! VM instance: evaluation stack, userdata protocol, collection
//!
//! The runtime is driven entirely through this embedding API — there is no
//! interpreter here. Arguments cross the boundary on the evaluation stack
//! (1-based indices from the current frame base, negative from the top),
//! and extensible-object behavior is supplied by embedder-registered
//! userdata classes whose hooks follow the C-function convention:
//! `fn(&mut Vm) -> ScriptResult<usize>` with arguments on the stack and a
//! result count returned.
//!
//! # Threading
//!
//! A `Vm` is strictly single-threaded. All mutation — script values,
//! tables, userdata, collection — happens synchronously on whichever
//! thread drives the instance. Reentry (a hook calling back into the VM)
//! is supported; concurrent use from multiple threads is a contract
//! violation, not a recoverable error.

use std::any::Any;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ScriptError, ScriptResult};
use crate::heap::{Heap, NativeClosure, NativeFn, SlotData, Userdata};
use crate::memory::MemoryAccount;
use crate::table::{Table, TableKey};
use crate::value::{HeapRef, Value};

/// Global counter for generating unique VM instance IDs
static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a VM instance.
///
/// Callbacks that only receive a `&mut Vm` use this to recover
/// embedder-side state from a process-wide map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId(u64);

impl VmId {
    fn next() -> Self {
        Self(NEXT_VM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Protocol hook: arguments on the stack, returns result count.
pub type Hook = fn(&mut Vm) -> ScriptResult<usize>;

/// Userdata protocol class: the extensible-object hook set.
pub struct UserdataClass {
    /// Diagnostic name
    pub name: &'static str,
    /// Attribute read: frame is `[target, key]`, returns 1 result
    pub index: Option<Hook>,
    /// Attribute write: frame is `[target, key, value]`, returns 0 results
    pub newindex: Option<Hook>,
    /// Call-as-function: frame is `[target, args...]`
    pub call: Option<Hook>,
    /// Finalizer: frame is `[target]`; runs during collection, must not
    /// allocate or re-enter the VM
    pub finalize: Option<Hook>,
}

/// Handle to a registered userdata class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserdataClassId(u32);

struct Frame {
    base: usize,
    native: Option<HeapRef>,
}

/// One VM instance.
pub struct Vm {
    id: VmId,
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    registry: HeapRef,
    classes: Vec<UserdataClass>,
    account: Rc<MemoryAccount>,
    dead: bool,
    in_gc: bool,
}

impl Vm {
    /// Create a VM with no memory limit.
    pub fn new() -> Self {
        match Self::with_account(MemoryAccount::unlimited()) {
            Ok(vm) => vm,
            Err(_) => unreachable!("an unlimited account refuses nothing"),
        }
    }

    /// Create a VM charging allocations to `account`.
    pub fn with_account(account: Rc<MemoryAccount>) -> ScriptResult<Self> {
        let mut heap = Heap::new(account.clone());
        let registry = heap.alloc(SlotData::Table(Table::new(false)), 0)?;
        Ok(Self {
            id: VmId::next(),
            heap,
            stack: Vec::new(),
            frames: vec![Frame {
                base: 0,
                native: None,
            }],
            registry,
            classes: Vec::new(),
            account,
            dead: false,
            in_gc: false,
        })
    }

    /// Process-unique instance id.
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Bytes currently accounted to this instance.
    pub fn mem_used(&self) -> usize {
        self.account.used()
    }

    /// The shared memory account.
    pub fn account(&self) -> &Rc<MemoryAccount> {
        &self.account
    }

    /// Number of live heap slots (diagnostics).
    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }

    /// True once a fatal error has poisoned the instance.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Mark the instance unusable (fatal embedder-side failure).
    pub fn poison(&mut self) {
        self.dead = true;
    }

    /// Construct a script-level error (raised by propagating it).
    pub fn error(&self, msg: impl Into<String>) -> ScriptError {
        ScriptError::runtime(msg)
    }

    fn ensure_alive(&self) -> ScriptResult<()> {
        if self.dead {
            Err(ScriptError::Poisoned)
        } else {
            Ok(())
        }
    }

    fn alloc_slot(&mut self, data: SlotData, extra_bytes: usize) -> ScriptResult<HeapRef> {
        self.ensure_alive()?;
        if self.in_gc {
            return Err(ScriptError::AllocInCollect);
        }
        match self.heap.alloc(data, extra_bytes) {
            Ok(r) => Ok(r),
            Err(e) => {
                if e.is_fatal() {
                    self.dead = true;
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Stack primitives
    // ========================================================================

    fn frame_base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }

    /// Number of values in the current frame.
    pub fn stack_size(&self) -> usize {
        self.stack.len() - self.frame_base()
    }

    fn abs_index(&self, idx: i32) -> ScriptResult<usize> {
        let base = self.frame_base();
        let len = self.stack.len();
        let abs = if idx > 0 {
            base + (idx as usize) - 1
        } else if idx < 0 {
            let back = (-idx) as usize;
            if back > len - base {
                return Err(ScriptError::BadStackIndex(idx));
            }
            len - back
        } else {
            return Err(ScriptError::BadStackIndex(idx));
        };
        if abs >= len || abs < base {
            return Err(ScriptError::BadStackIndex(idx));
        }
        Ok(abs)
    }

    /// Read the value at a frame index.
    pub fn value_at(&self, idx: i32) -> ScriptResult<Value> {
        Ok(self.stack[self.abs_index(idx)?])
    }

    /// Push a value.
    pub fn push_value(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Push null.
    pub fn push_null(&mut self) {
        self.stack.push(Value::null());
    }

    /// Push a boolean.
    pub fn push_bool(&mut self, b: bool) {
        self.stack.push(Value::bool(b));
    }

    /// Push an integer; out-of-range values are a shape error.
    pub fn push_int(&mut self, i: i64) -> ScriptResult<()> {
        match Value::try_int(i) {
            Some(v) => {
                self.stack.push(v);
                Ok(())
            }
            None => Err(ScriptError::BadType {
                expected: "48-bit int",
                got: "int",
            }),
        }
    }

    /// Push a float.
    pub fn push_float(&mut self, f: f64) {
        self.stack.push(Value::float(f));
    }

    /// Allocate and push a string.
    pub fn push_str(&mut self, s: &str) -> ScriptResult<()> {
        let v = self.new_str(s)?;
        self.stack.push(v);
        Ok(())
    }

    /// Pop the top value.
    pub fn pop_value(&mut self) -> ScriptResult<Value> {
        let base = self.frame_base();
        if self.stack.len() <= base {
            return Err(ScriptError::BadStackIndex(-1));
        }
        Ok(self.stack.pop().unwrap_or_default())
    }

    /// Pop `n` values.
    pub fn pop_n(&mut self, n: usize) -> ScriptResult<()> {
        let base = self.frame_base();
        if self.stack.len() < base + n {
            return Err(ScriptError::BadStackIndex(-(n as i32)));
        }
        self.stack.truncate(self.stack.len() - n);
        Ok(())
    }

    // ========================================================================
    // Typed stack reads
    // ========================================================================

    fn bad_type(&self, expected: &'static str, v: Value) -> ScriptError {
        ScriptError::BadType {
            expected,
            got: self.describe(v),
        }
    }

    /// Shape name of a value, resolving heap slot kinds.
    pub fn describe(&self, v: Value) -> &'static str {
        match v.as_heap_ref() {
            Some(r) => match self.heap.get(r) {
                Ok(SlotData::Str(_)) => "string",
                Ok(SlotData::Table(_)) => "table",
                Ok(SlotData::Userdata(_)) => "userdata",
                Ok(SlotData::Native(_)) => "function",
                Err(_) => "dangling ref",
            },
            None => v.type_name(),
        }
    }

    /// Read a boolean at `idx`.
    pub fn check_bool(&self, idx: i32) -> ScriptResult<bool> {
        let v = self.value_at(idx)?;
        v.as_bool().ok_or_else(|| self.bad_type("bool", v))
    }

    /// Read an integer at `idx`.
    pub fn check_int(&self, idx: i32) -> ScriptResult<i64> {
        let v = self.value_at(idx)?;
        v.as_int().ok_or_else(|| self.bad_type("int", v))
    }

    /// Read a float at `idx` (integers widen).
    pub fn check_float(&self, idx: i32) -> ScriptResult<f64> {
        let v = self.value_at(idx)?;
        if let Some(f) = v.as_float() {
            Ok(f)
        } else if let Some(i) = v.as_int() {
            Ok(i as f64)
        } else {
            Err(self.bad_type("float", v))
        }
    }

    /// Read a string at `idx` (owned copy).
    pub fn check_str(&self, idx: i32) -> ScriptResult<String> {
        let v = self.value_at(idx)?;
        Ok(self.str_value(v)?.to_owned())
    }

    /// Borrow the bytes of a string value.
    pub fn str_value(&self, v: Value) -> ScriptResult<&str> {
        match v.as_heap_ref().map(|r| self.heap.get(r)) {
            Some(Ok(SlotData::Str(s))) => Ok(s),
            _ => Err(self.bad_type("string", v)),
        }
    }

    // ========================================================================
    // Value construction
    // ========================================================================

    /// Allocate a string value.
    pub fn new_str(&mut self, s: &str) -> ScriptResult<Value> {
        let r = self.alloc_slot(SlotData::Str(s.into()), 0)?;
        Ok(Value::heap_ref(r))
    }

    /// Allocate a table; weak-valued tables do not keep their values alive.
    pub fn new_table(&mut self, weak_values: bool) -> ScriptResult<Value> {
        let r = self.alloc_slot(SlotData::Table(Table::new(weak_values)), 0)?;
        Ok(Value::heap_ref(r))
    }

    /// Allocate a userdata of a registered class. `payload_bytes` is
    /// charged to the memory account on behalf of the payload.
    pub fn new_userdata(
        &mut self,
        class: UserdataClassId,
        payload: Box<dyn Any>,
        payload_bytes: usize,
    ) -> ScriptResult<Value> {
        if class.0 as usize >= self.classes.len() {
            return Err(ScriptError::runtime("unregistered userdata class"));
        }
        let r = self.alloc_slot(SlotData::Userdata(Userdata { class, payload }), payload_bytes)?;
        Ok(Value::heap_ref(r))
    }

    /// Allocate a native closure with traced upvalues.
    pub fn new_native(
        &mut self,
        name: &str,
        func: NativeFn,
        upvalues: Vec<Value>,
    ) -> ScriptResult<Value> {
        let r = self.alloc_slot(
            SlotData::Native(NativeClosure {
                name: name.into(),
                func,
                upvalues,
            }),
            0,
        )?;
        Ok(Value::heap_ref(r))
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// The registry table (always a collection root).
    pub fn registry(&self) -> Value {
        Value::heap_ref(self.registry)
    }

    /// Convert a script value into a table key.
    pub fn key_from_value(&self, v: Value) -> ScriptResult<TableKey> {
        if let Some(i) = v.as_int() {
            Ok(TableKey::Int(i))
        } else if let Ok(s) = self.str_value(v) {
            Ok(TableKey::Str(s.into()))
        } else {
            Err(self.bad_type("table key (int or string)", v))
        }
    }

    fn table_ref(&self, t: Value) -> ScriptResult<HeapRef> {
        match t.as_heap_ref() {
            Some(r) if matches!(self.heap.get(r), Ok(SlotData::Table(_))) => Ok(r),
            _ => Err(self.bad_type("table", t)),
        }
    }

    /// Raw table read (no protocol dispatch).
    pub fn table_raw_get(&self, t: Value, key: &TableKey) -> ScriptResult<Value> {
        let r = self.table_ref(t)?;
        match self.heap.get(r)? {
            SlotData::Table(tbl) => Ok(tbl.raw_get(key)),
            _ => Err(ScriptError::InvalidRef),
        }
    }

    /// Raw table write (no protocol dispatch).
    pub fn table_raw_set(&mut self, t: Value, key: TableKey, v: Value) -> ScriptResult<()> {
        let r = self.table_ref(t)?;
        match self.heap.get_mut(r)? {
            SlotData::Table(tbl) => {
                tbl.raw_set(key, v);
                Ok(())
            }
            _ => Err(ScriptError::InvalidRef),
        }
    }

    /// Entry count of a table.
    pub fn table_len(&self, t: Value) -> ScriptResult<usize> {
        let r = self.table_ref(t)?;
        match self.heap.get(r)? {
            SlotData::Table(tbl) => Ok(tbl.len()),
            _ => Err(ScriptError::InvalidRef),
        }
    }

    // ========================================================================
    // Userdata
    // ========================================================================

    /// Register a userdata protocol class.
    pub fn register_class(&mut self, class: UserdataClass) -> UserdataClassId {
        self.classes.push(class);
        UserdataClassId((self.classes.len() - 1) as u32)
    }

    /// Protocol class of a userdata value.
    pub fn userdata_class(&self, v: Value) -> ScriptResult<UserdataClassId> {
        match v.as_heap_ref().map(|r| self.heap.get(r)) {
            Some(Ok(SlotData::Userdata(u))) => Ok(u.class),
            _ => Err(self.bad_type("userdata", v)),
        }
    }

    /// Is this value a userdata of the given class?
    pub fn is_userdata_of(&self, v: Value, class: UserdataClassId) -> bool {
        self.userdata_class(v).map(|c| c == class).unwrap_or(false)
    }

    /// Borrow a userdata payload. The closure must not call back into the
    /// VM (the instance is borrowed for its duration).
    pub fn with_userdata<T: 'static, R>(
        &self,
        v: Value,
        f: impl FnOnce(&T) -> R,
    ) -> ScriptResult<R> {
        match v.as_heap_ref().map(|r| self.heap.get(r)) {
            Some(Ok(SlotData::Userdata(u))) => match u.payload.downcast_ref::<T>() {
                Some(p) => Ok(f(p)),
                None => Err(ScriptError::runtime("userdata payload type mismatch")),
            },
            _ => Err(self.bad_type("userdata", v)),
        }
    }

    /// Mutably borrow a userdata payload. Same reentrancy rule as
    /// [`Vm::with_userdata`].
    pub fn with_userdata_mut<T: 'static, R>(
        &mut self,
        v: Value,
        f: impl FnOnce(&mut T) -> R,
    ) -> ScriptResult<R> {
        let got = self.describe(v);
        match v.as_heap_ref().map(|r| self.heap.get_mut(r)) {
            Some(Ok(SlotData::Userdata(u))) => match u.payload.downcast_mut::<T>() {
                Some(p) => Ok(f(p)),
                None => Err(ScriptError::runtime("userdata payload type mismatch")),
            },
            _ => Err(ScriptError::BadType {
                expected: "userdata",
                got,
            }),
        }
    }

    /// Upvalue `i` of the currently executing native closure.
    pub fn upvalue(&self, i: usize) -> ScriptResult<Value> {
        let r = self
            .frames
            .last()
            .and_then(|f| f.native)
            .ok_or_else(|| ScriptError::runtime("no native closure in this frame"))?;
        match self.heap.get(r)? {
            SlotData::Native(n) => n
                .upvalues
                .get(i)
                .copied()
                .ok_or_else(|| ScriptError::runtime("upvalue index out of range")),
            _ => Err(ScriptError::InvalidRef),
        }
    }

    // ========================================================================
    // Protocol dispatch
    // ========================================================================

    fn class_of(&self, id: UserdataClassId) -> &UserdataClass {
        &self.classes[id.0 as usize]
    }

    /// Run a hook over an argument frame, collecting `results`.
    fn dispatch_hook(&mut self, hook: Hook, args: &[Value]) -> ScriptResult<Vec<Value>> {
        let base = self.stack.len();
        self.stack.extend_from_slice(args);
        self.frames.push(Frame { base, native: None });
        let outcome = hook(self);
        let results = match outcome {
            Ok(n) => {
                if n > self.stack.len().saturating_sub(base) {
                    self.stack.truncate(base);
                    self.frames.pop();
                    return Err(ScriptError::runtime(
                        "hook returned more results than it pushed",
                    ));
                }
                self.stack.split_off(self.stack.len() - n)
            }
            Err(e) => {
                self.stack.truncate(base);
                self.frames.pop();
                return Err(e);
            }
        };
        self.stack.truncate(base);
        self.frames.pop();
        Ok(results)
    }

    /// Attribute read through the extensible-object protocol.
    pub fn index(&mut self, obj: Value, key: Value) -> ScriptResult<Value> {
        self.ensure_alive()?;
        if self.table_ref(obj).is_ok() {
            let k = self.key_from_value(key)?;
            return self.table_raw_get(obj, &k);
        }
        if let Ok(class) = self.userdata_class(obj) {
            let hook = self
                .class_of(class)
                .index
                .ok_or_else(|| self.bad_type("indexable value", obj))?;
            let results = self.dispatch_hook(hook, &[obj, key])?;
            return Ok(results.first().copied().unwrap_or_default());
        }
        Err(self.bad_type("indexable value", obj))
    }

    /// Attribute write through the extensible-object protocol.
    pub fn new_index(&mut self, obj: Value, key: Value, value: Value) -> ScriptResult<()> {
        self.ensure_alive()?;
        if self.table_ref(obj).is_ok() {
            let k = self.key_from_value(key)?;
            return self.table_raw_set(obj, k, value);
        }
        if let Ok(class) = self.userdata_class(obj) {
            let hook = self
                .class_of(class)
                .newindex
                .ok_or_else(|| self.bad_type("index-assignable value", obj))?;
            self.dispatch_hook(hook, &[obj, key, value])?;
            return Ok(());
        }
        Err(self.bad_type("index-assignable value", obj))
    }

    /// Call the value below the top `nargs` stack slots. On success the
    /// callee and arguments are replaced by the results; returns the
    /// result count.
    pub fn call(&mut self, nargs: usize) -> ScriptResult<usize> {
        self.ensure_alive()?;
        let len = self.stack.len();
        if len < nargs + 1 || len - nargs - 1 < self.frame_base() {
            return Err(ScriptError::BadStackIndex(-((nargs as i32) + 1)));
        }
        let func_pos = len - nargs - 1;
        let callee = self.stack[func_pos];

        enum Callee {
            Native(HeapRef, NativeFn),
            Protocol(Hook),
        }

        let resolved = match callee.as_heap_ref() {
            Some(r) => match self.heap.get(r) {
                Ok(SlotData::Native(n)) => Callee::Native(r, n.func.clone()),
                Ok(SlotData::Userdata(u)) => match self.class_of(u.class).call {
                    Some(hook) => Callee::Protocol(hook),
                    None => return Err(self.bad_type("callable value", callee)),
                },
                _ => return Err(self.bad_type("callable value", callee)),
            },
            None => return Err(self.bad_type("callable value", callee)),
        };

        // Native closures see only the arguments; protocol calls see the
        // callee as argument 1.
        let (base, native) = match &resolved {
            Callee::Native(r, _) => (func_pos + 1, Some(*r)),
            Callee::Protocol(_) => (func_pos, None),
        };

        self.frames.push(Frame { base, native });
        let outcome = match resolved {
            Callee::Native(_, func) => func(self),
            Callee::Protocol(hook) => hook(self),
        };
        match outcome {
            Ok(n) => {
                let len = self.stack.len();
                if n > len - base {
                    self.frames.pop();
                    self.stack.truncate(func_pos);
                    return Err(ScriptError::runtime(
                        "callee returned more results than it pushed",
                    ));
                }
                self.frames.pop();
                self.stack.drain(func_pos..len - n);
                Ok(n)
            }
            Err(e) => {
                self.frames.pop();
                self.stack.truncate(func_pos);
                Err(e)
            }
        }
    }

    /// Convenience: call `callee` with `args`, collecting all results.
    pub fn call_values(&mut self, callee: Value, args: &[Value]) -> ScriptResult<Vec<Value>> {
        self.push_value(callee);
        for a in args {
            self.push_value(*a);
        }
        let n = self.call(args.len())?;
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(self.pop_value()?);
        }
        results.reverse();
        Ok(results)
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Explicit mark-sweep pass. The embedder drives collection; the VM
    /// never collects behind its back. Returns the number of freed slots.
    pub fn collect_garbage(&mut self) -> ScriptResult<usize> {
        self.ensure_alive()?;
        self.in_gc = true;
        self.heap.clear_marks();
        let roots: Vec<Value> = self
            .stack
            .iter()
            .copied()
            .chain(std::iter::once(self.registry()))
            .chain(
                self.frames
                    .iter()
                    .filter_map(|f| f.native.map(Value::heap_ref)),
            )
            .collect();
        self.heap.mark_from(roots.into_iter());
        self.heap.prune_weak_tables();

        let finalizable = {
            let classes = &self.classes;
            self.heap
                .dead_finalizable(|cid| classes[cid.0 as usize].finalize.is_some())
        };
        for r in finalizable {
            let hook = {
                let class = match self.heap.get(r) {
                    Ok(SlotData::Userdata(u)) => u.class,
                    _ => continue,
                };
                match self.class_of(class).finalize {
                    Some(h) => h,
                    None => continue,
                }
            };
            if let Err(e) = self.dispatch_hook(hook, &[Value::heap_ref(r)]) {
                tracing::warn!(error = %e, "finalizer failed");
            }
        }

        let freed = self.heap.sweep();
        self.in_gc = false;
        tracing::debug!(freed, live = self.heap.live_count(), "collection pass");
        Ok(freed)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_check() {
        let mut vm = Vm::new();
        vm.push_int(42).unwrap();
        vm.push_bool(true);
        vm.push_float(2.5);
        vm.push_str("hello").unwrap();
        assert_eq!(vm.check_int(1).unwrap(), 42);
        assert_eq!(vm.check_bool(2).unwrap(), true);
        assert_eq!(vm.check_float(3).unwrap(), 2.5);
        assert_eq!(vm.check_str(4).unwrap(), "hello");
        // Negative indices address from the top.
        assert_eq!(vm.check_str(-1).unwrap(), "hello");
        assert_eq!(vm.check_int(-4).unwrap(), 42);
    }

    #[test]
    fn test_check_wrong_shape() {
        let mut vm = Vm::new();
        vm.push_bool(false);
        assert!(matches!(
            vm.check_int(1),
            Err(ScriptError::BadType { expected: "int", .. })
        ));
    }

    #[test]
    fn test_int_widens_to_float() {
        let mut vm = Vm::new();
        vm.push_int(7).unwrap();
        assert_eq!(vm.check_float(1).unwrap(), 7.0);
    }

    #[test]
    fn test_table_raw_roundtrip() {
        let mut vm = Vm::new();
        let t = vm.new_table(false).unwrap();
        vm.table_raw_set(t, TableKey::str("k"), Value::int(9)).unwrap();
        assert_eq!(vm.table_raw_get(t, &TableKey::str("k")).unwrap().as_int(), Some(9));
    }

    #[test]
    fn test_registry_is_root() {
        let mut vm = Vm::new();
        let s = vm.new_str("pinned").unwrap();
        vm.table_raw_set(vm.registry(), TableKey::str("pin"), s).unwrap();
        vm.collect_garbage().unwrap();
        let v = vm.table_raw_get(vm.registry(), &TableKey::str("pin")).unwrap();
        assert_eq!(vm.str_value(v).unwrap(), "pinned");
    }

    #[test]
    fn test_unreferenced_value_is_collected() {
        let mut vm = Vm::new();
        let before = vm.live_objects();
        let _s = vm.new_str("transient").unwrap();
        assert_eq!(vm.live_objects(), before + 1);
        vm.collect_garbage().unwrap();
        assert_eq!(vm.live_objects(), before);
    }

    #[test]
    fn test_stack_values_survive_collection() {
        let mut vm = Vm::new();
        vm.push_str("on stack").unwrap();
        vm.collect_garbage().unwrap();
        assert_eq!(vm.check_str(1).unwrap(), "on stack");
    }

    #[test]
    fn test_native_call() {
        let mut vm = Vm::new();
        let add = vm
            .new_native(
                "add",
                Rc::new(|vm: &mut Vm| {
                    let a = vm.check_int(1)?;
                    let b = vm.check_int(2)?;
                    vm.push_int(a + b)?;
                    Ok(1)
                }),
                Vec::new(),
            )
            .unwrap();
        let results = vm.call_values(add, &[Value::int(2), Value::int(3)]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_int(), Some(5));
        assert_eq!(vm.stack_size(), 0);
    }

    #[test]
    fn test_native_upvalues() {
        let mut vm = Vm::new();
        let bound = vm
            .new_native(
                "bound",
                Rc::new(|vm: &mut Vm| {
                    let captured = vm.upvalue(0)?;
                    vm.push_value(captured);
                    Ok(1)
                }),
                vec![Value::int(77)],
            )
            .unwrap();
        let results = vm.call_values(bound, &[]).unwrap();
        assert_eq!(results[0].as_int(), Some(77));
    }

    #[test]
    fn test_upvalues_keep_captures_alive() {
        let mut vm = Vm::new();
        let s = vm.new_str("captured").unwrap();
        let f = vm
            .new_native(
                "keeper",
                Rc::new(|vm: &mut Vm| {
                    let v = vm.upvalue(0)?;
                    vm.push_value(v);
                    Ok(1)
                }),
                vec![s],
            )
            .unwrap();
        vm.table_raw_set(vm.registry(), TableKey::str("f"), f).unwrap();
        vm.collect_garbage().unwrap();
        let results = vm.call_values(f, &[]).unwrap();
        assert_eq!(vm.str_value(results[0]).unwrap(), "captured");
    }

    #[test]
    fn test_call_error_unwinds_stack() {
        let mut vm = Vm::new();
        let fail = vm
            .new_native(
                "fail",
                Rc::new(|vm: &mut Vm| Err(vm.error("boom"))),
                Vec::new(),
            )
            .unwrap();
        let before = vm.stack_size();
        let err = vm.call_values(fail, &[Value::int(1)]);
        assert!(err.is_err());
        assert_eq!(vm.stack_size(), before);
    }

    #[test]
    fn test_userdata_protocol_index() {
        let mut vm = Vm::new();
        fn idx(vm: &mut Vm) -> ScriptResult<usize> {
            // frame: [target, key]
            let key = vm.check_str(2)?;
            vm.push_str(&format!("got:{key}"))?;
            Ok(1)
        }
        let class = vm.register_class(UserdataClass {
            name: "probe",
            index: Some(idx),
            newindex: None,
            call: None,
            finalize: None,
        });
        let ud = vm.new_userdata(class, Box::new(()), 0).unwrap();
        let key = vm.new_str("health").unwrap();
        let out = vm.index(ud, key).unwrap();
        assert_eq!(vm.str_value(out).unwrap(), "got:health");
    }

    #[test]
    fn test_userdata_without_hook_errors() {
        let mut vm = Vm::new();
        let class = vm.register_class(UserdataClass {
            name: "inert",
            index: None,
            newindex: None,
            call: None,
            finalize: None,
        });
        let ud = vm.new_userdata(class, Box::new(()), 0).unwrap();
        let key = vm.new_str("x").unwrap();
        assert!(vm.index(ud, key).is_err());
        assert!(vm.new_index(ud, key, Value::int(1)).is_err());
    }

    #[test]
    fn test_finalizer_runs_once_on_collect() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);
        fn fin(_vm: &mut Vm) -> ScriptResult<usize> {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
        let mut vm = Vm::new();
        let class = vm.register_class(UserdataClass {
            name: "finalized",
            index: None,
            newindex: None,
            call: None,
            finalize: Some(fin),
        });
        FINALIZED.store(0, Ordering::SeqCst);
        let _ud = vm.new_userdata(class, Box::new(()), 0).unwrap();
        vm.collect_garbage().unwrap();
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
        vm.collect_garbage().unwrap();
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oom_poisons_vm() {
        let account = MemoryAccount::with_limit(256);
        let mut vm = Vm::with_account(account).unwrap();
        let mut failed = false;
        for _ in 0..64 {
            vm.push_value(Value::null());
            if vm.push_str("grow the heap past the limit").is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(vm.is_dead());
        assert!(matches!(vm.new_str("after"), Err(ScriptError::Poisoned)));
    }

    #[test]
    fn test_vm_ids_unique() {
        let a = Vm::new();
        let b = Vm::new();
        assert_ne!(a.id(), b.id());
    }
}
