//! Slot heap for script-owned values
//!
//! Heap values live in a slot vector addressed by [`HeapRef`] handles; a
//! freed slot index goes on a free list for reuse. Collection is explicit
//! and host-driven: the VM marks from its roots, prunes weak-valued
//! tables, hands dead finalizable userdata back to the embedding layer,
//! then sweeps. Every allocation and release is charged to the shared
//! [`MemoryAccount`].

use std::any::Any;
use std::rc::Rc;

use crate::error::{ScriptError, ScriptResult};
use crate::memory::MemoryAccount;
use crate::table::Table;
use crate::value::{HeapRef, Value};
use crate::vm::{UserdataClassId, Vm};

/// Native closure function: arguments addressed via the VM stack, returns
/// the number of results left on top.
pub type NativeFn = Rc<dyn Fn(&mut Vm) -> ScriptResult<usize>>;

/// Userdata: an embedder-defined payload tagged with its protocol class.
///
/// Payloads must not contain script [`Value`]s — the collector cannot
/// trace them. Values a userdata needs alive belong in a table or in
/// native-closure upvalues.
pub struct Userdata {
    /// Protocol class (index/newindex/call/finalize hooks)
    pub class: UserdataClassId,
    /// Embedder payload
    pub payload: Box<dyn Any>,
}

/// Native closure with explicitly traced upvalues.
pub struct NativeClosure {
    /// Diagnostic name
    pub name: Box<str>,
    /// Entry point
    pub func: NativeFn,
    /// Captured script values, traced by the collector and addressable
    /// from inside the closure body
    pub upvalues: Vec<Value>,
}

/// Heap slot payload.
pub enum SlotData {
    /// Immutable string
    Str(Box<str>),
    /// Table
    Table(Table),
    /// Userdata
    Userdata(Userdata),
    /// Native closure
    Native(NativeClosure),
}

impl SlotData {
    /// Coarse byte estimate used for memory accounting.
    fn estimate_bytes(&self) -> usize {
        match self {
            SlotData::Str(s) => 64 + s.len(),
            SlotData::Table(_) => 128,
            SlotData::Userdata(_) => 96,
            SlotData::Native(n) => 96 + 16 * n.upvalues.len(),
        }
    }
}

struct Slot {
    data: SlotData,
    marked: bool,
    bytes: usize,
}

/// Slot heap with explicit mark-sweep collection.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    account: Rc<MemoryAccount>,
}

impl Heap {
    pub(crate) fn new(account: Rc<MemoryAccount>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            account,
        }
    }

    /// Allocate a slot, charging the memory account. `extra_bytes` lets
    /// the embedder account payload storage the heap cannot see.
    pub(crate) fn alloc(&mut self, data: SlotData, extra_bytes: usize) -> ScriptResult<HeapRef> {
        let bytes = data.estimate_bytes() + extra_bytes;
        if !self.account.realloc(0, bytes) {
            return Err(ScriptError::OutOfMemory {
                used: self.account.used(),
                limit: self.account.limit().unwrap_or(0),
            });
        }
        let slot = Slot {
            data,
            marked: false,
            bytes,
        };
        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        Ok(HeapRef(index))
    }

    pub(crate) fn get(&self, r: HeapRef) -> ScriptResult<&SlotData> {
        self.slots
            .get(r.0 as usize)
            .and_then(|s| s.as_ref())
            .map(|s| &s.data)
            .ok_or(ScriptError::InvalidRef)
    }

    pub(crate) fn get_mut(&mut self, r: HeapRef) -> ScriptResult<&mut SlotData> {
        self.slots
            .get_mut(r.0 as usize)
            .and_then(|s| s.as_mut())
            .map(|s| &mut s.data)
            .ok_or(ScriptError::InvalidRef)
    }

    /// Number of live slots.
    pub(crate) fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    // ========================================================================
    // Collection phases, orchestrated by `Vm::collect_garbage`
    // ========================================================================

    pub(crate) fn clear_marks(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.marked = false;
        }
    }

    /// Mark everything reachable from `roots`. Weak-valued tables are
    /// marked themselves but do not propagate to their values.
    pub(crate) fn mark_from(&mut self, roots: impl Iterator<Item = Value>) {
        let mut work: Vec<u32> = roots.filter_map(|v| v.as_heap_ref()).map(|r| r.0).collect();
        while let Some(i) = work.pop() {
            let Some(slot) = self.slots.get_mut(i as usize).and_then(|s| s.as_mut()) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            match &slot.data {
                SlotData::Table(t) if !t.has_weak_values() => {
                    work.extend(t.iter().filter_map(|(_, v)| v.as_heap_ref()).map(|r| r.0));
                }
                SlotData::Native(n) => {
                    work.extend(n.upvalues.iter().filter_map(|v| v.as_heap_ref()).map(|r| r.0));
                }
                _ => {}
            }
        }
    }

    /// Drop weak-table entries whose value died this cycle.
    pub(crate) fn prune_weak_tables(&mut self) {
        let marks: Vec<bool> = self
            .slots
            .iter()
            .map(|s| s.as_ref().is_some_and(|s| s.marked))
            .collect();
        for slot in self.slots.iter_mut().flatten() {
            if !slot.marked {
                continue;
            }
            if let SlotData::Table(t) = &mut slot.data {
                if t.has_weak_values() {
                    t.prune_dead_values(|v| {
                        v.as_heap_ref()
                            .is_some_and(|r| !marks.get(r.0 as usize).copied().unwrap_or(false))
                    });
                }
            }
        }
    }

    /// Collect dead userdata whose class wants finalization. The slots
    /// stay resident until the sweep so finalizers can read the payload.
    pub(crate) fn dead_finalizable(
        &self,
        wants_finalize: impl Fn(UserdataClassId) -> bool,
    ) -> Vec<HeapRef> {
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if !slot.marked {
                    if let SlotData::Userdata(u) = &slot.data {
                        if wants_finalize(u.class) {
                            out.push(HeapRef(i as u32));
                        }
                    }
                }
            }
        }
        out
    }

    /// Free every unmarked slot, refunding the account. Returns freed slots.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (i, entry) in self.slots.iter_mut().enumerate() {
            let dead = entry.as_ref().is_some_and(|s| !s.marked);
            if dead {
                if let Some(slot) = entry.take() {
                    self.account.realloc(slot.bytes, 0);
                    self.free.push(i as u32);
                    freed += 1;
                }
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableKey;

    fn heap() -> Heap {
        Heap::new(MemoryAccount::unlimited())
    }

    #[test]
    fn test_alloc_and_get() {
        let mut h = heap();
        let r = h.alloc(SlotData::Str("hi".into()), 0).unwrap();
        match h.get(r).unwrap() {
            SlotData::Str(s) => assert_eq!(&**s, "hi"),
            _ => panic!("expected string slot"),
        }
    }

    #[test]
    fn test_sweep_unreachable() {
        let mut h = heap();
        let a = h.alloc(SlotData::Str("a".into()), 0).unwrap();
        let b = h.alloc(SlotData::Str("b".into()), 0).unwrap();
        h.clear_marks();
        h.mark_from([Value::heap_ref(a)].into_iter());
        let freed = h.sweep();
        assert_eq!(freed, 1);
        assert!(h.get(a).is_ok());
        assert!(h.get(b).is_err());
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut h = heap();
        let a = h.alloc(SlotData::Str("a".into()), 0).unwrap();
        h.clear_marks();
        h.sweep();
        let b = h.alloc(SlotData::Str("b".into()), 0).unwrap();
        assert_eq!(a.raw(), b.raw());
    }

    #[test]
    fn test_strong_table_keeps_values() {
        let mut h = heap();
        let s = h.alloc(SlotData::Str("kept".into()), 0).unwrap();
        let mut t = Table::new(false);
        t.raw_set(TableKey::Int(1), Value::heap_ref(s));
        let tr = h.alloc(SlotData::Table(t), 0).unwrap();
        h.clear_marks();
        h.mark_from([Value::heap_ref(tr)].into_iter());
        h.prune_weak_tables();
        assert_eq!(h.sweep(), 0);
        assert!(h.get(s).is_ok());
    }

    #[test]
    fn test_weak_table_drops_dead_values() {
        let mut h = heap();
        let s = h.alloc(SlotData::Str("dropped".into()), 0).unwrap();
        let mut t = Table::new(true);
        t.raw_set(TableKey::Int(1), Value::heap_ref(s));
        let tr = h.alloc(SlotData::Table(t), 0).unwrap();
        h.clear_marks();
        h.mark_from([Value::heap_ref(tr)].into_iter());
        h.prune_weak_tables();
        assert_eq!(h.sweep(), 1);
        match h.get(tr).unwrap() {
            SlotData::Table(t) => assert!(t.is_empty()),
            _ => panic!("expected table slot"),
        }
    }

    #[test]
    fn test_accounting_rises_and_falls() {
        let acct = MemoryAccount::unlimited();
        let mut h = Heap::new(acct.clone());
        assert_eq!(acct.used(), 0);
        let _a = h.alloc(SlotData::Str("abc".into()), 0).unwrap();
        let before = acct.used();
        assert!(before > 0);
        h.clear_marks();
        h.sweep();
        assert_eq!(acct.used(), 0);
        let _ = before;
    }

    #[test]
    fn test_alloc_refused_at_limit() {
        let mut h = Heap::new(MemoryAccount::with_limit(32));
        let err = h.alloc(SlotData::Str("too big for the limit".into()), 0);
        assert!(matches!(err, Err(ScriptError::OutOfMemory { .. })));
    }
}
