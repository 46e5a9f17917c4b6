//! Host object registry
//!
//! The host side of the boundary: typed objects with stable byte storage,
//! addressed by generation-tagged handles (a destroyed slot's handles
//! never resurrect). Destruction is explicit; `sweep` is the
//! root-scanning collection pass the host collector runs, keeping every
//! object reachable from a host root or from the reported external root
//! set.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::class::{ClassDescriptor, PropertyAccess, PropertyDescriptor};
use crate::codec;
use crate::error::{HostError, HostResult};
use crate::types::{HostValue, LocText, TypeKind};

/// Shared handle to a [`HostRegistry`]; borrowed briefly, never across a
/// call back into script.
pub type SharedRegistry = Rc<RefCell<HostRegistry>>;

/// Generation-tagged handle to a host object.
///
/// Layout: low 32 bits slot index, high 32 bits generation (starting at
/// 1, so the bit pattern 0 is never a live handle and can encode null in
/// instance storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostHandle(u64);

impl HostHandle {
    fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    fn index(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw bits, as stored in instance memory and used as identity keys.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Rebuild from raw bits; 0 is the null encoding.
    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits == 0 {
            None
        } else {
            Some(Self(bits))
        }
    }
}

/// Text-like storage entry.
#[derive(Debug, Clone)]
pub enum TextEntry {
    /// Plain text
    Plain(String),
    /// Localizable text
    Localized(LocText),
}

/// Arena for text values referenced from instance storage by u32 id
/// (0 = empty).
#[derive(Debug, Default)]
pub struct TextArena {
    entries: Vec<Option<TextEntry>>,
    free: Vec<u32>,
}

impl TextArena {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry, returning its id.
    pub fn alloc(&mut self, entry: TextEntry) -> u32 {
        match self.free.pop() {
            Some(i) => {
                self.entries[i as usize] = Some(entry);
                i + 1
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() as u32
            }
        }
    }

    /// Resolve an id; 0 resolves to `None` (the empty text).
    pub fn get(&self, id: u32) -> HostResult<Option<&TextEntry>> {
        if id == 0 {
            return Ok(None);
        }
        match self.entries.get((id - 1) as usize) {
            Some(Some(e)) => Ok(Some(e)),
            _ => Err(HostError::DanglingText(id)),
        }
    }

    /// Release an id; 0 is a no-op, double-free is a no-op.
    pub fn free(&mut self, id: u32) {
        if id == 0 {
            return;
        }
        let i = (id - 1) as usize;
        if let Some(slot) = self.entries.get_mut(i) {
            if slot.take().is_some() {
                self.free.push(id - 1);
            }
        }
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

struct ObjectSlot {
    class: Arc<ClassDescriptor>,
    data: Box<[u8]>,
    rooted: bool,
}

/// The host object system.
pub struct HostRegistry {
    slots: Vec<Option<ObjectSlot>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    texts: TextArena,
}

impl HostRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            generations: Vec::new(),
            free: Vec::new(),
            texts: TextArena::new(),
        }
    }

    /// Empty registry behind the shared handle the bridge consumes.
    pub fn shared() -> SharedRegistry {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Construct an object of `class`: zeroed storage, then the class
    /// initializer, if any.
    pub fn create(&mut self, class: &Arc<ClassDescriptor>) -> HostHandle {
        let mut data = vec![0u8; class.instance_size()].into_boxed_slice();
        if let Some(init) = class.init() {
            init(&mut data, &mut self.texts);
        }
        let slot = ObjectSlot {
            class: class.clone(),
            data,
            rooted: false,
        };
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(slot);
                HostHandle::new(i, self.generations[i as usize])
            }
            None => {
                self.slots.push(Some(slot));
                self.generations.push(1);
                HostHandle::new((self.slots.len() - 1) as u32, 1)
            }
        }
    }

    fn slot(&self, h: HostHandle) -> HostResult<&ObjectSlot> {
        let i = h.index() as usize;
        if self.generations.get(i).copied() != Some(h.generation()) {
            return Err(HostError::InvalidHandle);
        }
        self.slots
            .get(i)
            .and_then(|s| s.as_ref())
            .ok_or(HostError::InvalidHandle)
    }

    fn slot_mut(&mut self, h: HostHandle) -> HostResult<&mut ObjectSlot> {
        let i = h.index() as usize;
        if self.generations.get(i).copied() != Some(h.generation()) {
            return Err(HostError::InvalidHandle);
        }
        self.slots
            .get_mut(i)
            .and_then(|s| s.as_mut())
            .ok_or(HostError::InvalidHandle)
    }

    /// True while the handle addresses a live object.
    pub fn is_valid(&self, h: HostHandle) -> bool {
        self.slot(h).is_ok()
    }

    /// Class of a live object.
    pub fn class_of(&self, h: HostHandle) -> HostResult<Arc<ClassDescriptor>> {
        Ok(self.slot(h)?.class.clone())
    }

    /// Borrow instance storage.
    pub fn bytes(&self, h: HostHandle) -> HostResult<&[u8]> {
        Ok(&self.slot(h)?.data)
    }

    /// Mutably borrow instance storage.
    pub fn bytes_mut(&mut self, h: HostHandle) -> HostResult<&mut [u8]> {
        Ok(&mut self.slot_mut(h)?.data)
    }

    /// Stable address of instance storage at `offset`. The storage is
    /// boxed and never moves while the object is alive; the pointer is
    /// invalidated by `destroy`/`sweep`.
    pub fn data_ptr(&self, h: HostHandle, offset: usize) -> HostResult<NonNull<u8>> {
        let slot = self.slot(h)?;
        if offset >= slot.data.len() {
            return Err(HostError::OutOfBounds {
                offset,
                len: 0,
                size: slot.data.len(),
            });
        }
        // Box<[u8]> storage has a stable address for the slot's lifetime,
        // and `offset < len` guarantees the pointer is non-null and
        // in-bounds.
        let ptr = slot.data.as_ptr() as *mut u8;
        Ok(unsafe { NonNull::new_unchecked(ptr.add(offset)) })
    }

    /// The text arena.
    pub fn texts(&self) -> &TextArena {
        &self.texts
    }

    /// The text arena, mutable.
    pub fn texts_mut(&mut self) -> &mut TextArena {
        &mut self.texts
    }

    /// Read a property of a live object through its access strategy.
    pub fn property_value(
        &self,
        h: HostHandle,
        prop: &PropertyDescriptor,
    ) -> HostResult<HostValue> {
        let slot = self.slot(h)?;
        match &prop.access {
            PropertyAccess::Offset(offset) => codec::read(&slot.data, *offset, &prop.ty, &self.texts),
            PropertyAccess::Accessor { get, .. } => Ok(get(&slot.data)),
        }
    }

    /// Write a property of a live object through its access strategy.
    /// Read-only enforcement happens at the dispatch layer; this is the
    /// raw host-side write.
    pub fn set_property_value(
        &mut self,
        h: HostHandle,
        prop: &PropertyDescriptor,
        value: &HostValue,
    ) -> HostResult<()> {
        let i = h.index() as usize;
        if self.generations.get(i).copied() != Some(h.generation()) {
            return Err(HostError::InvalidHandle);
        }
        let slot = self
            .slots
            .get_mut(i)
            .and_then(|s| s.as_mut())
            .ok_or(HostError::InvalidHandle)?;
        match &prop.access {
            PropertyAccess::Offset(offset) => {
                codec::write(&mut slot.data, *offset, &prop.ty, value, &mut self.texts)
            }
            PropertyAccess::Accessor { set, .. } => match set {
                Some(set) => set(&mut slot.data, value),
                None => Err(HostError::Invoke(format!(
                    "property '{}' has no setter",
                    prop.name
                ))),
            },
        }
    }

    /// Pin or unpin an object as a host root.
    pub fn set_rooted(&mut self, h: HostHandle, rooted: bool) -> HostResult<()> {
        self.slot_mut(h)?.rooted = rooted;
        Ok(())
    }

    /// Destroy an object explicitly, releasing owned text entries.
    pub fn destroy(&mut self, h: HostHandle) -> HostResult<()> {
        // Validate before mutating.
        let text_ids: Vec<u32> = {
            let slot = self.slot(h)?;
            collect_text_ids(&slot.class, &slot.data)
        };
        for id in text_ids {
            self.texts.free(id);
        }
        let i = h.index() as usize;
        self.slots[i] = None;
        self.generations[i] = self.generations[i].wrapping_add(1);
        self.free.push(i as u32);
        Ok(())
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Root-scanning collection pass: keep objects reachable from host
    /// roots or from `reported` (external roots, e.g. script-held
    /// references), tracing object-typed offset fields; destroy the rest.
    /// Returns the number of objects destroyed.
    pub fn sweep(&mut self, reported: &FxHashSet<HostHandle>) -> usize {
        let mut marked: FxHashSet<u32> = FxHashSet::default();
        let mut work: Vec<HostHandle> = Vec::new();

        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(slot) = slot {
                if slot.rooted {
                    work.push(HostHandle::new(i as u32, self.generations[i]));
                }
            }
        }
        work.extend(reported.iter().copied().filter(|h| self.is_valid(*h)));

        while let Some(h) = work.pop() {
            if !marked.insert(h.index()) {
                continue;
            }
            let Ok(slot) = self.slot(h) else { continue };
            for prop in all_offset_object_props(&slot.class) {
                if let PropertyAccess::Offset(offset) = prop.access {
                    if let Ok(HostValue::Object(Some(child))) =
                        codec::read(&slot.data, offset, &prop.ty, &self.texts)
                    {
                        if self.is_valid(child) && !marked.contains(&child.index()) {
                            work.push(child);
                        }
                    }
                }
            }
        }

        let mut destroyed = 0;
        for i in 0..self.slots.len() {
            if self.slots[i].is_some() && !marked.contains(&(i as u32)) {
                let h = HostHandle::new(i as u32, self.generations[i]);
                if self.destroy(h).is_ok() {
                    destroyed += 1;
                }
            }
        }
        destroyed
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Text-kind offset fields across the ancestry (owned arena ids).
fn collect_text_ids(class: &Arc<ClassDescriptor>, data: &[u8]) -> Vec<u32> {
    let mut ids = Vec::new();
    let mut current = Some(class.clone());
    while let Some(c) = current {
        for prop in c.properties() {
            if let PropertyAccess::Offset(offset) = prop.access {
                if matches!(prop.ty, TypeKind::Text | TypeKind::LocText) {
                    if let Some(b) = data.get(offset..offset + 4) {
                        ids.push(u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
                    }
                }
            }
        }
        current = c.parent().cloned();
    }
    ids
}

/// Object-kind offset fields across the ancestry, for the sweep trace.
fn all_offset_object_props(class: &Arc<ClassDescriptor>) -> Vec<&PropertyDescriptor> {
    let mut props = Vec::new();
    let mut current: Option<&Arc<ClassDescriptor>> = Some(class);
    while let Some(c) = current {
        props.extend(c.properties().iter().filter(|p| {
            matches!(p.ty, TypeKind::Object(_)) && matches!(p.access, PropertyAccess::Offset(_))
        }));
        current = c.parent();
    }
    props
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;

    fn point_class() -> Arc<ClassDescriptor> {
        ClassBuilder::new("Point")
            .field("x", TypeKind::Int32)
            .field("y", TypeKind::Int32)
            .build()
    }

    #[test]
    fn test_create_and_access() {
        let mut reg = HostRegistry::new();
        let class = point_class();
        let h = reg.create(&class);
        assert!(reg.is_valid(h));
        let prop = class.find_property("x").unwrap();
        reg.set_property_value(h, prop, &HostValue::Int32(11)).unwrap();
        assert!(matches!(
            reg.property_value(h, prop).unwrap(),
            HostValue::Int32(11)
        ));
    }

    #[test]
    fn test_destroyed_handle_is_stale() {
        let mut reg = HostRegistry::new();
        let class = point_class();
        let h = reg.create(&class);
        reg.destroy(h).unwrap();
        assert!(!reg.is_valid(h));
        assert!(matches!(reg.bytes(h), Err(HostError::InvalidHandle)));
    }

    #[test]
    fn test_no_handle_resurrection() {
        let mut reg = HostRegistry::new();
        let class = point_class();
        let h1 = reg.create(&class);
        reg.destroy(h1).unwrap();
        let h2 = reg.create(&class);
        // Slot is reused but the generation moved on.
        assert_ne!(h1, h2);
        assert!(!reg.is_valid(h1));
        assert!(reg.is_valid(h2));
    }

    #[test]
    fn test_sweep_keeps_reported_and_rooted() {
        let mut reg = HostRegistry::new();
        let class = point_class();
        let rooted = reg.create(&class);
        let reported = reg.create(&class);
        let loose = reg.create(&class);
        reg.set_rooted(rooted, true).unwrap();
        let mut external = FxHashSet::default();
        external.insert(reported);
        let destroyed = reg.sweep(&external);
        assert_eq!(destroyed, 1);
        assert!(reg.is_valid(rooted));
        assert!(reg.is_valid(reported));
        assert!(!reg.is_valid(loose));
    }

    #[test]
    fn test_sweep_traces_object_fields() {
        let target_class = point_class();
        let holder_class = ClassBuilder::new("Holder")
            .field("child", TypeKind::Object(target_class.clone()))
            .build();
        let mut reg = HostRegistry::new();
        let child = reg.create(&target_class);
        let holder = reg.create(&holder_class);
        let prop = holder_class.find_property("child").unwrap();
        reg.set_property_value(holder, prop, &HostValue::Object(Some(child)))
            .unwrap();
        reg.set_rooted(holder, true).unwrap();
        let destroyed = reg.sweep(&FxHashSet::default());
        assert_eq!(destroyed, 0);
        assert!(reg.is_valid(child));
        // Clear the field; the child is now unreachable.
        reg.set_property_value(holder, prop, &HostValue::Object(None))
            .unwrap();
        let destroyed = reg.sweep(&FxHashSet::default());
        assert_eq!(destroyed, 1);
        assert!(!reg.is_valid(child));
    }

    #[test]
    fn test_destroy_releases_texts() {
        let class = ClassBuilder::new("Named")
            .field("label", TypeKind::Text)
            .build();
        let mut reg = HostRegistry::new();
        let h = reg.create(&class);
        let prop = class.find_property("label").unwrap();
        reg.set_property_value(h, prop, &HostValue::Text("hello".into()))
            .unwrap();
        assert_eq!(reg.texts().live_count(), 1);
        reg.destroy(h).unwrap();
        assert_eq!(reg.texts().live_count(), 0);
    }
}
