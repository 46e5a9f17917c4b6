//! Class, property, and function descriptors
//!
//! Descriptors are the reflection system's source of truth. Consumers
//! resolve members by name per access — nothing here is meant to be
//! cached across dispatches, since a host may keep registering classes
//! and functions while script runs.

use std::cell::{Ref, RefMut};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::codec;
use crate::error::{HostError, HostResult};
use crate::registry::{HostHandle, HostRegistry, SharedRegistry, TextArena};
use crate::types::{HostValue, TypeKind};

/// Property read entry point for accessor-backed properties.
///
/// Receives the whole instance storage; typically reads a private slot
/// reserved via [`ClassBuilder::storage`].
pub type GetFn = fn(&[u8]) -> HostValue;

/// Property write entry point for accessor-backed properties.
pub type SetFn = fn(&mut [u8], &HostValue) -> HostResult<()>;

/// Instance initializer run on construction (after zero-fill).
pub type InitFn = fn(&mut [u8], &mut TextArena);

/// How a property reaches its value.
pub enum PropertyAccess {
    /// Direct byte access at an offset into instance storage
    Offset(usize),
    /// Accessor pair; `set: None` makes the property read-only
    Accessor {
        /// Read entry point
        get: GetFn,
        /// Write entry point
        set: Option<SetFn>,
    },
}

/// A reflected property.
pub struct PropertyDescriptor {
    /// Member name
    pub name: String,
    /// Declared kind
    pub ty: TypeKind,
    /// Writes rejected when set
    pub read_only: bool,
    /// Access strategy
    pub access: PropertyAccess,
}

/// A reflected function parameter.
pub struct ParamDescriptor {
    /// Parameter name
    pub name: String,
    /// Declared kind
    pub ty: TypeKind,
    /// Default value; presence makes the parameter omittable when every
    /// later parameter also has a default
    pub default: Option<HostValue>,
    /// Out/ref parameter: the invoke entry point writes the post-call
    /// value back into the argument frame
    pub out: bool,
}

/// Host→script callback capability handed to invoke entry points.
///
/// `reference` is a reverse-reference id previously created by the
/// embedding layer; host code uses it to call a script value it holds.
pub trait ScriptCallback {
    /// Invoke the referenced script value with `args`.
    fn call_reference(&mut self, reference: u64, args: &[HostValue])
        -> HostResult<Option<HostValue>>;
}

/// Context available to a reflected invocation.
///
/// Holds the shared object registry handle (borrow briefly, never across
/// a script callback) and, when the call came through the script
/// boundary, a capability to call back into script.
pub struct InvokeCtx<'a> {
    registry: &'a SharedRegistry,
    script: Option<&'a mut dyn ScriptCallback>,
}

impl<'a> InvokeCtx<'a> {
    /// Build a context over the shared registry.
    pub fn new(registry: &'a SharedRegistry, script: Option<&'a mut dyn ScriptCallback>) -> Self {
        Self { registry, script }
    }

    /// The shared registry handle.
    pub fn registry(&self) -> &'a SharedRegistry {
        self.registry
    }

    /// Borrow the object registry.
    pub fn objects(&self) -> Ref<'_, HostRegistry> {
        self.registry.borrow()
    }

    /// Mutably borrow the object registry.
    pub fn objects_mut(&self) -> RefMut<'_, HostRegistry> {
        self.registry.borrow_mut()
    }

    /// The script-callback capability, if the caller provided one.
    pub fn script(&mut self) -> HostResult<&mut dyn ScriptCallback> {
        match self.script.as_deref_mut() {
            Some(s) => Ok(s),
            None => Err(HostError::Invoke(
                "no script callback capability in this invocation".into(),
            )),
        }
    }
}

/// Generic invoke entry point of a reflected function.
pub type InvokeFn = Arc<
    dyn Fn(&mut InvokeCtx<'_>, Option<HostHandle>, &mut [HostValue]) -> HostResult<Option<HostValue>>,
>;

/// A reflected function.
pub struct FunctionDescriptor {
    /// Member name
    pub name: String,
    /// Positional parameters
    pub params: Vec<ParamDescriptor>,
    /// Return kind, if any
    pub ret: Option<TypeKind>,
    /// Generic invoke entry point
    pub invoke: InvokeFn,
}

impl FunctionDescriptor {
    /// Number of parameters that must be supplied (those before the
    /// trailing default-valued run).
    pub fn required_params(&self) -> usize {
        let mut required = self.params.len();
        for p in self.params.iter().rev() {
            if p.default.is_some() {
                required -= 1;
            } else {
                break;
            }
        }
        required
    }
}

/// Builder for [`FunctionDescriptor`].
pub struct FunctionBuilder {
    name: String,
    params: Vec<ParamDescriptor>,
    ret: Option<TypeKind>,
    invoke: Option<InvokeFn>,
}

impl FunctionBuilder {
    /// Start a function named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: None,
            invoke: None,
        }
    }

    /// Required positional parameter.
    pub fn param(mut self, name: impl Into<String>, ty: TypeKind) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            ty,
            default: None,
            out: false,
        });
        self
    }

    /// Default-valued parameter (omittable when trailing).
    pub fn optional(mut self, name: impl Into<String>, ty: TypeKind, default: HostValue) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            ty,
            default: Some(default),
            out: false,
        });
        self
    }

    /// Out/ref parameter: written back after the call.
    pub fn out(mut self, name: impl Into<String>, ty: TypeKind) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            ty,
            default: None,
            out: true,
        });
        self
    }

    /// Declare the return kind.
    pub fn returns(mut self, ty: TypeKind) -> Self {
        self.ret = Some(ty);
        self
    }

    /// Install the invoke entry point.
    pub fn invoke(mut self, f: InvokeFn) -> Self {
        self.invoke = Some(f);
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> FunctionDescriptor {
        let name = self.name;
        let invoke = self.invoke.unwrap_or_else(|| {
            Arc::new(|_, _, _| Err(HostError::Invoke("no invoke entry point".into())))
        });
        FunctionDescriptor {
            name,
            params: self.params,
            ret: self.ret,
            invoke,
        }
    }
}

/// A reflected class: layout, members, ancestry, construction.
pub struct ClassDescriptor {
    name: String,
    parent: Option<Arc<ClassDescriptor>>,
    properties: Vec<PropertyDescriptor>,
    functions: Vec<FunctionDescriptor>,
    prop_index: FxHashMap<String, usize>,
    func_index: FxHashMap<String, usize>,
    instance_size: usize,
    init: Option<InitFn>,
}

impl ClassDescriptor {
    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class, if any.
    pub fn parent(&self) -> Option<&Arc<ClassDescriptor>> {
        self.parent.as_ref()
    }

    /// Instance storage size in bytes (including inherited layout).
    pub fn instance_size(&self) -> usize {
        self.instance_size
    }

    /// Instance initializer, if any.
    pub fn init(&self) -> Option<InitFn> {
        self.init
    }

    /// Resolve a property by name, walking the ancestry.
    pub fn find_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        match self.prop_index.get(name) {
            Some(&i) => Some(&self.properties[i]),
            None => self.parent.as_ref().and_then(|p| p.find_property(name)),
        }
    }

    /// Resolve a function by name, walking the ancestry.
    pub fn find_function(&self, name: &str) -> Option<&FunctionDescriptor> {
        match self.func_index.get(name) {
            Some(&i) => Some(&self.functions[i]),
            None => self.parent.as_ref().and_then(|p| p.find_function(name)),
        }
    }

    /// Own (non-inherited) properties.
    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    /// True when `self` is `ancestor` or inherits from it. Descriptor
    /// identity is pointer identity — the reflection system hands out one
    /// shared descriptor per class.
    pub fn assignable_to(&self, ancestor: &Arc<ClassDescriptor>) -> bool {
        let target = Arc::as_ptr(ancestor);
        let mut current: &ClassDescriptor = self;
        loop {
            if std::ptr::eq(current as *const ClassDescriptor, target) {
                return true;
            }
            match current.parent.as_ref() {
                Some(p) => current = p.as_ref(),
                None => return false,
            }
        }
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("size", &self.instance_size)
            .field("properties", &self.properties.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Builder for [`ClassDescriptor`]. Offset-backed fields are laid out
/// sequentially with natural alignment, continuing the parent's layout.
pub struct ClassBuilder {
    name: String,
    parent: Option<Arc<ClassDescriptor>>,
    properties: Vec<PropertyDescriptor>,
    functions: Vec<FunctionDescriptor>,
    cursor: usize,
    init: Option<InitFn>,
}

impl ClassBuilder {
    /// Start a class named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            properties: Vec::new(),
            functions: Vec::new(),
            cursor: 0,
            init: None,
        }
    }

    /// Inherit from `parent`; layout continues after the parent's.
    pub fn parent(mut self, parent: Arc<ClassDescriptor>) -> Self {
        self.cursor = parent.instance_size();
        self.parent = Some(parent);
        self
    }

    fn push_field(&mut self, name: String, ty: TypeKind, read_only: bool) {
        let align = codec::kind_align(&ty);
        let size = codec::kind_size(&ty);
        let offset = (self.cursor + align - 1) / align * align;
        self.cursor = offset + size;
        self.properties.push(PropertyDescriptor {
            name,
            ty,
            read_only,
            access: PropertyAccess::Offset(offset),
        });
    }

    /// Writable offset-backed field.
    pub fn field(mut self, name: impl Into<String>, ty: TypeKind) -> Self {
        self.push_field(name.into(), ty, false);
        self
    }

    /// Read-only offset-backed field.
    pub fn field_read_only(mut self, name: impl Into<String>, ty: TypeKind) -> Self {
        self.push_field(name.into(), ty, true);
        self
    }

    /// Accessor-backed property; read-only when `set` is `None`.
    pub fn accessor(
        mut self,
        name: impl Into<String>,
        ty: TypeKind,
        get: GetFn,
        set: Option<SetFn>,
    ) -> Self {
        let read_only = set.is_none();
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            ty,
            read_only,
            access: PropertyAccess::Accessor { get, set },
        });
        self
    }

    /// Reserve raw instance storage (accessor backing, padding).
    pub fn storage(mut self, bytes: usize) -> Self {
        self.cursor += bytes;
        self
    }

    /// Current layout cursor; the offset the next field would land on
    /// (before alignment).
    pub fn next_offset(&self) -> usize {
        self.cursor
    }

    /// Add a reflected function.
    pub fn function(mut self, f: FunctionDescriptor) -> Self {
        self.functions.push(f);
        self
    }

    /// Install an instance initializer run on construction.
    pub fn init(mut self, f: InitFn) -> Self {
        self.init = Some(f);
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> Arc<ClassDescriptor> {
        let prop_index = self
            .properties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        let func_index = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Arc::new(ClassDescriptor {
            name: self.name,
            parent: self.parent,
            properties: self.properties,
            functions: self.functions,
            prop_index,
            func_index,
            instance_size: self.cursor,
            init: self.init,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_aligned() {
        let class = ClassBuilder::new("Layout")
            .field("flag", TypeKind::Bool)
            .field("count", TypeKind::Int32)
            .field("mass", TypeKind::Float64)
            .build();
        let flag = class.find_property("flag").unwrap();
        let count = class.find_property("count").unwrap();
        let mass = class.find_property("mass").unwrap();
        assert!(matches!(flag.access, PropertyAccess::Offset(0)));
        assert!(matches!(count.access, PropertyAccess::Offset(4)));
        assert!(matches!(mass.access, PropertyAccess::Offset(8)));
        assert_eq!(class.instance_size(), 16);
    }

    #[test]
    fn test_parent_lookup_and_layout() {
        let base = ClassBuilder::new("Base").field("a", TypeKind::Int32).build();
        let derived = ClassBuilder::new("Derived")
            .parent(base.clone())
            .field("b", TypeKind::Int32)
            .build();
        assert!(derived.find_property("a").is_some());
        let b = derived.find_property("b").unwrap();
        assert!(matches!(b.access, PropertyAccess::Offset(4)));
        assert!(derived.assignable_to(&base));
        assert!(!base.assignable_to(&derived));
    }

    #[test]
    fn test_unrelated_classes_not_assignable() {
        let a = ClassBuilder::new("A").build();
        let b = ClassBuilder::new("B").build();
        assert!(!a.assignable_to(&b));
    }

    #[test]
    fn test_required_params_trailing_defaults() {
        let f = FunctionBuilder::new("f")
            .param("a", TypeKind::Int32)
            .param("b", TypeKind::Int32)
            .optional("c", TypeKind::Int32, HostValue::Int32(0))
            .build();
        assert_eq!(f.required_params(), 2);
        assert_eq!(f.params.len(), 3);
    }

    #[test]
    fn test_required_params_non_trailing_default() {
        // A default followed by a required parameter is not omittable.
        let f = FunctionBuilder::new("f")
            .optional("a", TypeKind::Int32, HostValue::Int32(0))
            .param("b", TypeKind::Int32)
            .build();
        assert_eq!(f.required_params(), 2);
    }
}
