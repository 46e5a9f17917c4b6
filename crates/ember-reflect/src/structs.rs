//! Structured value types
//!
//! A struct descriptor fixes a byte layout for a host value type: sized
//! storage, offset-backed fields, an optional drop hook for copies whose
//! ownership moved to a foreign collector, and default-initialized bytes
//! for struct-as-constructor use.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::class::{PropertyAccess, PropertyDescriptor};
use crate::codec;
use crate::types::TypeKind;

/// Drop hook run exactly once when a foreign-owned copy is finalized.
pub type StructDropFn = fn(&mut [u8]);

/// A structured value type.
pub struct StructDescriptor {
    name: String,
    size: usize,
    fields: Vec<PropertyDescriptor>,
    field_index: FxHashMap<String, usize>,
    drop_fn: Option<StructDropFn>,
}

impl StructDescriptor {
    /// Type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance byte size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Field descriptors in layout order.
    pub fn fields(&self) -> &[PropertyDescriptor] {
        &self.fields
    }

    /// Resolve a field by name.
    pub fn find_field(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.field_index.get(name).map(|&i| &self.fields[i])
    }

    /// Drop hook for owned copies, if any.
    pub fn drop_fn(&self) -> Option<StructDropFn> {
        self.drop_fn
    }

    /// Default (zeroed) instance bytes.
    pub fn default_bytes(&self) -> Vec<u8> {
        vec![0u8; self.size]
    }
}

impl std::fmt::Debug for StructDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructDescriptor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("fields", &self.fields.len())
            .finish()
    }
}

/// Builder for [`StructDescriptor`]; fields are laid out sequentially
/// with natural alignment.
pub struct StructBuilder {
    name: String,
    fields: Vec<PropertyDescriptor>,
    cursor: usize,
    drop_fn: Option<StructDropFn>,
}

impl StructBuilder {
    /// Start a struct type named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            cursor: 0,
            drop_fn: None,
        }
    }

    /// Append a field.
    pub fn field(mut self, name: impl Into<String>, ty: TypeKind) -> Self {
        let align = codec::kind_align(&ty);
        let size = codec::kind_size(&ty);
        let offset = (self.cursor + align - 1) / align * align;
        self.cursor = offset + size;
        self.fields.push(PropertyDescriptor {
            name: name.into(),
            ty,
            read_only: false,
            access: PropertyAccess::Offset(offset),
        });
        self
    }

    /// Install the drop hook for foreign-owned copies.
    pub fn drop_hook(mut self, f: StructDropFn) -> Self {
        self.drop_fn = Some(f);
        self
    }

    /// Finish the descriptor.
    pub fn build(self) -> Arc<StructDescriptor> {
        let field_index = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Arc::new(StructDescriptor {
            name: self.name,
            size: self.cursor,
            fields: self.fields,
            field_index,
            drop_fn: self.drop_fn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_layout() {
        let vec2 = StructBuilder::new("Vector")
            .field("x", TypeKind::Float32)
            .field("y", TypeKind::Float32)
            .build();
        assert_eq!(vec2.size(), 8);
        let x = vec2.find_field("x").unwrap();
        let y = vec2.find_field("y").unwrap();
        assert!(matches!(x.access, PropertyAccess::Offset(0)));
        assert!(matches!(y.access, PropertyAccess::Offset(4)));
        assert!(vec2.find_field("z").is_none());
    }

    #[test]
    fn test_default_bytes_zeroed() {
        let s = StructBuilder::new("Pair")
            .field("a", TypeKind::Int64)
            .field("b", TypeKind::Int32)
            .build();
        let bytes = s.default_bytes();
        assert_eq!(bytes.len(), s.size());
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
