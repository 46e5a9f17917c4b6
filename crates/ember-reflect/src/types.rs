//! Host value and type-kind model
//!
//! `TypeKind` is the closed set of kinds a reflected member can declare;
//! `HostValue` is the native representation used in argument frames,
//! property reads, and return values. Marshaling layers dispatch on these
//! tags — member names are dynamic, but the kind set is fixed.

use std::sync::Arc;

use crate::class::ClassDescriptor;
use crate::registry::HostHandle;
use crate::structs::StructDescriptor;
use crate::symbol::Symbol;

/// Localizable text: display text plus an optional localization key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocText {
    /// Display text
    pub text: String,
    /// Localization key, if the text is bound to one
    pub key: Option<String>,
}

impl LocText {
    /// Unkeyed literal text.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            key: None,
        }
    }
}

/// Declared kind of a reflected member.
#[derive(Clone)]
pub enum TypeKind {
    /// Boolean
    Bool,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// Plain text
    Text,
    /// Localizable text
    LocText,
    /// Interned symbol text
    Name,
    /// Object reference of (at least) the given class
    Object(Arc<ClassDescriptor>),
    /// Structured value of the given type
    Struct(Arc<StructDescriptor>),
}

impl TypeKind {
    /// Diagnostic name.
    pub fn name(&self) -> String {
        match self {
            TypeKind::Bool => "bool".into(),
            TypeKind::Int32 => "int32".into(),
            TypeKind::Int64 => "int64".into(),
            TypeKind::Float32 => "float32".into(),
            TypeKind::Float64 => "float64".into(),
            TypeKind::Text => "text".into(),
            TypeKind::LocText => "loctext".into(),
            TypeKind::Name => "name".into(),
            TypeKind::Object(c) => format!("object<{}>", c.name()),
            TypeKind::Struct(s) => format!("struct<{}>", s.name()),
        }
    }
}

impl std::fmt::Debug for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeKind::{}", self.name())
    }
}

/// A structured value's bytes, owned, tagged with its type.
#[derive(Debug, Clone)]
pub struct StructValue {
    /// Value type
    pub ty: Arc<StructDescriptor>,
    /// Instance bytes (`ty.size()` long)
    pub bytes: Vec<u8>,
}

/// Native value representation crossing the reflection boundary.
#[derive(Debug, Clone)]
pub enum HostValue {
    /// Boolean
    Bool(bool),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int64(i64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
    /// Plain text
    Text(String),
    /// Localizable text
    LocText(LocText),
    /// Interned symbol
    Name(Symbol),
    /// Object reference (`None` = null)
    Object(Option<HostHandle>),
    /// Structured value (owned bytes)
    Struct(StructValue),
}

impl HostValue {
    /// Diagnostic kind name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            HostValue::Bool(_) => "bool",
            HostValue::Int32(_) => "int32",
            HostValue::Int64(_) => "int64",
            HostValue::Float32(_) => "float32",
            HostValue::Float64(_) => "float64",
            HostValue::Text(_) => "text",
            HostValue::LocText(_) => "loctext",
            HostValue::Name(_) => "name",
            HostValue::Object(_) => "object",
            HostValue::Struct(_) => "struct",
        }
    }
}
