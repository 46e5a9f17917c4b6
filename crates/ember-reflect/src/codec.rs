//! Byte-level property codec
//!
//! Reads and writes every [`TypeKind`] at an offset within instance or
//! struct storage. Scalars are little-endian; object references store
//! their handle bits as u64 (0 = null); symbol and text kinds store u32
//! ids (symbols into the process interner, texts into the registry's
//! arena, 0 = empty).

use crate::error::{HostError, HostResult};
use crate::registry::{HostHandle, TextArena, TextEntry};
use crate::symbol::Symbol;
use crate::types::{HostValue, LocText, StructValue, TypeKind};

/// Storage size of a kind in bytes.
pub fn kind_size(ty: &TypeKind) -> usize {
    match ty {
        TypeKind::Bool => 1,
        TypeKind::Int32 | TypeKind::Float32 => 4,
        TypeKind::Int64 | TypeKind::Float64 => 8,
        TypeKind::Text | TypeKind::LocText | TypeKind::Name => 4,
        TypeKind::Object(_) => 8,
        TypeKind::Struct(s) => s.size(),
    }
}

/// Natural alignment of a kind.
pub fn kind_align(ty: &TypeKind) -> usize {
    match ty {
        TypeKind::Bool => 1,
        TypeKind::Int32 | TypeKind::Float32 => 4,
        TypeKind::Text | TypeKind::LocText | TypeKind::Name => 4,
        TypeKind::Int64 | TypeKind::Float64 | TypeKind::Object(_) => 8,
        TypeKind::Struct(_) => 8,
    }
}

fn field<'a>(bytes: &'a [u8], offset: usize, len: usize) -> HostResult<&'a [u8]> {
    bytes
        .get(offset..offset + len)
        .ok_or(HostError::OutOfBounds {
            offset,
            len,
            size: bytes.len(),
        })
}

fn field_mut<'a>(bytes: &'a mut [u8], offset: usize, len: usize) -> HostResult<&'a mut [u8]> {
    let size = bytes.len();
    bytes
        .get_mut(offset..offset + len)
        .ok_or(HostError::OutOfBounds { offset, len, size })
}

fn read_u32(bytes: &[u8], offset: usize) -> HostResult<u32> {
    let b = field(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(bytes: &[u8], offset: usize) -> HostResult<u64> {
    let b = field(bytes, offset, 8)?;
    Ok(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

/// Read the value of kind `ty` at `offset`.
pub fn read(bytes: &[u8], offset: usize, ty: &TypeKind, texts: &TextArena) -> HostResult<HostValue> {
    Ok(match ty {
        TypeKind::Bool => HostValue::Bool(field(bytes, offset, 1)?[0] != 0),
        TypeKind::Int32 => {
            let b = field(bytes, offset, 4)?;
            HostValue::Int32(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }
        TypeKind::Int64 => HostValue::Int64(read_u64(bytes, offset)? as i64),
        TypeKind::Float32 => HostValue::Float32(f32::from_bits(read_u32(bytes, offset)?)),
        TypeKind::Float64 => HostValue::Float64(f64::from_bits(read_u64(bytes, offset)?)),
        TypeKind::Text => {
            let id = read_u32(bytes, offset)?;
            match texts.get(id)? {
                None => HostValue::Text(String::new()),
                Some(TextEntry::Plain(s)) => HostValue::Text(s.clone()),
                Some(TextEntry::Localized(t)) => HostValue::Text(t.text.clone()),
            }
        }
        TypeKind::LocText => {
            let id = read_u32(bytes, offset)?;
            match texts.get(id)? {
                None => HostValue::LocText(LocText::literal("")),
                Some(TextEntry::Plain(s)) => HostValue::LocText(LocText::literal(s.clone())),
                Some(TextEntry::Localized(t)) => HostValue::LocText(t.clone()),
            }
        }
        TypeKind::Name => HostValue::Name(Symbol::from_raw(read_u32(bytes, offset)?)),
        TypeKind::Object(_) => HostValue::Object(HostHandle::from_bits(read_u64(bytes, offset)?)),
        TypeKind::Struct(s) => {
            let b = field(bytes, offset, s.size())?;
            HostValue::Struct(StructValue {
                ty: s.clone(),
                bytes: b.to_vec(),
            })
        }
    })
}

fn kind_error(ty: &TypeKind, value: &HostValue) -> HostError {
    HostError::ValueKind {
        expected: ty.name(),
        got: value.kind_name().to_string(),
    }
}

/// Write `value` (which must match kind `ty`) at `offset`.
///
/// Text-like writes release the previously stored arena entry, so a slot
/// never leaks its old text.
pub fn write(
    bytes: &mut [u8],
    offset: usize,
    ty: &TypeKind,
    value: &HostValue,
    texts: &mut TextArena,
) -> HostResult<()> {
    match (ty, value) {
        (TypeKind::Bool, HostValue::Bool(b)) => {
            field_mut(bytes, offset, 1)?[0] = *b as u8;
        }
        (TypeKind::Int32, HostValue::Int32(i)) => {
            field_mut(bytes, offset, 4)?.copy_from_slice(&i.to_le_bytes());
        }
        (TypeKind::Int64, HostValue::Int64(i)) => {
            field_mut(bytes, offset, 8)?.copy_from_slice(&i.to_le_bytes());
        }
        (TypeKind::Float32, HostValue::Float32(f)) => {
            field_mut(bytes, offset, 4)?.copy_from_slice(&f.to_bits().to_le_bytes());
        }
        (TypeKind::Float64, HostValue::Float64(f)) => {
            field_mut(bytes, offset, 8)?.copy_from_slice(&f.to_bits().to_le_bytes());
        }
        (TypeKind::Text, HostValue::Text(s)) => {
            let old = read_u32(bytes, offset)?;
            texts.free(old);
            let id = if s.is_empty() {
                0
            } else {
                texts.alloc(TextEntry::Plain(s.clone()))
            };
            field_mut(bytes, offset, 4)?.copy_from_slice(&id.to_le_bytes());
        }
        (TypeKind::LocText, HostValue::LocText(t)) => {
            let old = read_u32(bytes, offset)?;
            texts.free(old);
            let id = if t.text.is_empty() && t.key.is_none() {
                0
            } else {
                texts.alloc(TextEntry::Localized(t.clone()))
            };
            field_mut(bytes, offset, 4)?.copy_from_slice(&id.to_le_bytes());
        }
        (TypeKind::Name, HostValue::Name(n)) => {
            field_mut(bytes, offset, 4)?.copy_from_slice(&n.raw().to_le_bytes());
        }
        (TypeKind::Object(_), HostValue::Object(h)) => {
            let bits = h.map(|h| h.bits()).unwrap_or(0);
            field_mut(bytes, offset, 8)?.copy_from_slice(&bits.to_le_bytes());
        }
        (TypeKind::Struct(ty), HostValue::Struct(v)) => {
            if v.bytes.len() != ty.size() {
                return Err(HostError::ValueKind {
                    expected: format!("struct<{}> ({} bytes)", ty.name(), ty.size()),
                    got: format!("struct of {} bytes", v.bytes.len()),
                });
            }
            field_mut(bytes, offset, ty.size())?.copy_from_slice(&v.bytes);
        }
        (ty, value) => return Err(kind_error(ty, value)),
    }
    Ok(())
}
