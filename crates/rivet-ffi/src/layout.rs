//! Struct and union memory layout.
//!
//! The builder computes field offsets under one of three disciplines:
//!
//! - `Natural`: each field's offset rounds up to its type's alignment, the
//!   struct's alignment is the max field alignment, and the final size
//!   rounds up to the struct alignment.
//! - `Packed(n)`: offsets accumulate with at most `n`-byte alignment and no
//!   trailing padding.
//! - `Union`: every field sits at offset 0; size is the max field size.
//!
//! Explicit field offsets bypass the alignment rule entirely; the caller
//! assumes responsibility for correctness, including deliberate
//! misalignment.
//!
//! The resulting [`StructLayout`] is immutable and doubles as the accessor
//! map for reading and writing fields through a [`MemoryRegion`]. Accessor
//! functions are looked up once per field at build time from a fixed table,
//! never dispatched by name at access time.

use std::collections::HashMap;

use rivet_memory::MemoryRegion;

use crate::error::{FfiError, Result};
use crate::types::{NativeType, TypeKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutStyle {
    Natural,
    Packed(usize),
    Union,
}

/// A typed {reader, writer} pair over a region offset.
struct MemoryOp {
    read: fn(&MemoryRegion, usize) -> Result<Value>,
    write: fn(&MemoryRegion, usize, &Value) -> Result<()>,
}

macro_rules! int_op {
    ($narrow:ident, $put:ident, $get:ident, $variant:ident) => {
        MemoryOp {
            read: |r, o| Ok(Value::$variant(r.$get(o)? as _)),
            write: |r, o, v| Ok(r.$put(o, v.$narrow()?)?),
        }
    };
}

static OP_BOOL: MemoryOp = MemoryOp {
    read: |r, o| Ok(Value::Bool(r.get_u8(o)? != 0)),
    write: |r, o, v| Ok(r.put_u8(o, v.to_bool()? as u8)?),
};
static OP_I8: MemoryOp = int_op!(to_i8, put_i8, get_i8, Int);
static OP_U8: MemoryOp = int_op!(to_u8, put_u8, get_u8, UInt);
static OP_I16: MemoryOp = int_op!(to_i16, put_i16, get_i16, Int);
static OP_U16: MemoryOp = int_op!(to_u16, put_u16, get_u16, UInt);
static OP_I32: MemoryOp = int_op!(to_i32, put_i32, get_i32, Int);
static OP_U32: MemoryOp = int_op!(to_u32, put_u32, get_u32, UInt);
static OP_I64: MemoryOp = int_op!(to_i64, put_i64, get_i64, Int);
static OP_U64: MemoryOp = int_op!(to_u64, put_u64, get_u64, UInt);
static OP_F32: MemoryOp = MemoryOp {
    read: |r, o| Ok(Value::Float(r.get_f32(o)? as f64)),
    write: |r, o, v| Ok(r.put_f32(o, v.to_f64()? as f32)?),
};
static OP_F64: MemoryOp = MemoryOp {
    read: |r, o| Ok(Value::Float(r.get_f64(o)?)),
    write: |r, o, v| Ok(r.put_f64(o, v.to_f64()?)?),
};
static OP_POINTER: MemoryOp = MemoryOp {
    read: |r, o| Ok(Value::Pointer(r.get_pointer(o)?)),
    write: |r, o, v| Ok(r.put_pointer(o, &v.to_region()?)?),
};
// A `char*` field: reading follows the pointer and copies out the string.
// Writing accepts only pointer-convertible values; storing an interpreter
// string would need owned backing memory the layout cannot provide.
static OP_CSTRING: MemoryOp = MemoryOp {
    read: |r, o| {
        let target = r.get_pointer(o)?;
        if target.is_null() {
            return Ok(Value::Nil);
        }
        let bytes = target.get_c_string(0)?;
        Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
    },
    write: |r, o, v| match v {
        Value::Str(_) => Err(FfiError::TypeMismatch {
            expected: "pointer (string fields need caller-owned storage)",
            got: "string".to_string(),
        }),
        other => Ok(r.put_pointer(o, &other.to_region()?)?),
    },
};

/// Build-time accessor lookup. Kinds without a scalar accessor (structs,
/// arrays, long double) are accessed as sub-views instead.
fn memory_op_for(kind: &TypeKind) -> Option<&'static MemoryOp> {
    match kind {
        TypeKind::Bool => Some(&OP_BOOL),
        TypeKind::I8 => Some(&OP_I8),
        TypeKind::U8 => Some(&OP_U8),
        TypeKind::I16 => Some(&OP_I16),
        TypeKind::U16 => Some(&OP_U16),
        TypeKind::I32 => Some(&OP_I32),
        TypeKind::U32 => Some(&OP_U32),
        TypeKind::I64 => Some(&OP_I64),
        TypeKind::U64 => Some(&OP_U64),
        TypeKind::F32 => Some(&OP_F32),
        TypeKind::F64 => Some(&OP_F64),
        TypeKind::Pointer | TypeKind::Function(_) => Some(&OP_POINTER),
        TypeKind::CString => Some(&OP_CSTRING),
        TypeKind::Mapped { inner, .. } => memory_op_for(inner.kind()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub ty: NativeType,
    pub offset: usize,
    op: Option<&'static MemoryOp>,
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("ty", &self.ty.name())
            .field("offset", &self.offset)
            .finish()
    }
}

impl Field {
    /// Read this field out of `region`.
    pub fn get(&self, region: &MemoryRegion) -> Result<Value> {
        let raw = match self.op {
            Some(op) => (op.read)(region, self.offset)?,
            // Aggregate fields read as a bounded sub-view sharing storage.
            None => {
                let view = region.offset_by(self.offset)?;
                Value::Pointer(match view.len() {
                    Some(_) => clamp(view, self.ty.size()),
                    None => view,
                })
            }
        };
        if let TypeKind::Mapped { converter, .. } = self.ty.kind() {
            return converter.from_native(raw);
        }
        Ok(raw)
    }

    /// Write `value` into this field.
    pub fn put(&self, region: &MemoryRegion, value: &Value) -> Result<()> {
        let mapped;
        let value = if let TypeKind::Mapped { converter, .. } = self.ty.kind() {
            mapped = converter.to_native(value)?;
            &mapped
        } else {
            value
        };
        match self.op {
            Some(op) => (op.write)(region, self.offset, value),
            None => {
                // Aggregates copy by bytes from the source region.
                let src = value.to_region()?;
                let bytes = src.get_bytes(0, self.ty.size())?;
                Ok(region.put_bytes(self.offset, &bytes)?)
            }
        }
    }
}

fn clamp(view: MemoryRegion, size: usize) -> MemoryRegion {
    match view.len() {
        Some(len) if len > size => MemoryRegion::new(view.base(), size),
        _ => view,
    }
}

/// An immutable struct or union layout: ordered fields, total size and
/// alignment, plus by-name access.
#[derive(Debug)]
pub struct StructLayout {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    size: usize,
    alignment: usize,
    style: LayoutStyle,
}

impl StructLayout {
    pub fn builder() -> StructLayoutBuilder {
        StructLayoutBuilder::new(LayoutStyle::Natural)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.field(name).map(|f| f.offset)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn style(&self) -> LayoutStyle {
        self.style
    }

    pub fn get(&self, region: &MemoryRegion, name: &str) -> Result<Value> {
        self.field(name)
            .ok_or_else(|| FfiError::Layout(format!("no field named '{name}'")))?
            .get(region)
    }

    pub fn put(&self, region: &MemoryRegion, name: &str, value: &Value) -> Result<()> {
        self.field(name)
            .ok_or_else(|| FfiError::Layout(format!("no field named '{name}'")))?
            .put(region, value)
    }
}

pub struct StructLayoutBuilder {
    style: LayoutStyle,
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
    size: usize,
    alignment: usize,
    min_alignment: usize,
}

impl StructLayoutBuilder {
    pub fn new(style: LayoutStyle) -> Self {
        Self {
            style,
            fields: Vec::new(),
            by_name: HashMap::new(),
            size: 0,
            alignment: 1,
            min_alignment: 1,
        }
    }

    /// Raise the minimum alignment applied to every subsequent field.
    pub fn min_alignment(mut self, align: usize) -> Self {
        self.min_alignment = align.max(1);
        self.alignment = self.alignment.max(self.min_alignment);
        self
    }

    /// Append a field at the next offset the layout discipline dictates.
    pub fn add_field(self, name: impl Into<String>, ty: NativeType) -> Result<Self> {
        let offset = self.next_offset(&ty);
        self.push(name.into(), ty, offset, false)
    }

    /// Append a field at an explicit offset, bypassing the alignment rule.
    pub fn add_field_at(
        self,
        name: impl Into<String>,
        ty: NativeType,
        offset: usize,
    ) -> Result<Self> {
        self.push(name.into(), ty, offset, true)
    }

    pub fn build(mut self) -> Result<StructLayout> {
        let size = match self.style {
            LayoutStyle::Packed(_) => self.size,
            _ => round_up(self.size, self.alignment),
        };
        self.fields.shrink_to_fit();
        Ok(StructLayout {
            fields: self.fields,
            by_name: self.by_name,
            size,
            alignment: self.alignment,
            style: self.style,
        })
    }

    fn next_offset(&self, ty: &NativeType) -> usize {
        match self.style {
            LayoutStyle::Union => 0,
            LayoutStyle::Packed(pack) => round_up(self.size, pack.max(1)),
            LayoutStyle::Natural => {
                round_up(self.size, self.min_alignment.max(ty.alignment()))
            }
        }
    }

    fn push(
        mut self,
        name: String,
        ty: NativeType,
        offset: usize,
        explicit: bool,
    ) -> Result<Self> {
        if matches!(ty.kind(), TypeKind::Void | TypeKind::Varargs) {
            return Err(FfiError::Layout(format!(
                "'{name}': {} cannot be a struct field",
                ty.name()
            )));
        }
        if self.by_name.contains_key(&name) {
            return Err(FfiError::Layout(format!("duplicate field '{name}'")));
        }
        match self.style {
            LayoutStyle::Packed(pack) => {
                self.alignment = self.alignment.max(pack.max(1).min(ty.alignment()));
            }
            _ => {
                let effective = self.min_alignment.max(ty.alignment());
                self.alignment = self.alignment.max(effective);
            }
        }
        self.size = self.size.max(offset + ty.size());
        let op = memory_op_for(ty.kind());
        let _ = explicit; // explicit offsets carry no extra bookkeeping
        self.by_name.insert(name.clone(), self.fields.len());
        self.fields.push(Field {
            name,
            ty,
            offset,
            op,
        });
        Ok(self)
    }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}
