//! Native type descriptors.
//!
//! A [`NativeType`] maps an abstract type tag to its native representation:
//! a kind, a size and an alignment matching the platform C ABI. Descriptors
//! are created once (at registration or layout-build time), immutable
//! afterwards, and shared by reference everywhere they are used.

use std::fmt;
use std::sync::Arc;

use libffi::middle::Type as FfiType;

use crate::callback::Signature;
use crate::error::{FfiError, Result};
use crate::layout::{LayoutStyle, StructLayout};
use crate::value::Value;

const PTR_SIZE: usize = std::mem::size_of::<usize>();

#[cfg(any(windows, all(target_os = "macos", target_arch = "aarch64")))]
const LONG_DOUBLE_SIZE: usize = 8;
#[cfg(not(any(windows, all(target_os = "macos", target_arch = "aarch64"))))]
const LONG_DOUBLE_SIZE: usize = 16;

/// Converts values between an interpreter-visible representation and the
/// representation of the underlying native type (enum-style mappings,
/// transparent wrappers).
pub trait TypeConverter: fmt::Debug + Send + Sync {
    /// Interpreter value to the inner native type's value.
    fn to_native(&self, value: &Value) -> Result<Value>;
    /// Inner native type's value back to the interpreter representation.
    fn from_native(&self, value: Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// Platform `long double`. Usable in memory and layouts; not supported
    /// for by-value call marshaling (the interpreter carries at most f64
    /// precision).
    LongDouble,
    Pointer,
    /// NUL-terminated string, passed by pointer with copy semantics.
    CString,
    /// Struct passed or stored by value.
    Struct(Arc<StructLayout>),
    /// Fixed-length inline array of an element type.
    Array { elem: Arc<NativeType>, len: usize },
    /// A native function pointer with a known signature.
    Function(Arc<Signature>),
    /// A type with an attached value converter over an inner native type.
    Mapped {
        inner: Arc<NativeType>,
        converter: Arc<dyn TypeConverter>,
    },
    /// Marker ending the fixed parameter list of a variadic signature.
    Varargs,
}

/// An immutable native type descriptor.
#[derive(Debug, Clone)]
pub struct NativeType {
    kind: TypeKind,
    size: usize,
    alignment: usize,
}

impl NativeType {
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Size in bytes. Positive for every kind except `Void` and the
    /// `Varargs` marker, which never occupy storage.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn void() -> Self {
        Self {
            kind: TypeKind::Void,
            size: 0,
            alignment: 1,
        }
    }

    pub fn bool() -> Self {
        Self {
            kind: TypeKind::Bool,
            size: 1,
            alignment: 1,
        }
    }

    pub fn i8() -> Self {
        Self::scalar(TypeKind::I8, 1)
    }

    pub fn u8() -> Self {
        Self::scalar(TypeKind::U8, 1)
    }

    pub fn i16() -> Self {
        Self::scalar(TypeKind::I16, 2)
    }

    pub fn u16() -> Self {
        Self::scalar(TypeKind::U16, 2)
    }

    pub fn i32() -> Self {
        Self::scalar(TypeKind::I32, 4)
    }

    pub fn u32() -> Self {
        Self::scalar(TypeKind::U32, 4)
    }

    pub fn i64() -> Self {
        Self::scalar(TypeKind::I64, 8)
    }

    pub fn u64() -> Self {
        Self::scalar(TypeKind::U64, 8)
    }

    pub fn f32() -> Self {
        Self::scalar(TypeKind::F32, 4)
    }

    pub fn f64() -> Self {
        Self::scalar(TypeKind::F64, 8)
    }

    pub fn long_double() -> Self {
        Self::scalar(TypeKind::LongDouble, LONG_DOUBLE_SIZE)
    }

    pub fn pointer() -> Self {
        Self::scalar(TypeKind::Pointer, PTR_SIZE)
    }

    pub fn c_string() -> Self {
        Self::scalar(TypeKind::CString, PTR_SIZE)
    }

    pub fn structure(layout: Arc<StructLayout>) -> Self {
        Self {
            size: layout.size(),
            alignment: layout.alignment(),
            kind: TypeKind::Struct(layout),
        }
    }

    /// Fixed array; size and alignment derive from the element descriptor,
    /// never re-derived from scratch.
    pub fn array(elem: Arc<NativeType>, len: usize) -> Self {
        Self {
            size: elem.size() * len,
            alignment: elem.alignment(),
            kind: TypeKind::Array { elem, len },
        }
    }

    /// A native function pointer type.
    pub fn function(signature: Arc<Signature>) -> Self {
        Self {
            kind: TypeKind::Function(signature),
            size: PTR_SIZE,
            alignment: PTR_SIZE,
        }
    }

    pub fn mapped(inner: Arc<NativeType>, converter: Arc<dyn TypeConverter>) -> Self {
        Self {
            size: inner.size(),
            alignment: inner.alignment(),
            kind: TypeKind::Mapped { inner, converter },
        }
    }

    pub fn varargs() -> Self {
        Self {
            kind: TypeKind::Varargs,
            size: 0,
            alignment: 1,
        }
    }

    fn scalar(kind: TypeKind, size: usize) -> Self {
        Self {
            kind,
            size,
            alignment: size,
        }
    }

    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            TypeKind::Void => "void",
            TypeKind::Bool => "bool",
            TypeKind::I8 => "i8",
            TypeKind::U8 => "u8",
            TypeKind::I16 => "i16",
            TypeKind::U16 => "u16",
            TypeKind::I32 => "i32",
            TypeKind::U32 => "u32",
            TypeKind::I64 => "i64",
            TypeKind::U64 => "u64",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::LongDouble => "long double",
            TypeKind::Pointer => "pointer",
            TypeKind::CString => "string",
            TypeKind::Struct(_) => "struct",
            TypeKind::Array { .. } => "array",
            TypeKind::Function(_) => "function",
            TypeKind::Mapped { .. } => "mapped",
            TypeKind::Varargs => "varargs",
        }
    }

    /// The libffi descriptor used when this type crosses a call boundary by
    /// value. Fails for kinds that cannot legally do so.
    pub fn ffi_type(&self) -> Result<FfiType> {
        match &self.kind {
            TypeKind::Void => Ok(FfiType::void()),
            TypeKind::Bool | TypeKind::U8 => Ok(FfiType::u8()),
            TypeKind::I8 => Ok(FfiType::i8()),
            TypeKind::I16 => Ok(FfiType::i16()),
            TypeKind::U16 => Ok(FfiType::u16()),
            TypeKind::I32 => Ok(FfiType::i32()),
            TypeKind::U32 => Ok(FfiType::u32()),
            TypeKind::I64 => Ok(FfiType::i64()),
            TypeKind::U64 => Ok(FfiType::u64()),
            TypeKind::F32 => Ok(FfiType::f32()),
            TypeKind::F64 => Ok(FfiType::f64()),
            TypeKind::Pointer | TypeKind::CString | TypeKind::Function(_) => {
                Ok(FfiType::pointer())
            }
            TypeKind::Struct(layout) => {
                if !matches!(layout.style(), LayoutStyle::Natural) {
                    return Err(FfiError::TypeMismatch {
                        expected: "naturally-aligned struct",
                        got: "packed or union layout passed by value".to_string(),
                    });
                }
                let mut elements = Vec::with_capacity(layout.fields().len());
                for field in layout.fields() {
                    push_struct_element(&field.ty, &mut elements)?;
                }
                Ok(FfiType::structure(elements))
            }
            TypeKind::Mapped { inner, .. } => inner.ffi_type(),
            TypeKind::LongDouble => Err(FfiError::TypeMismatch {
                expected: "by-value marshalable type",
                got: "long double".to_string(),
            }),
            TypeKind::Array { .. } => Err(FfiError::TypeMismatch {
                expected: "by-value marshalable type",
                got: "inline array (pass a pointer instead)".to_string(),
            }),
            TypeKind::Varargs => Err(FfiError::TypeMismatch {
                expected: "concrete type",
                got: "varargs marker".to_string(),
            }),
        }
    }
}

/// libffi describes aggregates element-by-element; inline arrays expand to
/// repeated elements and nested structs recurse.
fn push_struct_element(ty: &NativeType, out: &mut Vec<FfiType>) -> Result<()> {
    match ty.kind() {
        TypeKind::Array { elem, len } => {
            let elem_ffi = elem.ffi_type()?;
            for _ in 0..*len {
                out.push(elem_ffi.clone());
            }
            Ok(())
        }
        _ => {
            out.push(ty.ffi_type()?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_abi_sizes() {
        assert_eq!(NativeType::i32().size(), 4);
        assert_eq!(NativeType::i32().alignment(), 4);
        assert_eq!(NativeType::i64().size(), 8);
        assert_eq!(NativeType::i64().alignment(), 8);
        assert_eq!(NativeType::f64().size(), 8);
        assert_eq!(NativeType::bool().size(), 1);
        assert_eq!(NativeType::pointer().size(), std::mem::size_of::<usize>());
        assert_eq!(NativeType::void().size(), 0);
    }

    #[test]
    fn test_array_derives_from_element() {
        let arr = NativeType::array(Arc::new(NativeType::i32()), 5);
        assert_eq!(arr.size(), 20);
        assert_eq!(arr.alignment(), 4);
    }

    #[test]
    fn test_varargs_marker_has_no_ffi_type() {
        assert!(NativeType::varargs().ffi_type().is_err());
    }
}
