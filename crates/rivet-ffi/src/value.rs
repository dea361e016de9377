//! The dynamic value model the engine marshals to and from native
//! representations.

use std::sync::Arc;

use rivet_memory::{HeapBuffer, MemoryRegion};

use crate::error::{FfiError, Result};

/// An interpreter-level value.
///
/// This is the boundary currency of the engine: every invocation converts a
/// list of `Value`s into native calling-convention representations, and
/// every callback converts native arguments back into `Value`s.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    /// A non-owning view over native memory.
    Pointer(MemoryRegion),
    /// An owning native buffer, shared by reference.
    Buffer(Arc<HeapBuffer>),
}

impl Value {
    pub fn buffer(buf: HeapBuffer) -> Self {
        Value::Buffer(Arc::new(buf))
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Pointer(_) => "pointer",
            Value::Buffer(_) => "buffer",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Signed integral interpretation. Strict: floats do not implicitly
    /// round and booleans do not implicitly widen.
    pub fn to_i64(&self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::UInt(n) => i64::try_from(*n).map_err(|_| FfiError::Range {
                value: n.to_string(),
                ty: "i64",
            }),
            other => Err(FfiError::TypeMismatch {
                expected: "integer",
                got: other.type_name().to_string(),
            }),
        }
    }

    /// Unsigned integral interpretation; negative values are out of range,
    /// not wrapped.
    pub fn to_u64(&self) -> Result<u64> {
        match self {
            Value::UInt(n) => Ok(*n),
            Value::Int(n) => u64::try_from(*n).map_err(|_| FfiError::Range {
                value: n.to_string(),
                ty: "u64",
            }),
            other => Err(FfiError::TypeMismatch {
                expected: "unsigned integer",
                got: other.type_name().to_string(),
            }),
        }
    }

    pub fn to_f64(&self) -> Result<f64> {
        match self {
            Value::Float(x) => Ok(*x),
            Value::Int(n) => Ok(*n as f64),
            Value::UInt(n) => Ok(*n as f64),
            other => Err(FfiError::TypeMismatch {
                expected: "float",
                got: other.type_name().to_string(),
            }),
        }
    }

    pub fn to_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(FfiError::TypeMismatch {
                expected: "bool",
                got: other.type_name().to_string(),
            }),
        }
    }

    /// Checked narrowing per target width; out-of-range values raise
    /// [`FfiError::Range`] instead of wrapping.
    pub fn to_i8(&self) -> Result<i8> {
        narrow(self.to_i64()?, "i8")
    }

    pub fn to_i16(&self) -> Result<i16> {
        narrow(self.to_i64()?, "i16")
    }

    pub fn to_i32(&self) -> Result<i32> {
        narrow(self.to_i64()?, "i32")
    }

    pub fn to_u8(&self) -> Result<u8> {
        narrow_u(self.to_u64()?, "u8")
    }

    pub fn to_u16(&self) -> Result<u16> {
        narrow_u(self.to_u64()?, "u16")
    }

    pub fn to_u32(&self) -> Result<u32> {
        narrow_u(self.to_u64()?, "u32")
    }

    /// Pointer-conversion capability: NULL for nil, the view of a region or
    /// owning buffer, or a raw numeric address. Strings are deliberately
    /// excluded here; they need call-scoped NUL-terminated copies, which the
    /// invoker stages itself.
    pub fn to_region(&self) -> Result<MemoryRegion> {
        match self {
            Value::Nil => Ok(MemoryRegion::null()),
            Value::Pointer(region) => Ok(*region),
            Value::Buffer(buf) => Ok(buf.region()),
            Value::Int(n) => {
                let addr = usize::try_from(*n).map_err(|_| FfiError::Range {
                    value: n.to_string(),
                    ty: "pointer",
                })?;
                Ok(MemoryRegion::unbounded(addr as *mut u8))
            }
            Value::UInt(n) => Ok(MemoryRegion::unbounded(*n as usize as *mut u8)),
            other => Err(FfiError::TypeMismatch {
                expected: "pointer",
                got: other.type_name().to_string(),
            }),
        }
    }
}

fn narrow<T: TryFrom<i64>>(n: i64, ty: &'static str) -> Result<T> {
    T::try_from(n).map_err(|_| FfiError::Range {
        value: n.to_string(),
        ty,
    })
}

fn narrow_u<T: TryFrom<u64>>(n: u64, ty: &'static str) -> Result<T> {
    T::try_from(n).map_err(|_| FfiError::Range {
        value: n.to_string(),
        ty,
    })
}
