//! Dynamic native call dispatch.
//!
//! An [`Invoker`] is built once per bound function and reused for every
//! call. Building prepares the libffi call interface (CIF) for the declared
//! signature; invoking stages each dynamic value into its native
//! representation, performs the call, and converts the native return value
//! back. Argument conversion is strict: an out-of-range integer raises
//! [`FfiError::Range`] before any native code runs.
//!
//! Variadic signatures are declared with a trailing varargs marker. The
//! fixed prefix is consumed positionally; everything after it arrives as
//! explicit `(type-tag, value)` pairs, mirroring the C requirement that the
//! callee cannot infer vararg types from the call site. Tags resolve
//! through the calling scope's registry, so per-call custom names work.

use std::cell::Cell;
use std::ffi::CString;

use libffi::low::{self, ffi_abi, ffi_cif, ffi_type, CodePtr};
use libffi::middle::Type as FfiType;
use libffi::raw;
use libc::c_void;

use rivet_memory::{HeapBuffer, MemoryRegion};

use crate::error::{FfiError, Result};
use crate::lock::ExecutionGuard;
use crate::registry::{global_registry, TypeRegistry};
use crate::scope::BindingScope;
use crate::types::{NativeType, TypeKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvention {
    Default,
    /// Only distinct from `Default` on 32-bit x86 Windows.
    StdCall,
}

impl CallConvention {
    fn abi(self) -> ffi_abi {
        #[cfg(all(windows, target_arch = "x86"))]
        if self == CallConvention::StdCall {
            return raw::ffi_abi_FFI_STDCALL;
        }
        low::ffi_abi_FFI_DEFAULT_ABI
    }
}

thread_local! {
    static LAST_ERROR: Cell<i32> = const { Cell::new(0) };
}

/// The OS error (`errno` / `GetLastError`) observed immediately after the
/// most recent native call on this thread.
pub fn last_error() -> i32 {
    LAST_ERROR.with(|e| e.get())
}

fn record_last_error() {
    let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    LAST_ERROR.with(|e| e.set(err));
}

/// A prepared libffi call interface plus the type storage it points into.
struct PreparedCif {
    cif: Box<ffi_cif>,
    // The cif holds raw pointers into these; they must stay put.
    _arg_ptrs: Vec<*mut ffi_type>,
    _arg_ffis: Vec<FfiType>,
    _ret_ffi: FfiType,
}

impl PreparedCif {
    fn prepare(
        arg_types: &[NativeType],
        ret_type: &NativeType,
        fixed: Option<usize>,
        abi: ffi_abi,
    ) -> Result<Self> {
        let mut arg_ffis = Vec::with_capacity(arg_types.len());
        for ty in arg_types {
            if matches!(ty.kind(), TypeKind::Void) {
                return Err(FfiError::TypeMismatch {
                    expected: "concrete parameter type",
                    got: "void".to_string(),
                });
            }
            arg_ffis.push(ty.ffi_type()?);
        }
        let ret_ffi = ret_type.ffi_type()?;
        let mut arg_ptrs: Vec<*mut ffi_type> =
            arg_ffis.iter().map(|t| t.as_raw_ptr()).collect();
        let mut cif: Box<ffi_cif> = Box::new(Default::default());
        let status = unsafe {
            match fixed {
                None => low::prep_cif(
                    &mut *cif,
                    abi,
                    arg_ptrs.len(),
                    ret_ffi.as_raw_ptr(),
                    arg_ptrs.as_mut_ptr(),
                ),
                Some(n) => low::prep_cif_var(
                    &mut *cif,
                    abi,
                    n,
                    arg_ptrs.len(),
                    ret_ffi.as_raw_ptr(),
                    arg_ptrs.as_mut_ptr(),
                ),
            }
        };
        status.map_err(|e| FfiError::Layout(format!("libffi rejected signature: {e:?}")))?;
        Ok(Self {
            cif,
            _arg_ptrs: arg_ptrs,
            _arg_ffis: arg_ffis,
            _ret_ffi: ret_ffi,
        })
    }

    fn as_raw(&self) -> *mut ffi_cif {
        &*self.cif as *const ffi_cif as *mut ffi_cif
    }
}

/// A reusable bound call: target address, parameter types, return type,
/// calling convention and blocking mode. Immutable once built and
/// call-reentrant; each invocation stages its own argument memory.
pub struct Invoker {
    addr: usize,
    arg_types: Vec<NativeType>,
    ret_type: NativeType,
    convention: CallConvention,
    blocking: bool,
    /// Prepared once for fixed-arity signatures; variadic calls prepare
    /// per call since the trailing types change every time.
    cif: Option<PreparedCif>,
    variadic: bool,
}

// The invoker is immutable after build; the CIF and type storage are only
// ever read during calls.
unsafe impl Send for Invoker {}
unsafe impl Sync for Invoker {}

impl Invoker {
    /// Bind a native function. Fails fast on NULL addresses and on types
    /// that cannot cross the boundary by value, so per-call failures are
    /// limited to conversion errors.
    pub fn build(
        address: *mut c_void,
        mut arg_types: Vec<NativeType>,
        ret_type: NativeType,
        convention: CallConvention,
        blocking: bool,
    ) -> Result<Self> {
        if address.is_null() {
            return Err(FfiError::NullFunction);
        }
        let variadic = matches!(arg_types.last().map(NativeType::kind), Some(TypeKind::Varargs));
        if variadic {
            arg_types.pop();
        }
        if arg_types
            .iter()
            .any(|t| matches!(t.kind(), TypeKind::Varargs))
        {
            return Err(FfiError::TypeMismatch {
                expected: "varargs marker in trailing position only",
                got: "varargs marker mid-signature".to_string(),
            });
        }
        let cif = if variadic {
            // Validate the fixed prefix and return type now even though the
            // final cif is prepared per call.
            for ty in &arg_types {
                ty.ffi_type()?;
            }
            ret_type.ffi_type()?;
            None
        } else {
            Some(PreparedCif::prepare(
                &arg_types,
                &ret_type,
                None,
                convention.abi(),
            )?)
        };
        Ok(Self {
            addr: address as usize,
            arg_types,
            ret_type,
            convention,
            blocking,
            cif,
            variadic,
        })
    }

    pub fn blocking(&self) -> bool {
        self.blocking
    }

    pub fn variadic(&self) -> bool {
        self.variadic
    }

    pub fn convention(&self) -> CallConvention {
        self.convention
    }

    /// Perform the call without an execution lock in play. Variadic type
    /// tags resolve through the process-wide registry.
    pub fn invoke(&self, values: &[Value]) -> Result<Value> {
        self.invoke_inner(None, global_registry(), values)
    }

    /// Perform the call from interpreter context. A blocking invoker
    /// releases `guard` for the duration of the native call so other
    /// interpreter threads keep running; variadic type tags resolve through
    /// `scope`'s registry.
    pub fn invoke_with(
        &self,
        guard: &mut ExecutionGuard<'_>,
        scope: &BindingScope,
        values: &[Value],
    ) -> Result<Value> {
        self.invoke_inner(Some(guard), scope.registry(), values)
    }

    fn invoke_inner(
        &self,
        guard: Option<&mut ExecutionGuard<'_>>,
        registry: &TypeRegistry,
        values: &[Value],
    ) -> Result<Value> {
        let fixed = self.arg_types.len();
        let mut strings = Vec::new();
        let mut staged = Vec::with_capacity(values.len());

        let per_call_cif;
        let cif_ptr = if self.variadic {
            if values.len() < fixed || (values.len() - fixed) % 2 != 0 {
                return Err(FfiError::Arity {
                    expected: fixed,
                    got: values.len(),
                });
            }
            let mut all_types = self.arg_types.clone();
            for (ty, value) in self.arg_types.iter().zip(values) {
                staged.push(stage(ty, value, &mut strings)?);
            }
            let mut at = fixed;
            while at < values.len() {
                let ty = resolve_tag(registry, &values[at])?;
                let (slot, promoted) = stage_vararg(&ty, &values[at + 1], &mut strings)?;
                staged.push(slot);
                all_types.push(promoted);
                at += 2;
            }
            per_call_cif = PreparedCif::prepare(
                &all_types,
                &self.ret_type,
                Some(fixed),
                self.convention.abi(),
            )?;
            per_call_cif.as_raw()
        } else {
            if values.len() != fixed {
                return Err(FfiError::Arity {
                    expected: fixed,
                    got: values.len(),
                });
            }
            for (ty, value) in self.arg_types.iter().zip(values) {
                staged.push(stage(ty, value, &mut strings)?);
            }
            self.cif.as_ref().expect("fixed cif").as_raw()
        };

        let mut raw_args: Vec<*mut c_void> = staged.iter().map(Staged::raw_ptr).collect();
        let mut do_call =
            || unsafe { self.call_ret(self.ret_type.kind(), cif_ptr, raw_args.as_mut_ptr()) };
        match guard {
            Some(g) if self.blocking => g.unlocked(do_call),
            _ => do_call(),
        }
    }

    /// Dispatch the native call with the return handling `kind` demands.
    ///
    /// # Safety
    /// `cif` and `args` must describe exactly the staged argument storage,
    /// and the target address must be a function of this signature.
    unsafe fn call_ret(
        &self,
        kind: &TypeKind,
        cif: *mut ffi_cif,
        args: *mut *mut c_void,
    ) -> Result<Value> {
        let code = CodePtr(self.addr as *mut c_void);
        let value = match kind {
            TypeKind::Void => {
                low::call::<()>(cif, code, args);
                Value::Nil
            }
            TypeKind::Bool => Value::Bool(low::call::<u8>(cif, code, args) != 0),
            TypeKind::I8 => Value::Int(low::call::<i8>(cif, code, args) as i64),
            TypeKind::U8 => Value::UInt(low::call::<u8>(cif, code, args) as u64),
            TypeKind::I16 => Value::Int(low::call::<i16>(cif, code, args) as i64),
            TypeKind::U16 => Value::UInt(low::call::<u16>(cif, code, args) as u64),
            TypeKind::I32 => Value::Int(low::call::<i32>(cif, code, args) as i64),
            TypeKind::U32 => Value::UInt(low::call::<u32>(cif, code, args) as u64),
            TypeKind::I64 => Value::Int(low::call::<i64>(cif, code, args)),
            TypeKind::U64 => Value::UInt(low::call::<u64>(cif, code, args)),
            TypeKind::F32 => Value::Float(low::call::<f32>(cif, code, args) as f64),
            TypeKind::F64 => Value::Float(low::call::<f64>(cif, code, args)),
            TypeKind::Pointer | TypeKind::Function(_) => {
                let p = low::call::<*mut c_void>(cif, code, args);
                Value::Pointer(MemoryRegion::unbounded(p as *mut u8))
            }
            TypeKind::CString => {
                let p = low::call::<*mut c_void>(cif, code, args);
                if p.is_null() {
                    Value::Nil
                } else {
                    let bytes = MemoryRegion::unbounded(p as *mut u8).get_c_string(0)?;
                    Value::Str(String::from_utf8_lossy(&bytes).into_owned())
                }
            }
            TypeKind::Struct(layout) => {
                // Struct returns come back through a caller-supplied buffer
                // that the interpreter then owns.
                let buf = HeapBuffer::allocate(layout.size().max(1), 1, true)?;
                raw::ffi_call(
                    cif,
                    Some(*code.as_safe_fun()),
                    buf.region().base() as *mut c_void,
                    args,
                );
                Value::buffer(buf)
            }
            TypeKind::Mapped { inner, converter } => {
                let raw_value = self.call_ret(inner.kind(), cif, args)?;
                record_last_error();
                return converter.from_native(raw_value);
            }
            TypeKind::LongDouble | TypeKind::Array { .. } | TypeKind::Varargs => {
                return Err(FfiError::TypeMismatch {
                    expected: "by-value marshalable return type",
                    got: self.ret_type.name().to_string(),
                })
            }
        };
        record_last_error();
        Ok(value)
    }
}

/// Native staging storage for one argument. The libffi argument vector
/// points at these payloads, so a `Staged` must not move between staging
/// and the call.
enum Staged {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
    Bytes(Vec<u8>),
}

impl Staged {
    fn raw_ptr(&self) -> *mut c_void {
        match self {
            Staged::I8(v) => v as *const i8 as *mut c_void,
            Staged::U8(v) => v as *const u8 as *mut c_void,
            Staged::I16(v) => v as *const i16 as *mut c_void,
            Staged::U16(v) => v as *const u16 as *mut c_void,
            Staged::I32(v) => v as *const i32 as *mut c_void,
            Staged::U32(v) => v as *const u32 as *mut c_void,
            Staged::I64(v) => v as *const i64 as *mut c_void,
            Staged::U64(v) => v as *const u64 as *mut c_void,
            Staged::F32(v) => v as *const f32 as *mut c_void,
            Staged::F64(v) => v as *const f64 as *mut c_void,
            Staged::Ptr(p) => p as *const *mut c_void as *mut c_void,
            Staged::Bytes(b) => b.as_ptr() as *mut c_void,
        }
    }
}

/// Convert one dynamic value into the native staging representation for
/// `ty`. Strings stage NUL-terminated copies in `strings`, which must
/// outlive the call.
fn stage(ty: &NativeType, value: &Value, strings: &mut Vec<CString>) -> Result<Staged> {
    match ty.kind() {
        TypeKind::Bool => Ok(Staged::U8(value.to_bool()? as u8)),
        TypeKind::I8 => Ok(Staged::I8(value.to_i8()?)),
        TypeKind::U8 => Ok(Staged::U8(value.to_u8()?)),
        TypeKind::I16 => Ok(Staged::I16(value.to_i16()?)),
        TypeKind::U16 => Ok(Staged::U16(value.to_u16()?)),
        TypeKind::I32 => Ok(Staged::I32(value.to_i32()?)),
        TypeKind::U32 => Ok(Staged::U32(value.to_u32()?)),
        TypeKind::I64 => Ok(Staged::I64(value.to_i64()?)),
        TypeKind::U64 => Ok(Staged::U64(value.to_u64()?)),
        TypeKind::F32 => Ok(Staged::F32(value.to_f64()? as f32)),
        TypeKind::F64 => Ok(Staged::F64(value.to_f64()?)),
        TypeKind::Pointer | TypeKind::Array { .. } | TypeKind::Function(_) => {
            stage_pointer(value, strings)
        }
        TypeKind::CString => match value {
            Value::Str(s) => stage_string(s, strings),
            other => stage_pointer(other, strings),
        },
        TypeKind::Struct(layout) => {
            let region = value.to_region()?;
            if region.is_null() {
                return Err(FfiError::TypeMismatch {
                    expected: "struct-backed memory",
                    got: "NULL pointer".to_string(),
                });
            }
            Ok(Staged::Bytes(region.get_bytes(0, layout.size())?))
        }
        TypeKind::Mapped { inner, converter } => {
            let native = converter.to_native(value)?;
            stage(inner, &native, strings)
        }
        TypeKind::LongDouble => Err(FfiError::TypeMismatch {
            expected: "by-value marshalable type",
            got: "long double".to_string(),
        }),
        TypeKind::Void | TypeKind::Varargs => Err(FfiError::TypeMismatch {
            expected: "concrete parameter type",
            got: ty.name().to_string(),
        }),
    }
}

fn stage_pointer(value: &Value, strings: &mut Vec<CString>) -> Result<Staged> {
    if let Value::Str(s) = value {
        // Copy semantics: never alias interpreter string storage.
        return stage_string(s, strings);
    }
    Ok(Staged::Ptr(value.to_region()?.base() as *mut c_void))
}

fn stage_string(s: &str, strings: &mut Vec<CString>) -> Result<Staged> {
    let c = CString::new(s).map_err(|_| FfiError::TypeMismatch {
        expected: "NUL-free string",
        got: "string with interior NUL".to_string(),
    })?;
    let ptr = c.as_ptr() as *mut c_void;
    strings.push(c);
    Ok(Staged::Ptr(ptr))
}

fn resolve_tag(registry: &TypeRegistry, tag: &Value) -> Result<NativeType> {
    match tag {
        Value::Str(name) => registry.resolve(name),
        other => Err(FfiError::TypeMismatch {
            expected: "type name tag",
            got: other.type_name().to_string(),
        }),
    }
}

/// Stage one vararg with C default argument promotions: small integers
/// widen to int, floats to double. Range checks still apply against the
/// declared tag's width.
fn stage_vararg(
    ty: &NativeType,
    value: &Value,
    strings: &mut Vec<CString>,
) -> Result<(Staged, NativeType)> {
    match ty.kind() {
        TypeKind::Bool => Ok((Staged::I32(value.to_bool()? as i32), NativeType::i32())),
        TypeKind::I8 => Ok((Staged::I32(value.to_i8()? as i32), NativeType::i32())),
        TypeKind::I16 => Ok((Staged::I32(value.to_i16()? as i32), NativeType::i32())),
        TypeKind::U8 => Ok((Staged::U32(value.to_u8()? as u32), NativeType::u32())),
        TypeKind::U16 => Ok((Staged::U32(value.to_u16()? as u32), NativeType::u32())),
        TypeKind::F32 => Ok((Staged::F64(value.to_f64()?), NativeType::f64())),
        _ => Ok((stage(ty, value, strings)?, ty.clone())),
    }
}
