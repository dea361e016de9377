//! Foreign function binding engine for the Rivet runtime.
//!
//! This crate turns dynamically described native functions into callable
//! values: resolve a symbol out of a shared library, describe its signature
//! with registered type names, build an [`Invoker`], and call it with
//! interpreter [`Value`]s. The reverse direction is covered by
//! [`CallbackTrampoline`], which materializes an interpreter handler as a
//! native code pointer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rivet_ffi::{BindingScope, DynamicLibrary, OpenFlags, Value};
//!
//! # fn main() -> Result<(), rivet_ffi::FfiError> {
//! let scope = BindingScope::new();
//! scope.add_library(Arc::new(DynamicLibrary::open(None, OpenFlags::default())?));
//!
//! let abs = scope.attach_declaration("abs: (int) -> int", false)?;
//! let result = abs.invoke(&[Value::Int(-42)])?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```
//!
//! # Conversion discipline
//!
//! All numeric conversions are strict: a value that does not fit the
//! declared native width fails with [`FfiError::Range`] before any native
//! code runs, never silently truncates. Strings passed to native code are
//! NUL-terminated copies scoped to the call.

mod callback;
mod error;
mod invoke;
mod layout;
mod library;
mod lock;
mod parser;
mod registry;
mod scope;
mod types;
mod value;

pub use callback::{CallbackHandler, CallbackTrampoline, Signature};
pub use error::{FfiError, Result};
pub use invoke::{last_error, CallConvention, Invoker};
pub use layout::{Field, LayoutStyle, StructLayout, StructLayoutBuilder};
pub use library::{DynamicLibrary, OpenFlags};
pub use lock::{
    holds_execution_lock, is_interpreter_thread, mark_interpreter_thread, ExecutionGuard,
    ExecutionLock,
};
pub use parser::{parse_declaration, parse_declarations, Declaration, ParseError};
pub use registry::{global_registry, TypeRegistry};
pub use scope::BindingScope;
pub use types::{NativeType, TypeConverter, TypeKind};
pub use value::Value;
