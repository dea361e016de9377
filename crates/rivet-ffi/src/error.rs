//! Error taxonomy for the FFI engine.
//!
//! Bind-time failures (unknown types, library or symbol resolution) are
//! surfaced when an invoker or layout is built; per-call failures (range,
//! type, arity) are surfaced synchronously from `invoke` before any native
//! code runs.

use rivet_memory::MemoryError;
use thiserror::Error;

use crate::parser::ParseError;

#[derive(Debug, Error)]
pub enum FfiError {
    /// A type name could not be resolved in any registry in scope.
    #[error("unknown type '{0}'")]
    UnknownType(String),

    /// The dynamic library itself failed to load.
    #[error("failed to load library '{library}': {reason}")]
    Load { library: String, reason: String },

    /// The library loaded, but the symbol is absent. Kept distinct from
    /// [`FfiError::Load`] so callers can walk candidate symbol names.
    #[error("symbol '{symbol}' not found in '{library}'")]
    SymbolNotFound { symbol: String, library: String },

    /// A numeric argument or return value does not fit the target width.
    /// Values are never silently truncated.
    #[error("value {value} is out of range for {ty}")]
    Range { value: String, ty: &'static str },

    /// A value has no conversion path to the required native type.
    #[error("cannot convert {got} to {expected}")]
    TypeMismatch { expected: &'static str, got: String },

    /// Wrong argument count, including malformed variadic (type, value)
    /// pairing.
    #[error("wrong number of arguments: expected {expected}, got {got}")]
    Arity { expected: usize, got: usize },

    /// A struct layout could not be built or used as requested.
    #[error("invalid layout: {0}")]
    Layout(String),

    /// The target address of a call or callback is NULL.
    #[error("function address is NULL")]
    NullFunction,

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, FfiError>;
