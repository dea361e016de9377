//! Raw native memory handling for the Rivet FFI engine.
//!
//! Two layers live here:
//!
//! - [`MemoryRegion`]: a non-owning, bounds-checked typed view over a raw
//!   address, with get/put accessors for every primitive width, pointers,
//!   raw bytes and NUL-terminated strings.
//! - Owning allocations: [`HeapBuffer`] (interpreter-allocated native
//!   memory, idempotent free) and [`AutoPointer`] (foreign memory with an
//!   attached release policy, fire-once under free/drop races).
//!
//! Higher layers (struct layouts, argument marshaling) are built on top in
//! `rivet-ffi`.

mod alloc;
mod error;
mod region;

pub use alloc::{AutoPointer, HeapBuffer, Releaser};
pub use error::{MemoryError, Result};
pub use region::MemoryRegion;
