//! Owning allocations: heap buffers and release-policy pointers.
//!
//! Both wrappers guarantee that the backing memory is released exactly once,
//! whether the release happens through an explicit `free()` or through
//! `Drop`. The two kinds differ on double `free()`: a [`HeapBuffer`] treats
//! it as a silent no-op, while an [`AutoPointer`] reports
//! [`MemoryError::AlreadyFreed`], since a repeated explicit free on a
//! release-policy pointer usually indicates mis-wired ownership.

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;

use crate::error::{MemoryError, Result};
use crate::region::MemoryRegion;

/// Interpreter-owned native heap memory.
///
/// Allocated with the global allocator at pointer alignment (the alignment
/// `malloc` would give), so the buffer can back any struct layout whose
/// alignment does not exceed it.
pub struct HeapBuffer {
    ptr: AtomicPtr<u8>,
    layout: Layout,
    freed: AtomicBool,
}

const HEAP_ALIGN: usize = std::mem::align_of::<usize>() * 2;

impl HeapBuffer {
    /// Allocate `count` elements of `size` bytes each.
    pub fn allocate(size: usize, count: usize, zero: bool) -> Result<Self> {
        let bytes = size
            .checked_mul(count)
            .filter(|&b| b > 0)
            .ok_or(MemoryError::AllocationFailed {
                bytes: size.saturating_mul(count),
            })?;
        let layout = Layout::from_size_align(bytes, HEAP_ALIGN)
            .map_err(|_| MemoryError::AllocationFailed { bytes })?;
        let ptr = unsafe {
            if zero {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        if ptr.is_null() {
            return Err(MemoryError::AllocationFailed { bytes });
        }
        log::trace!("allocated {bytes} byte heap buffer at {ptr:p}");
        Ok(Self {
            ptr: AtomicPtr::new(ptr),
            layout,
            freed: AtomicBool::new(false),
        })
    }

    /// View over the buffer. NULL after the buffer has been freed, so stale
    /// accesses surface as `NullDereference` instead of use-after-free.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.ptr.load(Ordering::Acquire), self.layout.size())
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Release the backing memory. Safe to call more than once; only the
    /// first call releases.
    pub fn free(&self) {
        if self.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ptr = self.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            unsafe { dealloc(ptr, self.layout) };
        }
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }
}

impl Drop for HeapBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("size", &self.layout.size())
            .field("freed", &self.is_freed())
            .finish()
    }
}

unsafe impl Send for HeapBuffer {}
unsafe impl Sync for HeapBuffer {}

/// The deferred release action of an [`AutoPointer`].
pub type Releaser = Box<dyn FnOnce(MemoryRegion) + Send>;

/// A pointer with an attached release policy.
///
/// The releaser fires exactly once: on the first explicit `free()`, or on
/// drop if no explicit free happened. Whichever runs first wins; the loser
/// is a no-op. Unlike [`HeapBuffer`], an `AutoPointer` wraps memory the
/// interpreter did not allocate itself (a handle returned by a native
/// library, to be given back through that library's own release function).
pub struct AutoPointer {
    addr: AtomicPtr<u8>,
    len: Option<usize>,
    releaser: Mutex<Option<Releaser>>,
    freed: AtomicBool,
}

impl AutoPointer {
    pub fn new(region: MemoryRegion, releaser: Releaser) -> Self {
        Self {
            addr: AtomicPtr::new(region.base()),
            len: region.len(),
            releaser: Mutex::new(Some(releaser)),
            freed: AtomicBool::new(false),
        }
    }

    /// Current view over the pointed-to memory. NULL once freed.
    pub fn region(&self) -> MemoryRegion {
        let base = self.addr.load(Ordering::Acquire);
        match self.len {
            Some(len) => MemoryRegion::new(base, len),
            None => MemoryRegion::unbounded(base),
        }
    }

    /// Run the release policy now. A second call reports `AlreadyFreed`.
    pub fn free(&self) -> Result<()> {
        if self.freed.swap(true, Ordering::AcqRel) {
            return Err(MemoryError::AlreadyFreed);
        }
        self.run_releaser();
        Ok(())
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    fn run_releaser(&self) {
        let releaser = self.releaser.lock().expect("releaser lock").take();
        let base = self.addr.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if let Some(release) = releaser {
            let region = match self.len {
                Some(len) => MemoryRegion::new(base, len),
                None => MemoryRegion::unbounded(base),
            };
            log::trace!("releasing auto pointer at {base:p}");
            release(region);
        }
    }
}

impl Drop for AutoPointer {
    fn drop(&mut self) {
        if !self.freed.swap(true, Ordering::AcqRel) {
            self.run_releaser();
        }
    }
}
