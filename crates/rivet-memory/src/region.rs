//! Bounds-checked typed views over raw native memory.
//!
//! A [`MemoryRegion`] is a `(base address, optional length)` pair. It owns
//! nothing; owning wrappers live in [`crate::alloc`]. Regions obtained from
//! native code frequently have no known length, in which case bounds checks
//! are skipped and misuse is a process-level hazard rather than a
//! recoverable error.

use crate::error::{MemoryError, Result};

/// A view over a raw native address, optionally bounded.
///
/// All accessors are offset-based and use unaligned reads/writes, since
/// packed struct layouts may legally place fields at unaligned offsets.
/// Regions provide no synchronization; concurrent readers and writers over
/// the same backing address must coordinate externally.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    base: *mut u8,
    len: Option<usize>,
}

// Regions are raw views that the engine hands across threads (callback
// arguments arrive on foreign threads). The aliasing hazard is documented
// on the type; it is the same hazard C callers live with.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

macro_rules! scalar_accessors {
    ($get:ident, $put:ident, $get_arr:ident, $put_arr:ident, $ty:ty) => {
        pub fn $get(&self, offset: usize) -> Result<$ty> {
            let p = self.check(offset, std::mem::size_of::<$ty>())?;
            Ok(unsafe { (p as *const $ty).read_unaligned() })
        }

        pub fn $put(&self, offset: usize, value: $ty) -> Result<()> {
            let p = self.check(offset, std::mem::size_of::<$ty>())?;
            unsafe { (p as *mut $ty).write_unaligned(value) };
            Ok(())
        }

        pub fn $get_arr(&self, offset: usize, count: usize) -> Result<Vec<$ty>> {
            let elem = std::mem::size_of::<$ty>();
            self.check(offset, elem.checked_mul(count).unwrap_or(usize::MAX))?;
            let mut out = Vec::with_capacity(count);
            for i in 0..count {
                out.push(self.$get(offset + i * elem)?);
            }
            Ok(out)
        }

        pub fn $put_arr(&self, offset: usize, values: &[$ty]) -> Result<()> {
            let elem = std::mem::size_of::<$ty>();
            self.check(offset, elem.checked_mul(values.len()).unwrap_or(usize::MAX))?;
            for (i, v) in values.iter().enumerate() {
                self.$put(offset + i * elem, *v)?;
            }
            Ok(())
        }
    };
}

impl MemoryRegion {
    /// A view over `len` bytes starting at `base`.
    pub fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base,
            len: Some(len),
        }
    }

    /// An unbounded view over an address obtained from native code.
    ///
    /// No bounds checking is possible; only the NULL check remains.
    pub fn unbounded(base: *mut u8) -> Self {
        Self { base, len: None }
    }

    /// The canonical NULL region.
    pub fn null() -> Self {
        Self {
            base: std::ptr::null_mut(),
            len: Some(0),
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// The numeric address of the region's start.
    pub fn address(&self) -> usize {
        self.base as usize
    }

    /// Known length in bytes, if any.
    pub fn len(&self) -> Option<usize> {
        self.len
    }

    pub fn is_null(&self) -> bool {
        self.base.is_null()
    }

    /// Pointer arithmetic: a new view sharing the same backing storage,
    /// shifted forward by `n` bytes. Not a copy and not an allocation.
    pub fn offset_by(&self, n: usize) -> Result<Self> {
        if self.base.is_null() {
            return Err(MemoryError::NullDereference { offset: n });
        }
        if let Some(len) = self.len {
            if n > len {
                return Err(MemoryError::OutOfBounds {
                    offset: n,
                    size: 0,
                    len,
                });
            }
            Ok(Self {
                base: unsafe { self.base.add(n) },
                len: Some(len - n),
            })
        } else {
            Ok(Self {
                base: unsafe { self.base.add(n) },
                len: None,
            })
        }
    }

    /// Validate an access of `size` bytes at `offset`, returning the raw
    /// pointer to the first byte.
    fn check(&self, offset: usize, size: usize) -> Result<*mut u8> {
        if self.base.is_null() {
            return Err(MemoryError::NullDereference { offset });
        }
        if let Some(len) = self.len {
            let end = offset.checked_add(size).unwrap_or(usize::MAX);
            if end > len {
                return Err(MemoryError::OutOfBounds { offset, size, len });
            }
        }
        Ok(unsafe { self.base.add(offset) })
    }

    scalar_accessors!(get_i8, put_i8, get_array_of_i8, put_array_of_i8, i8);
    scalar_accessors!(get_u8, put_u8, get_array_of_u8, put_array_of_u8, u8);
    scalar_accessors!(get_i16, put_i16, get_array_of_i16, put_array_of_i16, i16);
    scalar_accessors!(get_u16, put_u16, get_array_of_u16, put_array_of_u16, u16);
    scalar_accessors!(get_i32, put_i32, get_array_of_i32, put_array_of_i32, i32);
    scalar_accessors!(get_u32, put_u32, get_array_of_u32, put_array_of_u32, u32);
    scalar_accessors!(get_i64, put_i64, get_array_of_i64, put_array_of_i64, i64);
    scalar_accessors!(get_u64, put_u64, get_array_of_u64, put_array_of_u64, u64);
    scalar_accessors!(get_f32, put_f32, get_array_of_f32, put_array_of_f32, f32);
    scalar_accessors!(get_f64, put_f64, get_array_of_f64, put_array_of_f64, f64);

    /// Read a pointer-sized value as a new unbounded region.
    pub fn get_pointer(&self, offset: usize) -> Result<MemoryRegion> {
        let p = self.check(offset, std::mem::size_of::<usize>())?;
        let addr = unsafe { (p as *const usize).read_unaligned() };
        Ok(MemoryRegion::unbounded(addr as *mut u8))
    }

    /// Write the address of another region at `offset`.
    pub fn put_pointer(&self, offset: usize, value: &MemoryRegion) -> Result<()> {
        let p = self.check(offset, std::mem::size_of::<usize>())?;
        unsafe { (p as *mut usize).write_unaligned(value.address()) };
        Ok(())
    }

    /// Copy `len` raw bytes out of the region.
    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let p = self.check(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(p, out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// Copy raw bytes into the region.
    pub fn put_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let p = self.check(offset, bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len()) };
        Ok(())
    }

    /// Read a NUL-terminated byte string starting at `offset`.
    ///
    /// The returned bytes exclude the terminator. The copy stops at the
    /// region end when the length is known; an unterminated bounded region
    /// yields all remaining bytes.
    pub fn get_c_string(&self, offset: usize) -> Result<Vec<u8>> {
        // Scan for NUL a byte at a time so the bounds check applies.
        let mut out = Vec::new();
        let mut at = offset;
        loop {
            if let Some(len) = self.len {
                if at >= len {
                    break;
                }
            }
            let b = self.get_u8(at)?;
            if b == 0 {
                break;
            }
            out.push(b);
            at += 1;
        }
        Ok(out)
    }

    /// Write `bytes` followed by a NUL terminator at `offset`.
    pub fn put_c_string(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len() + 1)?;
        self.put_bytes(offset, bytes)?;
        self.put_u8(offset + bytes.len(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_over(buf: &mut [u8]) -> MemoryRegion {
        MemoryRegion::new(buf.as_mut_ptr(), buf.len())
    }

    #[test]
    fn test_scalar_round_trips() {
        let mut buf = [0u8; 64];
        let r = region_over(&mut buf);

        r.put_i8(0, -5).unwrap();
        assert_eq!(r.get_i8(0).unwrap(), -5);
        r.put_u16(2, 0xBEEF).unwrap();
        assert_eq!(r.get_u16(2).unwrap(), 0xBEEF);
        r.put_i32(4, i32::MIN).unwrap();
        assert_eq!(r.get_i32(4).unwrap(), i32::MIN);
        r.put_u64(8, u64::MAX).unwrap();
        assert_eq!(r.get_u64(8).unwrap(), u64::MAX);
        r.put_f32(16, 1.5).unwrap();
        assert_eq!(r.get_f32(16).unwrap(), 1.5);
        r.put_f64(24, -2.25).unwrap();
        assert_eq!(r.get_f64(24).unwrap(), -2.25);
    }

    #[test]
    fn test_unaligned_access_is_permitted() {
        let mut buf = [0u8; 16];
        let r = region_over(&mut buf);
        r.put_i32(1, 0x1234_5678).unwrap();
        assert_eq!(r.get_i32(1).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        let mut buf = [0u8; 8];
        let r = region_over(&mut buf);
        assert!(matches!(
            r.get_i64(1),
            Err(MemoryError::OutOfBounds {
                offset: 1,
                size: 8,
                len: 8
            })
        ));
        assert!(r.put_u8(8, 0).is_err());
        assert!(r.get_u8(7).is_ok());
    }

    #[test]
    fn test_null_region_is_rejected() {
        let r = MemoryRegion::null();
        assert!(matches!(
            r.get_u8(0),
            Err(MemoryError::NullDereference { offset: 0 })
        ));
        assert!(r.offset_by(4).is_err());
    }

    #[test]
    fn test_offset_by_shares_backing_storage() {
        let mut buf = [0u8; 16];
        let r = region_over(&mut buf);
        let view = r.offset_by(8).unwrap();
        assert_eq!(view.len(), Some(8));
        view.put_i32(0, 7).unwrap();
        assert_eq!(r.get_i32(8).unwrap(), 7);
        // The shifted view is re-bounded: 8 bytes remain.
        assert!(view.get_i64(1).is_err());
    }

    #[test]
    fn test_array_round_trip() {
        let mut buf = [0u8; 32];
        let r = region_over(&mut buf);
        r.put_array_of_i32(0, &[1, -2, 3, -4]).unwrap();
        assert_eq!(r.get_array_of_i32(0, 4).unwrap(), vec![1, -2, 3, -4]);
        assert!(r.put_array_of_i64(0, &[0; 5]).is_err());
    }

    #[test]
    fn test_c_string_round_trip() {
        let mut buf = [0xAAu8; 16];
        let r = region_over(&mut buf);
        r.put_c_string(0, b"hello").unwrap();
        assert_eq!(r.get_c_string(0).unwrap(), b"hello");
        assert_eq!(r.get_u8(5).unwrap(), 0);
        // Terminator must fit too.
        assert!(r.put_c_string(11, b"too-long").is_err());
    }

    #[test]
    fn test_pointer_round_trip() {
        let mut buf = [0u8; 16];
        let mut other = [0u8; 4];
        let r = region_over(&mut buf);
        let target = region_over(&mut other);
        r.put_pointer(0, &target).unwrap();
        assert_eq!(r.get_pointer(0).unwrap().address(), target.address());
    }
}
