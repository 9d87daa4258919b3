//! Aligned byte buffers
//!
//! Every weight chunk, disk staging slot and compute workspace lives in an
//! [`AlignedBuffer`]: a zero-initialised heap region whose base address is a
//! multiple of the requested alignment and whose length is rounded up to a
//! multiple of it.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{Result, RuntimeError};

/// Round `size` up to the next multiple of `alignment` (a power of two)
#[inline]
pub fn align_up(size: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}

/// Round `value` down to a multiple of `alignment` (a power of two)
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Owned, aligned, zero-initialised byte buffer
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: AlignedBuffer uniquely owns its allocation; shared access only
// hands out `&[u8]`, mutable access requires `&mut self`.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate at least `size` bytes aligned to `alignment`.
    ///
    /// The length is rounded up to a multiple of `alignment`; a zero-sized
    /// request still yields one alignment unit so the base address is real.
    pub fn allocate(size: usize, alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(RuntimeError::InvalidAlignment(alignment));
        }

        let rounded = align_up(size.max(1), alignment);
        let layout = Layout::from_size_align(rounded, alignment)
            .map_err(|_| RuntimeError::InvalidAlignment(alignment))?;

        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(RuntimeError::Allocation {
            size: rounded,
            alignment,
        })?;

        Ok(Self { ptr, layout })
    }

    /// Allocate a buffer and fill it with `bytes`
    pub fn from_bytes(bytes: &[u8], alignment: usize) -> Result<Self> {
        let mut buffer = Self::allocate(bytes.len(), alignment)?;
        buffer.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Usable length in bytes (a multiple of the alignment)
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false: every buffer holds at least one alignment unit
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Alignment of the base address
    #[inline]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Base address
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable base address
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the whole buffer
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Mutably view the whole buffer
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len())
            .field("alignment", &self.alignment())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CACHE_LINE_SIZE, DISK_ALIGNMENT};

    #[test]
    fn test_alignment_and_rounding() {
        let buf = AlignedBuffer::allocate(100, CACHE_LINE_SIZE).unwrap();
        assert_eq!(buf.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        assert_eq!(buf.len(), 128);

        let page = AlignedBuffer::allocate(4097, DISK_ALIGNMENT).unwrap();
        assert_eq!(page.as_ptr() as usize % DISK_ALIGNMENT, 0);
        assert_eq!(page.len(), 8192);
    }

    #[test]
    fn test_zero_size_and_zeroed() {
        let buf = AlignedBuffer::allocate(0, 64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_alignment() {
        assert!(matches!(
            AlignedBuffer::allocate(64, 48),
            Err(RuntimeError::InvalidAlignment(48))
        ));
        assert!(AlignedBuffer::allocate(64, 0).is_err());
    }

    #[test]
    fn test_from_bytes() {
        let buf = AlignedBuffer::from_bytes(&[1, 2, 3], 16).unwrap();
        assert_eq!(&buf.as_slice()[..4], &[1, 2, 3, 0]);
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_down(5000, 4096), 4096);
        assert_eq!(align_down(4096, 4096), 4096);
    }
}
