//! Scratch workspace shared by the workers of one dispatch
//!
//! The caller owns a [`Workspace`] with a fixed byte ceiling. A kernel lays
//! out its packing and temporary buffers with a [`WorkspacePlan`], fails
//! with `WorkspaceTooSmall` if the plan does not fit, and hands each worker
//! [`SharedSlice`] views of the regions.

use std::marker::PhantomData;
use std::ops::Range;

use crate::config::CACHE_LINE_SIZE;
use crate::error::{Result, RuntimeError};
use crate::memory::{align_up, AlignedBuffer};

/// Caller-provided scratch memory
#[derive(Debug)]
pub struct Workspace {
    buffer: AlignedBuffer,
    wsize: usize,
}

impl Workspace {
    /// Workspace with a ceiling of `wsize` bytes
    pub fn new(wsize: usize) -> Result<Self> {
        Ok(Self {
            buffer: AlignedBuffer::allocate(wsize, CACHE_LINE_SIZE)?,
            wsize,
        })
    }

    /// Byte ceiling
    pub fn wsize(&self) -> usize {
        self.wsize
    }

    /// Carve the planned regions out of this workspace
    pub fn bind(&mut self, plan: &WorkspacePlan) -> Result<SharedSlice<'_, u8>> {
        plan.check(self.wsize)?;
        let wsize = self.wsize;
        Ok(SharedSlice::new(&mut self.buffer.as_mut_slice()[..wsize]))
    }
}

/// Typed region reserved in a [`WorkspacePlan`]
#[derive(Debug)]
pub struct Region<T> {
    offset: usize,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Region<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Region<T> {}

impl<T> Region<T> {
    /// Elements in the region
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region holds no elements
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Cache-line aligned layout of workspace regions
#[derive(Debug, Default, Clone)]
pub struct WorkspacePlan {
    size: usize,
}

impl WorkspacePlan {
    /// Empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `len` elements of `T`
    pub fn reserve<T>(&mut self, len: usize) -> Region<T> {
        let offset = align_up(self.size, CACHE_LINE_SIZE);
        self.size = offset + len * std::mem::size_of::<T>();
        Region {
            offset,
            len,
            _marker: PhantomData,
        }
    }

    /// Bytes the plan needs
    pub fn required(&self) -> usize {
        self.size
    }

    /// Fail unless the plan fits in `available` bytes
    pub fn check(&self, available: usize) -> Result<()> {
        if self.size > available {
            return Err(RuntimeError::WorkspaceTooSmall {
                required: self.size,
                available,
            });
        }
        Ok(())
    }
}

/// Slice that several workers write through concurrently.
///
/// Callers guarantee that concurrent writers touch disjoint elements and
/// that reads of an element do not race with writes to it; barriers
/// between pipeline phases provide the ordering.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

// Safety: access discipline is documented on the type; T itself must be Send.
unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<T> Clone for SharedSlice<'_, T> {
    fn clone(&self) -> Self {
        Self {
            ptr: self.ptr,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<'a, T> SharedSlice<'a, T> {
    /// Share a mutable slice
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slice is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read-only view of `range`.
    ///
    /// # Safety
    /// No other worker may write to `range` while the view is alive.
    pub unsafe fn slice(&self, range: Range<usize>) -> &[T] {
        assert!(range.start <= range.end && range.end <= self.len);
        std::slice::from_raw_parts(self.ptr.add(range.start), range.end - range.start)
    }

    /// Mutable view of `range`.
    ///
    /// # Safety
    /// No other worker may access `range` while the view is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, range: Range<usize>) -> &mut [T] {
        assert!(range.start <= range.end && range.end <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.end - range.start)
    }

    /// Write one element.
    ///
    /// # Safety
    /// No other worker may access element `idx` concurrently.
    #[inline]
    pub unsafe fn write(&self, idx: usize, value: T) {
        assert!(idx < self.len);
        self.ptr.add(idx).write(value);
    }
}

impl<'a> SharedSlice<'a, u8> {
    /// Typed view of a planned region
    pub fn region<T>(&self, region: Region<T>) -> SharedSlice<'a, T> {
        let bytes = region.len * std::mem::size_of::<T>();
        assert!(region.offset + bytes <= self.len);
        let ptr = unsafe { self.ptr.add(region.offset) } as *mut T;
        debug_assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
        SharedSlice {
            ptr,
            len: region.len,
            _marker: PhantomData,
        }
    }
}
