//! Double-buffered, page-aligned disk staging
//!
//! A [`DiskBuffer`] owns two staging slots. Reads are widened to the
//! enclosing page-aligned envelope of the requested range, and a padding
//! offset records where the logical bytes start inside the slot. Each slot
//! has a [`ReadyEvent`]; a slot is only reused once its event is ready, so
//! one read can land in one slot while the other slot is being consumed.

use std::fs::File;
use std::io;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use super::aligned::{align_down, align_up, AlignedBuffer};
use crate::config::{DiskBufferConfig, WaitStrategy};
use crate::error::{Result, RuntimeError};
use crate::sync::ReadyEvent;

/// Number of staging slots
pub const NUM_BUFFER: usize = 2;

/// Positional byte source that weight chunks are paged from
pub trait BackingStore: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`; `Ok(0)` means end of store
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
}

impl BackingStore for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl<S: BackingStore + ?Sized> BackingStore for Arc<S> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// Backing store held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    bytes: Vec<u8>,
}

impl MemoryStore {
    /// Wrap a byte vector
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Store length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl BackingStore for MemoryStore {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let start = match usize::try_from(offset) {
            Ok(start) if start < self.bytes.len() => start,
            _ => return Ok(0),
        };
        let n = buf.len().min(self.bytes.len() - start);
        buf[..n].copy_from_slice(&self.bytes[start..start + n]);
        Ok(n)
    }
}

/// Page-aligned envelope of a logical byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedRead {
    /// Start of the envelope, a multiple of the alignment
    pub aligned_offset: u64,
    /// Length of the envelope, a multiple of the alignment
    pub aligned_size: usize,
    /// Distance from `aligned_offset` to the logical start
    pub padding: usize,
}

impl AlignedRead {
    /// Compute the envelope of `[offset, offset + size)`
    pub fn envelope(offset: u64, size: usize, alignment: usize) -> Self {
        let aligned_offset = align_down(offset, alignment as u64);
        let end = offset + size as u64;
        let aligned_end = align_up(end as usize, alignment) as u64;
        Self {
            aligned_offset,
            aligned_size: (aligned_end - aligned_offset) as usize,
            padding: (offset - aligned_offset) as usize,
        }
    }
}

#[derive(Debug)]
struct Slot {
    buffer: AlignedBuffer,
    padding: usize,
    logical_len: usize,
}

/// Write access to a slot, sized to the envelope of the pending read
pub struct StagingWrite<'a> {
    slot: RwLockWriteGuard<'a, Slot>,
    read: AlignedRead,
}

impl StagingWrite<'_> {
    /// Envelope being staged
    pub fn read(&self) -> AlignedRead {
        self.read
    }

    /// Destination bytes for the aligned read
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let size = self.read.aligned_size;
        &mut self.slot.buffer.as_mut_slice()[..size]
    }
}

/// Two-slot disk staging buffer
#[derive(Debug)]
pub struct DiskBuffer {
    slots: [RwLock<Slot>; NUM_BUFFER],
    events: [ReadyEvent; NUM_BUFFER],
    alignment: usize,
}

impl DiskBuffer {
    /// Allocate both slots at the configured initial capacity
    pub fn new(config: &DiskBufferConfig, wait: WaitStrategy) -> Result<Self> {
        let alloc_slot = || -> Result<RwLock<Slot>> {
            Ok(RwLock::new(Slot {
                buffer: AlignedBuffer::allocate(config.initial_capacity, config.alignment)?,
                padding: 0,
                logical_len: 0,
            }))
        };
        let slots = [alloc_slot()?, alloc_slot()?];

        debug!(
            capacity = config.initial_capacity,
            alignment = config.alignment,
            "disk staging buffers allocated"
        );

        Ok(Self {
            slots,
            events: [ReadyEvent::new(true, wait), ReadyEvent::new(true, wait)],
            alignment: config.alignment,
        })
    }

    /// Read alignment
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Current capacity of a slot
    pub fn capacity(&self, slot: usize) -> usize {
        self.slots[slot].read().buffer.len()
    }

    /// Prepare `slot` to receive the envelope of `[offset, offset + size)`.
    ///
    /// Grows the slot (discarding its contents) when it is too small, and
    /// records the padding so [`read_buffer`](Self::read_buffer) starts at
    /// `offset`.
    pub fn get_buffer(&self, slot: usize, offset: u64, size: usize) -> Result<StagingWrite<'_>> {
        if slot >= NUM_BUFFER {
            return Err(RuntimeError::Precondition(format!(
                "disk buffer slot {} out of range",
                slot
            )));
        }

        let read = AlignedRead::envelope(offset, size, self.alignment);
        let mut guard = self.slots[slot].write();

        if guard.buffer.len() < read.aligned_size {
            debug!(
                slot,
                old = guard.buffer.len(),
                new = read.aligned_size,
                "growing disk staging slot"
            );
            guard.buffer = AlignedBuffer::allocate(read.aligned_size, self.alignment)?;
        }
        guard.padding = read.padding;
        guard.logical_len = size;

        Ok(StagingWrite { slot: guard, read })
    }

    /// Logical bytes of the last read staged into `slot`
    pub fn read_buffer(&self, slot: usize) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.slots[slot].read(), |s| {
            &s.buffer.as_slice()[s.padding..s.padding + s.logical_len]
        })
    }

    /// Base address of a slot's allocation
    pub fn base_ptr(&self, slot: usize) -> *const u8 {
        self.slots[slot].read().buffer.as_ptr()
    }

    /// Padding recorded for a slot
    pub fn padding(&self, slot: usize) -> usize {
        self.slots[slot].read().padding
    }

    /// Mark a slot's read as in flight
    pub fn set_event(&self, slot: usize) {
        self.events[slot].set();
    }

    /// Mark a slot's read as complete
    pub fn finish_event(&self, slot: usize) {
        self.events[slot].finish();
    }

    /// Wait until a slot's read has completed
    pub fn wait_event(&self, slot: usize) {
        self.events[slot].wait();
    }

    /// Whether a slot's read has completed
    pub fn is_ready(&self, slot: usize) -> bool {
        self.events[slot].is_ready()
    }

    /// Synchronously page `[offset, offset + size)` from `store` into `slot`.
    ///
    /// Waits for any earlier read on the slot, marks it in flight, reads
    /// the aligned envelope and marks it ready again, even on failure.
    pub fn stage<S>(&self, slot: usize, store: &S, offset: u64, size: usize) -> Result<()>
    where
        S: BackingStore + ?Sized,
    {
        self.wait_event(slot);
        self.set_event(slot);
        let result = self.fill(slot, store, offset, size);
        self.finish_event(slot);
        result
    }

    fn fill<S>(&self, slot: usize, store: &S, offset: u64, size: usize) -> Result<()>
    where
        S: BackingStore + ?Sized,
    {
        let mut staging = self.get_buffer(slot, offset, size)?;
        let read = staging.read();
        let dst = staging.as_mut_slice();

        let mut filled = 0;
        while filled < dst.len() {
            match store.read_at(&mut dst[filled..], read.aligned_offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(RuntimeError::PagingRead {
                        offset: read.aligned_offset,
                        len: read.aligned_size,
                        source,
                    })
                }
            }
        }

        let needed = read.padding + size;
        if filled < needed {
            return Err(RuntimeError::ShortRead {
                offset,
                needed,
                got: filled,
            });
        }
        // the envelope may run past the end of the store
        dst[filled..].fill(0);

        trace!(slot, offset, size, aligned = read.aligned_size, "staged chunk");
        Ok(())
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        for event in &self.events {
            event.wait();
        }
    }
}
