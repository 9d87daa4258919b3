//! Residency cache for offloaded weight chunks
//!
//! Offloaded chunks are paged from the backing store through the two-slot
//! [`DiskBuffer`]: while chunk `i` is copied out of one slot, chunk `i + 1`
//! is already being read into the other. Resident chunks are ordered by an
//! [`Lru`]; once `max_cached_chunks` are resident the least recently used
//! one is evicted and its buffer is reused for the incoming chunk when no
//! reader still holds it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::chunk::{ChunkData, ChunkDescriptor, ChunkHandle, ChunkRegistry, Placement, Residency};
use crate::config::{CacheConfig, RuntimeConfig, CACHE_LINE_SIZE};
use crate::error::{Result, RuntimeError};
use crate::memory::{AlignedBuffer, BackingStore, DiskBuffer, ListArena, Lru, NodeId, NUM_BUFFER};

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Offloaded chunk lookups
    pub examined: u64,
    /// Lookups served from memory
    pub hits: u64,
    /// Chunks paged in on demand
    pub fetched: u64,
    /// Chunks paged in ahead of use
    pub prefetched: u64,
    /// Chunks dropped to make room
    pub evicted: u64,
    /// Chunks currently resident
    pub cached: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit
    pub fn hit_rate(&self) -> f64 {
        if self.examined == 0 {
            0.0
        } else {
            self.hits as f64 / self.examined as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    examined: AtomicU64,
    hits: AtomicU64,
    fetched: AtomicU64,
    prefetched: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    node: NodeId,
    data: Arc<AlignedBuffer>,
}

#[derive(Debug)]
struct CacheState {
    arena: ListArena<ChunkHandle>,
    lru: Lru,
    entries: HashMap<ChunkHandle, Entry>,
    in_flight: HashSet<ChunkHandle>,
    capacity: usize,
}

impl CacheState {
    /// Resident data for `handle`, promoting it to most recently used
    fn touch(&mut self, handle: ChunkHandle) -> Option<Arc<AlignedBuffer>> {
        let entry = self.entries.get(&handle)?;
        let (node, data) = (entry.node, entry.data.clone());
        self.lru.promote(&mut self.arena, node);
        Some(data)
    }

    /// Evict least recently used entries until one more fits.
    ///
    /// Returns a victim buffer of at least `size` bytes nobody else holds.
    fn make_room(&mut self, size: usize, evicted: &AtomicU64) -> Option<AlignedBuffer> {
        let mut recycled = None;
        while self.entries.len() >= self.capacity {
            let Some(node) = self.lru.evict(&mut self.arena) else {
                break;
            };
            let Some(victim) = self.arena.remove(node) else {
                continue;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                evicted.fetch_add(1, Ordering::Relaxed);
                trace!(chunk = victim.index(), "evicted chunk");
                if recycled.is_none() {
                    if let Ok(buffer) = Arc::try_unwrap(entry.data) {
                        if buffer.len() >= size {
                            recycled = Some(buffer);
                        }
                    }
                }
            }
        }
        recycled
    }
}

/// LRU-ordered, capacity-bounded cache of offloaded chunks
pub struct ChunkCache {
    state: Mutex<CacheState>,
    paging: Mutex<()>,
    disk: DiskBuffer,
    store: Arc<dyn BackingStore>,
    config: CacheConfig,
    counters: Counters,
}

impl ChunkCache {
    /// Create a cache paging from `store`
    pub fn new(config: &RuntimeConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        let disk = DiskBuffer::new(&config.disk, config.wait)?;
        let mut arena = ListArena::with_capacity(config.cache.max_cached_chunks.min(1 << 16) + 1);
        let lru = Lru::new(&mut arena);

        debug!(
            max_cached = config.cache.max_cached_chunks,
            max_prefetch = config.cache.max_prefetch,
            "chunk cache created"
        );

        Ok(Self {
            state: Mutex::new(CacheState {
                arena,
                lru,
                entries: HashMap::new(),
                in_flight: HashSet::new(),
                capacity: config.cache.max_cached_chunks,
            }),
            paging: Mutex::new(()),
            disk,
            store,
            config: config.cache.clone(),
            counters: Counters::default(),
        })
    }

    /// Maximum number of resident offloaded chunks
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Number of resident offloaded chunks
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no offloaded chunk is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Staging buffers used for paging
    pub fn disk_buffer(&self) -> &DiskBuffer {
        &self.disk
    }

    /// Current residency of a chunk
    pub fn residency(&self, registry: &ChunkRegistry, handle: ChunkHandle) -> Result<Residency> {
        if registry.get(handle)?.is_pinned() {
            return Ok(Residency::Resident);
        }
        let state = self.state.lock();
        Ok(if state.entries.contains_key(&handle) {
            Residency::Resident
        } else if state.in_flight.contains(&handle) {
            Residency::InFlight
        } else {
            Residency::Cold
        })
    }

    /// Offloaded chunks from most to least recently used
    pub fn lru_order(&self) -> Vec<ChunkHandle> {
        let state = self.state.lock();
        state
            .lru
            .iter(&state.arena)
            .filter_map(|node| state.arena.owner(node).copied())
            .collect()
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            examined: self.counters.examined.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            fetched: self.counters.fetched.load(Ordering::Relaxed),
            prefetched: self.counters.prefetched.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            cached: self.len() as u64,
        }
    }

    /// Make every chunk in `handles` readable, paging in whatever is cold.
    ///
    /// Results are in the order of `handles`. Pinned chunks pass straight
    /// through; resident offloaded chunks are promoted.
    pub fn resolve(&self, registry: &ChunkRegistry, handles: &[ChunkHandle]) -> Result<Vec<ChunkData>> {
        let mut resolved: Vec<Option<ChunkData>> = vec![None; handles.len()];
        let mut misses: Vec<ChunkHandle> = Vec::new();

        {
            let mut state = self.state.lock();
            for (slot, &handle) in resolved.iter_mut().zip(handles) {
                let chunk = registry.get(handle)?;
                match &chunk.placement {
                    Placement::Pinned(buffer) => {
                        *slot = Some(ChunkData::new(buffer.clone(), &chunk.descriptor));
                    }
                    Placement::Offloaded => {
                        self.counters.examined.fetch_add(1, Ordering::Relaxed);
                        if let Some(data) = state.touch(handle) {
                            self.counters.hits.fetch_add(1, Ordering::Relaxed);
                            *slot = Some(ChunkData::new(data, &chunk.descriptor));
                        } else if !misses.contains(&handle) {
                            misses.push(handle);
                        }
                    }
                }
            }
        }

        if !misses.is_empty() {
            let fetched = self.page_in(registry, &misses)?;
            self.counters
                .fetched
                .fetch_add(misses.len() as u64, Ordering::Relaxed);

            for (handle, data) in misses.iter().zip(fetched) {
                let descriptor = &registry.get(*handle)?.descriptor;
                for (slot, _) in resolved
                    .iter_mut()
                    .zip(handles)
                    .filter(|(_, h)| **h == *handle)
                {
                    *slot = Some(ChunkData::new(data.clone(), descriptor));
                }
            }
        }

        resolved
            .into_iter()
            .zip(handles)
            .map(|(data, h)| data.ok_or_else(|| RuntimeError::UnknownChunk(format!("handle {}", h.index()))))
            .collect()
    }

    /// Page in up to `max` of `handles` that are not yet resident.
    ///
    /// `max` is further capped by the configured prefetch limit. Returns the
    /// number of chunks fetched.
    pub fn prefetch(&self, registry: &ChunkRegistry, handles: &[ChunkHandle], max: usize) -> Result<usize> {
        let limit = max.min(self.config.max_prefetch);
        let mut todo = Vec::new();
        {
            let state = self.state.lock();
            for &handle in handles {
                if todo.len() >= limit {
                    break;
                }
                if registry.get(handle)?.is_pinned()
                    || state.entries.contains_key(&handle)
                    || todo.contains(&handle)
                {
                    continue;
                }
                todo.push(handle);
            }
        }

        if todo.is_empty() {
            return Ok(0);
        }
        self.page_in(registry, &todo)?;
        self.counters
            .prefetched
            .fetch_add(todo.len() as u64, Ordering::Relaxed);
        trace!(count = todo.len(), "prefetched chunks");
        Ok(todo.len())
    }

    /// Page in every offloaded chunk, raising the capacity to hold them all
    pub fn load_all(&self, registry: &ChunkRegistry) -> Result<usize> {
        let offloaded: Vec<ChunkHandle> = registry.offloaded().collect();
        {
            let mut state = self.state.lock();
            if state.capacity < offloaded.len() {
                state.capacity = offloaded.len();
            }
        }

        let todo: Vec<ChunkHandle> = {
            let state = self.state.lock();
            offloaded
                .into_iter()
                .filter(|h| !state.entries.contains_key(h))
                .collect()
        };
        if !todo.is_empty() {
            self.page_in(registry, &todo)?;
        }
        info!(chunks = todo.len(), "loaded all offloaded chunks");
        Ok(todo.len())
    }

    fn page_in(&self, registry: &ChunkRegistry, handles: &[ChunkHandle]) -> Result<Vec<Arc<AlignedBuffer>>> {
        let descriptors: Vec<&ChunkDescriptor> = handles
            .iter()
            .map(|h| registry.get(*h).map(|c| &c.descriptor))
            .collect::<Result<_>>()?;

        let _paging = self.paging.lock();
        {
            let mut state = self.state.lock();
            state.in_flight.extend(handles.iter().copied());
        }

        let result = self.page_in_overlapped(handles, &descriptors);

        {
            let mut state = self.state.lock();
            for handle in handles {
                state.in_flight.remove(handle);
            }
        }
        result
    }

    fn page_in_overlapped(
        &self,
        handles: &[ChunkHandle],
        descriptors: &[&ChunkDescriptor],
    ) -> Result<Vec<Arc<AlignedBuffer>>> {
        let disk = &self.disk;
        let store: &dyn BackingStore = &*self.store;

        thread::scope(|s| -> Result<Vec<Arc<AlignedBuffer>>> {
            let stage = |i: usize| {
                let (offset, size) = (descriptors[i].file_offset, descriptors[i].byte_size);
                s.spawn(move || disk.stage(i % NUM_BUFFER, store, offset, size))
            };

            let mut out = Vec::with_capacity(handles.len());
            let mut pending = Some(stage(0));
            for i in 0..handles.len() {
                if let Some(read) = pending.take() {
                    read.join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
                }
                if i + 1 < handles.len() {
                    pending = Some(stage(i + 1));
                }
                out.push(self.install(handles[i], descriptors[i], i % NUM_BUFFER)?);
            }
            Ok(out)
        })
    }

    /// Copy a staged chunk out of `slot` and link it at the head of the LRU
    fn install(&self, handle: ChunkHandle, descriptor: &ChunkDescriptor, slot: usize) -> Result<Arc<AlignedBuffer>> {
        let size = descriptor.byte_size;
        let recycled = self.state.lock().make_room(size, &self.counters.evicted);

        let mut buffer = match recycled {
            Some(buffer) => buffer,
            None => AlignedBuffer::allocate(size, CACHE_LINE_SIZE)?,
        };
        {
            let staged = self.disk.read_buffer(slot);
            buffer.as_mut_slice()[..size].copy_from_slice(&staged);
        }
        if let Some(tag) = &descriptor.layout_conversion {
            trace!(chunk = %descriptor.name, layout = %tag, "chunk layout tag");
        }

        let data = Arc::new(buffer);
        let mut state = self.state.lock();
        let CacheState {
            arena,
            lru,
            entries,
            ..
        } = &mut *state;

        if let Some(old) = entries.remove(&handle) {
            lru.destroy(arena, old.node);
        }
        let node = arena.insert(handle);
        lru.add(arena, node, true);
        entries.insert(
            handle,
            Entry {
                node,
                data: data.clone(),
            },
        );
        Ok(data)
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for ChunkCache {
    fn drop(&mut self) {
        let stats = self.stats();
        debug!(
            examined = stats.examined,
            hits = stats.hits,
            fetched = stats.fetched,
            prefetched = stats.prefetched,
            evicted = stats.evicted,
            cached = stats.cached,
            hit_rate = stats.hit_rate(),
            "chunk cache statistics"
        );
    }
}
