//! Weight chunk identity and registration
//!
//! A chunk is a contiguous run of quantized rows of one weight matrix. The
//! registry records what each chunk is and where it lives; the bytes of
//! offloaded chunks are brought in by the [`ChunkCache`](crate::ChunkCache).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CACHE_LINE_SIZE;
use crate::error::{Result, RuntimeError};
use crate::memory::AlignedBuffer;
use crate::quant::QuantType;

/// Logical identity of a chunk: layer plus expert or row-block index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    /// Transformer layer
    pub layer: u32,
    /// Expert or row-block index within the layer
    pub unit: u32,
}

impl ChunkId {
    /// Create a chunk id
    pub fn new(layer: u32, unit: u32) -> Self {
        Self { layer, unit }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}.u{}", self.layer, self.unit)
    }
}

/// Registry-local handle to a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle(pub(crate) u32);

impl ChunkHandle {
    /// Position in registration order
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a chunk's bytes currently are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    /// In memory and readable
    Resident,
    /// Being paged in
    InFlight,
    /// Only in the backing store
    Cold,
}

impl fmt::Display for Residency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Residency::Resident => write!(f, "resident"),
            Residency::InFlight => write!(f, "in-flight"),
            Residency::Cold => write!(f, "cold"),
        }
    }
}

/// Static description of a chunk, as supplied by the model loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Tensor name, e.g. `"L0.up"`
    pub name: String,
    /// Logical id
    pub id: ChunkId,
    /// Element encoding
    pub qtype: QuantType,
    /// Shape: `ne[0]` elements per row, `ne[1]` rows, `ne[2..]` batch dims
    pub ne: [usize; 4],
    /// Byte strides; zero entries are filled in for a contiguous layout
    pub nb: [usize; 4],
    /// Total bytes in the backing store
    pub byte_size: usize,
    /// Offset of the first byte in the backing store
    pub file_offset: u64,
    /// Optional repacking applied when the chunk is loaded
    pub layout_conversion: Option<String>,
}

impl ChunkDescriptor {
    /// Contiguous chunk of `rows` rows of `cols` elements
    pub fn new(
        name: impl Into<String>,
        id: ChunkId,
        qtype: QuantType,
        cols: usize,
        rows: usize,
        file_offset: u64,
    ) -> Result<Self> {
        let name = name.into();
        check_extents(&name, cols, rows)?;
        let row_bytes = qtype.row_size(cols)?;
        Ok(Self {
            name,
            id,
            qtype,
            ne: [cols, rows, 1, 1],
            nb: [qtype.type_size(), row_bytes, row_bytes * rows, row_bytes * rows],
            byte_size: row_bytes * rows,
            file_offset,
            layout_conversion: None,
        })
    }

    /// Attach a layout conversion tag
    pub fn with_layout_conversion(mut self, tag: impl Into<String>) -> Self {
        self.layout_conversion = Some(tag.into());
        self
    }

    /// Elements per row
    pub fn cols(&self) -> usize {
        self.ne[0]
    }

    /// Rows across all batch dimensions
    pub fn rows(&self) -> usize {
        self.ne[1] * self.ne[2].max(1) * self.ne[3].max(1)
    }

    /// Bytes per row
    pub fn row_bytes(&self) -> usize {
        self.nb[1]
    }

    fn normalize(&mut self) -> Result<()> {
        check_extents(&self.name, self.ne[0], self.ne[1])?;
        let row_bytes = self.qtype.row_size(self.ne[0])?;
        if self.nb[0] == 0 {
            self.nb[0] = self.qtype.type_size();
        }
        if self.nb[1] == 0 {
            self.nb[1] = row_bytes;
        }
        if self.nb[2] == 0 {
            self.nb[2] = self.nb[1] * self.ne[1];
        }
        if self.nb[3] == 0 {
            self.nb[3] = self.nb[2] * self.ne[2].max(1);
        }

        if self.nb[1] != row_bytes {
            return Err(RuntimeError::Precondition(format!(
                "chunk {} has non-contiguous rows: stride {} for row size {}",
                self.name, self.nb[1], row_bytes
            )));
        }

        let needed = self.rows() * row_bytes;
        if self.byte_size < needed {
            return Err(RuntimeError::dims("chunk byte size", needed, self.byte_size));
        }
        Ok(())
    }
}

fn check_extents(name: &str, cols: usize, rows: usize) -> Result<()> {
    if cols == 0 || rows == 0 {
        return Err(RuntimeError::Precondition(format!(
            "chunk {} has an empty shape: {} cols x {} rows",
            name, cols, rows
        )));
    }
    Ok(())
}

/// How a registered chunk is kept
#[derive(Debug, Clone)]
pub enum Placement {
    /// Always resident; bytes supplied at registration
    Pinned(Arc<AlignedBuffer>),
    /// Paged from the backing store on demand
    Offloaded,
}

/// A registered chunk
#[derive(Debug, Clone)]
pub struct WeightChunk {
    /// Static description
    pub descriptor: ChunkDescriptor,
    /// Pinned or offloaded
    pub placement: Placement,
}

impl WeightChunk {
    /// Whether the chunk never needs paging
    pub fn is_pinned(&self) -> bool {
        matches!(self.placement, Placement::Pinned(_))
    }
}

/// Chunk bytes in memory, viewed row by row
#[derive(Debug, Clone)]
pub struct ChunkData {
    data: Arc<AlignedBuffer>,
    qtype: QuantType,
    cols: usize,
    rows: usize,
    row_bytes: usize,
}

impl ChunkData {
    pub(crate) fn new(data: Arc<AlignedBuffer>, descriptor: &ChunkDescriptor) -> Self {
        Self {
            data,
            qtype: descriptor.qtype,
            cols: descriptor.cols(),
            rows: descriptor.rows(),
            row_bytes: descriptor.row_bytes(),
        }
    }

    /// Encoded bytes of row `i`
    #[inline]
    pub fn row(&self, i: usize) -> &[u8] {
        let start = i * self.row_bytes;
        &self.data.as_slice()[start..start + self.row_bytes]
    }

    /// Element encoding
    pub fn qtype(&self) -> QuantType {
        self.qtype
    }

    /// Elements per row
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Underlying buffer
    pub fn buffer(&self) -> &Arc<AlignedBuffer> {
        &self.data
    }
}

/// Name and id index over registered chunks
#[derive(Debug, Default)]
pub struct ChunkRegistry {
    chunks: Vec<WeightChunk>,
    by_name: HashMap<String, ChunkHandle>,
    by_id: HashMap<ChunkId, ChunkHandle>,
}

impl ChunkRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chunk. `resident` bytes make it pinned; `None` offloads it.
    pub fn register(
        &mut self,
        mut descriptor: ChunkDescriptor,
        resident: Option<&[u8]>,
    ) -> Result<ChunkHandle> {
        descriptor.normalize()?;

        if self.by_name.contains_key(&descriptor.name) {
            return Err(RuntimeError::DuplicateChunk(descriptor.name));
        }
        if self.by_id.contains_key(&descriptor.id) {
            return Err(RuntimeError::DuplicateChunk(descriptor.id.to_string()));
        }

        let placement = match resident {
            Some(bytes) => {
                if bytes.len() < descriptor.byte_size {
                    return Err(RuntimeError::dims(
                        "resident chunk bytes",
                        descriptor.byte_size,
                        bytes.len(),
                    ));
                }
                let buffer = AlignedBuffer::from_bytes(&bytes[..descriptor.byte_size], CACHE_LINE_SIZE)?;
                Placement::Pinned(Arc::new(buffer))
            }
            None => Placement::Offloaded,
        };

        let handle = ChunkHandle(self.chunks.len() as u32);
        debug!(
            name = %descriptor.name,
            id = %descriptor.id,
            qtype = %descriptor.qtype,
            bytes = descriptor.byte_size,
            pinned = resident.is_some(),
            "registered weight chunk"
        );

        self.by_name.insert(descriptor.name.clone(), handle);
        self.by_id.insert(descriptor.id, handle);
        self.chunks.push(WeightChunk {
            descriptor,
            placement,
        });
        Ok(handle)
    }

    /// Handle for a chunk name
    pub fn lookup(&self, name: &str) -> Result<ChunkHandle> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| RuntimeError::UnknownChunk(name.to_string()))
    }

    /// Handle for a chunk id
    pub fn lookup_id(&self, id: ChunkId) -> Result<ChunkHandle> {
        self.by_id
            .get(&id)
            .copied()
            .ok_or_else(|| RuntimeError::UnknownChunk(id.to_string()))
    }

    /// Registered chunk for a handle
    pub fn get(&self, handle: ChunkHandle) -> Result<&WeightChunk> {
        self.chunks
            .get(handle.index())
            .ok_or_else(|| RuntimeError::UnknownChunk(format!("handle {}", handle.0)))
    }

    /// Number of registered chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All chunks in registration order
    pub fn iter(&self) -> impl Iterator<Item = (ChunkHandle, &WeightChunk)> {
        self.chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (ChunkHandle(i as u32), c))
    }

    /// Handles of offloaded chunks
    pub fn offloaded(&self) -> impl Iterator<Item = ChunkHandle> + '_ {
        self.iter()
            .filter(|(_, c)| !c.is_pinned())
            .map(|(h, _)| h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up_descriptor() -> ChunkDescriptor {
        ChunkDescriptor::new("L0.up", ChunkId::new(0, 0), QuantType::Q4_0, 4096, 11008, 1024).unwrap()
    }

    #[test]
    fn test_descriptor_sizes() {
        let d = up_descriptor();
        assert_eq!(d.cols(), 4096);
        assert_eq!(d.rows(), 11008);
        assert_eq!(d.row_bytes(), 128 * 18);
        assert_eq!(d.byte_size, 11008 * 128 * 18);
        assert_eq!(d.nb[1], d.row_bytes());
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ChunkRegistry::new();
        let h = registry.register(up_descriptor(), None).unwrap();

        assert_eq!(registry.lookup("L0.up").unwrap(), h);
        assert_eq!(registry.lookup_id(ChunkId::new(0, 0)).unwrap(), h);
        assert!(!registry.get(h).unwrap().is_pinned());
        assert_eq!(registry.offloaded().count(), 1);
    }

    #[test]
    fn test_unknown_and_duplicate() {
        let mut registry = ChunkRegistry::new();
        registry.register(up_descriptor(), None).unwrap();

        assert!(matches!(
            registry.lookup("L0.down"),
            Err(RuntimeError::UnknownChunk(_))
        ));
        assert!(matches!(
            registry.register(up_descriptor(), None),
            Err(RuntimeError::DuplicateChunk(_))
        ));

        let mut other = up_descriptor();
        other.name = "L0.up.copy".into();
        assert!(matches!(
            registry.register(other, None),
            Err(RuntimeError::DuplicateChunk(_))
        ));
        assert!(registry.get(ChunkHandle(7)).is_err());
    }

    #[test]
    fn test_pinned_chunk_rows() {
        let mut registry = ChunkRegistry::new();
        let desc = ChunkDescriptor::new("L1.gate", ChunkId::new(1, 0), QuantType::F32, 2, 3, 0)
            .unwrap()
            .with_layout_conversion("none");
        let bytes: Vec<u8> = (0u8..24).collect();
        let h = registry.register(desc, Some(bytes.as_slice())).unwrap();

        let chunk = registry.get(h).unwrap();
        let data = match &chunk.placement {
            Placement::Pinned(buf) => ChunkData::new(buf.clone(), &chunk.descriptor),
            Placement::Offloaded => panic!("expected pinned"),
        };
        assert_eq!(data.row(1), &bytes[8..16]);
        assert_eq!(chunk.descriptor.layout_conversion.as_deref(), Some("none"));
    }

    #[test]
    fn test_empty_shape_rejected() {
        for (cols, rows) in [(0, 4), (32, 0)] {
            assert!(matches!(
                ChunkDescriptor::new("z", ChunkId::new(0, 0), QuantType::F32, cols, rows, 0),
                Err(RuntimeError::Precondition(_))
            ));
        }

        // a hand-built descriptor goes through the same check on registration
        let mut desc = ChunkDescriptor::new("z", ChunkId::new(0, 0), QuantType::F32, 4, 4, 0).unwrap();
        desc.ne[0] = 0;
        let mut registry = ChunkRegistry::new();
        assert!(matches!(
            registry.register(desc, None),
            Err(RuntimeError::Precondition(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_short_resident_bytes() {
        let mut registry = ChunkRegistry::new();
        let desc = ChunkDescriptor::new("x", ChunkId::new(0, 1), QuantType::F32, 4, 4, 0).unwrap();
        assert!(registry.register(desc, Some(&[0u8; 8][..])).is_err());
    }
}
