//! Sparse quantized matrix product
//!
//! `dst[token, unit] = dot(W[unit], x[token])` for active units only; every
//! inactive unit is written as exactly `0.0`. Weight rows come from the
//! chunks of one layer, the activation is pre-packed into the weight type's
//! dot-product format (Q8_0 for Q4_0 weights).

use tracing::trace;

use crate::chunk::ChunkData;
use crate::compute::chunking::{ChunkCursor, ChunkPlan};
use crate::compute::param::ComputeParam;
use crate::compute::workspace::SharedSlice;
use crate::error::{Result, RuntimeError};
use crate::quant::{quantize_row, DotFn, QuantType};
use crate::router::RouterDecision;

/// Tile edge of the inner blocking loop
const BLOCK: usize = 16;

/// Decides which (token, unit) outputs are computed
pub trait UnitGate: Sync {
    /// Whether `unit` is active for `token`
    fn is_active(&self, token: usize, unit: usize) -> bool;
}

/// One router decision per token
impl UnitGate for [RouterDecision] {
    #[inline]
    fn is_active(&self, token: usize, unit: usize) -> bool {
        self.get(token).is_some_and(|d| d.is_hot(unit))
    }
}

/// Every unit is computed
#[derive(Debug, Clone, Copy, Default)]
pub struct AllActive;

impl UnitGate for AllActive {
    fn is_active(&self, _token: usize, _unit: usize) -> bool {
        true
    }
}

/// Units whose score is at or below `threshold` are skipped
#[derive(Debug, Clone, Copy)]
pub struct ThresholdGate<'a> {
    scores: &'a [f32],
    num_units: usize,
    threshold: f32,
}

impl<'a> ThresholdGate<'a> {
    /// Gate over row-major `[tokens, num_units]` scores
    pub fn new(scores: &'a [f32], num_units: usize, threshold: f32) -> Result<Self> {
        if num_units == 0 || scores.len() % num_units != 0 {
            return Err(RuntimeError::dims("gate scores", num_units, scores.len()));
        }
        Ok(Self {
            scores,
            num_units,
            threshold,
        })
    }
}

impl UnitGate for ThresholdGate<'_> {
    #[inline]
    fn is_active(&self, token: usize, unit: usize) -> bool {
        self.scores
            .get(token * self.num_units + unit)
            .is_some_and(|&s| s > self.threshold)
    }
}

/// Weight rows of one layer, addressed by global unit index.
///
/// A chunk slot may be empty when its rows belong to another path of the
/// computation; rows in empty slots are reported as absent.
#[derive(Debug)]
pub struct LayerRows<'a> {
    starts: Vec<usize>,
    chunks: Vec<Option<&'a ChunkData>>,
    nr0: usize,
}

impl<'a> LayerRows<'a> {
    /// Rows laid out chunk after chunk; `rows[i]` is the row count of chunk `i`
    pub fn new(rows: &[usize], chunks: Vec<Option<&'a ChunkData>>) -> Result<Self> {
        if rows.len() != chunks.len() {
            return Err(RuntimeError::dims("layer chunks", rows.len(), chunks.len()));
        }
        let mut starts = Vec::with_capacity(rows.len());
        let mut nr0 = 0;
        for (&n, chunk) in rows.iter().zip(&chunks) {
            if let Some(c) = chunk {
                if c.rows() != n {
                    return Err(RuntimeError::dims("chunk rows", n, c.rows()));
                }
            }
            starts.push(nr0);
            nr0 += n;
        }
        Ok(Self {
            starts,
            chunks,
            nr0,
        })
    }

    /// Rows from fully present chunks
    pub fn from_chunks(chunks: &'a [ChunkData]) -> Result<Self> {
        let rows: Vec<usize> = chunks.iter().map(ChunkData::rows).collect();
        Self::new(&rows, chunks.iter().map(Some).collect())
    }

    /// Total units across all chunks
    pub fn num_units(&self) -> usize {
        self.nr0
    }

    /// Index of the chunk holding `unit`
    #[inline]
    pub fn chunk_of(&self, unit: usize) -> usize {
        self.starts.partition_point(|&s| s <= unit) - 1
    }

    /// Encoded weights of `unit`, if present on this path
    #[inline]
    pub fn row(&self, unit: usize) -> Option<&'a [u8]> {
        if unit >= self.nr0 {
            return None;
        }
        let idx = self.chunk_of(unit);
        self.chunks[idx].map(|c| c.row(unit - self.starts[idx]))
    }
}

/// Arguments of one sparse product, shared by all workers
pub struct SparseMatmul<'a, G: UnitGate + ?Sized> {
    /// Weight rows
    pub rows: &'a LayerRows<'a>,
    /// Which outputs to compute
    pub gate: &'a G,
    /// Packed activation, `nr1` rows of `lhs_row_bytes`
    pub lhs: &'a [u8],
    /// Bytes per packed activation row
    pub lhs_row_bytes: usize,
    /// Elements per row
    pub ne00: usize,
    /// Row-by-activation kernel
    pub dot: DotFn,
    /// Output tiling
    pub plan: ChunkPlan,
}

impl<G: UnitGate + ?Sized> SparseMatmul<'_, G> {
    /// Compute this worker's tiles into `dst` (row-major `[nr1, nr0]`).
    ///
    /// Outputs whose row is absent or whose unit is inactive are set to 0.
    pub fn compute(&self, params: &ComputeParam<'_>, cursor: &ChunkCursor, dst: &SharedSlice<'_, f32>) {
        let total = self.plan.num_chunks();
        let mut tiles = 0usize;
        cursor.for_each(params.ith, total, |idx| {
            self.compute_tile(idx, dst);
            tiles += 1;
        });
        trace!(ith = params.ith, tiles, "sparse matmul tiles done");
    }

    fn compute_tile(&self, idx: usize, dst: &SharedSlice<'_, f32>) {
        let nr0 = self.plan.nr0;
        let (ir0, ir1) = self.plan.chunk_range(idx);

        for iir1 in ir1.clone().step_by(BLOCK) {
            for iir0 in ir0.clone().step_by(BLOCK) {
                for i1 in iir1..(iir1 + BLOCK).min(ir1.end) {
                    let lhs = &self.lhs[i1 * self.lhs_row_bytes..(i1 + 1) * self.lhs_row_bytes];
                    for i0 in iir0..(iir0 + BLOCK).min(ir0.end) {
                        let value = match self.rows.row(i0) {
                            Some(row) if self.gate.is_active(i1, i0) => (self.dot)(self.ne00, row, lhs),
                            _ => 0.0,
                        };
                        // Safety: tiles are disjoint and each is visited by one worker.
                        unsafe { dst.write(i1 * nr0 + i0, value) };
                    }
                }
            }
        }
    }
}

/// Pack this worker's share of `src` rows into `vec_dot_type` for the product
pub fn pack_rows(
    params: &ComputeParam<'_>,
    src: &[f32],
    ne00: usize,
    vec_dot_type: QuantType,
    dst: &SharedSlice<'_, u8>,
) -> Result<()> {
    let row_bytes = vec_dot_type.row_size(ne00)?;
    let nr1 = src.len() / ne00.max(1);
    for i1 in params.distribute(nr1, 1) {
        // Safety: `distribute` hands each worker disjoint rows.
        let out = unsafe { dst.slice_mut(i1 * row_bytes..(i1 + 1) * row_bytes) };
        quantize_row(vec_dot_type, &src[i1 * ne00..(i1 + 1) * ne00], out)?;
    }
    Ok(())
}
