//! Per-layer sparse forward pass
//!
//! One dispatch on the worker pool walks
//! `Idle -> LhsPack -> RhsResolve -> Matmul -> Accumulate -> Done`:
//!
//! - `LhsPack`: workers pack disjoint token rows of the activation into the
//!   weights' dot-product format.
//! - `RhsResolve`: pinned chunks are used in place. The worker that wins the
//!   gate pages in the offloaded chunks that hold active units while the
//!   others already run the product over pinned rows.
//! - `Matmul`: the pinned-row product, then the paged-row product, each into
//!   its own zero-filled scratch output.
//! - `Accumulate`: the two scratch outputs are summed into the caller's
//!   buffer. Nothing is written there if any phase failed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cache::ChunkCache;
use crate::chunk::{ChunkData, ChunkHandle, ChunkRegistry, Placement};
use crate::compute::chunking::{ChunkCursor, ChunkPlan};
use crate::compute::param::{ComputeParam, WorkerPool};
use crate::compute::sparse_matmul::{pack_rows, LayerRows, SparseMatmul, UnitGate};
use crate::compute::workspace::{SharedSlice, Workspace, WorkspacePlan};
use crate::config::{WaitStrategy, CACHE_LINE_SIZE};
use crate::error::{Result, RuntimeError};
use crate::quant::{dot_kernel, QuantType};
use crate::sync::{SpinBarrier, TestAndSetGate};

/// Phase of a layer forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    /// No forward in progress
    Idle,
    /// Packing the activation
    LhsPack,
    /// Making weight chunks readable
    RhsResolve,
    /// Running the sparse products
    Matmul,
    /// Summing partial outputs
    Accumulate,
    /// Output complete
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::LhsPack => "lhs_pack",
            PipelineStage::RhsResolve => "rhs_resolve",
            PipelineStage::Matmul => "matmul",
            PipelineStage::Accumulate => "accumulate",
            PipelineStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Chunks making up one weight matrix, in row order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerWeights {
    chunks: Vec<ChunkHandle>,
}

impl LayerWeights {
    /// Matrix whose rows are the rows of `chunks`, concatenated
    pub fn new(chunks: Vec<ChunkHandle>) -> Self {
        Self { chunks }
    }

    /// Chunk handles in row order
    pub fn chunks(&self) -> &[ChunkHandle] {
        &self.chunks
    }
}

/// Shape of a layer's weights after validation
#[derive(Debug, Clone)]
pub(crate) struct LayerShape {
    pub qtype: QuantType,
    pub cols: usize,
    pub rows: Vec<usize>,
    pub nr0: usize,
}

impl LayerShape {
    /// Check that all chunks of `layer` are registered and agree on row format
    pub(crate) fn of(registry: &ChunkRegistry, layer: &[ChunkHandle]) -> Result<Self> {
        let first = layer
            .first()
            .ok_or_else(|| RuntimeError::Precondition("layer has no weight chunks".to_string()))?;
        let head = &registry.get(*first)?.descriptor;
        if head.cols() == 0 {
            return Err(RuntimeError::Precondition(format!("chunk {} has no columns", head.name)));
        }
        let mut rows = Vec::with_capacity(layer.len());
        for &handle in layer {
            let d = &registry.get(handle)?.descriptor;
            if d.qtype != head.qtype {
                return Err(RuntimeError::Precondition(format!(
                    "chunk {} is {} but the layer is {}",
                    d.name, d.qtype, head.qtype
                )));
            }
            if d.cols() != head.cols() {
                return Err(RuntimeError::dims("chunk columns", head.cols(), d.cols()));
            }
            rows.push(d.rows());
        }
        Ok(Self {
            qtype: head.qtype,
            cols: head.cols(),
            nr0: rows.iter().sum(),
            rows,
        })
    }
}

/// Counters of one forward
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Output units
    pub nr0: usize,
    /// Tokens
    pub nr1: usize,
    /// Active `(token, unit)` outputs
    pub active: usize,
    /// Offloaded chunks resolved through the cache
    pub resolved_chunks: usize,
    /// Offloaded chunks skipped because none of their units were active
    pub skipped_chunks: usize,
}

impl ForwardStats {
    /// Fraction of outputs that were not computed
    pub fn sparsity(&self) -> f32 {
        let total = self.nr0 * self.nr1;
        if total == 0 {
            return 0.0;
        }
        1.0 - self.active as f32 / total as f32
    }
}

/// First error raised by any worker
#[derive(Default)]
pub(crate) struct FirstError {
    failed: AtomicBool,
    error: Mutex<Option<RuntimeError>>,
}

impl FirstError {
    pub(crate) fn record(&self, err: RuntimeError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn into_result(self) -> Result<()> {
        match self.error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Sparse forward over the chunks of one layer
pub struct SparsePipeline<'a> {
    registry: &'a ChunkRegistry,
    cache: &'a ChunkCache,
    pool: &'a WorkerPool,
    wait: WaitStrategy,
    stage: Mutex<PipelineStage>,
}

impl<'a> SparsePipeline<'a> {
    /// Pipeline over shared runtime state
    pub fn new(registry: &'a ChunkRegistry, cache: &'a ChunkCache, pool: &'a WorkerPool, wait: WaitStrategy) -> Self {
        Self {
            registry,
            cache,
            pool,
            wait,
            stage: Mutex::new(PipelineStage::Idle),
        }
    }

    /// Last stage reached
    pub fn stage(&self) -> PipelineStage {
        *self.stage.lock()
    }

    fn advance(&self, stage: PipelineStage) {
        trace!(%stage, "pipeline stage");
        *self.stage.lock() = stage;
    }

    /// `output[t, u] = W[u] · input[t]` for every unit `gate` marks active.
    ///
    /// `input` is `[nr1, cols]`, `output` is `[nr1, nr0]`, row-major. Inactive
    /// units are written as exactly 0. The workspace must hold the packed
    /// activation plus two `[nr1, nr0]` f32 scratch outputs.
    pub fn forward<G>(
        &self,
        layer: &LayerWeights,
        input: &[f32],
        gate: &G,
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<ForwardStats>
    where
        G: UnitGate + ?Sized,
    {
        self.advance(PipelineStage::Idle);
        let shape = LayerShape::of(self.registry, layer.chunks())?;
        let ne00 = shape.cols;
        let nr0 = shape.nr0;
        if ne00 == 0 || input.is_empty() || input.len() % ne00 != 0 {
            return Err(RuntimeError::dims("pipeline input", ne00, input.len()));
        }
        let nr1 = input.len() / ne00;
        if output.len() != nr0 * nr1 {
            return Err(RuntimeError::dims("pipeline output", nr0 * nr1, output.len()));
        }

        let vec_dot_type = shape.qtype.vec_dot_type()?;
        let dot = dot_kernel(shape.qtype)?;
        let lhs_row_bytes = vec_dot_type.row_size(ne00)?;

        let mut plan = WorkspacePlan::new();
        let lhs_region = plan.reserve::<u8>(nr1 * lhs_row_bytes);
        let hot_region = plan.reserve::<f32>(nr0 * nr1);
        let cold_region = plan.reserve::<f32>(nr0 * nr1);
        let wsize = workspace.wsize();
        let scratch = workspace.bind(&plan)?;
        let lhs = scratch.region(lhs_region);
        let hot_out = scratch.region(hot_region);
        let cold_out = scratch.region(cold_region);

        // Split chunks between the in-place path and the paged path
        let mut stats = ForwardStats {
            nr0,
            nr1,
            ..ForwardStats::default()
        };
        let mut pinned: Vec<Option<ChunkData>> = Vec::with_capacity(layer.chunks().len());
        let mut needed: Vec<(usize, ChunkHandle)> = Vec::new();
        let mut start = 0;
        for (idx, (&handle, &rows)) in layer.chunks().iter().zip(&shape.rows).enumerate() {
            let chunk = self.registry.get(handle)?;
            let active = (start..start + rows)
                .map(|u| (0..nr1).filter(|&t| gate.is_active(t, u)).count())
                .sum::<usize>();
            stats.active += active;
            start += rows;

            match &chunk.placement {
                Placement::Pinned(buffer) => {
                    pinned.push(Some(ChunkData::new(buffer.clone(), &chunk.descriptor)));
                }
                Placement::Offloaded => {
                    pinned.push(None);
                    if active > 0 {
                        needed.push((idx, handle));
                    } else {
                        stats.skipped_chunks += 1;
                    }
                }
            }
        }
        stats.resolved_chunks = needed.len();
        let hot_rows = LayerRows::new(&shape.rows, pinned.iter().map(Option::as_ref).collect())?;
        let needed_handles: Vec<ChunkHandle> = needed.iter().map(|(_, h)| *h).collect();

        let nth = self.pool.num_threads();
        let chunk_plan = ChunkPlan::new(nr0, nr1, nth);
        let barrier = SpinBarrier::new(nth, self.wait);
        let leader = TestAndSetGate::new();
        let resolved: OnceLock<Vec<ChunkData>> = OnceLock::new();
        let failure = FirstError::default();
        let hot_cursor = ChunkCursor::new(nth);
        let cold_cursor = ChunkCursor::new(nth);
        let dst = SharedSlice::new(output);

        self.advance(PipelineStage::LhsPack);
        self.pool.run(|ith, nth| {
            let params = ComputeParam::new(ith, nth, wsize, Some(&barrier));

            if let Err(err) = pack_rows(&params, input, ne00, vec_dot_type, &lhs) {
                failure.record(err);
            }
            if params.sync() {
                self.advance(PipelineStage::RhsResolve);
            }
            if failure.is_set() {
                params.sync();
                params.sync();
                return;
            }
            // Safety: packing finished at the barrier above; lhs is read-only from here.
            let lhs_bytes = unsafe { lhs.slice(0..lhs.len()) };

            if !needed_handles.is_empty() && leader.try_claim() {
                match self.cache.resolve(self.registry, &needed_handles) {
                    Ok(data) => {
                        let _ = resolved.set(data);
                    }
                    Err(err) => failure.record(err),
                }
            }

            let hot = SparseMatmul {
                rows: &hot_rows,
                gate,
                lhs: lhs_bytes,
                lhs_row_bytes,
                ne00,
                dot,
                plan: chunk_plan,
            };
            hot.compute(&params, &hot_cursor, &hot_out);
            if params.sync() {
                self.advance(PipelineStage::Matmul);
            }

            if !needed.is_empty() && !failure.is_set() {
                let mut slots: Vec<Option<&ChunkData>> = vec![None; shape.rows.len()];
                if let Some(data) = resolved.get() {
                    for ((idx, _), chunk) in needed.iter().zip(data) {
                        slots[*idx] = Some(chunk);
                    }
                }
                match LayerRows::new(&shape.rows, slots) {
                    Ok(cold_rows) => {
                        let cold = SparseMatmul {
                            rows: &cold_rows,
                            gate,
                            lhs: lhs_bytes,
                            lhs_row_bytes,
                            ne00,
                            dot,
                            plan: chunk_plan,
                        };
                        cold.compute(&params, &cold_cursor, &cold_out);
                    }
                    Err(err) => failure.record(err),
                }
            }
            if params.sync() {
                self.advance(PipelineStage::Accumulate);
            }
            if failure.is_set() {
                return;
            }

            let range = params.distribute(nr0 * nr1, CACHE_LINE_SIZE / std::mem::size_of::<f32>());
            // Safety: products finished at the barrier above; each worker owns `range`.
            let (out, hot) = unsafe { (dst.slice_mut(range.clone()), hot_out.slice(range.clone())) };
            if needed.is_empty() {
                out.copy_from_slice(hot);
            } else {
                let cold = unsafe { cold_out.slice(range) };
                for ((o, h), c) in out.iter_mut().zip(hot).zip(cold) {
                    *o = h + c;
                }
            }
        });

        failure.into_result()?;
        self.advance(PipelineStage::Done);
        debug!(
            nr0,
            nr1,
            active = stats.active,
            resolved = stats.resolved_chunks,
            skipped = stats.skipped_chunks,
            sparsity = stats.sparsity(),
            "sparse forward done"
        );
        Ok(stats)
    }
}

impl fmt::Debug for SparsePipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparsePipeline")
            .field("stage", &self.stage())
            .field("threads", &self.pool.num_threads())
            .finish()
    }
}
