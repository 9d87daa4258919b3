//! Fused sparse feed-forward and mixture-of-experts
//!
//! Instead of three separate products, each active `(token, neuron)` pair is
//! evaluated end to end: the up (and gate) row dot products give a scalar
//! activation that scales the matching row of the transposed down matrix,
//! which is accumulated into a per-worker partial output. Partials are
//! reduced into the caller's buffer at the end, plus an optional residual.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::ChunkCache;
use crate::chunk::{ChunkData, ChunkHandle, ChunkRegistry, Placement};
use crate::compute::chunking::ChunkCursor;
use crate::compute::param::{ComputeParam, WorkerPool};
use crate::compute::pipeline::{FirstError, LayerShape, LayerWeights};
use crate::compute::sparse_matmul::{pack_rows, LayerRows, UnitGate};
use crate::compute::workspace::{SharedSlice, Workspace, WorkspacePlan};
use crate::config::{WaitStrategy, CACHE_LINE_SIZE};
use crate::error::{Result, RuntimeError};
use crate::quant::{axpy, dequantize_row, dot_kernel, DotFn, QuantType};
use crate::router::ExpertSelection;
use crate::sync::{SpinBarrier, TestAndSetGate};

/// Work items claimed per cursor step
const ITEM_BLOCK: usize = 16;

/// Nonlinearity applied to the up (or gate) projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfnActivation {
    /// `max(0, x)`
    #[default]
    Relu,
    /// `x * sigmoid(x)`
    Silu,
}

impl FfnActivation {
    /// Apply to one value
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            FfnActivation::Relu => x.max(0.0),
            FfnActivation::Silu => x / (1.0 + (-x).exp()),
        }
    }
}

/// Weights of one feed-forward block
///
/// `up` and `gate` are `[d_ff, d_model]`. `down` is stored transposed, also
/// `[d_ff, d_model]`, so that neuron `i` owns row `i` of every matrix.
#[derive(Debug, Clone)]
pub struct FfnWeights {
    /// Up projection
    pub up: LayerWeights,
    /// Optional gate projection; `act(gate) * up` when present, `act(up)` otherwise
    pub gate: Option<LayerWeights>,
    /// Transposed down projection
    pub down: LayerWeights,
    /// Optional bias added to the up projection, `[d_ff]`
    pub up_bias: Option<Vec<f32>>,
    /// Nonlinearity
    pub activation: FfnActivation,
}

/// Counters of one fused call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedStats {
    /// Tokens
    pub tokens: usize,
    /// Neurons evaluated across all tokens and experts
    pub neurons: usize,
    /// Chunks made readable for the call
    pub chunks: usize,
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    token: usize,
    ffn: usize,
    unit: usize,
    scale: f32,
}

#[derive(Debug)]
struct FfnLayout {
    d_ff: usize,
    up: LayerShape,
    gate: Option<LayerShape>,
    down: LayerShape,
}

impl FfnLayout {
    fn of(registry: &ChunkRegistry, ffn: &FfnWeights, d_model: usize) -> Result<Self> {
        let up = LayerShape::of(registry, ffn.up.chunks())?;
        let down = LayerShape::of(registry, ffn.down.chunks())?;
        let gate = ffn
            .gate
            .as_ref()
            .map(|g| LayerShape::of(registry, g.chunks()))
            .transpose()?;

        if up.cols != d_model {
            return Err(RuntimeError::dims("ffn up columns", d_model, up.cols));
        }
        if down.cols != d_model {
            return Err(RuntimeError::dims("ffn down columns", d_model, down.cols));
        }
        if down.nr0 != up.nr0 {
            return Err(RuntimeError::dims("ffn down rows", up.nr0, down.nr0));
        }
        if let Some(g) = &gate {
            if g.qtype != up.qtype {
                return Err(RuntimeError::Precondition(format!(
                    "gate is {} but up is {}",
                    g.qtype, up.qtype
                )));
            }
            if g.nr0 != up.nr0 || g.cols != up.cols {
                return Err(RuntimeError::dims("ffn gate rows", up.nr0, g.nr0));
            }
        }
        if let Some(bias) = &ffn.up_bias {
            if bias.len() != up.nr0 {
                return Err(RuntimeError::dims("ffn up bias", up.nr0, bias.len()));
            }
        }
        Ok(Self {
            d_ff: up.nr0,
            up,
            gate,
            down,
        })
    }
}

/// Rows of one FFN made readable for a compute phase
struct FfnRows<'a> {
    up: LayerRows<'a>,
    gate: Option<LayerRows<'a>>,
    down: LayerRows<'a>,
    bias: Option<&'a [f32]>,
    activation: FfnActivation,
    down_qtype: QuantType,
}

pub(crate) fn bind_rows<'a, F>(weights: &LayerWeights, shape: &LayerShape, lookup: &F) -> Result<LayerRows<'a>>
where
    F: Fn(&ChunkHandle) -> Option<&'a ChunkData>,
{
    let chunks = weights.chunks().iter().map(lookup).collect();
    LayerRows::new(&shape.rows, chunks)
}

fn bind_ffn_rows<'a, F>(ffns: &[&'a FfnWeights], layouts: &[FfnLayout], lookup: &F) -> Result<Vec<FfnRows<'a>>>
where
    F: Fn(&ChunkHandle) -> Option<&'a ChunkData>,
{
    ffns.iter()
        .zip(layouts)
        .map(|(ffn, layout)| {
            Ok(FfnRows {
                up: bind_rows(&ffn.up, &layout.up, lookup)?,
                gate: match (&ffn.gate, &layout.gate) {
                    (Some(g), Some(gs)) => Some(bind_rows(g, gs, lookup)?),
                    _ => None,
                },
                down: bind_rows(&ffn.down, &layout.down, lookup)?,
                bias: ffn.up_bias.as_deref(),
                activation: ffn.activation,
                down_qtype: layout.down.qtype,
            })
        })
        .collect()
}

/// Which chunk of each projection holds a given neuron
struct FfnIndex {
    up: LayerRows<'static>,
    gate: Option<LayerRows<'static>>,
    down: LayerRows<'static>,
}

impl FfnIndex {
    fn of(layout: &FfnLayout) -> Result<Self> {
        let index = |shape: &LayerShape| LayerRows::new(&shape.rows, vec![None; shape.rows.len()]);
        Ok(Self {
            up: index(&layout.up)?,
            gate: layout.gate.as_ref().map(index).transpose()?,
            down: index(&layout.down)?,
        })
    }

    fn chunks_of(&self, ffn: &FfnWeights, unit: usize, out: &mut Vec<ChunkHandle>) {
        out.push(ffn.up.chunks()[self.up.chunk_of(unit)]);
        if let (Some(g), Some(index)) = (&ffn.gate, &self.gate) {
            out.push(g.chunks()[index.chunk_of(unit)]);
        }
        out.push(ffn.down.chunks()[self.down.chunk_of(unit)]);
    }
}

/// Work items grouped by whether their rows must be paged in
struct ItemSplit {
    /// Every row of the item is in a pinned chunk
    hot: Vec<WorkItem>,
    /// At least one row of the item is in an offloaded chunk
    cold: Vec<WorkItem>,
    pinned: HashMap<ChunkHandle, ChunkData>,
    offloaded: Vec<ChunkHandle>,
}

impl ItemSplit {
    fn of(registry: &ChunkRegistry, ffns: &[&FfnWeights], layouts: &[FfnLayout], items: Vec<WorkItem>) -> Result<Self> {
        let indices = layouts.iter().map(FfnIndex::of).collect::<Result<Vec<_>>>()?;
        let mut split = Self {
            hot: Vec::new(),
            cold: Vec::new(),
            pinned: HashMap::new(),
            offloaded: Vec::new(),
        };
        let mut touched = Vec::with_capacity(3);
        for item in items {
            touched.clear();
            indices[item.ffn].chunks_of(ffns[item.ffn], item.unit, &mut touched);
            let mut paged = false;
            for &handle in &touched {
                if split.pinned.contains_key(&handle) {
                    continue;
                }
                if split.offloaded.contains(&handle) {
                    paged = true;
                    continue;
                }
                let chunk = registry.get(handle)?;
                match &chunk.placement {
                    Placement::Pinned(buffer) => {
                        split.pinned.insert(handle, ChunkData::new(buffer.clone(), &chunk.descriptor));
                    }
                    Placement::Offloaded => {
                        split.offloaded.push(handle);
                        paged = true;
                    }
                }
            }
            if paged {
                split.cold.push(item);
            } else {
                split.hot.push(item);
            }
        }
        Ok(split)
    }
}

/// Fused FFN and MoE over shared runtime state
pub struct FusedFfn<'a> {
    registry: &'a ChunkRegistry,
    cache: &'a ChunkCache,
    pool: &'a WorkerPool,
    wait: WaitStrategy,
}

impl<'a> FusedFfn<'a> {
    /// Fused kernels over shared runtime state
    pub fn new(registry: &'a ChunkRegistry, cache: &'a ChunkCache, pool: &'a WorkerPool, wait: WaitStrategy) -> Self {
        Self {
            registry,
            cache,
            pool,
            wait,
        }
    }

    /// `output[t] = residual[t] + down · h_t`, evaluating only the neurons
    /// `gate` marks active for token `t`.
    pub fn ffn<G>(
        &self,
        weights: &FfnWeights,
        input: &[f32],
        gate: &G,
        residual: Option<&[f32]>,
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats>
    where
        G: UnitGate + ?Sized,
    {
        let d_model = LayerShape::of(self.registry, weights.up.chunks())?.cols;
        let layout = FfnLayout::of(self.registry, weights, d_model)?;
        let nr1 = token_count(input, d_model)?;

        let mut items = Vec::new();
        for token in 0..nr1 {
            for unit in 0..layout.d_ff {
                if gate.is_active(token, unit) {
                    items.push(WorkItem {
                        token,
                        ffn: 0,
                        unit,
                        scale: 1.0,
                    });
                }
            }
        }
        self.run(&[weights], &[layout], items, input, d_model, residual, output, workspace)
    }

    /// `output[t] = residual[t] + sum_e w_e * FFN_e(input[t])` over the experts
    /// selected for each token.
    pub fn moe(
        &self,
        experts: &[FfnWeights],
        input: &[f32],
        selections: &[ExpertSelection],
        residual: Option<&[f32]>,
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats> {
        let first = experts
            .first()
            .ok_or_else(|| RuntimeError::Precondition("no experts".to_string()))?;
        let d_model = LayerShape::of(self.registry, first.up.chunks())?.cols;
        let layouts = experts
            .iter()
            .map(|e| FfnLayout::of(self.registry, e, d_model))
            .collect::<Result<Vec<_>>>()?;
        if let Some(other) = layouts.iter().find(|l| l.up.qtype != layouts[0].up.qtype) {
            return Err(RuntimeError::Precondition(format!(
                "experts mix {} and {} up projections",
                layouts[0].up.qtype, other.up.qtype
            )));
        }
        let nr1 = token_count(input, d_model)?;
        if selections.len() != nr1 {
            return Err(RuntimeError::dims("expert selections", nr1, selections.len()));
        }

        let mut items = Vec::new();
        for (token, sel) in selections.iter().enumerate() {
            if sel.experts.len() != sel.weights.len() {
                return Err(RuntimeError::dims("expert weights", sel.experts.len(), sel.weights.len()));
            }
            for (&expert, &scale) in sel.experts.iter().zip(&sel.weights) {
                let layout = layouts.get(expert).ok_or_else(|| {
                    RuntimeError::Precondition(format!("expert {} out of range for {} experts", expert, experts.len()))
                })?;
                items.extend((0..layout.d_ff).map(|unit| WorkItem {
                    token,
                    ffn: expert,
                    unit,
                    scale,
                }));
            }
        }
        let ffns: Vec<&FfnWeights> = experts.iter().collect();
        self.run(&ffns, &layouts, items, input, d_model, residual, output, workspace)
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        ffns: &[&FfnWeights],
        layouts: &[FfnLayout],
        items: Vec<WorkItem>,
        input: &[f32],
        d_model: usize,
        residual: Option<&[f32]>,
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats> {
        let nr1 = input.len() / d_model;
        if output.len() != nr1 * d_model {
            return Err(RuntimeError::dims("ffn output", nr1 * d_model, output.len()));
        }
        if let Some(r) = residual {
            if r.len() != output.len() {
                return Err(RuntimeError::dims("ffn residual", output.len(), r.len()));
            }
        }

        let up_qtype = layouts[0].up.qtype;
        let vec_dot_type = up_qtype.vec_dot_type()?;
        let up_dot: DotFn = dot_kernel(up_qtype)?;
        let lhs_row_bytes = vec_dot_type.row_size(d_model)?;
        let nth = self.pool.num_threads();

        let mut plan = WorkspacePlan::new();
        let lhs_region = plan.reserve::<u8>(nr1 * lhs_row_bytes);
        let partial_region = plan.reserve::<f32>(nth * nr1 * d_model);
        let row_region = plan.reserve::<f32>(nth * d_model);
        let wsize = workspace.wsize();
        let scratch = workspace.bind(&plan)?;
        let lhs = scratch.region(lhs_region);
        let partials = scratch.region(partial_region);
        let rows_scratch = scratch.region(row_region);

        let neurons = items.len();
        let split = ItemSplit::of(self.registry, ffns, layouts, items)?;
        let stats = FusedStats {
            tokens: nr1,
            neurons,
            chunks: split.pinned.len() + split.offloaded.len(),
        };
        let hot_rows = bind_ffn_rows(ffns, layouts, &|h: &ChunkHandle| split.pinned.get(h))?;
        let hot_blocks = split.hot.len().div_ceil(ITEM_BLOCK);
        let cold_blocks = split.cold.len().div_ceil(ITEM_BLOCK);

        let barrier = SpinBarrier::new(nth, self.wait);
        let leader = TestAndSetGate::new();
        let resolved: OnceLock<HashMap<ChunkHandle, ChunkData>> = OnceLock::new();
        let failure = FirstError::default();
        let hot_cursor = ChunkCursor::new(nth);
        let cold_cursor = ChunkCursor::new(nth);
        let dst = SharedSlice::new(output);
        let total = nr1 * d_model;
        let split = &split;

        self.pool.run(|ith, nth| {
            let params = ComputeParam::new(ith, nth, wsize, Some(&barrier));
            let kernel = ItemKernel {
                up_dot,
                d_model,
                lhs_row_bytes,
            };

            if let Err(err) = pack_rows(&params, input, d_model, vec_dot_type, &lhs) {
                failure.record(err);
            }
            // Safety: each worker owns partial `ith` and scratch row `ith`.
            let partial = unsafe { partials.slice_mut(ith * total..(ith + 1) * total) };
            let row = unsafe { rows_scratch.slice_mut(ith * d_model..(ith + 1) * d_model) };
            partial.fill(0.0);
            params.sync();
            if failure.is_set() {
                params.sync();
                params.sync();
                return;
            }
            // Safety: packing finished at the barrier above; lhs is read-only from here.
            let lhs_bytes = unsafe { lhs.slice(0..lhs.len()) };

            // The leader pages offloaded chunks while the others work on pinned rows
            if !split.offloaded.is_empty() && leader.try_claim() {
                match self.cache.resolve(self.registry, &split.offloaded) {
                    Ok(data) => {
                        let _ = resolved.set(split.offloaded.iter().copied().zip(data).collect());
                    }
                    Err(err) => failure.record(err),
                }
            }
            hot_cursor.for_each(ith, hot_blocks, |b| {
                let items = &split.hot[b * ITEM_BLOCK..((b + 1) * ITEM_BLOCK).min(split.hot.len())];
                if let Err(err) = kernel.run(&hot_rows, items, lhs_bytes, partial, row) {
                    failure.record(err);
                }
            });
            params.sync();

            if cold_blocks > 0 && !failure.is_set() {
                let lookup = |h: &ChunkHandle| {
                    resolved
                        .get()
                        .and_then(|r| r.get(h))
                        .or_else(|| split.pinned.get(h))
                };
                match bind_ffn_rows(ffns, layouts, &lookup) {
                    Ok(cold_rows) => cold_cursor.for_each(ith, cold_blocks, |b| {
                        let items = &split.cold[b * ITEM_BLOCK..((b + 1) * ITEM_BLOCK).min(split.cold.len())];
                        if let Err(err) = kernel.run(&cold_rows, items, lhs_bytes, partial, row) {
                            failure.record(err);
                        }
                    }),
                    Err(err) => failure.record(err),
                }
            }
            params.sync();
            if failure.is_set() {
                return;
            }

            let range = params.distribute(total, CACHE_LINE_SIZE / std::mem::size_of::<f32>());
            // Safety: every partial is complete; each worker owns `range` of the output.
            let out = unsafe { dst.slice_mut(range.clone()) };
            match residual {
                Some(r) => out.copy_from_slice(&r[range.clone()]),
                None => out.fill(0.0),
            }
            for w in 0..nth {
                let part = unsafe { partials.slice(w * total + range.start..w * total + range.end) };
                for (o, p) in out.iter_mut().zip(part) {
                    *o += p;
                }
            }
        });

        failure.into_result()?;
        debug!(
            tokens = stats.tokens,
            neurons = stats.neurons,
            chunks = stats.chunks,
            hot = split.hot.len(),
            cold = split.cold.len(),
            "fused ffn done"
        );
        Ok(stats)
    }
}

/// Per-item arithmetic shared by the pinned and paged phases
struct ItemKernel {
    up_dot: DotFn,
    d_model: usize,
    lhs_row_bytes: usize,
}

impl ItemKernel {
    fn run(&self, rows: &[FfnRows<'_>], items: &[WorkItem], lhs: &[u8], partial: &mut [f32], row: &mut [f32]) -> Result<()> {
        let d_model = self.d_model;
        let missing = |what: &str, it: &WorkItem| {
            RuntimeError::Precondition(format!("{} row {} of ffn {} is not resident", what, it.unit, it.ffn))
        };

        for it in items {
            let f = &rows[it.ffn];
            let x = &lhs[it.token * self.lhs_row_bytes..(it.token + 1) * self.lhs_row_bytes];

            let up_row = f.up.row(it.unit).ok_or_else(|| missing("up", it))?;
            let mut up = (self.up_dot)(d_model, up_row, x);
            if let Some(bias) = f.bias {
                up += bias[it.unit];
            }
            let h = match &f.gate {
                Some(gate) => {
                    let gate_row = gate.row(it.unit).ok_or_else(|| missing("gate", it))?;
                    f.activation.apply((self.up_dot)(d_model, gate_row, x)) * up
                }
                None => f.activation.apply(up),
            };
            if h == 0.0 {
                continue;
            }

            let down_row = f.down.row(it.unit).ok_or_else(|| missing("down", it))?;
            dequantize_row(f.down_qtype, down_row, row)?;
            axpy(
                &mut partial[it.token * d_model..(it.token + 1) * d_model],
                row,
                h * it.scale,
            );
        }
        Ok(())
    }
}

pub(crate) fn token_count(input: &[f32], d_model: usize) -> Result<usize> {
    if input.is_empty() || d_model == 0 || input.len() % d_model != 0 {
        return Err(RuntimeError::dims("ffn input", d_model, input.len()));
    }
    Ok(input.len() / d_model)
}

impl std::fmt::Debug for FusedFfn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusedFfn")
            .field("threads", &self.pool.num_threads())
            .finish()
    }
}
