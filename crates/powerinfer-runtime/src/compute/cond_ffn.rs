//! Dense feed-forward block fused with its surrounding norms
//!
//! One dispatch runs the whole block for every token:
//!
//! 1. `r = input + skip`, `x = norm(r) * ffn_norm`
//! 2. `h = silu(gate · x) * (up · x)`
//! 3. `y = down · h`, with `down` in its natural `[d_model, d_ff]` layout
//! 4. `residual = r + y`, and `output = norm(residual) * output_norm` when a
//!    trailing norm is configured, `y` otherwise
//!
//! All weight chunks are made readable by one worker while the others
//! normalize their rows; the products then tile over `(rows, tokens)`.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::debug;

use crate::cache::ChunkCache;
use crate::chunk::{ChunkData, ChunkHandle, ChunkRegistry};
use crate::compute::chunking::{ChunkCursor, ChunkPlan};
use crate::compute::fused_ffn::{bind_rows, token_count, FfnActivation, FusedStats};
use crate::compute::norm::RmsNorm;
use crate::compute::param::{ComputeParam, WorkerPool};
use crate::compute::pipeline::{FirstError, LayerShape, LayerWeights};
use crate::compute::sparse_matmul::{pack_rows, LayerRows};
use crate::compute::workspace::{SharedSlice, Workspace, WorkspacePlan};
use crate::config::WaitStrategy;
use crate::error::{Result, RuntimeError};
use crate::quant::{dot_kernel, DotFn};
use crate::sync::{SpinBarrier, TestAndSetGate};

/// Weights of one dense gated feed-forward block and its norms
#[derive(Debug, Clone)]
pub struct DenseFfnWeights {
    /// Up projection, `[d_ff, d_model]`
    pub up: LayerWeights,
    /// Gate projection, `[d_ff, d_model]`, same type as `up`
    pub gate: LayerWeights,
    /// Down projection, `[d_model, d_ff]`
    pub down: LayerWeights,
    /// Weight of the input norm, `[d_model]`
    pub ffn_norm: Option<Vec<f32>>,
    /// Weight of the trailing norm, `[d_model]`. The trailing norm runs only when set.
    pub output_norm: Option<Vec<f32>>,
    /// Epsilon of both norms
    pub eps: f32,
}

#[derive(Debug)]
struct DenseLayout {
    d_model: usize,
    d_ff: usize,
    up: LayerShape,
    gate: LayerShape,
    down: LayerShape,
}

impl DenseLayout {
    fn of(registry: &ChunkRegistry, ffn: &DenseFfnWeights) -> Result<Self> {
        let up = LayerShape::of(registry, ffn.up.chunks())?;
        let gate = LayerShape::of(registry, ffn.gate.chunks())?;
        let down = LayerShape::of(registry, ffn.down.chunks())?;
        let (d_model, d_ff) = (up.cols, up.nr0);

        if gate.qtype != up.qtype {
            return Err(RuntimeError::Precondition(format!(
                "gate is {} but up is {}",
                gate.qtype, up.qtype
            )));
        }
        if gate.cols != d_model {
            return Err(RuntimeError::dims("ffn gate columns", d_model, gate.cols));
        }
        if gate.nr0 != d_ff {
            return Err(RuntimeError::dims("ffn gate rows", d_ff, gate.nr0));
        }
        if down.cols != d_ff {
            return Err(RuntimeError::dims("ffn down columns", d_ff, down.cols));
        }
        if down.nr0 != d_model {
            return Err(RuntimeError::dims("ffn down rows", d_model, down.nr0));
        }
        Ok(Self {
            d_model,
            d_ff,
            up,
            gate,
            down,
        })
    }
}

fn missing(what: &str, unit: usize) -> RuntimeError {
    RuntimeError::Precondition(format!("{} row {} is not resident", what, unit))
}

/// Dense FFN over shared runtime state
pub struct CondFfn<'a> {
    registry: &'a ChunkRegistry,
    cache: &'a ChunkCache,
    pool: &'a WorkerPool,
    wait: WaitStrategy,
}

impl<'a> CondFfn<'a> {
    /// Dense FFN over shared runtime state
    pub fn new(registry: &'a ChunkRegistry, cache: &'a ChunkCache, pool: &'a WorkerPool, wait: WaitStrategy) -> Self {
        Self {
            registry,
            cache,
            pool,
            wait,
        }
    }

    /// Run the block for every token of `input`
    ///
    /// `output` and `residual` are only written when the call succeeds.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        weights: &DenseFfnWeights,
        input: &[f32],
        skip: Option<&[f32]>,
        output: &mut [f32],
        residual: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats> {
        let layout = DenseLayout::of(self.registry, weights)?;
        let (d_model, d_ff) = (layout.d_model, layout.d_ff);
        let input_norm = RmsNorm::new(weights.eps).with_weight(weights.ffn_norm.as_deref());
        input_norm.check(d_model)?;
        let output_norm = weights
            .output_norm
            .as_deref()
            .map(|w| RmsNorm::new(weights.eps).with_weight(Some(w)));
        if let Some(norm) = &output_norm {
            norm.check(d_model)?;
        }

        let nr1 = token_count(input, d_model)?;
        let total = nr1 * d_model;
        if let Some(s) = skip {
            if s.len() != total {
                return Err(RuntimeError::dims("ffn skip", total, s.len()));
            }
        }
        if output.len() != total {
            return Err(RuntimeError::dims("ffn output", total, output.len()));
        }
        if residual.len() != total {
            return Err(RuntimeError::dims("ffn residual", total, residual.len()));
        }

        let x_type = layout.up.qtype.vec_dot_type()?;
        let h_type = layout.down.qtype.vec_dot_type()?;
        let up_dot: DotFn = dot_kernel(layout.up.qtype)?;
        let down_dot: DotFn = dot_kernel(layout.down.qtype)?;
        let x_row = x_type.row_size(d_model)?;
        let h_row = h_type.row_size(d_ff)?;
        let nth = self.pool.num_threads();

        let mut plan = WorkspacePlan::new();
        let norm_region = plan.reserve::<f32>(total);
        let skip_region = plan.reserve::<f32>(total);
        let x_region = plan.reserve::<u8>(nr1 * x_row);
        let h_region = plan.reserve::<f32>(nr1 * d_ff);
        let hq_region = plan.reserve::<u8>(nr1 * h_row);
        let y_region = plan.reserve::<f32>(total);
        let wsize = workspace.wsize();
        let scratch = workspace.bind(&plan)?;
        let normed = scratch.region(norm_region);
        let summed = scratch.region(skip_region);
        let x_q = scratch.region(x_region);
        let h_buf = scratch.region(h_region);
        let h_q = scratch.region(hq_region);
        let y_buf = scratch.region(y_region);

        let mut handles: Vec<ChunkHandle> = Vec::new();
        for layer in [&weights.up, &weights.gate, &weights.down] {
            for &h in layer.chunks() {
                if !handles.contains(&h) {
                    handles.push(h);
                }
            }
        }
        let stats = FusedStats {
            tokens: nr1,
            neurons: nr1 * d_ff,
            chunks: handles.len(),
        };

        let up_plan = ChunkPlan::new(d_ff, nr1, nth);
        let down_plan = ChunkPlan::new(d_model, nr1, nth);
        let barrier = SpinBarrier::new(nth, self.wait);
        let leader = TestAndSetGate::new();
        let resolved: OnceLock<HashMap<ChunkHandle, ChunkData>> = OnceLock::new();
        let failure = FirstError::default();
        let up_cursor = ChunkCursor::new(nth);
        let down_cursor = ChunkCursor::new(nth);
        let out_dst = SharedSlice::new(output);
        let res_dst = SharedSlice::new(residual);
        let lookup = |h: &ChunkHandle| resolved.get().and_then(|r| r.get(h));
        let (handles, layout) = (&handles, &layout);

        self.pool.run(|ith, nth| {
            let params = ComputeParam::new(ith, nth, wsize, Some(&barrier));

            if leader.try_claim() {
                match self.cache.resolve(self.registry, handles) {
                    Ok(data) => {
                        let _ = resolved.set(handles.iter().copied().zip(data).collect());
                    }
                    Err(err) => failure.record(err),
                }
            }
            input_norm.forward_rows(&params, input, skip, d_model, &normed, &summed);
            params.sync();

            if !failure.is_set() {
                // Safety: every norm row was written before the barrier above.
                let x = unsafe { normed.slice(0..total) };
                if let Err(err) = pack_rows(&params, x, d_model, x_type, &x_q) {
                    failure.record(err);
                }
            }
            params.sync();

            if !failure.is_set() {
                let rows = bind_rows(&weights.up, &layout.up, &lookup)
                    .and_then(|up| Ok((up, bind_rows(&weights.gate, &layout.gate, &lookup)?)));
                match rows {
                    Ok((up, gate)) => {
                        // Safety: packing finished at the barrier above.
                        let x = unsafe { x_q.slice(0..x_q.len()) };
                        up_cursor.for_each(ith, up_plan.num_chunks(), |idx| {
                            let (units, tokens) = up_plan.chunk_range(idx);
                            if let Err(err) = gated_tile(&up, &gate, up_dot, d_model, x, x_row, units, tokens, |t, u, h| {
                                // Safety: each (token, unit) belongs to exactly one tile.
                                unsafe { h_buf.write(t * d_ff + u, h) }
                            }) {
                                failure.record(err);
                            }
                        });
                    }
                    Err(err) => failure.record(err),
                }
            }
            params.sync();

            if !failure.is_set() {
                // Safety: every hidden activation was written before the barrier above.
                let h = unsafe { h_buf.slice(0..nr1 * d_ff) };
                if let Err(err) = pack_rows(&params, h, d_ff, h_type, &h_q) {
                    failure.record(err);
                }
            }
            params.sync();

            if !failure.is_set() {
                match bind_rows(&weights.down, &layout.down, &lookup) {
                    Ok(down) => {
                        // Safety: packing finished at the barrier above.
                        let h = unsafe { h_q.slice(0..h_q.len()) };
                        down_cursor.for_each(ith, down_plan.num_chunks(), |idx| {
                            let (units, tokens) = down_plan.chunk_range(idx);
                            if let Err(err) = down_tile(&down, down_dot, d_ff, h, h_row, units, tokens, |t, e, y| {
                                // Safety: each (token, row) belongs to exactly one tile.
                                unsafe { y_buf.write(t * d_model + e, y) }
                            }) {
                                failure.record(err);
                            }
                        });
                    }
                    Err(err) => failure.record(err),
                }
            }
            params.sync();
            if failure.is_set() {
                return;
            }

            for t in (ith..nr1).step_by(nth) {
                let cols = t * d_model..(t + 1) * d_model;
                // Safety: all phases are done; token rows are strided by worker index.
                let (r, y) = unsafe { (summed.slice(cols.clone()), y_buf.slice(cols.clone())) };
                let res = unsafe { res_dst.slice_mut(cols.clone()) };
                for ((o, r), y) in res.iter_mut().zip(r).zip(y) {
                    *o = r + y;
                }
                let out = unsafe { out_dst.slice_mut(cols) };
                match &output_norm {
                    Some(norm) => {
                        out.copy_from_slice(res);
                        norm.apply_row(out);
                    }
                    None => out.copy_from_slice(y),
                }
            }
        });

        failure.into_result()?;
        debug!(
            tokens = stats.tokens,
            d_ff,
            chunks = stats.chunks,
            trailing_norm = weights.output_norm.is_some(),
            "dense ffn done"
        );
        Ok(stats)
    }
}

/// `h = silu(gate · x) * (up · x)` for one tile of units and tokens
#[allow(clippy::too_many_arguments)]
fn gated_tile<W>(
    up: &LayerRows<'_>,
    gate: &LayerRows<'_>,
    dot: DotFn,
    d_model: usize,
    x: &[u8],
    x_row: usize,
    units: std::ops::Range<usize>,
    tokens: std::ops::Range<usize>,
    mut write: W,
) -> Result<()>
where
    W: FnMut(usize, usize, f32),
{
    for t in tokens {
        let xt = &x[t * x_row..(t + 1) * x_row];
        for u in units.clone() {
            let up_row = up.row(u).ok_or_else(|| missing("up", u))?;
            let gate_row = gate.row(u).ok_or_else(|| missing("gate", u))?;
            let h = FfnActivation::Silu.apply(dot(d_model, gate_row, xt)) * dot(d_model, up_row, xt);
            write(t, u, h);
        }
    }
    Ok(())
}

/// `y = down · h` for one tile of output rows and tokens
#[allow(clippy::too_many_arguments)]
fn down_tile<W>(
    down: &LayerRows<'_>,
    dot: DotFn,
    d_ff: usize,
    h: &[u8],
    h_row: usize,
    rows: std::ops::Range<usize>,
    tokens: std::ops::Range<usize>,
    mut write: W,
) -> Result<()>
where
    W: FnMut(usize, usize, f32),
{
    for t in tokens {
        let ht = &h[t * h_row..(t + 1) * h_row];
        for e in rows.clone() {
            let row = down.row(e).ok_or_else(|| missing("down", e))?;
            write(t, e, dot(d_ff, row, ht));
        }
    }
    Ok(())
}

impl std::fmt::Debug for CondFfn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondFfn")
            .field("threads", &self.pool.num_threads())
            .finish()
    }
}
