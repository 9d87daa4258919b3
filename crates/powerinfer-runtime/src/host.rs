//! Host boundary
//!
//! Entry points for an embedding inference engine. Every call returns a
//! [`PowerInferError`] by value; internal errors are flattened to their
//! message and panics are caught rather than unwound into the host.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, warn};

use crate::chunk::{ChunkDescriptor, ChunkId};
use crate::compute::{DenseFfnWeights, FfnActivation, FfnWeights, RmsNorm, Workspace};
use crate::context::RuntimeContext;
use crate::error::{PowerInferError, Result, RuntimeError};
use crate::quant::QuantType;
use crate::router::{ExpertSelection, RouterDecision};

/// Chunk identity as passed by the host's model loader
#[derive(Debug, Clone)]
pub struct ChunkRegistration<'a> {
    /// Tensor name
    pub name: &'a str,
    /// Layer index
    pub layer: u32,
    /// Unit (slice) index within the layer
    pub unit: u32,
    /// Quantization type tag
    pub qtype: i32,
    /// Shape
    pub ne: [usize; 4],
    /// Byte strides; zeros are filled for a contiguous layout
    pub nb: [usize; 4],
    /// Total bytes
    pub byte_size: usize,
    /// Offset in the model file
    pub file_offset: u64,
    /// Bytes already in memory; pins the chunk
    pub resident: Option<&'a [u8]>,
    /// Optional layout conversion tag
    pub layout_conversion: Option<&'a str>,
}

/// One feed-forward block named by chunk names
#[derive(Debug, Clone)]
pub struct FfnChunks<'a> {
    /// Up projection chunks in row order
    pub up: &'a [&'a str],
    /// Gate projection chunks, if the block is gated
    pub gate: Option<&'a [&'a str]>,
    /// Transposed down projection chunks in row order
    pub down: &'a [&'a str],
    /// Optional up bias
    pub up_bias: Option<&'a [f32]>,
    /// Nonlinearity
    pub activation: FfnActivation,
}

/// Dense FFN block and its norms named by chunk names
#[derive(Debug, Clone)]
pub struct DenseFfnChunks<'a> {
    /// Up projection chunks in row order
    pub up: &'a [&'a str],
    /// Gate projection chunks in row order
    pub gate: &'a [&'a str],
    /// Down projection chunks in row order, `[d_model, d_ff]`
    pub down: &'a [&'a str],
    /// Input norm weight
    pub ffn_norm: Option<&'a [f32]>,
    /// Trailing norm weight; the trailing norm runs only when set
    pub output_norm: Option<&'a [f32]>,
    /// Epsilon of both norms
    pub eps: f32,
}

fn boundary<F>(operation: &'static str, f: F) -> PowerInferError
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => PowerInferError::success(),
        Ok(Err(err)) => {
            warn!(operation, error = %err, "host call failed");
            err.into()
        }
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(operation, %detail, "host call panicked");
            PowerInferError::failure(format!("{} panicked: {}", operation, detail))
        }
    }
}

fn resolve_ffn(ctx: &RuntimeContext, chunks: &FfnChunks<'_>) -> Result<FfnWeights> {
    Ok(FfnWeights {
        up: ctx.layer(chunks.up)?,
        gate: chunks.gate.map(|g| ctx.layer(g)).transpose()?,
        down: ctx.layer(chunks.down)?,
        up_bias: chunks.up_bias.map(<[f32]>::to_vec),
        activation: chunks.activation,
    })
}

fn decisions_from_hot(num_units: usize, hot: &[Vec<usize>]) -> Result<Vec<RouterDecision>> {
    hot.iter()
        .map(|units| RouterDecision::from_hot_units(num_units, units))
        .collect()
}

/// Record a chunk's identity with the runtime
pub fn host_register_chunk(ctx: &RuntimeContext, chunk: &ChunkRegistration<'_>) -> PowerInferError {
    boundary("register_chunk", || {
        let qtype = QuantType::try_from(chunk.qtype)?;
        let descriptor = ChunkDescriptor {
            name: chunk.name.to_string(),
            id: ChunkId::new(chunk.layer, chunk.unit),
            qtype,
            ne: chunk.ne,
            nb: chunk.nb,
            byte_size: chunk.byte_size,
            file_offset: chunk.file_offset,
            layout_conversion: chunk.layout_conversion.map(str::to_string),
        };
        ctx.register_chunk(descriptor, chunk.resident)?;
        Ok(())
    })
}

/// Stage every chunk into memory when the runtime is not offloading
pub fn host_load_all_chunks(ctx: &RuntimeContext) -> PowerInferError {
    boundary("load_all_chunks", || ctx.load_all_chunks().map(|_| ()))
}

/// Sparse product of the named chunks with `input`.
///
/// `hot[t]` lists the units computed for token `t`; all other outputs are 0.
pub fn host_sparse_matmul(
    ctx: &RuntimeContext,
    chunk_names: &[&str],
    input: &[f32],
    hot: &[Vec<usize>],
    output: &mut [f32],
    workspace: &mut Workspace,
) -> PowerInferError {
    boundary("sparse_matmul", || {
        let layer = ctx.layer(chunk_names)?;
        let nr0 = layer
            .chunks()
            .iter()
            .map(|h| ctx.descriptor(*h).map(|d| d.rows()))
            .sum::<Result<usize>>()?;
        let decisions = decisions_from_hot(nr0, hot)?;
        ctx.sparse_matmul(&layer, input, &decisions, output, workspace)?;
        Ok(())
    })
}

/// Fused sparse FFN; `hot[t]` lists the neurons evaluated for token `t`
pub fn host_fused_sparse_ffn(
    ctx: &RuntimeContext,
    ffn: &FfnChunks<'_>,
    input: &[f32],
    hot: &[Vec<usize>],
    residual: Option<&[f32]>,
    output: &mut [f32],
    workspace: &mut Workspace,
) -> PowerInferError {
    boundary("fused_sparse_ffn", || {
        let weights = resolve_ffn(ctx, ffn)?;
        let d_ff = weights
            .up
            .chunks()
            .iter()
            .map(|h| ctx.descriptor(*h).map(|d| d.rows()))
            .sum::<Result<usize>>()?;
        let decisions = decisions_from_hot(d_ff, hot)?;
        ctx.fused_sparse_ffn(&weights, input, &decisions, residual, output, workspace)?;
        Ok(())
    })
}

/// Fused sparse MoE; each token's experts are picked from its gate logits
pub fn host_fused_sparse_moe(
    ctx: &RuntimeContext,
    experts: &[FfnChunks<'_>],
    input: &[f32],
    gate_logits: &[f32],
    residual: Option<&[f32]>,
    output: &mut [f32],
    workspace: &mut Workspace,
) -> PowerInferError {
    boundary("fused_sparse_moe", || {
        if experts.is_empty() || gate_logits.len() % experts.len() != 0 {
            return Err(RuntimeError::dims("gate logits", experts.len(), gate_logits.len()));
        }
        let weights = experts
            .iter()
            .map(|e| resolve_ffn(ctx, e))
            .collect::<Result<Vec<_>>>()?;
        let selections = gate_logits
            .chunks_exact(experts.len())
            .map(|logits| ctx.route_experts(logits))
            .collect::<Result<Vec<ExpertSelection>>>()?;
        ctx.fused_sparse_moe(&weights, input, &selections, residual, output, workspace)?;
        Ok(())
    })
}

/// `residual = input + skip` and `output = norm(residual) * weight + bias` per row
#[allow(clippy::too_many_arguments)]
pub fn host_post_attn_layernorm(
    ctx: &RuntimeContext,
    input: &[f32],
    skip: Option<&[f32]>,
    weight: Option<&[f32]>,
    bias: Option<&[f32]>,
    ne00: usize,
    eps: f32,
    output: &mut [f32],
    residual: &mut [f32],
) -> PowerInferError {
    boundary("post_attn_layernorm", || {
        let norm = RmsNorm::new(eps).with_weight(weight).with_bias(bias);
        ctx.post_attn_layernorm(&norm, input, skip, ne00, output, residual)
    })
}

/// Dense FFN block fused with its norms, over every token of `input`
#[allow(clippy::too_many_arguments)]
pub fn host_ffn_cond(
    ctx: &RuntimeContext,
    ffn: &DenseFfnChunks<'_>,
    input: &[f32],
    skip: Option<&[f32]>,
    output: &mut [f32],
    residual: &mut [f32],
    workspace: &mut Workspace,
) -> PowerInferError {
    boundary("ffn_cond", || {
        let weights = DenseFfnWeights {
            up: ctx.layer(ffn.up)?,
            gate: ctx.layer(ffn.gate)?,
            down: ctx.layer(ffn.down)?,
            ffn_norm: ffn.ffn_norm.map(<[f32]>::to_vec),
            output_norm: ffn.output_norm.map(<[f32]>::to_vec),
            eps: ffn.eps,
        };
        ctx.dense_ffn(&weights, input, skip, output, residual, workspace)?;
        Ok(())
    })
}

/// Page in up to `max` of the named chunks ahead of use
pub fn host_prefetch(ctx: &RuntimeContext, chunk_names: &[&str], max: usize) -> PowerInferError {
    boundary("prefetch", || {
        let layer = ctx.layer(chunk_names)?;
        ctx.prefetch(layer.chunks(), max)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    fn context() -> RuntimeContext {
        let config = RuntimeConfig::default().threads(2).disk_buffer_capacity(1 << 16);
        RuntimeContext::new(config, Arc::new(MemoryStore::new(vec![0u8; 4096]))).unwrap()
    }

    fn registration<'a>(name: &'a str, unit: u32, resident: Option<&'a [u8]>) -> ChunkRegistration<'a> {
        ChunkRegistration {
            name,
            layer: 0,
            unit,
            qtype: QuantType::F32 as i32,
            ne: [32, 4, 1, 1],
            nb: [0; 4],
            byte_size: 512,
            file_offset: 0,
            resident,
            layout_conversion: None,
        }
    }

    #[test]
    fn test_register_and_duplicate() {
        let ctx = context();
        let ok = host_register_chunk(&ctx, &registration("L0.up", 0, None));
        assert!(ok.is_ok());
        assert_eq!(ok.message, "Success");

        let dup = host_register_chunk(&ctx, &registration("L0.up", 1, None));
        assert!(dup.error);
        assert!(dup.message.contains("L0.up"));
    }

    #[test]
    fn test_bad_qtype_tag() {
        let ctx = context();
        let mut reg = registration("x", 0, None);
        reg.qtype = 99;
        assert!(host_register_chunk(&ctx, &reg).error);
    }

    #[test]
    fn test_workspace_too_small_message() {
        let ctx = context();
        let bytes = vec![0u8; 512];
        assert!(host_register_chunk(&ctx, &registration("a", 0, Some(&bytes))).is_ok());

        let mut out = vec![0.0; 4];
        let mut ws = Workspace::new(16).unwrap();
        let status = host_sparse_matmul(&ctx, &["a"], &[1.0; 32], &[vec![0]], &mut out, &mut ws);
        assert!(status.error);
        assert!(status.message.starts_with("The compute buffer is too small"));
    }

    #[test]
    fn test_unknown_chunk_reported() {
        let ctx = context();
        let mut out = vec![0.0; 4];
        let mut ws = Workspace::new(1 << 12).unwrap();
        let status = host_sparse_matmul(&ctx, &["nope"], &[1.0; 32], &[vec![0]], &mut out, &mut ws);
        assert!(status.error);
        assert!(status.message.contains("nope"));

        assert!(host_prefetch(&ctx, &["nope"], 4).error);
    }

    #[test]
    fn test_post_attn_layernorm() {
        let ctx = context();
        let input: Vec<f32> = (0..8).map(|i| i as f32 - 3.0).collect();
        let skip = vec![1.0; 8];
        let mut out = vec![0.0; 8];
        let mut res = vec![0.0; 8];
        let status = host_post_attn_layernorm(&ctx, &input, Some(&skip), None, None, 4, 0.0, &mut out, &mut res);
        assert!(status.is_ok());
        assert_eq!(res, vec![-2.0, -1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        for row in out.chunks(4) {
            let ms = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
            assert!((ms - 1.0).abs() < 1e-5);
        }

        let status = host_post_attn_layernorm(&ctx, &input, None, Some(&[1.0; 3]), None, 4, 0.0, &mut out, &mut res);
        assert!(status.error);
    }

    #[test]
    fn test_ffn_cond_with_zero_weights() {
        let ctx = context();
        let zeros = vec![0u8; 512];
        assert!(host_register_chunk(&ctx, &registration("up", 0, Some(&zeros))).is_ok());
        assert!(host_register_chunk(&ctx, &registration("gate", 1, Some(&zeros))).is_ok());
        let mut down = registration("down", 2, Some(&zeros));
        down.ne = [4, 32, 1, 1];
        assert!(host_register_chunk(&ctx, &down).is_ok());

        let input: Vec<f32> = (0..64).map(|i| ((i % 7) as f32 - 3.0) / 2.0).collect();
        let skip = vec![0.5; 64];
        let norm_weight = vec![2.0; 32];
        let ffn = DenseFfnChunks {
            up: &["up"],
            gate: &["gate"],
            down: &["down"],
            ffn_norm: None,
            output_norm: Some(&norm_weight),
            eps: 1e-6,
        };
        let mut out = vec![f32::NAN; 64];
        let mut res = vec![f32::NAN; 64];
        let mut ws = Workspace::new(1 << 14).unwrap();
        let status = host_ffn_cond(&ctx, &ffn, &input, Some(&skip), &mut out, &mut res, &mut ws);
        assert!(status.is_ok(), "{}", status.message);

        for (r, (x, s)) in res.iter().zip(input.iter().zip(&skip)) {
            assert_eq!(*r, x + s);
        }
        for row in out.chunks(32) {
            let ms = row.iter().map(|v| v * v).sum::<f32>() / 32.0;
            assert!((ms - 4.0).abs() < 1e-3, "{}", ms);
        }

        let mut small = Workspace::new(16).unwrap();
        let status = host_ffn_cond(&ctx, &ffn, &input, Some(&skip), &mut out, &mut res, &mut small);
        assert!(status.message.starts_with("The compute buffer is too small"));
    }

    #[test]
    fn test_panic_is_contained() {
        let status = boundary("test", || panic!("boom"));
        assert!(status.error);
        assert!(status.message.contains("boom"));
    }
}
