//! # PowerInfer Runtime
//!
//! Sparse hot/cold weight scheduling for LLM inference on machines whose
//! fast memory cannot hold the whole model.
//!
//! A small predictor scores every neuron (or expert) of a layer from its
//! input. Only the neurons it selects are computed: rows of weight chunks
//! pinned in memory are used in place, rows of offloaded chunks are paged
//! from disk through double-buffered staging into an LRU-bounded cache.
//!
//! ## Key Features
//!
//! - **Index-linked LRU**: arena of list records with generation-checked handles
//! - **Double-buffered paging**: page-aligned reads overlapped with cache installs
//! - **Low-Rank Prediction**: `up · relu(down · x)` neuron scoring, gating for experts
//! - **Sparse matmul**: Q4_0 x Q8_0 tiles with dynamic chunk claiming
//! - **Fused FFN / MoE**: up, gate and down in one pass over active neurons
//! - **Dense FFN**: residual add, RMS norm and gated FFN in one dispatch
//! - **Flat host boundary**: every entry point returns `{error, message}`
//!
//! ## Example
//!
//! ```rust,ignore
//! use powerinfer_runtime::{RuntimeConfig, RuntimeContext, Workspace};
//!
//! let ctx = RuntimeContext::open(RuntimeConfig::default().with_env_overrides()?, "model.bin")?;
//! // register chunks, then per layer:
//! let decisions = ctx.route_batch(&predictor, &input)?;
//! let layer = ctx.layer(&["L0.up"])?;
//! ctx.sparse_matmul(&layer, &input, &decisions, &mut output, &mut workspace)?;
//! ```

pub mod cache;
pub mod chunk;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod memory;
pub mod predictor;
pub mod quant;
pub mod router;
pub mod sync;

pub use cache::{CacheStats, ChunkCache};
pub use chunk::{ChunkData, ChunkDescriptor, ChunkHandle, ChunkId, ChunkRegistry, Placement, Residency, WeightChunk};
pub use compute::{
    DenseFfnWeights, FfnActivation, FfnWeights, ForwardStats, FusedStats, LayerWeights, PipelineStage, RmsNorm,
    SparsePipeline, UnitGate, WorkerPool, Workspace,
};
pub use config::{
    CacheConfig, DiskBufferConfig, ExpertRoutingConfig, GateNormalization, RuntimeConfig, SparsityConfig, WaitStrategy,
};
pub use context::RuntimeContext;
pub use error::{ErrorKind, PowerInferError, Result, RuntimeError};
pub use host::{
    host_ffn_cond, host_fused_sparse_ffn, host_fused_sparse_moe, host_load_all_chunks, host_post_attn_layernorm,
    host_prefetch, host_register_chunk, host_sparse_matmul, ChunkRegistration, DenseFfnChunks, FfnChunks,
};
pub use memory::{AlignedBuffer, BackingStore, DiskBuffer, MemoryStore};
pub use predictor::{GatingPredictor, LowRankPredictor, Predictor};
pub use quant::QuantType;
pub use router::{ExpertSelection, Router, RouterDecision, UnitClass};
