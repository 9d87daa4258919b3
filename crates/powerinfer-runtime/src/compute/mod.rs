//! Multi-threaded sparse compute
//!
//! Kernels run on a fixed [`WorkerPool`]; each worker gets a
//! [`ComputeParam`] with its index and shares a barrier with the others.

pub mod chunking;
pub mod cond_ffn;
pub mod fused_ffn;
pub mod norm;
pub mod param;
pub mod pipeline;
pub mod sparse_matmul;
pub mod workspace;

pub use chunking::{distribute_items, ChunkCursor, ChunkPlan, CHUNK_SIZE, CHUNK_SIZE_VECTOR};
pub use cond_ffn::{CondFfn, DenseFfnWeights};
pub use fused_ffn::{FfnActivation, FfnWeights, FusedFfn, FusedStats};
pub use norm::{post_attn_layernorm, RmsNorm, DEFAULT_NORM_EPS};
pub use param::{ComputeParam, WorkerPool};
pub use pipeline::{ForwardStats, LayerWeights, PipelineStage, SparsePipeline};
pub use sparse_matmul::{pack_rows, AllActive, LayerRows, SparseMatmul, ThresholdGate, UnitGate};
pub use workspace::{Region, SharedSlice, Workspace, WorkspacePlan};
