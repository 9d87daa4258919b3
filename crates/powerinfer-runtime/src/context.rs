//! Runtime context
//!
//! Owns everything a forward pass shares: configuration, the chunk
//! registry, the chunk cache with its paging buffers, the worker pool and
//! the router. One context is built per model and passed to every call.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cache::{CacheStats, ChunkCache};
use crate::chunk::{ChunkDescriptor, ChunkHandle, ChunkRegistry, Residency};
use crate::compute::pipeline::LayerShape;
use crate::compute::{
    CondFfn, DenseFfnWeights, FfnWeights, ForwardStats, FusedFfn, FusedStats, LayerRows, LayerWeights, RmsNorm,
    SparsePipeline, UnitGate, WorkerPool, Workspace,
};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::memory::BackingStore;
use crate::predictor::Predictor;
use crate::router::{ExpertSelection, Router, RouterDecision};

/// Shared state of one loaded model
pub struct RuntimeContext {
    config: RuntimeConfig,
    registry: RwLock<ChunkRegistry>,
    cache: ChunkCache,
    pool: WorkerPool,
    router: Router,
}

impl RuntimeContext {
    /// Build a context paging offloaded chunks from `store`
    pub fn new(config: RuntimeConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        config.validate()?;
        let cache = ChunkCache::new(&config, store)?;
        let pool = WorkerPool::new(config.threads)?;
        let router = Router::new(&config);
        info!(
            threads = pool.num_threads(),
            max_cached = config.cache.max_cached_chunks,
            offload = config.offload_to_disk,
            "runtime context ready"
        );
        Ok(Self {
            config,
            registry: RwLock::new(ChunkRegistry::new()),
            cache,
            pool,
            router,
        })
    }

    /// Build a context paging from a model file
    pub fn open(config: RuntimeConfig, path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened backing store");
        Self::new(config, Arc::new(file))
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Router built from the configuration
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Replace the router, e.g. to enable usage tracking
    pub fn set_router(&mut self, router: Router) {
        self.router = router;
    }

    /// Chunk cache
    pub fn cache(&self) -> &ChunkCache {
        &self.cache
    }

    /// Number of compute workers
    pub fn num_threads(&self) -> usize {
        self.pool.num_threads()
    }

    /// Record a chunk's identity; `resident` bytes pin it in memory
    pub fn register_chunk(&self, descriptor: ChunkDescriptor, resident: Option<&[u8]>) -> Result<ChunkHandle> {
        self.registry.write().register(descriptor, resident)
    }

    /// Handle for a chunk name
    pub fn lookup(&self, name: &str) -> Result<ChunkHandle> {
        self.registry.read().lookup(name)
    }

    /// Matrix made of the named chunks, in row order
    pub fn layer<S: AsRef<str>>(&self, names: &[S]) -> Result<LayerWeights> {
        let registry = self.registry.read();
        let chunks = names
            .iter()
            .map(|n| registry.lookup(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(LayerWeights::new(chunks))
    }

    /// Descriptor of a registered chunk
    pub fn descriptor(&self, handle: ChunkHandle) -> Result<ChunkDescriptor> {
        Ok(self.registry.read().get(handle)?.descriptor.clone())
    }

    /// Current residency of a chunk
    pub fn residency(&self, handle: ChunkHandle) -> Result<Residency> {
        self.cache.residency(&self.registry.read(), handle)
    }

    /// Stage every offloaded chunk into memory when not offloading to disk.
    ///
    /// Returns the number of chunks loaded; 0 when offloading is enabled.
    pub fn load_all_chunks(&self) -> Result<usize> {
        if self.config.offload_to_disk {
            debug!("offloading to disk, chunks stay paged on demand");
            return Ok(0);
        }
        let loaded = self.cache.load_all(&self.registry.read())?;
        info!(loaded, "loaded all weight chunks");
        Ok(loaded)
    }

    /// Score and partition one token's units
    pub fn route(&self, predictor: &dyn Predictor, activation: &[f32]) -> Result<RouterDecision> {
        self.router.route(predictor, activation)
    }

    /// Score and partition a batch of tokens
    pub fn route_batch(&self, predictor: &dyn Predictor, activations: &[f32]) -> Result<Vec<RouterDecision>> {
        self.router.route_batch(predictor, activations)
    }

    /// Select experts for one token
    pub fn route_experts(&self, logits: &[f32]) -> Result<ExpertSelection> {
        self.router.route_experts(logits)
    }

    /// Sparse product of `layer` with `input`, computing only hot units.
    ///
    /// One decision per token; each decision must cover every unit of the layer.
    pub fn sparse_matmul(
        &self,
        layer: &LayerWeights,
        input: &[f32],
        decisions: &[RouterDecision],
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<ForwardStats> {
        let registry = self.registry.read();
        let shape = LayerShape::of(&registry, layer.chunks())?;
        if decisions.len() * shape.cols != input.len() {
            return Err(RuntimeError::dims("router decisions", input.len() / shape.cols.max(1), decisions.len()));
        }
        if let Some(d) = decisions.iter().find(|d| d.num_units() != shape.nr0) {
            return Err(RuntimeError::dims("decision units", shape.nr0, d.num_units()));
        }
        self.pipeline(&registry).forward(layer, input, decisions, output, workspace)
    }

    /// Sparse product with a caller-supplied gate
    pub fn sparse_matmul_with<G>(
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
        let registry = self.registry.read();
        self.pipeline(&registry).forward(layer, input, gate, output, workspace)
    }

    /// Fused sparse FFN over the neurons each token's decision marks hot
    pub fn fused_sparse_ffn(
        &self,
        weights: &FfnWeights,
        input: &[f32],
        decisions: &[RouterDecision],
        residual: Option<&[f32]>,
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats> {
        let registry = self.registry.read();
        let up = LayerShape::of(&registry, weights.up.chunks())?;
        if decisions.len() * up.cols != input.len() {
            return Err(RuntimeError::dims("router decisions", input.len() / up.cols.max(1), decisions.len()));
        }
        if let Some(d) = decisions.iter().find(|d| d.num_units() != up.nr0) {
            return Err(RuntimeError::dims("decision units", up.nr0, d.num_units()));
        }
        self.fused(&registry)
            .ffn(weights, input, decisions, residual, output, workspace)
    }

    /// Fused sparse MoE: weighted sum of each token's selected experts
    pub fn fused_sparse_moe(
        &self,
        experts: &[FfnWeights],
        input: &[f32],
        selections: &[ExpertSelection],
        residual: Option<&[f32]>,
        output: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats> {
        let registry = self.registry.read();
        self.fused(&registry)
            .moe(experts, input, selections, residual, output, workspace)
    }

    /// `residual = input + skip` and `output = norm(residual)` for each row of `ne00`
    #[allow(clippy::too_many_arguments)]
    pub fn post_attn_layernorm(
        &self,
        norm: &RmsNorm<'_>,
        input: &[f32],
        skip: Option<&[f32]>,
        ne00: usize,
        output: &mut [f32],
        residual: &mut [f32],
    ) -> Result<()> {
        crate::compute::norm::post_attn_layernorm(&self.pool, norm, input, skip, ne00, output, residual)
    }

    /// Dense FFN block with its input norm and optional trailing norm
    pub fn dense_ffn(
        &self,
        weights: &DenseFfnWeights,
        input: &[f32],
        skip: Option<&[f32]>,
        output: &mut [f32],
        residual: &mut [f32],
        workspace: &mut Workspace,
    ) -> Result<FusedStats> {
        let registry = self.registry.read();
        CondFfn::new(&registry, &self.cache, &self.pool, self.config.wait)
            .forward(weights, input, skip, output, residual, workspace)
    }

    /// Page in up to `max` of `handles` ahead of use
    pub fn prefetch(&self, handles: &[ChunkHandle], max: usize) -> Result<usize> {
        self.cache.prefetch(&self.registry.read(), handles, max)
    }

    /// Prefetch the chunks of `layer` holding units hot for any token
    pub fn prefetch_predicted(&self, layer: &LayerWeights, decisions: &[RouterDecision], max: usize) -> Result<usize> {
        let registry = self.registry.read();
        let shape = LayerShape::of(&registry, layer.chunks())?;
        let index = LayerRows::new(&shape.rows, vec![None; shape.rows.len()])?;

        let mut wanted = Vec::new();
        for unit in decisions.iter().flat_map(|d| d.hot_units().iter().copied()) {
            if unit >= shape.nr0 {
                continue;
            }
            let handle = layer.chunks()[index.chunk_of(unit)];
            if !wanted.contains(&handle) {
                wanted.push(handle);
            }
        }
        self.cache.prefetch(&registry, &wanted, max)
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn pipeline<'a>(&'a self, registry: &'a ChunkRegistry) -> SparsePipeline<'a> {
        SparsePipeline::new(registry, &self.cache, &self.pool, self.config.wait)
    }

    fn fused<'a>(&'a self, registry: &'a ChunkRegistry) -> FusedFfn<'a> {
        FusedFfn::new(registry, &self.cache, &self.pool, self.config.wait)
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .field("chunks", &self.registry.read().len())
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkId;
    use crate::memory::MemoryStore;
    use crate::compute::AllActive;
    use crate::predictor::LowRankPredictor;
    use crate::quant::{quantize_matrix, QuantType};

    fn context(offload: bool, store: Vec<u8>) -> RuntimeContext {
        let config = RuntimeConfig::default()
            .threads(2)
            .offload_to_disk(offload)
            .disk_buffer_capacity(1 << 16);
        RuntimeContext::new(config, Arc::new(MemoryStore::new(store))).unwrap()
    }

    fn f32_desc(name: &str, unit: u32, rows: usize, offset: u64) -> ChunkDescriptor {
        ChunkDescriptor::new(name, ChunkId::new(0, unit), QuantType::F32, 32, rows, offset).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig::default().max_cached_chunks(0);
        assert!(RuntimeContext::new(config, Arc::new(MemoryStore::new(Vec::new()))).is_err());
    }

    #[test]
    fn test_load_all_respects_offload_flag() {
        let bytes = quantize_matrix(QuantType::F32, &[0.5; 32 * 4], 32).unwrap();

        let ctx = context(true, bytes.clone());
        let h = ctx.register_chunk(f32_desc("a", 0, 4, 0), None).unwrap();
        assert_eq!(ctx.load_all_chunks().unwrap(), 0);
        assert_eq!(ctx.residency(h).unwrap(), Residency::Cold);

        let ctx = context(false, bytes);
        let h = ctx.register_chunk(f32_desc("a", 0, 4, 0), None).unwrap();
        assert_eq!(ctx.load_all_chunks().unwrap(), 1);
        assert_eq!(ctx.residency(h).unwrap(), Residency::Resident);
    }

    #[test]
    fn test_unknown_chunk_is_fatal() {
        let ctx = context(true, Vec::new());
        ctx.register_chunk(f32_desc("a", 0, 4, 0), Some(&[0u8; 512][..])).unwrap();
        let err = ctx.layer(&["a", "missing"]).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownChunk(ref n) if n == "missing"));
    }

    #[test]
    fn test_decisions_must_match_tokens() {
        let ctx = context(true, Vec::new());
        ctx.register_chunk(f32_desc("a", 0, 4, 0), Some(&[0u8; 512][..])).unwrap();
        let layer = ctx.layer(&["a"]).unwrap();
        let mut out = vec![0.0; 8];
        let mut ws = Workspace::new(1 << 12).unwrap();
        let decisions = vec![RouterDecision::dense(4)];
        let err = ctx
            .sparse_matmul(&layer, &[0.0; 64], &decisions, &mut out, &mut ws)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_empty_chunk_shape_never_reaches_compute() {
        let ctx = context(true, Vec::new());
        let mut zero_cols = f32_desc("z", 0, 4, 0);
        zero_cols.ne[0] = 0;
        assert!(matches!(
            ctx.register_chunk(zero_cols, None),
            Err(RuntimeError::Precondition(_))
        ));
        assert!(matches!(ctx.lookup("z"), Err(RuntimeError::UnknownChunk(_))));

        ctx.register_chunk(f32_desc("a", 0, 4, 0), Some(&[0u8; 512][..])).unwrap();
        let layer = ctx.layer(&["a"]).unwrap();
        let mut out = vec![0.0; 4];
        let mut ws = Workspace::new(1 << 12).unwrap();
        let err = ctx
            .sparse_matmul_with(&layer, &[], &AllActive, &mut out, &mut ws)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::DimensionMismatch { .. }));
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_route_then_prefetch() {
        let store = quantize_matrix(QuantType::F32, &[1.0; 32 * 8], 32).unwrap();
        let ctx = context(true, store);
        ctx.register_chunk(f32_desc("lo", 0, 4, 0), None).unwrap();
        ctx.register_chunk(f32_desc("hi", 1, 4, 512), None).unwrap();
        let layer = ctx.layer(&["lo", "hi"]).unwrap();

        let predictor = LowRankPredictor::random(32, 8, 4, 3);
        let decision = ctx.route(&predictor, &[0.25; 32]).unwrap();
        assert!(!decision.hot_units().is_empty());

        let hot_only_hi = RouterDecision::from_hot_units(8, &[5, 6]).unwrap();
        assert_eq!(ctx.prefetch_predicted(&layer, &[hot_only_hi], 8).unwrap(), 1);
        assert_eq!(ctx.residency(layer.chunks()[1]).unwrap(), Residency::Resident);
        assert_eq!(ctx.residency(layer.chunks()[0]).unwrap(), Residency::Cold);
        assert_eq!(ctx.cache_stats().prefetched, 1);
    }
}
