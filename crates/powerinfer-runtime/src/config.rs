//! Runtime configuration
//!
//! One [`RuntimeConfig`] is built at startup and handed to
//! [`RuntimeContext`](crate::RuntimeContext); nothing in the crate reads
//! process-wide mutable state after that.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RuntimeError};

/// Alignment of disk reads and staging buffers
pub const DISK_ALIGNMENT: usize = 4096;

/// Cache line size used for workspace and buffer alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Default capacity of each disk staging slot: 32MB
pub const DEFAULT_DISK_BUFFER_SIZE: usize = 32 * 1024 * 1024;

/// Default number of chunks kept resident by the LRU cache
pub const DEFAULT_MAX_CACHED_CHUNKS: usize = 3 * 64 * 32;

/// Environment variable overriding [`CacheConfig::max_cached_chunks`]
pub const ENV_MAX_CACHED: &str = "MAX_N_CACHED";

/// Environment variable overriding [`RuntimeConfig::threads`]
pub const ENV_THREADS: &str = "POWERINFER_THREADS";

/// How a thread waits on a readiness flag or barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Pure busy spin; for workers pinned to dedicated cores
    Spin,
    /// Spin with `thread::yield_now` between polls
    Yield,
    /// Spin a bounded number of iterations, then block on a condition variable
    SpinThenBlock {
        /// Polls before falling back to blocking
        spin_iterations: u32,
    },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::Yield
    }
}

/// Neuron sparsity configuration for dense (non-expert) layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparsityConfig {
    /// Units scoring strictly above this are hot
    pub threshold: f32,
    /// Minimum number of hot units per token (top-K fallback)
    pub min_active: usize,
}

impl Default for SparsityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            min_active: 1,
        }
    }
}

/// When gate weights are normalized relative to top-K selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateNormalization {
    /// Use raw gate logits of the selected experts
    None,
    /// Softmax over all experts, then pick top-K (weights do not sum to 1)
    SoftmaxBeforeTopK,
    /// Pick top-K by logit, then softmax over the selected logits
    SoftmaxAfterTopK,
    /// Softmax over all experts, pick top-K, then rescale selected weights to sum to 1
    RenormalizeAfterTopK,
}

impl Default for GateNormalization {
    fn default() -> Self {
        GateNormalization::RenormalizeAfterTopK
    }
}

/// Mixture-of-experts routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertRoutingConfig {
    /// Experts selected per token
    pub n_expert_used: usize,
    /// Gate weight normalization policy
    pub normalization: GateNormalization,
}

impl Default for ExpertRoutingConfig {
    fn default() -> Self {
        Self {
            n_expert_used: 2,
            normalization: GateNormalization::default(),
        }
    }
}

/// Chunk residency cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum offloaded chunks held in memory at once
    pub max_cached_chunks: usize,
    /// Maximum chunks fetched by one prefetch request
    pub max_prefetch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cached_chunks: DEFAULT_MAX_CACHED_CHUNKS,
            max_prefetch: 64,
        }
    }
}

/// Disk staging buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskBufferConfig {
    /// Initial capacity of each of the two slots
    pub initial_capacity: usize,
    /// Read alignment; must be a power of two
    pub alignment: usize,
}

impl Default for DiskBufferConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_DISK_BUFFER_SIZE,
            alignment: DISK_ALIGNMENT,
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of compute workers
    pub threads: usize,
    /// Keep offloaded chunks on disk instead of loading them all at startup
    pub offload_to_disk: bool,
    /// Dense-layer sparsity
    pub sparsity: SparsityConfig,
    /// Expert routing
    pub experts: ExpertRoutingConfig,
    /// Residency cache
    pub cache: CacheConfig,
    /// Disk staging buffers
    pub disk: DiskBufferConfig,
    /// Waiting policy for events and barriers
    pub wait: WaitStrategy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            offload_to_disk: true,
            sparsity: SparsityConfig::default(),
            experts: ExpertRoutingConfig::default(),
            cache: CacheConfig::default(),
            disk: DiskBufferConfig::default(),
            wait: WaitStrategy::default(),
        }
    }
}

impl RuntimeConfig {
    /// Set the number of compute workers
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the sparsity threshold and minimum active units
    pub fn sparsity(mut self, threshold: f32, min_active: usize) -> Self {
        self.sparsity = SparsityConfig {
            threshold,
            min_active,
        };
        self
    }

    /// Set the maximum number of cached offloaded chunks
    pub fn max_cached_chunks(mut self, max: usize) -> Self {
        self.cache.max_cached_chunks = max;
        self
    }

    /// Set the wait strategy
    pub fn wait_strategy(mut self, wait: WaitStrategy) -> Self {
        self.wait = wait;
        self
    }

    /// Set whether offloaded chunks stay on disk
    pub fn offload_to_disk(mut self, offload: bool) -> Self {
        self.offload_to_disk = offload;
        self
    }

    /// Set the initial capacity of each disk staging slot
    pub fn disk_buffer_capacity(mut self, capacity: usize) -> Self {
        self.disk.initial_capacity = capacity;
        self
    }

    /// Parse a configuration from JSON; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Apply `MAX_N_CACHED` and `POWERINFER_THREADS` overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_CACHED) {
            let value = parse_usize(ENV_MAX_CACHED, &raw)?;
            debug!(value, "max cached chunks overridden from environment");
            self.cache.max_cached_chunks = value;
        }
        if let Some(raw) = lookup(ENV_THREADS) {
            let value = parse_usize(ENV_THREADS, &raw)?;
            debug!(value, "thread count overridden from environment");
            self.threads = value;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(RuntimeError::Config(
                "Thread count must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_cached_chunks == 0 {
            return Err(RuntimeError::Config(
                "Max cached chunks must be greater than 0".to_string(),
            ));
        }

        if !self.disk.alignment.is_power_of_two() {
            return Err(RuntimeError::Config(
                "Disk alignment must be a power of 2".to_string(),
            ));
        }

        if self.disk.initial_capacity == 0 {
            return Err(RuntimeError::Config(
                "Disk buffer capacity must be greater than 0".to_string(),
            ));
        }

        if self.sparsity.threshold.is_nan() {
            return Err(RuntimeError::Config(
                "Sparsity threshold must not be NaN".to_string(),
            ));
        }

        if self.experts.n_expert_used == 0 {
            return Err(RuntimeError::Config(
                "n_expert_used must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| RuntimeError::Config(format!("{}={:?} is not a count: {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.disk.alignment, DISK_ALIGNMENT);
        assert_eq!(config.cache.max_cached_chunks, DEFAULT_MAX_CACHED_CHUNKS);
        assert_eq!(config.wait, WaitStrategy::Yield);
    }

    #[test]
    fn test_invalid_config() {
        assert!(RuntimeConfig::default().threads(0).validate().is_err());
        assert!(RuntimeConfig::default()
            .max_cached_chunks(0)
            .validate()
            .is_err());

        let mut config = RuntimeConfig::default();
        config.disk.alignment = 3000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_partial_config() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "threads": 3,
                "sparsity": { "threshold": 0.25, "min_active": 8 },
                "wait": { "spin_then_block": { "spin_iterations": 100 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.threads, 3);
        assert_eq!(config.sparsity.min_active, 8);
        assert_eq!(
            config.wait,
            WaitStrategy::SpinThenBlock {
                spin_iterations: 100
            }
        );
        assert_eq!(config.cache.max_cached_chunks, DEFAULT_MAX_CACHED_CHUNKS);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [(ENV_MAX_CACHED, "512"), (ENV_THREADS, " 6 ")]
            .into_iter()
            .collect();

        let config = RuntimeConfig::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cache.max_cached_chunks, 512);
        assert_eq!(config.threads, 6);
    }

    #[test]
    fn test_bad_override() {
        let result = RuntimeConfig::default().with_overrides_from(|k| {
            (k == ENV_MAX_CACHED).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }
}
