//! Hot/cold partitioning of predictor scores
//!
//! Dense layers: a unit is hot when its score is strictly above the
//! threshold; if fewer than `min_active` units pass, the `min_active`
//! highest-scoring units are taken instead. Expert layers: the top
//! `n_expert_used` experts by gate logit, with weights normalized according
//! to [`GateNormalization`]. Ties always go to the lower index.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::config::{ExpertRoutingConfig, GateNormalization, RuntimeConfig, SparsityConfig};
use crate::error::{Result, RuntimeError};
use crate::predictor::Predictor;

/// Hot/cold tag of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitClass {
    /// Selected for computation
    Hot,
    /// Skipped; its output is zero
    Cold,
}

impl fmt::Display for UnitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitClass::Hot => write!(f, "hot"),
            UnitClass::Cold => write!(f, "cold"),
        }
    }
}

/// One token's partition of a layer's units
#[derive(Debug, Clone, PartialEq)]
pub struct RouterDecision {
    scores: Vec<f32>,
    classes: Vec<UnitClass>,
    hot: Vec<usize>,
}

impl RouterDecision {
    /// Decision marking exactly `hot` as hot; scores are 1 for hot units and 0 otherwise
    pub fn from_hot_units(num_units: usize, hot: &[usize]) -> Result<Self> {
        let mut classes = vec![UnitClass::Cold; num_units];
        let mut scores = vec![0.0; num_units];
        for &u in hot {
            if u >= num_units {
                return Err(RuntimeError::Precondition(format!(
                    "hot unit {} out of range for {} units",
                    u, num_units
                )));
            }
            classes[u] = UnitClass::Hot;
            scores[u] = 1.0;
        }
        Ok(Self::from_classes(scores, classes))
    }

    /// Decision with every unit hot
    pub fn dense(num_units: usize) -> Self {
        Self::from_classes(vec![1.0; num_units], vec![UnitClass::Hot; num_units])
    }

    fn from_classes(scores: Vec<f32>, classes: Vec<UnitClass>) -> Self {
        let hot = classes
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == UnitClass::Hot)
            .map(|(i, _)| i)
            .collect();
        Self {
            scores,
            classes,
            hot,
        }
    }

    /// Number of units
    pub fn num_units(&self) -> usize {
        self.classes.len()
    }

    /// Raw score of each unit
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Tag of each unit
    pub fn classes(&self) -> &[UnitClass] {
        &self.classes
    }

    /// Hot units in ascending order
    pub fn hot_units(&self) -> &[usize] {
        &self.hot
    }

    /// Whether `unit` is hot
    #[inline]
    pub fn is_hot(&self, unit: usize) -> bool {
        self.classes.get(unit) == Some(&UnitClass::Hot)
    }

    /// Fraction of units that are cold
    pub fn sparsity(&self) -> f32 {
        if self.classes.is_empty() {
            return 0.0;
        }
        1.0 - self.hot.len() as f32 / self.classes.len() as f32
    }
}

/// Experts chosen for one token
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertSelection {
    /// Expert indices, best first
    pub experts: Vec<usize>,
    /// Gate weight of each selected expert
    pub weights: Vec<f32>,
}

/// Per-unit activation counters
#[derive(Debug)]
pub struct UsageStats {
    counts: Vec<AtomicU64>,
    tokens: AtomicU64,
}

impl UsageStats {
    /// Counters for `num_units` units
    pub fn new(num_units: usize) -> Self {
        Self {
            counts: (0..num_units).map(|_| AtomicU64::new(0)).collect(),
            tokens: AtomicU64::new(0),
        }
    }

    fn record(&self, hot: &[usize]) {
        self.tokens.fetch_add(1, Ordering::Relaxed);
        for &u in hot {
            if let Some(c) = self.counts.get(u) {
                c.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Times each unit was hot
    pub fn counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Tokens routed
    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Fraction of tokens for which each unit was hot
    pub fn frequencies(&self) -> Vec<f64> {
        let tokens = self.tokens().max(1) as f64;
        self.counts().into_iter().map(|c| c as f64 / tokens).collect()
    }
}

/// Score-to-partition policy
#[derive(Debug)]
pub struct Router {
    sparsity: SparsityConfig,
    experts: ExpertRoutingConfig,
    usage: Option<UsageStats>,
}

impl Router {
    /// Router using the sparsity and expert settings of `config`
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            sparsity: config.sparsity.clone(),
            experts: config.experts.clone(),
            usage: None,
        }
    }

    /// Router with explicit policies
    pub fn with_policies(sparsity: SparsityConfig, experts: ExpertRoutingConfig) -> Self {
        Self {
            sparsity,
            experts,
            usage: None,
        }
    }

    /// Count how often each of `num_units` units is hot
    pub fn with_usage_tracking(mut self, num_units: usize) -> Self {
        self.usage = Some(UsageStats::new(num_units));
        self
    }

    /// Activation counters, when tracking is enabled
    pub fn usage(&self) -> Option<&UsageStats> {
        self.usage.as_ref()
    }

    /// Threshold policy
    pub fn sparsity(&self) -> &SparsityConfig {
        &self.sparsity
    }

    /// Partition one token's scores
    pub fn partition(&self, scores: Vec<f32>) -> RouterDecision {
        let n = scores.len();
        let threshold = self.sparsity.threshold;
        let k = self.sparsity.min_active.min(n);

        let mut classes: Vec<UnitClass> = scores
            .iter()
            .map(|&s| if s > threshold { UnitClass::Hot } else { UnitClass::Cold })
            .collect();
        let passing = classes.iter().filter(|c| **c == UnitClass::Hot).count();

        if passing < k {
            classes.fill(UnitClass::Cold);
            for unit in top_k(&scores, k) {
                classes[unit] = UnitClass::Hot;
            }
        }

        let decision = RouterDecision::from_classes(scores, classes);
        if let Some(usage) = &self.usage {
            usage.record(decision.hot_units());
        }
        trace!(
            units = n,
            hot = decision.hot_units().len(),
            sparsity = decision.sparsity(),
            "partitioned units"
        );
        decision
    }

    /// Score with `predictor` and partition
    pub fn route(&self, predictor: &dyn Predictor, activation: &[f32]) -> Result<RouterDecision> {
        Ok(self.partition(predictor.scores(activation)?))
    }

    /// Route every token of a row-major `[n_tokens, input_dim]` batch
    pub fn route_batch(&self, predictor: &dyn Predictor, activations: &[f32]) -> Result<Vec<RouterDecision>> {
        Ok(predictor
            .scores_batch(activations)?
            .into_iter()
            .map(|s| self.partition(s))
            .collect())
    }

    /// Pick experts from one token's gate logits
    pub fn route_experts(&self, logits: &[f32]) -> Result<ExpertSelection> {
        if logits.is_empty() {
            return Err(RuntimeError::Precondition("no expert logits".to_string()));
        }
        let k = self.experts.n_expert_used.min(logits.len());
        let experts = top_k(logits, k);
        let selected: Vec<f32> = experts.iter().map(|&e| logits[e]).collect();

        let weights = match self.experts.normalization {
            GateNormalization::None => selected,
            GateNormalization::SoftmaxBeforeTopK => {
                let probs = softmax(logits);
                experts.iter().map(|&e| probs[e]).collect()
            }
            GateNormalization::SoftmaxAfterTopK => softmax(&selected),
            GateNormalization::RenormalizeAfterTopK => {
                let probs = softmax(logits);
                let picked: Vec<f32> = experts.iter().map(|&e| probs[e]).collect();
                let sum: f32 = picked.iter().sum();
                if sum > 0.0 {
                    picked.iter().map(|p| p / sum).collect()
                } else {
                    picked
                }
            }
        };

        if let Some(usage) = &self.usage {
            usage.record(&experts);
        }
        Ok(ExpertSelection { experts, weights })
    }
}

/// Indices of the `k` largest values, best first; ties go to the lower index, NaN ranks last
pub fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    let key = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        key(values[b])
            .partial_cmp(&key(values[a]))
            .unwrap_or(CmpOrdering::Equal)
            .then(a.cmp(&b))
    });
    order.truncate(k);
    order
}

/// Numerically stable softmax.
///
/// NaN counts as `-inf`. All `-inf` gives a uniform distribution; any `+inf`
/// splits the mass evenly among the infinite entries.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let key = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };
    let max = values.iter().map(|&v| key(v)).fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return vec![1.0 / values.len() as f32; values.len()];
    }
    if max == f32::INFINITY {
        let n = values.iter().filter(|&&v| v == f32::INFINITY).count() as f32;
        return values
            .iter()
            .map(|&v| if v == f32::INFINITY { 1.0 / n } else { 0.0 })
            .collect();
    }
    let exps: Vec<f32> = values.iter().map(|&v| (key(v) - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(threshold: f32, min_active: usize) -> Router {
        Router::with_policies(
            SparsityConfig {
                threshold,
                min_active,
            },
            ExpertRoutingConfig::default(),
        )
    }

    fn expert_router(n: usize, normalization: GateNormalization) -> Router {
        Router::with_policies(
            SparsityConfig::default(),
            ExpertRoutingConfig {
                n_expert_used: n,
                normalization,
            },
        )
    }

    #[test]
    fn test_threshold_partition() {
        let d = router(0.5, 1).partition(vec![0.1, 0.9, 0.5, 2.0]);
        assert_eq!(d.hot_units(), &[1, 3]);
        assert_eq!(d.classes()[2], UnitClass::Cold);
        assert!(d.is_hot(3));
        assert!(!d.is_hot(10));
        assert!((d.sparsity() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_min_active_when_all_below_threshold() {
        let d = router(10.0, 3).partition(vec![0.3, -1.0, 0.7, 0.3, 0.1]);
        assert_eq!(d.hot_units().len(), 3);
        // 0.7, then the tie at 0.3 resolved in index order
        assert_eq!(d.hot_units(), &[0, 2, 3]);
    }

    #[test]
    fn test_min_active_clamped() {
        let d = router(10.0, 8).partition(vec![1.0, 2.0]);
        assert_eq!(d.hot_units(), &[0, 1]);

        let d = router(10.0, 0).partition(vec![1.0, 2.0]);
        assert!(d.hot_units().is_empty());
    }

    #[test]
    fn test_top_k_ties_and_nan() {
        assert_eq!(top_k(&[1.0, 3.0, 3.0, f32::NAN, 2.0], 3), vec![1, 2, 4]);
        assert_eq!(top_k(&[5.0, 5.0, 5.0], 2), vec![0, 1]);
    }

    #[test]
    fn test_expert_normalizations() {
        let logits = [1.0, 3.0, 2.0, 3.0];

        let raw = expert_router(2, GateNormalization::None).route_experts(&logits).unwrap();
        assert_eq!(raw.experts, vec![1, 3]);
        assert_eq!(raw.weights, vec![3.0, 3.0]);

        let after = expert_router(2, GateNormalization::SoftmaxAfterTopK)
            .route_experts(&logits)
            .unwrap();
        assert!((after.weights[0] - 0.5).abs() < 1e-6);

        let renorm = expert_router(3, GateNormalization::RenormalizeAfterTopK)
            .route_experts(&logits)
            .unwrap();
        assert_eq!(renorm.experts, vec![1, 3, 2]);
        let sum: f32 = renorm.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);

        let before = expert_router(2, GateNormalization::SoftmaxBeforeTopK)
            .route_experts(&logits)
            .unwrap();
        let sum: f32 = before.weights.iter().sum();
        assert!(sum < 1.0);
    }

    #[test]
    fn test_softmax_degenerate_logits() {
        let ninf = f32::NEG_INFINITY;
        assert_eq!(softmax(&[ninf, ninf, ninf, ninf]), vec![0.25; 4]);
        assert_eq!(softmax(&[1.0, f32::INFINITY, f32::INFINITY]), vec![0.0, 0.5, 0.5]);
        assert!(softmax(&[]).is_empty());

        let p = softmax(&[f32::NAN, 0.0, ninf]);
        assert_eq!(p, vec![0.0, 1.0, 0.0]);

        for normalization in [
            GateNormalization::SoftmaxBeforeTopK,
            GateNormalization::SoftmaxAfterTopK,
            GateNormalization::RenormalizeAfterTopK,
        ] {
            let sel = expert_router(2, normalization).route_experts(&[ninf; 4]).unwrap();
            assert_eq!(sel.experts, vec![0, 1]);
            assert!(sel.weights.iter().all(|w| w.is_finite()), "{:?}", normalization);
        }
    }

    #[test]
    fn test_usage_tracking() {
        let r = router(0.0, 1).with_usage_tracking(3);
        r.partition(vec![1.0, -1.0, 1.0]);
        r.partition(vec![1.0, -1.0, -1.0]);

        let usage = r.usage().unwrap();
        assert_eq!(usage.tokens(), 2);
        assert_eq!(usage.counts(), vec![2, 0, 1]);
        assert_eq!(usage.frequencies()[2], 0.5);
    }

    #[test]
    fn test_from_hot_units() {
        let d = RouterDecision::from_hot_units(4, &[3, 1]).unwrap();
        assert_eq!(d.hot_units(), &[1, 3]);
        assert!(RouterDecision::from_hot_units(2, &[2]).is_err());
        assert_eq!(RouterDecision::dense(3).hot_units(), &[0, 1, 2]);
    }
}
