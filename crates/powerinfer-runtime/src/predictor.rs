//! Activation predictors
//!
//! A predictor scores every output unit of a layer (FFN neuron or expert)
//! from the layer's normalized input. Scores feed the [`Router`](crate::Router).

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Per-unit relevance scoring
pub trait Predictor: Send + Sync {
    /// Width of the activation vector
    fn input_dim(&self) -> usize;

    /// Number of scored units
    fn num_units(&self) -> usize;

    /// Score every unit for one token
    fn scores(&self, activation: &[f32]) -> Result<Vec<f32>>;

    /// Score every unit for `activations.len() / input_dim()` tokens
    fn scores_batch(&self, activations: &[f32]) -> Result<Vec<Vec<f32>>> {
        let dim = self.input_dim();
        if dim == 0 || activations.len() % dim != 0 {
            return Err(RuntimeError::dims("predictor batch", dim, activations.len()));
        }
        activations.chunks_exact(dim).map(|a| self.scores(a)).collect()
    }
}

fn check_input(expected: usize, activation: &[f32]) -> Result<ArrayView1<'_, f32>> {
    if activation.len() != expected {
        return Err(RuntimeError::dims("predictor input", expected, activation.len()));
    }
    Ok(ArrayView1::from(activation))
}

/// Low-rank bottleneck: `up · relu(down · x)`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "LowRankWeights")]
pub struct LowRankPredictor {
    /// `[rank, input_dim]`
    down: Array2<f32>,
    /// `[num_units, rank]`
    up: Array2<f32>,
    /// Optional per-unit bias, `[num_units]`
    bias: Option<Array1<f32>>,
}

/// Serialized form of [`LowRankPredictor`]; shapes are checked on load
#[derive(Deserialize)]
struct LowRankWeights {
    down: Array2<f32>,
    up: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl TryFrom<LowRankWeights> for LowRankPredictor {
    type Error = RuntimeError;

    fn try_from(w: LowRankWeights) -> Result<Self> {
        Self::from_weights(w.down, w.up, w.bias)
    }
}

impl LowRankPredictor {
    /// Build from projection weights
    pub fn from_weights(down: Array2<f32>, up: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self> {
        let (rank, _) = down.dim();
        let (units, up_rank) = up.dim();
        if rank != up_rank {
            return Err(RuntimeError::dims("predictor rank", rank, up_rank));
        }
        if let Some(b) = &bias {
            if b.len() != units {
                return Err(RuntimeError::dims("predictor bias", units, b.len()));
            }
        }
        Ok(Self { down, up, bias })
    }

    /// Randomly initialised predictor, reproducible from `seed`
    pub fn random(input_dim: usize, num_units: usize, rank: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (input_dim.max(1) as f32).sqrt();
        let down = Array2::from_shape_fn((rank, input_dim), |_| rng.gen_range(-scale..scale));
        let scale = 1.0 / (rank.max(1) as f32).sqrt();
        let up = Array2::from_shape_fn((num_units, rank), |_| rng.gen_range(-scale..scale));
        Self {
            down,
            up,
            bias: None,
        }
    }

    /// Bottleneck width
    pub fn rank(&self) -> usize {
        self.down.nrows()
    }

    /// Down projection
    pub fn down(&self) -> ArrayView2<'_, f32> {
        self.down.view()
    }
}

impl Predictor for LowRankPredictor {
    fn input_dim(&self) -> usize {
        self.down.ncols()
    }

    fn num_units(&self) -> usize {
        self.up.nrows()
    }

    fn scores(&self, activation: &[f32]) -> Result<Vec<f32>> {
        let x = check_input(self.input_dim(), activation)?;
        let hidden = self.down.dot(&x).mapv(|v| v.max(0.0));
        let mut scores = self.up.dot(&hidden);
        if let Some(bias) = &self.bias {
            scores += bias;
        }
        Ok(scores.to_vec())
    }
}

/// Direct gating projection for expert models: `gate · x`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingPredictor {
    /// `[num_experts, input_dim]`
    gate: Array2<f32>,
}

impl GatingPredictor {
    /// Build from a gate matrix
    pub fn from_weights(gate: Array2<f32>) -> Self {
        Self { gate }
    }

    /// Randomly initialised gate, reproducible from `seed`
    pub fn random(input_dim: usize, num_experts: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (input_dim.max(1) as f32).sqrt();
        Self {
            gate: Array2::from_shape_fn((num_experts, input_dim), |_| rng.gen_range(-scale..scale)),
        }
    }
}

impl Predictor for GatingPredictor {
    fn input_dim(&self) -> usize {
        self.gate.ncols()
    }

    fn num_units(&self) -> usize {
        self.gate.nrows()
    }

    fn scores(&self, activation: &[f32]) -> Result<Vec<f32>> {
        let x = check_input(self.input_dim(), activation)?;
        Ok(self.gate.dot(&x).to_vec())
    }
}
