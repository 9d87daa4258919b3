//! Residual add followed by RMS normalization
//!
//! After attention each token row is `attn_out + skip`. That sum is kept as
//! the residual for the next block and, scaled by `1 / sqrt(mean(x²) + eps)`
//! and the optional affine weight and bias, becomes the normalized input of
//! the feed-forward block.

use crate::compute::param::{ComputeParam, WorkerPool};
use crate::compute::workspace::SharedSlice;
use crate::error::{Result, RuntimeError};

/// Default epsilon of the normalization
pub const DEFAULT_NORM_EPS: f32 = 1e-6;

/// RMS normalization with optional affine terms
#[derive(Debug, Clone, Copy)]
pub struct RmsNorm<'a> {
    /// Per-column scale, `[ne00]`
    pub weight: Option<&'a [f32]>,
    /// Per-column offset, `[ne00]`
    pub bias: Option<&'a [f32]>,
    /// Added to the mean square before the square root
    pub eps: f32,
}

impl Default for RmsNorm<'_> {
    fn default() -> Self {
        Self::new(DEFAULT_NORM_EPS)
    }
}

impl<'a> RmsNorm<'a> {
    /// Plain normalization without affine terms
    pub fn new(eps: f32) -> Self {
        Self {
            weight: None,
            bias: None,
            eps,
        }
    }

    /// Scale each column by `weight`
    pub fn with_weight(mut self, weight: Option<&'a [f32]>) -> Self {
        self.weight = weight;
        self
    }

    /// Add `bias` to each column after scaling
    pub fn with_bias(mut self, bias: Option<&'a [f32]>) -> Self {
        self.bias = bias;
        self
    }

    /// Reject affine terms that do not match rows of `ne00` columns
    pub fn check(&self, ne00: usize) -> Result<()> {
        if ne00 == 0 {
            return Err(RuntimeError::dims("norm columns", 1, 0));
        }
        if !self.eps.is_finite() || self.eps < 0.0 {
            return Err(RuntimeError::Precondition(format!("norm eps {} is not a finite non-negative value", self.eps)));
        }
        if let Some(w) = self.weight {
            if w.len() != ne00 {
                return Err(RuntimeError::dims("norm weight", ne00, w.len()));
            }
        }
        if let Some(b) = self.bias {
            if b.len() != ne00 {
                return Err(RuntimeError::dims("norm bias", ne00, b.len()));
            }
        }
        Ok(())
    }

    /// Normalize one row in place
    pub fn apply_row(&self, row: &mut [f32]) {
        if row.is_empty() {
            return;
        }
        let mean = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
        let scale = 1.0 / (mean + self.eps).sqrt();
        for v in row.iter_mut() {
            *v *= scale;
        }
        if let Some(w) = self.weight {
            for (v, w) in row.iter_mut().zip(w) {
                *v *= w;
            }
        }
        if let Some(b) = self.bias {
            for (v, b) in row.iter_mut().zip(b) {
                *v += b;
            }
        }
    }

    /// This worker's share of rows `ith, ith + nth, ...`
    ///
    /// Writes `residual = input + skip` and `output = norm(residual)`.
    /// Shapes must have been checked by the caller.
    pub fn forward_rows(
        &self,
        params: &ComputeParam<'_>,
        input: &[f32],
        skip: Option<&[f32]>,
        ne00: usize,
        output: &SharedSlice<'_, f32>,
        residual: &SharedSlice<'_, f32>,
    ) {
        let nr = input.len() / ne00;
        for i in (params.ith..nr).step_by(params.nth) {
            let cols = i * ne00..(i + 1) * ne00;
            // Safety: rows are strided by worker index, so no two workers share one.
            let res = unsafe { residual.slice_mut(cols.clone()) };
            res.copy_from_slice(&input[cols.clone()]);
            if let Some(s) = skip {
                for (r, s) in res.iter_mut().zip(&s[cols.clone()]) {
                    *r += s;
                }
            }
            let out = unsafe { output.slice_mut(cols) };
            out.copy_from_slice(res);
            self.apply_row(out);
        }
    }
}

/// `residual = input + skip` and `output = norm(residual)` for every row, on the pool
#[allow(clippy::too_many_arguments)]
pub fn post_attn_layernorm(
    pool: &WorkerPool,
    norm: &RmsNorm<'_>,
    input: &[f32],
    skip: Option<&[f32]>,
    ne00: usize,
    output: &mut [f32],
    residual: &mut [f32],
) -> Result<()> {
    norm.check(ne00)?;
    if input.is_empty() || input.len() % ne00 != 0 {
        return Err(RuntimeError::dims("norm input", ne00, input.len()));
    }
    if let Some(s) = skip {
        if s.len() != input.len() {
            return Err(RuntimeError::dims("norm skip", input.len(), s.len()));
        }
    }
    if output.len() != input.len() {
        return Err(RuntimeError::dims("norm output", input.len(), output.len()));
    }
    if residual.len() != input.len() {
        return Err(RuntimeError::dims("norm residual", input.len(), residual.len()));
    }

    let output = SharedSlice::new(output);
    let residual = SharedSlice::new(residual);
    pool.run(|ith, nth| {
        let params = ComputeParam::new(ith, nth, 0, None);
        norm.forward_rows(&params, input, skip, ne00, &output, &residual);
    });
    Ok(())
}
