//! RMS normalization with the Gemma scaling convention.
//!
//! Implemented with basic tensor operations (mean, sqrt, broadcast ops) so it
//! runs on any backend without a fused norm kernel. The learnable weight is
//! stored as an offset from 1: `y = x / sqrt(mean(x^2) + eps) * (1 + weight)`.

use candle_core::{Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

/// RMS norm with `(1 + weight)` scaling, weight initialized to zero.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Create a new RmsNorm from an existing weight tensor.
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    fn forward_impl(&self, x: &Tensor) -> Result<Tensor> {
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;

        let eps_tensor = Tensor::new(self.eps as f32, x.device())?;
        let rms = mean_sq.broadcast_add(&eps_tensor)?.sqrt()?;

        let normalized = x.broadcast_div(&rms)?;
        let scale = (&self.weight + 1.0)?;
        normalized.broadcast_mul(&scale)
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_impl(x)
    }
}

/// Create an RMS norm layer.
pub fn rms_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(0.0))?;
    Ok(RmsNorm::new(weight, eps))
}
