//! Gated MLP block (GeGLU).
//!
//! Gate and up projections each map to half of `intermediate_size`; the gate
//! passes through GeLU and multiplies the up branch before the down
//! projection back to the residual width.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::config::GriffinConfig;

pub struct MlpBlock {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MlpBlock {
    pub fn new(config: &GriffinConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let half_inter = config.intermediate_size / 2;

        let gate_proj = linear(hidden, half_inter, vb.pp("gate_proj"))?;
        let up_proj = linear(hidden, half_inter, vb.pp("up_proj"))?;
        let down_proj = linear(half_inter, hidden, vb.pp("down_proj"))?;

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }
}

impl Module for MlpBlock {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.gelu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&gate.mul(&up)?)
    }
}
