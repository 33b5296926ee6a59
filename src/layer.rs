//! Residual layer combining a temporal mixing block and an MLP.
//!
//! Each layer is `x + temporal(norm(x))` followed by `x + mlp(norm(x))`,
//! where the temporal block is either the gated recurrence or local
//! attention depending on the layer's position in the block pattern.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::attention::LocalAttentionBlock;
use crate::cache::LayerCache;
use crate::config::{BlockKind, GriffinConfig};
use crate::error::{GriffinError, GriffinResult};
use crate::mlp::MlpBlock;
use crate::norm::{rms_norm, RmsNorm};
use crate::recurrent::RecurrentBlock;

enum TemporalBlock {
    Recurrent(RecurrentBlock),
    Attention(LocalAttentionBlock),
}

pub struct ResidualLayer {
    temporal_pre_norm: RmsNorm,
    temporal_block: TemporalBlock,
    channel_pre_norm: RmsNorm,
    mlp_block: MlpBlock,
    layer_idx: usize,
}

impl ResidualLayer {
    pub fn new(config: &GriffinConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.rms_norm_eps;

        let temporal_pre_norm = rms_norm(hidden, eps, vb.pp("temporal_pre_norm"))?;
        let temporal_block = match config.block_kind(layer_idx) {
            BlockKind::Recurrent => {
                TemporalBlock::Recurrent(RecurrentBlock::new(config, vb.pp("temporal_block"))?)
            }
            BlockKind::Attention => {
                TemporalBlock::Attention(LocalAttentionBlock::new(config, vb.pp("temporal_block"))?)
            }
        };
        let channel_pre_norm = rms_norm(hidden, eps, vb.pp("channel_pre_norm"))?;
        let mlp_block = MlpBlock::new(config, vb.pp("mlp_block"))?;

        Ok(Self {
            temporal_pre_norm,
            temporal_block,
            channel_pre_norm,
            mlp_block,
            layer_idx,
        })
    }

    /// Build the cache slot matching this layer's temporal block.
    pub fn make_cache(&self, config: &GriffinConfig) -> LayerCache {
        match &self.temporal_block {
            TemporalBlock::Recurrent(_) => {
                LayerCache::Recurrent(crate::cache::RecurrentCache::new())
            }
            TemporalBlock::Attention(_) => LayerCache::Attention(
                crate::cache::RotatingKvCache::new(config.attention_window_size),
            ),
        }
    }

    /// Forward pass with an optional per-layer cache slot.
    pub fn forward(&self, x: &Tensor, cache: Option<&mut LayerCache>) -> GriffinResult<Tensor> {
        let normed = self.temporal_pre_norm.forward(x)?;
        let mixed = match (&self.temporal_block, cache) {
            (TemporalBlock::Recurrent(block), None) => block.forward(&normed, None)?,
            (TemporalBlock::Recurrent(block), Some(LayerCache::Recurrent(c))) => {
                block.forward(&normed, Some(c))?
            }
            (TemporalBlock::Attention(block), None) => block.forward(&normed, None)?,
            (TemporalBlock::Attention(block), Some(LayerCache::Attention(c))) => {
                block.forward(&normed, Some(c))?
            }
            (TemporalBlock::Recurrent(_), Some(_)) => {
                return Err(GriffinError::CacheMismatch {
                    layer: self.layer_idx,
                    expected: "recurrent",
                })
            }
            (TemporalBlock::Attention(_), Some(_)) => {
                return Err(GriffinError::CacheMismatch {
                    layer: self.layer_idx,
                    expected: "attention",
                })
            }
        };
        let x = (x + mixed)?;

        let normed = self.channel_pre_norm.forward(&x)?;
        let out = self.mlp_block.forward(&normed)?;
        Ok((x + out)?)
    }
}
