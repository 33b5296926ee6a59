//! The Griffin language model.
//!
//! A stack of residual layers whose temporal blocks alternate between gated
//! linear recurrences and local attention following the configured block
//! pattern, with tied or untied output embeddings and a tanh soft cap on the
//! logits.

use candle_core::{Result, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, Module, VarBuilder};

use crate::cache::LayerCache;
use crate::config::GriffinConfig;
use crate::error::{GriffinError, GriffinResult};
use crate::layer::ResidualLayer;
use crate::norm::{rms_norm, RmsNorm};

pub struct GriffinModel {
    embed_tokens: Embedding,
    layers: Vec<ResidualLayer>,
    final_norm: RmsNorm,
    lm_head: Option<Linear>,
    embeddings_scale: Option<f64>,
    logits_soft_cap: f64,
    config: GriffinConfig,
}

impl GriffinModel {
    pub fn new(config: &GriffinConfig, vb: VarBuilder) -> GriffinResult<Self> {
        config.validate()?;

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(config.num_layers);
        let vb_layers = vb.pp("layers");
        for idx in 0..config.num_layers {
            layers.push(ResidualLayer::new(config, idx, vb_layers.pp(idx))?);
        }

        let final_norm = rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("final_norm"))?;

        let lm_head = if config.tied_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let embeddings_scale = if config.embeddings_scale_by_sqrt_dim {
            Some((config.hidden_size as f64).sqrt())
        } else {
            None
        };

        Ok(Self {
            embed_tokens,
            layers,
            final_norm,
            lm_head,
            embeddings_scale,
            logits_soft_cap: config.logits_soft_cap,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &GriffinConfig {
        &self.config
    }

    pub fn device(&self) -> candle_core::Device {
        self.embed_tokens.embeddings().device().clone()
    }

    /// Fresh cache slots, one per layer, matching each layer's block kind.
    pub fn make_cache(&self) -> Vec<LayerCache> {
        self.layers
            .iter()
            .map(|layer| layer.make_cache(&self.config))
            .collect()
    }

    /// Forward pass over token ids `(batch, seq_len)`, producing logits
    /// `(batch, seq_len, vocab_size)`. When caches are given they are
    /// advanced in place, one slot per layer.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        mut caches: Option<&mut [LayerCache]>,
    ) -> GriffinResult<Tensor> {
        if let Some(slots) = &caches {
            if slots.len() != self.layers.len() {
                return Err(GriffinError::CacheLength {
                    expected: self.layers.len(),
                    got: slots.len(),
                });
            }
        }

        let mut x = self.embed_tokens.forward(input_ids)?;
        if let Some(scale) = self.embeddings_scale {
            x = x.affine(scale, 0.0)?;
        }

        for (idx, layer) in self.layers.iter().enumerate() {
            let cache = caches.as_deref_mut().map(|slots| &mut slots[idx]);
            x = layer.forward(&x, cache)?;
        }

        let x = self.final_norm.forward(&x)?;

        let logits = match &self.lm_head {
            Some(head) => head.forward(&x)?,
            None => x.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?,
        };

        Ok(self.cap_logits(&logits)?)
    }

    fn cap_logits(&self, logits: &Tensor) -> Result<Tensor> {
        if self.logits_soft_cap > 0.0 {
            let cap = self.logits_soft_cap;
            logits.affine(1.0 / cap, 0.0)?.tanh()?.affine(cap, 0.0)
        } else {
            Ok(logits.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn model(config: &GriffinConfig, device: &Device) -> (VarMap, GriffinModel) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = GriffinModel::new(config, vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn test_forward_logits_shape() {
        let device = Device::Cpu;
        let config = GriffinConfig::test();
        let (_varmap, model) = model(&config, &device);

        let ids = Tensor::zeros((2, 7), DType::U32, &device).unwrap();
        let logits = model.forward(&ids, None).unwrap();
        assert_eq!(logits.dims(), &[2, 7, config.vocab_size]);
    }

    #[test]
    fn test_logits_respect_soft_cap() {
        let device = Device::Cpu;
        let config = GriffinConfig::test();
        let (_varmap, model) = model(&config, &device);

        let ids = Tensor::zeros((1, 4), DType::U32, &device).unwrap();
        let logits = model.forward(&ids, None).unwrap();
        let max = logits
            .abs()
            .unwrap()
            .max_keepdim(candle_core::D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for v in max {
            assert!(v <= config.logits_soft_cap as f32 + 1e-5);
        }
    }

    #[test]
    fn test_tied_embeddings_share_weights() {
        let device = Device::Cpu;
        let mut config = GriffinConfig::test();
        config.tied_embeddings = true;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = GriffinModel::new(&config, vb).unwrap();

        // No separate lm_head variable should exist
        let names: Vec<String> = varmap
            .data()
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert!(!names.iter().any(|n| n.contains("lm_head")));

        let ids = Tensor::zeros((1, 3), DType::U32, &device).unwrap();
        let logits = model.forward(&ids, None).unwrap();
        assert_eq!(logits.dims(), &[1, 3, config.vocab_size]);
    }

    #[test]
    fn test_cached_decode_matches_full_forward() {
        let device = Device::Cpu;
        let config = GriffinConfig::test();
        let (_varmap, model) = model(&config, &device);

        let ids: Vec<u32> = (0..10u32).map(|i| i % config.vocab_size as u32).collect();
        let full_ids = Tensor::from_vec(ids.clone(), (1, 10), &device).unwrap();
        let full_logits = model.forward(&full_ids, None).unwrap();
        let full_last = full_logits.narrow(1, 9, 1).unwrap();

        // Prefill 9 tokens through the cache, then decode the 10th
        let mut caches = model.make_cache();
        let prefill = Tensor::from_vec(ids[..9].to_vec(), (1, 9), &device).unwrap();
        model.forward(&prefill, Some(&mut caches)).unwrap();
        let step = Tensor::from_vec(ids[9..].to_vec(), (1, 1), &device).unwrap();
        let step_logits = model.forward(&step, Some(&mut caches)).unwrap();

        let diff = (full_last - step_logits)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(candle_core::D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for d in diff {
            assert!(d < 1e-4, "cached decode diverged from full forward: {}", d);
        }
    }

    #[test]
    fn test_short_cache_slice_rejected() {
        let device = Device::Cpu;
        let config = GriffinConfig::test();
        let (_varmap, model) = model(&config, &device);

        let mut caches = model.make_cache();
        caches.truncate(config.num_layers - 1);

        let ids = Tensor::zeros((1, 2), DType::U32, &device).unwrap();
        let err = model.forward(&ids, Some(&mut caches)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::GriffinError::CacheLength { expected: 3, got: 2 }
        ));
    }

    #[test]
    fn test_cache_slots_match_layers() {
        let device = Device::Cpu;
        let config = GriffinConfig::test();
        let (_varmap, model) = model(&config, &device);

        let caches = model.make_cache();
        assert_eq!(caches.len(), config.num_layers);
        assert!(matches!(caches[0], LayerCache::Recurrent(_)));
        assert!(matches!(caches[2], LayerCache::Attention(_)));
    }
}
