//! Local (windowed) multi-query attention.
//!
//! Queries use the full head count; keys and values share a single head that
//! is broadcast across the query heads. Positions are encoded with a partial
//! rotary embedding that rotates only the first half of each head dimension.
//! Attention is restricted to a sliding window of recent positions, which is
//! what lets the key/value cache stay bounded during decoding.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, Module, VarBuilder};

use crate::cache::RotatingKvCache;
use crate::config::GriffinConfig;

/// Rotary position embedding applied to the first `rope_dim` dimensions of
/// each head; the remaining dimensions pass through unchanged.
#[derive(Debug, Clone)]
pub struct PartialRotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    rope_dim: usize,
}

impl PartialRotaryEmbedding {
    pub fn new(
        rope_dim: usize,
        max_seq_len: usize,
        theta: f32,
        device: &Device,
    ) -> Result<Self> {
        let half = rope_dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / theta.powf(2.0 * i as f32 / rope_dim as f32))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
            rope_dim,
        })
    }

    /// Number of absolute positions the table covers.
    pub fn max_positions(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Apply the rotation to `x` of shape `(batch, heads, seq, head_dim)`,
    /// with `offset` giving the absolute position of the first token. Fails
    /// once positions run past the precomputed table.
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        let half = self.rope_dim / 2;

        if offset + seq_len > self.max_positions() {
            candle_core::bail!(
                "position {} exceeds the rotary table of {} entries",
                offset + seq_len,
                self.max_positions()
            )
        }

        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;

        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let pass = x.narrow(D::Minus1, self.rope_dim, head_dim - self.rope_dim)?;

        let r1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let r2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;

        Tensor::cat(&[r1, r2, pass], D::Minus1)?.contiguous()
    }
}

/// Additive mask for windowed causal attention.
///
/// Queries occupy absolute positions `offset .. offset + seq_len`; keys cover
/// the last `kv_len` positions before `offset + seq_len`. A query may attend
/// a key when the key is not in its future and lies within the window.
fn window_mask(
    seq_len: usize,
    kv_len: usize,
    offset: usize,
    window: usize,
    device: &Device,
) -> Result<Tensor> {
    let key_start = offset + seq_len - kv_len;
    let mut data = Vec::with_capacity(seq_len * kv_len);
    for i in 0..seq_len {
        let q_pos = offset + i;
        for j in 0..kv_len {
            let k_pos = key_start + j;
            let visible = k_pos <= q_pos && q_pos - k_pos < window;
            data.push(if visible { 0.0f32 } else { f32::NEG_INFINITY });
        }
    }
    Tensor::from_vec(data, (seq_len, kv_len), device)
}

/// Local multi-query attention block.
pub struct LocalAttentionBlock {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rope: PartialRotaryEmbedding,
    num_heads: usize,
    head_dim: usize,
    window_size: usize,
    scale: f64,
}

impl LocalAttentionBlock {
    pub fn new(config: &GriffinConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();

        let q_proj = linear_no_bias(hidden, hidden, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden, head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden, head_dim, vb.pp("v_proj"))?;
        let o_proj = if config.attention_bias {
            linear(hidden, hidden, vb.pp("o_proj"))?
        } else {
            linear_no_bias(hidden, hidden, vb.pp("o_proj"))?
        };

        let rope = PartialRotaryEmbedding::new(
            head_dim / 2,
            config.max_seq_length,
            config.rope_theta,
            vb.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
            num_heads: config.num_heads,
            head_dim,
            window_size: config.attention_window_size,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// Forward pass.
    /// Input: `(batch, seq_len, hidden_size)`; the cache, when present, is
    /// advanced in place and bounds the attended history to the window.
    pub fn forward(&self, x: &Tensor, cache: Option<&mut RotatingKvCache>) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let offset = cache.as_ref().map(|c| c.offset()).unwrap_or(0);

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, 1, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, 1, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.rope.apply(&q, offset)?;
        let k = self.rope.apply(&k, offset)?;

        let (k, v) = match cache {
            Some(cache) => cache.update_and_fetch(&k, &v)?,
            None => (k, v),
        };
        let kv_len = k.dim(2)?;

        // (B, H, L, D) @ (B, 1, D, S) -> (B, H, L, S)
        let scores = q
            .broadcast_matmul(&k.transpose(2, 3)?)?
            .affine(self.scale, 0.0)?;
        let scores = if seq_len > 1 {
            let mask = window_mask(seq_len, kv_len, offset, self.window_size, x.device())?;
            scores.broadcast_add(&mask)?
        } else {
            // Single cached step: everything in the (trimmed) cache is visible
            scores
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = probs
            .broadcast_matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_rope_preserves_shape_and_norm() {
        let device = Device::Cpu;
        let rope = PartialRotaryEmbedding::new(8, 32, 10_000.0, &device).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 4, 16), &device).unwrap();
        let y = rope.apply(&x, 0).unwrap();
        assert_eq!(y.dims(), x.dims());

        // Rotation is norm-preserving
        let nx = x.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let ny = y.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((nx - ny).abs() / nx < 1e-4);
    }

    #[test]
    fn test_rope_rejects_positions_past_table() {
        let device = Device::Cpu;
        let rope = PartialRotaryEmbedding::new(8, 16, 10_000.0, &device).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 4, 16), &device).unwrap();
        assert!(rope.apply(&x, 12).is_ok());
        assert!(rope.apply(&x, 13).is_err());
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let device = Device::Cpu;
        let rope = PartialRotaryEmbedding::new(8, 32, 10_000.0, &device).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 1, 16), &device).unwrap();
        let y = rope.apply(&x, 0).unwrap();
        let xv: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let yv: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in xv.iter().zip(yv.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_window_mask_limits_history() {
        let device = Device::Cpu;
        let mask = window_mask(4, 4, 0, 2, &device).unwrap();
        let vals: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        // Row 0: only position 0 visible
        assert_eq!(vals[0], 0.0);
        assert_eq!(vals[1], f32::NEG_INFINITY);
        // Row 3: positions 2 and 3 visible, 0 and 1 outside the window
        assert_eq!(vals[12], f32::NEG_INFINITY);
        assert_eq!(vals[13], f32::NEG_INFINITY);
        assert_eq!(vals[14], 0.0);
        assert_eq!(vals[15], 0.0);
    }

    #[test]
    fn test_attention_forward_shapes() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = GriffinConfig::test();
        let attn = LocalAttentionBlock::new(&config, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 6, config.hidden_size), &device).unwrap();
        let out = attn.forward(&x, None).unwrap();
        assert_eq!(out.dims(), &[2, 6, config.hidden_size]);
    }

    #[test]
    fn test_attention_cached_decode() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = GriffinConfig::test();
        let attn = LocalAttentionBlock::new(&config, vb).unwrap();

        let mut cache = RotatingKvCache::new(config.attention_window_size);
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, config.hidden_size), &device).unwrap();
        let out = attn.forward(&x, Some(&mut cache)).unwrap();
        assert_eq!(out.dims(), &[1, 4, config.hidden_size]);
        assert_eq!(cache.offset(), 4);

        for _ in 0..8 {
            let x1 = Tensor::randn(0.0f32, 1.0, (1, 1, config.hidden_size), &device).unwrap();
            let out1 = attn.forward(&x1, Some(&mut cache)).unwrap();
            assert_eq!(out1.dims(), &[1, 1, config.hidden_size]);
        }
        // Cache stays bounded by the window while the offset keeps advancing
        assert!(cache.len() <= config.attention_window_size);
        assert_eq!(cache.offset(), 12);
    }
}
