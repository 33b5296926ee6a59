//! Gated linear recurrence (RG-LRU) and its surrounding block.
//!
//! The recurrent branch of a residual layer runs the input through a causal
//! depthwise temporal convolution and a Real-Gated Linear Recurrent Unit:
//! per-head sigmoid gates modulate both the input and the decay of a
//! diagonal linear recurrence `h_t = a_t * h_{t-1} + x_t`, with the input
//! scaled by `sqrt(1 - a_t^2)` so the state stays bounded.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};

use crate::cache::RecurrentCache;
use crate::config::GriffinConfig;

/// Decay sharpness of the recurrence gate.
const RECURRENT_GATE_SCALE: f64 = -8.0;

/// Causal depthwise convolution over the sequence axis.
///
/// Weight layout is `(channels, 1, kernel)` for candle's grouped conv1d.
/// Without a cache the input is left-padded with zeros; with a cache the last
/// `kernel - 1` input frames of the previous call are prepended instead.
pub struct TemporalConv1d {
    weight: Tensor,
    bias: Tensor,
    channels: usize,
    kernel_size: usize,
}

impl TemporalConv1d {
    pub fn new(channels: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.0,
            stdev: (1.0 / kernel_size as f64).sqrt(),
        };
        let weight = vb.get_with_hints((channels, 1, kernel_size), "weight", init)?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self {
            weight,
            bias,
            channels,
            kernel_size,
        })
    }

    /// Forward pass.
    /// Input: `(batch, seq_len, channels)`, optional cached tail of the
    /// previous input. Returns the output and the new tail (the last
    /// `kernel - 1` frames of the padded input).
    pub fn forward(&self, x: &Tensor, state: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let pad = self.kernel_size - 1;
        let padded = match state {
            Some(prev) => Tensor::cat(&[prev, x], 1)?,
            None => x.pad_with_zeros(1, pad, 0)?,
        };

        let tail_start = padded.dim(1)? - pad;
        let tail = padded.narrow(1, tail_start, pad)?.contiguous()?;

        // (B, L + pad, C) -> (B, C, L + pad) for conv, then back
        let y = padded
            .transpose(1, 2)?
            .contiguous()?
            .conv1d(&self.weight, 0, 1, 1, self.channels)?
            .transpose(1, 2)?;
        let y = y.broadcast_add(&self.bias)?;

        Ok((y, tail))
    }
}

/// Diagonal linear scan `h_t = a_t * h_{t-1} + x_t`.
///
/// Returns the per-step outputs and the final hidden state. A single-step
/// fast path avoids the loop during cached decoding.
pub fn rnn_scan(x: &Tensor, a: &Tensor, h0: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
    let (batch, seq_len, width) = x.dims3()?;

    if seq_len == 1 {
        let y = match h0 {
            Some(h) => a.mul(&h.unsqueeze(1)?)?.add(x)?,
            None => x.clone(),
        };
        let last = y.narrow(1, 0, 1)?.squeeze(1)?;
        return Ok((y, last));
    }

    let mut h = match h0 {
        Some(h) => h.clone(),
        None => Tensor::zeros((batch, width), x.dtype(), x.device())?,
    };

    let mut steps = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        let x_t = x.narrow(1, t, 1)?.squeeze(1)?;
        let a_t = a.narrow(1, t, 1)?.squeeze(1)?;
        h = a_t.mul(&h)?.add(&x_t)?;
        steps.push(h.unsqueeze(1)?);
    }

    let y = Tensor::cat(&steps, 1)?;
    Ok((y, h))
}

/// A Real-Gated Linear Recurrent Unit (RG-LRU) layer.
pub struct RgLru {
    recurrent_param: Tensor,
    input_gate_weight: Tensor,
    input_gate_bias: Tensor,
    recurrent_gate_weight: Tensor,
    recurrent_gate_bias: Tensor,
    width: usize,
    num_heads: usize,
    head_dim: usize,
}

impl RgLru {
    pub fn new(width: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = width / num_heads;

        // Decay parameter sits in softplus space; a small positive init puts
        // the per-channel decay a = exp(-8 * sigmoid(..) * softplus(p)) in a
        // usable range.
        let recurrent_param =
            vb.get_with_hints(width, "recurrent_param", Init::Uniform { lo: 0.5, up: 1.5 })?;

        let gate_init = Init::Randn {
            mean: 0.0,
            stdev: (1.0 / head_dim as f64).sqrt(),
        };
        let input_gate_weight = vb.get_with_hints(
            (num_heads, head_dim, head_dim),
            "input_gate_weight",
            gate_init,
        )?;
        let input_gate_bias =
            vb.get_with_hints((num_heads, head_dim), "input_gate_bias", Init::Const(0.0))?;
        let recurrent_gate_weight = vb.get_with_hints(
            (num_heads, head_dim, head_dim),
            "recurrent_gate_weight",
            gate_init,
        )?;
        let recurrent_gate_bias = vb.get_with_hints(
            (num_heads, head_dim),
            "recurrent_gate_bias",
            Init::Const(0.0),
        )?;

        Ok(Self {
            recurrent_param,
            input_gate_weight,
            input_gate_bias,
            recurrent_gate_weight,
            recurrent_gate_bias,
            width,
            num_heads,
            head_dim,
        })
    }

    /// Per-head block-diagonal gate: sigmoid of a head-wise linear map.
    fn gate(&self, x: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let h = x
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        // (B, H, L, D) @ (H, D, D) -> (B, H, L, D)
        let h = h.broadcast_matmul(weight)?;
        let h = h.broadcast_add(&bias.reshape((self.num_heads, 1, self.head_dim))?)?;
        let h = candle_nn::ops::sigmoid(&h)?;
        h.transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.width))
    }

    /// Forward pass.
    /// Input: `(batch, seq_len, width)`, optional previous hidden state
    /// `(batch, width)`. Returns the outputs and the final hidden state.
    pub fn forward(&self, x: &Tensor, state: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;

        let gate_x = self.gate(x, &self.input_gate_weight, &self.input_gate_bias)?;
        let gate_a = self.gate(x, &self.recurrent_gate_weight, &self.recurrent_gate_bias)?;

        // softplus(p) = log(1 + exp(p))
        let softplus = self.recurrent_param.exp()?.affine(1.0, 1.0)?.log()?;
        let log_a = gate_a
            .broadcast_mul(&softplus)?
            .affine(RECURRENT_GATE_SCALE, 0.0)?;
        let a = log_a.exp()?;
        let a_square = log_a.affine(2.0, 0.0)?.exp()?;

        let gated_x = x.mul(&gate_x)?;

        // Gamma normalization keeps the state bounded; the first step of a
        // fresh sequence has no state to decay, so its multiplier is 1.
        let mut multiplier = a_square.affine(-1.0, 1.0)?.sqrt()?;
        if state.is_none() {
            let ones = Tensor::ones((batch, 1, self.width), x.dtype(), x.device())?;
            multiplier = if seq_len == 1 {
                ones
            } else {
                Tensor::cat(&[ones, multiplier.narrow(1, 1, seq_len - 1)?], 1)?
            };
        }
        let normalized_x = gated_x.mul(&multiplier)?;

        rnn_scan(&normalized_x, &a, state)
    }
}

/// Recurrent temporal block: gated GeLU branch times a conv + RG-LRU branch.
pub struct RecurrentBlock {
    linear_y: Linear,
    linear_x: Linear,
    linear_out: Linear,
    conv_1d: TemporalConv1d,
    rg_lru: RgLru,
}

impl RecurrentBlock {
    pub fn new(config: &GriffinConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.hidden_size;
        let lru_width = config.lru_width();

        let linear_y = linear(width, lru_width, vb.pp("linear_y"))?;
        let linear_x = linear(width, lru_width, vb.pp("linear_x"))?;
        let linear_out = linear(lru_width, width, vb.pp("linear_out"))?;
        let conv_1d =
            TemporalConv1d::new(lru_width, config.conv1d_temporal_width, vb.pp("conv_1d"))?;
        let rg_lru = RgLru::new(lru_width, config.num_heads, vb.pp("rg_lru"))?;

        Ok(Self {
            linear_y,
            linear_x,
            linear_out,
            conv_1d,
            rg_lru,
        })
    }

    /// Forward pass.
    /// Input: `(batch, seq_len, hidden_size)`; the cache, when present, is
    /// advanced in place.
    pub fn forward(&self, x: &Tensor, cache: Option<&mut RecurrentCache>) -> Result<Tensor> {
        let y = self.linear_y.forward(x)?.gelu()?;

        let x = self.linear_x.forward(x)?;
        let x = match cache {
            Some(cache) => {
                let (x, conv_tail) = self.conv_1d.forward(&x, cache.conv_state())?;
                cache.set_conv_state(conv_tail);
                let (x, lru_state) = self.rg_lru.forward(&x, cache.lru_state())?;
                cache.set_lru_state(lru_state);
                x
            }
            None => {
                let (x, _) = self.conv_1d.forward(&x, None)?;
                let (x, _) = self.rg_lru.forward(&x, None)?;
                x
            }
        };

        self.linear_out.forward(&x.mul(&y)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn test_conv_shapes() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let conv = TemporalConv1d::new(8, 4, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 6, 8), &device).unwrap();
        let (y, tail) = conv.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[2, 6, 8]);
        assert_eq!(tail.dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_conv_cached_matches_full() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let conv = TemporalConv1d::new(4, 4, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (1, 6, 4), &device).unwrap();
        let (full, _) = conv.forward(&x, None).unwrap();

        // Same input split into two chunks through the cache
        let first = x.narrow(1, 0, 3).unwrap();
        let second = x.narrow(1, 3, 3).unwrap();
        let (y1, tail) = conv.forward(&first, None).unwrap();
        let (y2, _) = conv.forward(&second, Some(&tail)).unwrap();
        let chunked = Tensor::cat(&[y1, y2], 1).unwrap();

        let diff = (full - chunked)
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
            assert!(d < 1e-5, "cached conv diverged: {}", d);
        }
    }

    #[test]
    fn test_rnn_scan_decay() {
        let device = Device::Cpu;
        // x = [1, 0, 0], a = 0.5 -> h = [1, 0.5, 0.25]
        let x = Tensor::from_vec(vec![1.0f32, 0.0, 0.0], (1, 3, 1), &device).unwrap();
        let a = Tensor::full(0.5f32, (1, 3, 1), &device).unwrap();

        let (y, last) = rnn_scan(&x, &a, None).unwrap();
        let vals: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!((vals[0] - 1.0).abs() < 1e-6);
        assert!((vals[1] - 0.5).abs() < 1e-6);
        assert!((vals[2] - 0.25).abs() < 1e-6);

        let last: Vec<f32> = last.flatten_all().unwrap().to_vec1().unwrap();
        assert!((last[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_rnn_scan_single_step_matches_loop() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 1, 4), &device).unwrap();
        let a = Tensor::full(0.9f32, (2, 1, 4), &device).unwrap();
        let h0 = Tensor::randn(0.0f32, 1.0, (2, 4), &device).unwrap();

        let (y, last) = rnn_scan(&x, &a, Some(&h0)).unwrap();
        assert_eq!(y.dims(), &[2, 1, 4]);
        assert_eq!(last.dims(), &[2, 4]);

        // h = 0.9 * h0 + x
        let expected = ((&h0 * 0.9).unwrap() + x.squeeze(1).unwrap()).unwrap();
        let diff = (last - expected)
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
            assert!(d < 1e-6);
        }
    }

    #[test]
    fn test_rg_lru_shapes_and_state() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let lru = RgLru::new(16, 2, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 5, 16), &device).unwrap();
        let (y, state) = lru.forward(&x, None).unwrap();
        assert_eq!(y.dims(), &[2, 5, 16]);
        assert_eq!(state.dims(), &[2, 16]);

        // Continue from the returned state with a single step
        let x1 = Tensor::randn(0.0f32, 1.0, (2, 1, 16), &device).unwrap();
        let (y1, state1) = lru.forward(&x1, Some(&state)).unwrap();
        assert_eq!(y1.dims(), &[2, 1, 16]);
        assert_eq!(state1.dims(), &[2, 16]);
    }

    #[test]
    fn test_recurrent_block_forward() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = GriffinConfig::test();
        let block = RecurrentBlock::new(&config, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 6, config.hidden_size), &device).unwrap();
        let out = block.forward(&x, None).unwrap();
        assert_eq!(out.dims(), &[2, 6, config.hidden_size]);
    }

    #[test]
    fn test_recurrent_block_cached_decode() {
        let device = Device::Cpu;
        let (_varmap, vb) = vb(&device);
        let config = GriffinConfig::test();
        let block = RecurrentBlock::new(&config, vb).unwrap();

        let mut cache = RecurrentCache::new();
        let x = Tensor::randn(0.0f32, 1.0, (1, 4, config.hidden_size), &device).unwrap();
        let out = block.forward(&x, Some(&mut cache)).unwrap();
        assert_eq!(out.dims(), &[1, 4, config.hidden_size]);
        assert!(cache.conv_state().is_some());
        assert!(cache.lru_state().is_some());

        // Single decode step continues from the cache
        let x1 = Tensor::randn(0.0f32, 1.0, (1, 1, config.hidden_size), &device).unwrap();
        let out1 = block.forward(&x1, Some(&mut cache)).unwrap();
        assert_eq!(out1.dims(), &[1, 1, config.hidden_size]);
    }
}
