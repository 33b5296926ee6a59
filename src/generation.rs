//! Autoregressive sampling with cached decoding.
//!
//! The prompt is prefilled in one forward pass through fresh caches, then
//! tokens are decoded one step at a time. The recurrent layers carry fixed
//! size state and the attention caches stay bounded by the window, so memory
//! does not grow with the number of generated tokens. Absolute positions
//! still index the precomputed rotary table, which caps a single run at
//! `max_seq_length` positions.

use candle_core::{Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{GriffinError, GriffinResult};
use crate::model::GriffinModel;

/// Sampling settings.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Number of tokens to generate
    pub max_tokens: usize,
    /// Softmax temperature; 0 means greedy argmax
    pub temperature: f64,
    /// Stop early when this token is produced
    pub eos_token: Option<u32>,
    /// Sampling seed
    pub seed: u64,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: 1.0,
            eos_token: None,
            seed: 0,
        }
    }
}

fn sample_token(logits: &Tensor, temperature: f64, rng: &mut StdRng) -> GriffinResult<u32> {
    if temperature <= 0.0 {
        let token = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;
        return Ok(token);
    }
    let scaled = logits.affine(1.0 / temperature, 0.0)?;
    let probs: Vec<f32> = candle_nn::ops::softmax_last_dim(&scaled)?.to_vec1()?;
    let dist = WeightedIndex::new(&probs)
        .map_err(|e| GriffinError::Sampling(e.to_string()))?;
    Ok(dist.sample(rng) as u32)
}

/// Generate a continuation of `prompt` token ids.
///
/// Returns only the newly generated tokens, not the prompt. The cache state
/// is bounded, but positions feed the rotary table, so the prompt plus the
/// requested tokens must fit within the model's `max_seq_length`.
pub fn generate(
    model: &GriffinModel,
    prompt: &[u32],
    config: &GenerateConfig,
) -> GriffinResult<Vec<u32>> {
    if prompt.is_empty() {
        return Err(GriffinError::data("prompt must not be empty"));
    }
    let max_positions = model.config().max_seq_length;
    if prompt.len() + config.max_tokens > max_positions {
        return Err(GriffinError::data(format!(
            "prompt of {} plus {} requested tokens exceeds max_seq_length {}",
            prompt.len(),
            config.max_tokens,
            max_positions
        )));
    }

    let device = model.device();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut caches = model.make_cache();

    // Prefill: one pass over the whole prompt, keep the last position
    let input = Tensor::from_vec(prompt.to_vec(), (1, prompt.len()), &device)?;
    let logits = model.forward(&input, Some(&mut caches))?;
    let mut last = logits
        .narrow(1, prompt.len() - 1, 1)?
        .squeeze(1)?
        .squeeze(0)?;

    let mut output = Vec::with_capacity(config.max_tokens);
    for _ in 0..config.max_tokens {
        let token = sample_token(&last, config.temperature, &mut rng)?;
        if config.eos_token == Some(token) {
            break;
        }
        output.push(token);

        let input = Tensor::from_vec(vec![token], (1, 1), &device)?;
        let logits = model.forward(&input, Some(&mut caches))?;
        last = logits.squeeze(1)?.squeeze(0)?;
    }

    debug!(
        prompt_len = prompt.len(),
        generated = output.len(),
        "generation finished"
    );
    Ok(output)
}
