//! Model configuration for the Griffin architecture.
//!
//! Provides the hyperparameters of the hybrid recurrent/attention stack and
//! presets from the published RecurrentGemma layout down to unit-test sizes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GriffinError, GriffinResult};

/// Kind of temporal mixing block inside a residual layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// RG-LRU gated linear recurrence with a causal temporal conv
    Recurrent,
    /// Local (windowed) multi-query attention
    Attention,
}

/// Configuration for the Griffin model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GriffinConfig {
    /// Residual stream width
    pub hidden_size: usize,
    /// Expanded width of the MLP block (projections use half of this)
    pub intermediate_size: usize,
    /// Number of heads, shared by attention and the RG-LRU gates
    pub num_heads: usize,
    /// Number of residual layers
    pub num_layers: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Width of the RG-LRU branch (None = hidden_size)
    pub lru_width: Option<usize>,
    /// Kernel width of the causal temporal convolution
    pub conv1d_temporal_width: usize,
    /// Context window of the local attention blocks
    pub attention_window_size: usize,
    /// Maximum sequence length (bounds the RoPE table)
    pub max_seq_length: usize,
    /// RMS norm epsilon
    pub rms_norm_eps: f64,
    /// RoPE theta for positional encoding
    pub rope_theta: f32,
    /// Soft cap applied to the output logits (0 disables)
    pub logits_soft_cap: f64,
    /// Scale token embeddings by sqrt(hidden_size)
    pub embeddings_scale_by_sqrt_dim: bool,
    /// Use a bias on the attention output projection
    pub attention_bias: bool,
    /// Reuse the embedding matrix as the LM head
    pub tied_embeddings: bool,
    /// Repeating cycle of temporal block kinds over the layers
    pub block_pattern: Vec<BlockKind>,
}

impl Default for GriffinConfig {
    fn default() -> Self {
        Self::tiny()
    }
}

impl GriffinConfig {
    /// Layout of the published RecurrentGemma 2B model.
    pub fn recurrent_gemma_2b() -> Self {
        Self {
            hidden_size: 2560,
            intermediate_size: 15360,
            num_heads: 10,
            num_layers: 26,
            vocab_size: 256_000,
            lru_width: None,
            conv1d_temporal_width: 4,
            attention_window_size: 2048,
            max_seq_length: 8192,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            logits_soft_cap: 30.0,
            embeddings_scale_by_sqrt_dim: true,
            attention_bias: true,
            tied_embeddings: true,
            block_pattern: vec![
                BlockKind::Recurrent,
                BlockKind::Recurrent,
                BlockKind::Attention,
            ],
        }
    }

    /// Small configuration for from-scratch experiments on a single GPU.
    pub fn tiny() -> Self {
        Self {
            hidden_size: 512,
            intermediate_size: 3072,
            num_heads: 4,
            num_layers: 9,
            vocab_size: 32_000,
            lru_width: None,
            conv1d_temporal_width: 4,
            attention_window_size: 512,
            max_seq_length: 2048,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            logits_soft_cap: 30.0,
            embeddings_scale_by_sqrt_dim: true,
            attention_bias: true,
            tied_embeddings: true,
            block_pattern: vec![
                BlockKind::Recurrent,
                BlockKind::Recurrent,
                BlockKind::Attention,
            ],
        }
    }

    /// Test configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            hidden_size: 32,
            intermediate_size: 64,
            num_heads: 2,
            num_layers: 3,
            vocab_size: 96,
            lru_width: None,
            conv1d_temporal_width: 4,
            attention_window_size: 8,
            max_seq_length: 64,
            rms_norm_eps: 1e-6,
            rope_theta: 10_000.0,
            logits_soft_cap: 30.0,
            embeddings_scale_by_sqrt_dim: true,
            attention_bias: true,
            tied_embeddings: false,
            block_pattern: vec![
                BlockKind::Recurrent,
                BlockKind::Recurrent,
                BlockKind::Attention,
            ],
        }
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Width of the RG-LRU branch
    pub fn lru_width(&self) -> usize {
        self.lru_width.unwrap_or(self.hidden_size)
    }

    /// Temporal block kind for a given layer (the pattern repeats cyclically)
    pub fn block_kind(&self, layer_idx: usize) -> BlockKind {
        self.block_pattern[layer_idx % self.block_pattern.len()]
    }

    /// Validate internal consistency of the configuration.
    pub fn validate(&self) -> GriffinResult<()> {
        if self.block_pattern.is_empty() {
            return Err(GriffinError::config("block_pattern must not be empty"));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(GriffinError::config(format!(
                "hidden_size {} not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.lru_width() % self.num_heads != 0 {
            return Err(GriffinError::config(format!(
                "lru_width {} not divisible by num_heads {}",
                self.lru_width(),
                self.num_heads
            )));
        }
        // Partial RoPE rotates head_dim / 2 dims, split into two halves
        if self.head_dim() % 4 != 0 {
            return Err(GriffinError::config(format!(
                "head_dim {} must be divisible by 4",
                self.head_dim()
            )));
        }
        if self.intermediate_size % 2 != 0 {
            return Err(GriffinError::config(
                "intermediate_size must be even (MLP projections use half of it)",
            ));
        }
        if self.attention_window_size == 0 {
            return Err(GriffinError::config("attention_window_size must be > 0"));
        }
        if self.conv1d_temporal_width < 2 {
            return Err(GriffinError::config("conv1d_temporal_width must be >= 2"));
        }
        Ok(())
    }

    /// Estimate parameter count
    pub fn parameter_count(&self) -> usize {
        let hidden = self.hidden_size;
        let lru = self.lru_width();
        let head_dim = self.head_dim();
        let half_inter = self.intermediate_size / 2;

        let embed = self.vocab_size * hidden;

        // linear_y, linear_x, linear_out + conv + gates + recurrent param
        let recurrent = 2 * (hidden * lru + lru)
            + (lru * hidden + hidden)
            + lru * self.conv1d_temporal_width
            + lru
            + 2 * (self.num_heads * head_dim * head_dim + lru)
            + lru;

        // full-width q/o, single-head k/v
        let attention = hidden * hidden + 2 * hidden * head_dim + hidden * hidden + hidden;

        let mlp = 2 * (hidden * half_inter + half_inter) + half_inter * hidden + hidden;
        let norms = 2 * hidden;

        let mut total = embed + hidden; // embeddings + final norm
        for i in 0..self.num_layers {
            total += match self.block_kind(i) {
                BlockKind::Recurrent => recurrent,
                BlockKind::Attention => attention,
            };
            total += mlp + norms;
        }
        if !self.tied_embeddings {
            total += hidden * self.vocab_size;
        }
        total
    }

    /// Write the configuration as JSON next to a checkpoint.
    pub fn save(&self, path: &Path) -> GriffinResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> GriffinResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
