//! Griffin-style hybrid recurrent/attention language model in Rust.
//!
//! This crate implements a RecurrentGemma-like architecture on top of candle:
//! - Residual blocks alternating RG-LRU gated linear recurrences and local
//!   (windowed) multi-query attention
//! - Gated GeLU feed-forward blocks with Gemma-style RMS norms
//! - Per-layer inference caches (rolling KV buffer / recurrent state slots)
//! - A minimal AdamW training loop with warmup, periodic eval and
//!   safetensors checkpoints
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//! use griffin_model_rs::{GriffinConfig, GriffinModel};
//!
//! let config = GriffinConfig::tiny();
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let model = GriffinModel::new(&config, vb).unwrap();
//! ```

pub mod attention;
pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod generation;
pub mod layer;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod recurrent;
pub mod trainer;

pub use cache::{LayerCache, RecurrentCache, RotatingKvCache};
pub use config::{BlockKind, GriffinConfig};
pub use data::{eval_batches, BatchIterator, TextDataset};
pub use error::{GriffinError, GriffinResult};
pub use generation::{generate, GenerateConfig};
pub use model::GriffinModel;
pub use trainer::{LrSchedule, Trainer, TrainerConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cache::LayerCache;
    pub use crate::config::{BlockKind, GriffinConfig};
    pub use crate::data::{BatchIterator, TextDataset};
    pub use crate::error::{GriffinError, GriffinResult};
    pub use crate::model::GriffinModel;
    pub use crate::trainer::{LrSchedule, Trainer, TrainerConfig};
}
