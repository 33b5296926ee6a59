//! Training loop for the Griffin language model.
//!
//! AdamW with a selectable learning rate schedule, periodic loss reporting
//! with throughput, periodic validation (loss and perplexity), and
//! safetensors checkpointing through the `VarMap`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Tensor, D};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::BatchIterator;
use crate::error::{GriffinError, GriffinResult};
use crate::model::GriffinModel;

/// Learning rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Constant learning rate
    Constant,
    /// Linear warmup then constant
    Warmup {
        /// Number of warmup steps
        warmup_steps: usize,
    },
    /// Cosine annealing with linear warmup
    Cosine {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of training steps
        total_steps: usize,
    },
}

impl LrSchedule {
    /// Learning rate at a given step for a base (peak) learning rate.
    pub fn lr_at(&self, step: usize, base_lr: f64) -> f64 {
        match self {
            LrSchedule::Constant => base_lr,

            LrSchedule::Warmup { warmup_steps } => {
                if *warmup_steps == 0 {
                    base_lr
                } else {
                    base_lr * (step as f64 / *warmup_steps as f64).min(1.0)
                }
            }

            LrSchedule::Cosine {
                warmup_steps,
                total_steps,
            } => {
                if step < *warmup_steps {
                    base_lr * (step as f64 / *warmup_steps as f64)
                } else {
                    let progress = (step - warmup_steps) as f64
                        / (total_steps.saturating_sub(*warmup_steps)).max(1) as f64;
                    let cosine_decay =
                        0.5 * (1.0 + (std::f64::consts::PI * progress.min(1.0)).cos());
                    base_lr * cosine_decay
                }
            }
        }
    }
}

/// Hyperparameters of the training loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Peak learning rate
    pub learning_rate: f64,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Sequences per batch
    pub batch_size: usize,
    /// Tokens per sequence
    pub context_size: usize,
    /// Total optimizer steps
    pub num_iters: usize,
    /// Learning rate schedule
    pub schedule: LrSchedule,
    /// Log training loss and throughput every this many steps
    pub steps_per_report: usize,
    /// Run validation every this many steps
    pub steps_per_eval: usize,
    /// Write a checkpoint every this many steps (None disables)
    pub save_every: Option<usize>,
    /// Directory for checkpoints and the config file
    pub checkpoint_dir: Option<PathBuf>,
    /// Shuffling seed
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.01,
            batch_size: 32,
            context_size: 1024,
            num_iters: 10_000,
            schedule: LrSchedule::Warmup { warmup_steps: 200 },
            steps_per_report: 10,
            steps_per_eval: 1000,
            save_every: None,
            checkpoint_dir: None,
            seed: 0,
        }
    }
}

/// Next-token cross entropy over a batch of logits `(batch, seq, vocab)`
/// and targets `(batch, seq)`.
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> GriffinResult<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let logits = logits.reshape((batch * seq_len, vocab))?;
    let targets = targets.reshape(batch * seq_len)?;
    Ok(loss::cross_entropy(&logits, &targets)?)
}

/// Summed next-token cross entropy over a batch, for token-normalized
/// evaluation.
pub fn cross_entropy_sum(logits: &Tensor, targets: &Tensor) -> GriffinResult<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    let log_probs =
        candle_nn::ops::log_softmax(&logits.reshape((batch * seq_len, vocab))?, D::Minus1)?;
    let targets = targets.reshape((batch * seq_len, 1))?;
    let picked = log_probs.gather(&targets, D::Minus1)?;
    Ok(picked.sum_all()?.neg()?)
}

pub struct Trainer {
    model: GriffinModel,
    varmap: VarMap,
    optimizer: AdamW,
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(model: GriffinModel, varmap: VarMap, config: TrainerConfig) -> GriffinResult<Self> {
        if config.num_iters == 0 {
            return Err(GriffinError::training("num_iters must be > 0"));
        }
        if config.steps_per_report == 0 || config.steps_per_eval == 0 {
            return Err(GriffinError::training(
                "steps_per_report and steps_per_eval must be > 0",
            ));
        }
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            model,
            varmap,
            optimizer,
            config,
        })
    }

    pub fn model(&self) -> &GriffinModel {
        &self.model
    }

    /// Learning rate at a given step, per the configured schedule.
    fn learning_rate_at(&self, step: usize) -> f64 {
        self.config.schedule.lr_at(step, self.config.learning_rate)
    }

    /// One optimizer step. Returns the batch loss.
    pub fn train_step(
        &mut self,
        inputs: &Tensor,
        targets: &Tensor,
        step: usize,
    ) -> GriffinResult<f64> {
        self.optimizer.set_learning_rate(self.learning_rate_at(step));

        let logits = self.model.forward(inputs, None)?;
        let batch_loss = cross_entropy_loss(&logits, targets)?;
        self.optimizer.backward_step(&batch_loss)?;

        Ok(batch_loss.to_scalar::<f32>()? as f64)
    }

    /// Per-token loss over a set of evaluation batches, without updates.
    /// Losses are summed over every window (including a partial final
    /// batch) and normalized by the total target-token count.
    pub fn evaluate(&self, batches: &[(Tensor, Tensor)]) -> GriffinResult<f64> {
        let mut total_loss = 0.0;
        let mut total_tokens = 0usize;
        for (inputs, targets) in batches {
            let logits = self.model.forward(inputs, None)?;
            total_loss += cross_entropy_sum(&logits, targets)?.to_scalar::<f32>()? as f64;
            total_tokens += targets.elem_count();
        }
        if total_tokens == 0 {
            return Err(GriffinError::data("no evaluation tokens"));
        }
        Ok(total_loss / total_tokens as f64)
    }

    /// Run the full training loop.
    ///
    /// Draws `num_iters` batches from the endless iterator, reporting and
    /// validating at the configured cadences. Returns the final validation
    /// loss when validation batches are given, otherwise the last training
    /// report average.
    pub fn train(
        &mut self,
        train_iter: &mut BatchIterator,
        valid_batches: Option<&[(Tensor, Tensor)]>,
    ) -> GriffinResult<f64> {
        if let Some(dir) = self.config.checkpoint_dir.clone() {
            std::fs::create_dir_all(&dir)?;
            self.model.config().save(&dir.join("config.json"))?;
        }

        info!(
            num_iters = self.config.num_iters,
            batch_size = self.config.batch_size,
            context_size = self.config.context_size,
            params = self.model.config().parameter_count(),
            "starting training"
        );

        let mut window_losses = Vec::with_capacity(self.config.steps_per_report);
        let mut window_start = Instant::now();
        let mut last_reported = 0.0;

        for step in 0..self.config.num_iters {
            let (inputs, targets) = train_iter
                .next()
                .ok_or_else(|| GriffinError::training("training iterator ended early"))??;
            let batch_loss = self.train_step(&inputs, &targets, step)?;
            window_losses.push(batch_loss);

            if (step + 1) % self.config.steps_per_report == 0 {
                let avg = window_losses.iter().sum::<f64>() / window_losses.len() as f64;
                let elapsed = window_start.elapsed().as_secs_f64();
                let its_per_sec = window_losses.len() as f64 / elapsed;
                info!(
                    step = step + 1,
                    loss = avg,
                    lr = self.learning_rate_at(step),
                    it_per_sec = its_per_sec,
                    "train"
                );
                last_reported = avg;
                window_losses.clear();
                window_start = Instant::now();
            }

            if let Some(batches) = valid_batches {
                if (step + 1) % self.config.steps_per_eval == 0 {
                    let val_loss = self.evaluate(batches)?;
                    info!(
                        step = step + 1,
                        val_loss,
                        val_ppl = val_loss.exp(),
                        "eval"
                    );
                    last_reported = val_loss;
                }
            }

            if let (Some(every), Some(dir)) = (self.config.save_every, &self.config.checkpoint_dir)
            {
                if (step + 1) % every == 0 {
                    let path = dir.join(format!("checkpoint_{:06}.safetensors", step + 1));
                    self.save_checkpoint(&path)?;
                }
            }
        }

        let final_loss = match valid_batches {
            Some(batches) => {
                let val_loss = self.evaluate(batches)?;
                info!(val_loss, val_ppl = val_loss.exp(), "final eval");
                val_loss
            }
            None => last_reported,
        };

        if let Some(dir) = &self.config.checkpoint_dir {
            self.save_checkpoint(&dir.join("final.safetensors"))?;
        }

        Ok(final_loss)
    }

    /// Write all model weights to a safetensors file.
    pub fn save_checkpoint(&self, path: &Path) -> GriffinResult<()> {
        self.varmap.save(path)?;
        info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }

    /// Load weights from a safetensors file into the existing variables.
    pub fn load_checkpoint(&mut self, path: &Path) -> GriffinResult<()> {
        self.varmap.load(path)?;
        info!(path = %path.display(), "loaded checkpoint");
        Ok(())
    }
}
