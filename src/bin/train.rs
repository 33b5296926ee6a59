//! Train a Griffin language model on plain text files.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, ValueEnum};
use tokenizers::Tokenizer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use griffin_model_rs::{
    eval_batches, BatchIterator, GriffinConfig, GriffinModel, LrSchedule, TextDataset, Trainer,
    TrainerConfig,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScheduleArg {
    Constant,
    Warmup,
    Cosine,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train a Griffin language model")]
struct Args {
    /// Training text file
    #[arg(long)]
    train_file: PathBuf,

    /// Validation text file; omit to use the leading tenth of the training
    /// corpus
    #[arg(long)]
    valid_file: Option<PathBuf>,

    /// Test text file; omit to use the leading tenth of the training corpus
    #[arg(long)]
    test_file: Option<PathBuf>,

    /// Evaluate on the test set after training
    #[arg(long)]
    eval_test: bool,

    /// Tokenizer file (tokenizers json); omit for byte-level tokens
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Model configuration json; omit for the small preset
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Sequences per batch
    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Tokens per sequence
    #[arg(long, default_value_t = 1024)]
    context_size: usize,

    /// Total optimizer steps
    #[arg(long, default_value_t = 10_000)]
    num_iters: usize,

    /// Peak learning rate
    #[arg(long, default_value_t = 3e-4)]
    learning_rate: f64,

    /// AdamW weight decay
    #[arg(long, default_value_t = 0.01)]
    weight_decay: f64,

    /// Learning rate schedule
    #[arg(long, value_enum, default_value_t = ScheduleArg::Warmup)]
    lr_schedule: ScheduleArg,

    /// Steps of linear learning rate warmup
    #[arg(long, default_value_t = 200)]
    lr_warmup: usize,

    /// Report training loss every this many steps
    #[arg(long, default_value_t = 10)]
    steps_per_report: usize,

    /// Run validation every this many steps
    #[arg(long, default_value_t = 1000)]
    steps_per_eval: usize,

    /// Write a checkpoint every this many steps
    #[arg(long)]
    save_every: Option<usize>,

    /// Directory for checkpoints
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Resume from a safetensors checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Shuffling and initialization seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Force CPU even when a GPU is available
    #[arg(long)]
    cpu: bool,
}

fn load_dataset(path: &PathBuf, tokenizer: Option<&Tokenizer>) -> Result<TextDataset> {
    let dataset = match tokenizer {
        Some(tok) => TextDataset::from_text_file(path, tok)?,
        None => TextDataset::from_text_file_bytes(path)?,
    };
    info!(path = %path.display(), tokens = dataset.len(), "loaded dataset");
    Ok(dataset)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    info!(?device, "selected device");

    let tokenizer = args
        .tokenizer
        .as_ref()
        .map(|path| {
            Tokenizer::from_file(path)
                .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))
        })
        .transpose()?;

    let mut model_config = match &args.model_config {
        Some(path) => GriffinConfig::load(path)
            .with_context(|| format!("loading model config from {}", path.display()))?,
        None => GriffinConfig::tiny(),
    };
    if tokenizer.is_none() && args.model_config.is_none() {
        // Byte-level tokens only need 256 entries
        model_config.vocab_size = 256;
    }
    model_config.validate()?;

    let train_data = load_dataset(&args.train_file, tokenizer.as_ref())?;
    // A single corpus drives the whole cycle: without explicit files, valid
    // and test are the leading tenth of the training stream
    let (split_valid, split_test) = train_data.split_valid_test();
    let valid_data = match &args.valid_file {
        Some(path) => load_dataset(path, tokenizer.as_ref())?,
        None => split_valid,
    };
    let test_data = match &args.test_file {
        Some(path) => Some(load_dataset(path, tokenizer.as_ref())?),
        None if args.eval_test => Some(split_test),
        None => None,
    };

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = GriffinModel::new(&model_config, vb)?;
    info!(
        params = model_config.parameter_count(),
        layers = model_config.num_layers,
        hidden = model_config.hidden_size,
        "built model"
    );

    let schedule = match args.lr_schedule {
        ScheduleArg::Constant => LrSchedule::Constant,
        ScheduleArg::Warmup => LrSchedule::Warmup {
            warmup_steps: args.lr_warmup,
        },
        ScheduleArg::Cosine => LrSchedule::Cosine {
            warmup_steps: args.lr_warmup,
            total_steps: args.num_iters,
        },
    };

    let trainer_config = TrainerConfig {
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        batch_size: args.batch_size,
        context_size: args.context_size,
        num_iters: args.num_iters,
        schedule,
        steps_per_report: args.steps_per_report,
        steps_per_eval: args.steps_per_eval,
        save_every: args.save_every,
        checkpoint_dir: Some(args.checkpoint_dir.clone()),
        seed: args.seed,
    };
    let mut trainer = Trainer::new(model, varmap, trainer_config)?;

    if let Some(path) = &args.resume {
        trainer.load_checkpoint(path)?;
    }

    let mut train_iter = BatchIterator::new(
        &train_data,
        args.batch_size,
        args.context_size,
        args.seed,
        &device,
    )?;
    let valid_batches =
        match eval_batches(&valid_data, args.batch_size, args.context_size, &device) {
            Ok(batches) => Some(batches),
            Err(e) if args.valid_file.is_none() => {
                warn!(error = %e, "validation split too small, training without validation");
                None
            }
            Err(e) => return Err(e.into()),
        };

    trainer.train(&mut train_iter, valid_batches.as_deref())?;

    if let Some(test) = test_data {
        let batches = eval_batches(&test, args.batch_size, args.context_size, &device)?;
        let test_loss = trainer.evaluate(&batches)?;
        info!(test_loss, test_ppl = test_loss.exp(), "test");
    }

    Ok(())
}
