//! Token datasets and batch iteration for language model training.
//!
//! A dataset is a flat stream of token ids, chopped into non-overlapping
//! windows of `context + 1` tokens; inputs are the first `context` tokens of
//! a window and targets the last `context`. Batches are drawn in shuffled
//! order, reshuffling at every epoch boundary so iteration never ends.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::error::{GriffinError, GriffinResult};

/// A flat stream of token ids.
#[derive(Debug, Clone)]
pub struct TextDataset {
    tokens: Vec<u32>,
}

impl TextDataset {
    pub fn from_tokens(tokens: Vec<u32>) -> Self {
        Self { tokens }
    }

    /// Tokenize a text file with a `tokenizers` tokenizer.
    pub fn from_text_file(path: &Path, tokenizer: &Tokenizer) -> GriffinResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let encoding = tokenizer
            .encode(text, false)
            .map_err(|e| GriffinError::tokenizer(e.to_string()))?;
        let tokens = encoding.get_ids().to_vec();
        debug!(path = %path.display(), tokens = tokens.len(), "tokenized dataset");
        Ok(Self { tokens })
    }

    /// Byte-level fallback: each byte is its own token (vocab size 256).
    /// Useful for smoke tests and corpora without a trained tokenizer.
    pub fn from_text_file_bytes(path: &Path) -> GriffinResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self {
            tokens: bytes.into_iter().map(u32::from).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Carve validation and test sets out of a single corpus: each is the
    /// leading tenth of the token stream, while training keeps the whole
    /// stream. Lets one text file drive the full train/eval cycle.
    pub fn split_valid_test(&self) -> (TextDataset, TextDataset) {
        let head = self.tokens.len() / 10;
        let valid = TextDataset::from_tokens(self.tokens[..head].to_vec());
        let test = TextDataset::from_tokens(self.tokens[..head].to_vec());
        (valid, test)
    }

    /// Chop the stream into non-overlapping windows of `context_size + 1`
    /// tokens, dropping the tail remainder.
    pub fn to_samples(&self, context_size: usize) -> GriffinResult<Vec<&[u32]>> {
        let window = context_size + 1;
        let count = self.tokens.len() / window;
        if count == 0 {
            return Err(GriffinError::data(format!(
                "dataset of {} tokens is too small for context size {}",
                self.tokens.len(),
                context_size
            )));
        }
        Ok(self.tokens.chunks_exact(window).collect())
    }
}

/// Endless shuffled iterator over `(inputs, targets)` batches.
///
/// Each item is a pair of `(batch_size, context_size)` u32 tensors, with
/// targets shifted one token ahead of inputs. Windows that do not fill a
/// whole batch at the end of an epoch are skipped.
pub struct BatchIterator {
    windows: Vec<Vec<u32>>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    context_size: usize,
    device: Device,
    rng: StdRng,
}

impl BatchIterator {
    pub fn new(
        dataset: &TextDataset,
        batch_size: usize,
        context_size: usize,
        seed: u64,
        device: &Device,
    ) -> GriffinResult<Self> {
        let windows: Vec<Vec<u32>> = dataset
            .to_samples(context_size)?
            .into_iter()
            .map(<[u32]>::to_vec)
            .collect();
        if windows.len() < batch_size {
            return Err(GriffinError::data(format!(
                "{} windows cannot fill a batch of {}",
                windows.len(),
                batch_size
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..windows.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            windows,
            order,
            cursor: 0,
            batch_size,
            context_size,
            device: device.clone(),
            rng,
        })
    }

    /// Number of full batches per epoch.
    pub fn batches_per_epoch(&self) -> usize {
        self.windows.len() / self.batch_size
    }

    fn next_batch(&mut self) -> GriffinResult<(Tensor, Tensor)> {
        if self.cursor + self.batch_size > self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }

        let mut inputs = Vec::with_capacity(self.batch_size * self.context_size);
        let mut targets = Vec::with_capacity(self.batch_size * self.context_size);
        for &idx in &self.order[self.cursor..self.cursor + self.batch_size] {
            let window = &self.windows[idx];
            inputs.extend_from_slice(&window[..self.context_size]);
            targets.extend_from_slice(&window[1..]);
        }
        self.cursor += self.batch_size;

        let shape = (self.batch_size, self.context_size);
        let inputs = Tensor::from_vec(inputs, shape, &self.device)?;
        let targets = Tensor::from_vec(targets, shape, &self.device)?;
        Ok((inputs, targets))
    }
}

impl Iterator for BatchIterator {
    type Item = GriffinResult<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

/// All batches of a dataset in order, for evaluation. Every window is
/// covered: the last batch may be smaller than `batch_size`.
pub fn eval_batches(
    dataset: &TextDataset,
    batch_size: usize,
    context_size: usize,
    device: &Device,
) -> GriffinResult<Vec<(Tensor, Tensor)>> {
    let windows = dataset.to_samples(context_size)?;
    let mut batches = Vec::new();
    for chunk in windows.chunks(batch_size) {
        let mut inputs = Vec::with_capacity(chunk.len() * context_size);
        let mut targets = Vec::with_capacity(chunk.len() * context_size);
        for window in chunk {
            inputs.extend_from_slice(&window[..context_size]);
            targets.extend_from_slice(&window[1..]);
        }
        let shape = (chunk.len(), context_size);
        batches.push((
            Tensor::from_vec(inputs, shape, device)?,
            Tensor::from_vec(targets, shape, device)?,
        ));
    }
    Ok(batches)
}
