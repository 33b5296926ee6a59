//! Per-layer inference caches.
//!
//! Recurrent layers carry two state slots (the temporal conv tail and the
//! RG-LRU hidden state); attention layers carry a rolling key/value buffer
//! bounded by the attention window. During training no cache is used.

use candle_core::{Result, Tensor};

/// State slots for a recurrent layer.
///
/// `conv_state` holds the last `kernel_width - 1` input frames of the
/// temporal convolution, `lru_state` the RG-LRU hidden state `(batch, width)`.
#[derive(Debug, Default, Clone)]
pub struct RecurrentCache {
    conv_state: Option<Tensor>,
    lru_state: Option<Tensor>,
}

impl RecurrentCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last conv input frames, if any step ran before.
    pub fn conv_state(&self) -> Option<&Tensor> {
        self.conv_state.as_ref()
    }

    pub fn set_conv_state(&mut self, state: Tensor) {
        self.conv_state = Some(state);
    }

    /// RG-LRU hidden state, if any step ran before.
    pub fn lru_state(&self) -> Option<&Tensor> {
        self.lru_state.as_ref()
    }

    pub fn set_lru_state(&mut self, state: Tensor) {
        self.lru_state = Some(state);
    }

    /// Drop all state, restarting the sequence.
    pub fn reset(&mut self) {
        self.conv_state = None;
        self.lru_state = None;
    }
}

/// Rolling key/value buffer for local attention.
///
/// Keys and values are stored as `(batch, 1, seq, head_dim)` (multi-query:
/// a single KV head). A fetch returns the stored history concatenated with
/// the new entries; the attention mask enforces the window, so fetches may
/// briefly exceed it during prefill. The buffer retains at most
/// `window - 1` positions between calls, which makes a single-step fetch
/// span exactly the window. `offset` keeps counting absolute positions past
/// the window so RoPE stays consistent.
#[derive(Debug, Clone)]
pub struct RotatingKvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    window: usize,
    offset: usize,
}

impl RotatingKvCache {
    /// Create an empty cache for an attention window of `window` positions.
    pub fn new(window: usize) -> Self {
        Self {
            keys: None,
            values: None,
            window,
            offset: 0,
        }
    }

    /// Absolute position of the next token to be appended.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.keys
            .as_ref()
            .and_then(|k| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append new keys/values along the sequence axis and return the full
    /// buffers to attend over. What is kept for the next call is trimmed to
    /// the last `window - 1` positions.
    pub fn update_and_fetch(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let added = k.dim(2)?;

        let keys = match &self.keys {
            Some(prev) => Tensor::cat(&[prev, k], 2)?,
            None => k.clone(),
        };
        let values = match &self.values {
            Some(prev) => Tensor::cat(&[prev, v], 2)?,
            None => v.clone(),
        };
        self.offset += added;

        let len = keys.dim(2)?;
        let keep = self.window.saturating_sub(1);
        if keep == 0 {
            self.keys = None;
            self.values = None;
        } else if len > keep {
            self.keys = Some(keys.narrow(2, len - keep, keep)?.contiguous()?);
            self.values = Some(values.narrow(2, len - keep, keep)?.contiguous()?);
        } else {
            self.keys = Some(keys.clone());
            self.values = Some(values.clone());
        }

        Ok((keys, values))
    }

    /// Drop all state, restarting the sequence.
    pub fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.offset = 0;
    }
}

/// Cache for one residual layer, matching its temporal block kind.
#[derive(Debug, Clone)]
pub enum LayerCache {
    Recurrent(RecurrentCache),
    Attention(RotatingKvCache),
}

impl LayerCache {
    /// Drop all state, restarting the sequence.
    pub fn reset(&mut self) {
        match self {
            LayerCache::Recurrent(c) => c.reset(),
            LayerCache::Attention(c) => c.reset(),
        }
    }
}
