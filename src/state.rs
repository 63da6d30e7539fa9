//! Per-sequence mutable buffers.
//!
//! Stages never own memory. They name buffers by [`BufferId`] and the [`RuntimeState`] of the
//! sequence being generated resolves those names, so one plan can drive any number of
//! independent sequences.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::{
    config::ModelConfig,
    error::{Error, Result},
};

/// Stable names of the runtime buffers
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum BufferId {
    /// Current sequence position, refreshed from the host every step
    Position,
    /// Embedding row of the current token, refreshed from the host every step
    Embedding,
    /// Residual stream
    X,
    /// Normalized residual stream
    Xb,
    NormScratch,
    Q,
    K,
    V,
    /// Output of a fused QKV projection before splitting
    Qkv,
    /// One inverse RMS slot per query head
    QNormScratch,
    /// One inverse RMS slot per key head
    KNormScratch,
    KeyCache,
    ValueCache,
    /// Attention scores, one context-length row per head
    Att,
    AttnOut,
    FfnNormScratch,
    /// Output of a fused gate/up projection before splitting
    GateUp,
    /// Gated feed-forward activations
    Hidden,
    LogitsNormScratch,
    Logits,
}

impl BufferId {
    /// Number of `f32` slots the buffer takes for this configuration
    pub fn len(&self, c: &ModelConfig) -> usize {
        match self {
            Self::Position
            | Self::NormScratch
            | Self::FfnNormScratch
            | Self::LogitsNormScratch => 1,
            Self::Embedding | Self::X | Self::Xb => c.dim,
            Self::Q | Self::AttnOut => c.q_dim(),
            Self::K | Self::V => c.kv_dim(),
            Self::Qkv => c.q_dim() + 2 * c.kv_dim(),
            Self::QNormScratch => c.n_heads,
            Self::KNormScratch => c.n_kv_heads,
            Self::KeyCache | Self::ValueCache => c.n_layers * c.context_length * c.kv_dim(),
            Self::Att => c.n_heads * c.context_length,
            Self::GateUp => 2 * c.hidden_dim,
            Self::Hidden => c.hidden_dim,
            Self::Logits => c.vocab_size,
        }
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Self::KeyCache | Self::ValueCache)
    }
}

/// Key/value cache laid out as `[layer][position][kv_dim]` in two flat arrays
#[derive(Debug, Clone)]
pub struct KvCache {
    n_layers: usize,
    context_length: usize,
    kv_dim: usize,
    keys: Vec<f32>,
    values: Vec<f32>,
    /// Positions written so far, per layer
    filled: Vec<usize>,
}

impl KvCache {
    pub fn new(n_layers: usize, context_length: usize, kv_dim: usize) -> Self {
        let len = n_layers * context_length * kv_dim;
        Self {
            n_layers,
            context_length,
            kv_dim,
            keys: vec![0.; len],
            values: vec![0.; len],
            filled: vec![0; n_layers],
        }
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Number of positions of `layer` that can be read
    pub fn filled(&self, layer: usize) -> usize {
        self.filled.get(layer).copied().unwrap_or_default()
    }

    fn offset(&self, layer: usize, position: usize) -> usize {
        (layer * self.context_length + position) * self.kv_dim
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.n_layers {
            return Err(Error::backend(format!(
                "cache has {} layers, layer {layer} requested",
                self.n_layers
            )));
        }
        Ok(())
    }

    /// Store the key and value of `position`. Writing at `p` makes every position after `p`
    /// unreadable again, and positions can't be skipped.
    pub fn write(
        &mut self,
        layer: usize,
        position: usize,
        key: &[f32],
        value: &[f32],
    ) -> Result<()> {
        self.check_layer(layer)?;
        if position >= self.context_length {
            return Err(Error::Bounds {
                position,
                limit: self.context_length,
            });
        }
        if position > self.filled[layer] {
            return Err(Error::Bounds {
                position,
                limit: self.filled[layer],
            });
        }
        if key.len() != self.kv_dim || value.len() != self.kv_dim {
            return Err(Error::backend(format!(
                "cache rows are {} wide, got key {} and value {}",
                self.kv_dim,
                key.len(),
                value.len()
            )));
        }
        let start = self.offset(layer, position);
        self.keys[start..start + self.kv_dim].copy_from_slice(key);
        self.values[start..start + self.kv_dim].copy_from_slice(value);
        self.filled[layer] = position + 1;
        Ok(())
    }

    /// Keys of positions `0..=position`, one `kv_dim` row each
    pub fn keys(&self, layer: usize, position: usize) -> Result<&[f32]> {
        let range = self.readable(layer, position)?;
        Ok(&self.keys[range])
    }

    /// Values of positions `0..=position`, one `kv_dim` row each
    pub fn values(&self, layer: usize, position: usize) -> Result<&[f32]> {
        let range = self.readable(layer, position)?;
        Ok(&self.values[range])
    }

    fn readable(&self, layer: usize, position: usize) -> Result<std::ops::Range<usize>> {
        self.check_layer(layer)?;
        if position >= self.filled[layer] {
            return Err(Error::Bounds {
                position,
                limit: self.filled[layer],
            });
        }
        Ok(self.offset(layer, 0)..self.offset(layer, position + 1))
    }

    pub fn reset(&mut self) {
        self.keys.fill(0.);
        self.values.fill(0.);
        self.filled.fill(0);
    }
}

/// Arena of named `f32` buffers. The caches live in [`KvCache`] instead.
#[derive(Debug, Clone)]
pub struct Buffers(Vec<Vec<f32>>);

impl Buffers {
    fn new(config: &ModelConfig) -> Self {
        Self(
            BufferId::iter()
                .map(|id| {
                    if id.is_cache() {
                        vec![]
                    } else {
                        vec![0.; id.len(config)]
                    }
                })
                .collect(),
        )
    }

    pub fn get(&self, id: BufferId) -> &[f32] {
        &self.0[id as usize]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut [f32] {
        &mut self.0[id as usize]
    }

    /// Move a buffer out so it can be written while others are read. Put it back with
    /// [`Buffers::put`].
    pub fn take(&mut self, id: BufferId) -> Vec<f32> {
        std::mem::take(&mut self.0[id as usize])
    }

    pub fn put(&mut self, id: BufferId, buffer: Vec<f32>) {
        self.0[id as usize] = buffer;
    }
}

/// Everything one in-flight sequence mutates
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub(crate) buffers: Buffers,
    pub(crate) kv_cache: KvCache,
    position: usize,
}

impl RuntimeState {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            buffers: Buffers::new(config),
            kv_cache: KvCache::new(config.n_layers, config.context_length, config.kv_dim()),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move to `position`, mirroring it into the position buffer
    pub(crate) fn set_position(&mut self, position: usize) -> Result<()> {
        if position >= self.kv_cache.context_length() {
            return Err(Error::Bounds {
                position,
                limit: self.kv_cache.context_length(),
            });
        }
        self.position = position;
        self.buffers.get_mut(BufferId::Position)[0] = position as f32;
        Ok(())
    }

    pub fn buffer(&self, id: BufferId) -> &[f32] {
        self.buffers.get(id)
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut [f32] {
        self.buffers.get_mut(id)
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv_cache
    }

    pub fn logits(&self) -> &[f32] {
        self.buffers.get(BufferId::Logits)
    }

    /// Start a new sequence
    pub fn reset(&mut self) {
        for b in self.buffers.0.iter_mut() {
            b.fill(0.);
        }
        self.kv_cache.reset();
        self.position = 0;
    }
}
