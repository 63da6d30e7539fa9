//! Per-layer weight arrays, keyed by role.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use tracing::{debug, info};

use crate::{
    config::ModelConfig,
    error::{Error, Result},
    metadata::TensorEntry,
    quant::{QuantKind, QuantizedTensor},
};

/// What a weight tensor is used for
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
pub enum WeightRole {
    AttentionNorm,
    Query,
    Key,
    Value,
    /// Query, key and value rows stacked into one matrix
    QueryKeyValue,
    QueryBias,
    KeyBias,
    ValueBias,
    /// Per-head query normalization
    QueryNorm,
    /// Per-head key normalization
    KeyNorm,
    AttentionOutput,
    FfnNorm,
    Gate,
    Up,
    /// Gate and up rows stacked into one matrix
    GateUp,
    Down,
    TokenEmbedding,
    OutputNorm,
    Classifier,
}

impl WeightRole {
    /// Roles that exist once per model rather than once per layer
    pub fn is_global(&self) -> bool {
        matches!(
            self,
            Self::TokenEmbedding | Self::OutputNorm | Self::Classifier
        )
    }

    /// Roles consumed by matrix-vector products. These must share the planner's quantization.
    pub fn is_matmul(&self) -> bool {
        matches!(
            self,
            Self::Query
                | Self::Key
                | Self::Value
                | Self::QueryKeyValue
                | Self::AttentionOutput
                | Self::Gate
                | Self::Up
                | Self::GateUp
                | Self::Down
                | Self::Classifier
        )
    }

    /// Tensor name in the weight file. `layer` is ignored for global roles.
    pub fn tensor_name(&self, layer: usize) -> String {
        let suffix = match self {
            Self::TokenEmbedding => return "token_embd.weight".to_string(),
            Self::OutputNorm => return "output_norm.weight".to_string(),
            Self::Classifier => return "output.weight".to_string(),
            Self::AttentionNorm => "attn_norm.weight",
            Self::Query => "attn_q.weight",
            Self::Key => "attn_k.weight",
            Self::Value => "attn_v.weight",
            Self::QueryKeyValue => "attn_qkv.weight",
            Self::QueryBias => "attn_q.bias",
            Self::KeyBias => "attn_k.bias",
            Self::ValueBias => "attn_v.bias",
            Self::QueryNorm => "attn_q_norm.weight",
            Self::KeyNorm => "attn_k_norm.weight",
            Self::AttentionOutput => "attn_output.weight",
            Self::FfnNorm => "ffn_norm.weight",
            Self::Gate => "ffn_gate.weight",
            Self::Up | Self::GateUp => "ffn_up.weight",
            Self::Down => "ffn_down.weight",
        };
        format!("blk.{layer}.{suffix}")
    }

    /// Number of elements the tensor must hold for this configuration
    pub fn expected_len(&self, c: &ModelConfig) -> usize {
        match self {
            Self::AttentionNorm | Self::FfnNorm | Self::OutputNorm => c.dim,
            Self::Query => c.q_dim() * c.dim,
            Self::Key | Self::Value => c.kv_dim() * c.dim,
            Self::QueryKeyValue => (c.q_dim() + 2 * c.kv_dim()) * c.dim,
            Self::QueryBias => c.q_dim(),
            Self::KeyBias | Self::ValueBias => c.kv_dim(),
            Self::QueryNorm | Self::KeyNorm => c.head_size,
            Self::AttentionOutput => c.dim * c.q_dim(),
            Self::Gate | Self::Up | Self::Down => c.hidden_dim * c.dim,
            Self::GateUp => 2 * c.hidden_dim * c.dim,
            Self::TokenEmbedding | Self::Classifier => c.vocab_size * c.dim,
        }
    }
}

/// Every weight of a model, one entry per layer for each per-layer role
#[derive(Debug, Clone)]
pub struct LayeredWeights {
    n_layers: usize,
    layers: BTreeMap<WeightRole, Vec<QuantizedTensor>>,
    globals: BTreeMap<WeightRole, QuantizedTensor>,
}

impl LayeredWeights {
    /// Decode the tensors needed for `roles` out of the parser's entries.
    ///
    /// The classifier falls back to the token embedding when the model ties them.
    pub fn load(
        entries: impl IntoIterator<Item = TensorEntry>,
        config: &ModelConfig,
        roles: &[WeightRole],
    ) -> Result<Self> {
        let entries = entries
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect::<FxHashMap<_, _>>();
        let decode = |role: WeightRole,
                      name: String,
                      fallback: Option<String>|
         -> Result<QuantizedTensor> {
            let entry = entries
                .get(&name)
                .or_else(|| fallback.as_ref().and_then(|f| entries.get(f)))
                .ok_or_else(|| {
                    Error::format(&name, format!("missing tensor for required role {role}"))
                })?;
            let tensor =
                QuantizedTensor::from_bytes(&name, entry.shape.clone(), entry.kind, &entry.bytes)?;
            let expected = role.expected_len(config);
            if tensor.len() != expected {
                return Err(Error::format(
                    &name,
                    format!("expected {expected} elements for {role}, got {}", tensor.len()),
                ));
            }
            Ok(tensor)
        };

        let mut layers = BTreeMap::new();
        let mut globals = BTreeMap::new();
        for role in roles.iter().copied() {
            if role.is_global() {
                let fallback = (role == WeightRole::Classifier)
                    .then(|| WeightRole::TokenEmbedding.tensor_name(0));
                globals.insert(role, decode(role, role.tensor_name(0), fallback)?);
            } else {
                let tensors = (0..config.n_layers)
                    .map(|l| decode(role, role.tensor_name(l), None))
                    .collect::<Result<Vec<_>>>()?;
                layers.insert(role, tensors);
            }
        }

        let weights = Self {
            n_layers: config.n_layers,
            layers,
            globals,
        };
        info!(
            layers = config.n_layers,
            roles = roles.len(),
            quantization = ?weights.matmul_kinds(),
            "loaded weights"
        );
        Ok(weights)
    }

    /// Assemble from already decoded tensors, checking that each role has one tensor per layer
    pub fn from_parts(
        n_layers: usize,
        layers: BTreeMap<WeightRole, Vec<QuantizedTensor>>,
        globals: BTreeMap<WeightRole, QuantizedTensor>,
    ) -> Result<Self> {
        for (role, tensors) in &layers {
            if role.is_global() || tensors.len() != n_layers {
                return Err(Error::format(
                    role.to_string(),
                    format!("expected {n_layers} per-layer tensors, got {}", tensors.len()),
                ));
            }
        }
        if let Some(role) = globals.keys().find(|r| !r.is_global()) {
            return Err(Error::format(role.to_string(), "not a model-wide role"));
        }
        Ok(Self {
            n_layers,
            layers,
            globals,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn has_role(&self, role: WeightRole) -> bool {
        self.layers.contains_key(&role) || self.globals.contains_key(&role)
    }

    /// Look up a tensor. `layer` is ignored for global roles.
    pub fn tensor(&self, role: WeightRole, layer: Option<usize>) -> Result<&QuantizedTensor> {
        let found = if role.is_global() {
            self.globals.get(&role)
        } else {
            layer.and_then(|l| self.layers.get(&role).and_then(|t| t.get(l)))
        };
        found.ok_or_else(|| {
            Error::format(
                match layer {
                    Some(l) if !role.is_global() => role.tensor_name(l),
                    _ => role.to_string(),
                },
                "tensor not loaded",
            )
        })
    }

    /// Distinct quantization kinds among the matrix weights
    pub fn matmul_kinds(&self) -> BTreeSet<QuantKind> {
        self.layers
            .iter()
            .filter(|(r, _)| r.is_matmul())
            .flat_map(|(_, t)| t.iter().map(|t| t.kind()))
            .chain(
                self.globals
                    .iter()
                    .filter(|(r, _)| r.is_matmul())
                    .map(|(_, t)| t.kind()),
            )
            .collect()
    }

    /// Check every matrix weight is stored as `kind`
    pub fn check_quantization(&self, kind: QuantKind) -> Result<()> {
        let kinds = self.matmul_kinds();
        if kinds.iter().any(|k| *k != kind) {
            return Err(Error::config(format!(
                "weights are quantized as {kinds:?} but the planner expects {kind}"
            )));
        }
        debug!(%kind, "weight quantization matches planner");
        Ok(())
    }
}
