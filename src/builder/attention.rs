use serde::{Deserialize, Serialize};

use crate::{
    config::ModelConfig,
    quant::QuantKind,
    stage::{BufferRef, RopePairing, StageDescriptor, StageKind},
    state::BufferId::*,
    weights::WeightRole,
};

use super::Projection;

/// The attention half of a transformer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttentionVariant {
    /// Separate Q/K/V matrices, or one stacked matrix followed by a split
    pub projection: Projection,
    /// Learned bias on the Q/K/V projections
    pub bias: bool,
    /// RMS norm inside each query and key head before rotation
    pub head_norm: bool,
    pub rope: RopePairing,
    /// Write the cache in the rotation stage instead of a stage of its own
    pub fused_cache_write: bool,
}

impl AttentionVariant {
    pub fn required_roles(&self) -> Vec<WeightRole> {
        let mut roles = vec![WeightRole::AttentionNorm];
        match self.projection {
            Projection::Split => {
                roles.extend([WeightRole::Query, WeightRole::Key, WeightRole::Value])
            }
            Projection::Fused => roles.push(WeightRole::QueryKeyValue),
        }
        if self.bias {
            roles.extend([
                WeightRole::QueryBias,
                WeightRole::KeyBias,
                WeightRole::ValueBias,
            ]);
        }
        if self.head_norm {
            roles.extend([WeightRole::QueryNorm, WeightRole::KeyNorm]);
        }
        roles.push(WeightRole::AttentionOutput);
        roles
    }

    /// Stages from the input norm up to and including the residual output projection
    pub fn stages(&self, c: &ModelConfig, layer: usize, quant: QuantKind) -> Vec<StageDescriptor> {
        let w = |role| BufferRef::weight(role, layer);
        let (q_dim, kv_dim) = (c.q_dim(), c.kv_dim());
        let mut stages = vec![
            StageDescriptor::new(
                "attn_rms_reduce",
                StageKind::RmsReduce {
                    len: c.dim,
                    eps: c.rms_norm_eps,
                },
            )
            .input(X)
            .output(NormScratch),
            StageDescriptor::new("attn_rms_apply", StageKind::RmsApply { len: c.dim })
                .input(X)
                .input(NormScratch)
                .input(w(WeightRole::AttentionNorm))
                .output(Xb),
        ];

        let matvec = |rows| StageKind::MatVec {
            rows,
            cols: c.dim,
            quant,
        };
        match self.projection {
            Projection::Split => stages.extend([
                StageDescriptor::new("q_proj", matvec(q_dim))
                    .input(Xb)
                    .input(w(WeightRole::Query))
                    .output(Q),
                StageDescriptor::new("k_proj", matvec(kv_dim))
                    .input(Xb)
                    .input(w(WeightRole::Key))
                    .output(K),
                StageDescriptor::new("v_proj", matvec(kv_dim))
                    .input(Xb)
                    .input(w(WeightRole::Value))
                    .output(V),
            ]),
            Projection::Fused => stages.extend([
                StageDescriptor::new("qkv_proj", matvec(q_dim + 2 * kv_dim))
                    .input(Xb)
                    .input(w(WeightRole::QueryKeyValue))
                    .output(Qkv),
                StageDescriptor::new("split_qkv", StageKind::SplitQkv { q_dim, kv_dim })
                    .input(Qkv)
                    .output(Q)
                    .output(K)
                    .output(V),
            ]),
        }

        if self.bias {
            for (name, role, target, len) in [
                ("q_bias", WeightRole::QueryBias, Q, q_dim),
                ("k_bias", WeightRole::KeyBias, K, kv_dim),
                ("v_bias", WeightRole::ValueBias, V, kv_dim),
            ] {
                stages.push(
                    StageDescriptor::new(name, StageKind::BiasAdd { len })
                        .input(w(role))
                        .in_out(target),
                );
            }
        }

        if self.head_norm {
            for (prefix, role, target, scratch, heads) in [
                ("q", WeightRole::QueryNorm, Q, QNormScratch, c.n_heads),
                ("k", WeightRole::KeyNorm, K, KNormScratch, c.n_kv_heads),
            ] {
                stages.push(
                    StageDescriptor::new(
                        format!("{prefix}_norm_reduce"),
                        StageKind::HeadRmsReduce {
                            heads,
                            head_size: c.head_size,
                            eps: c.rms_norm_eps,
                        },
                    )
                    .input(target)
                    .output(scratch),
                );
                stages.push(
                    StageDescriptor::new(
                        format!("{prefix}_norm_apply"),
                        StageKind::HeadRmsApply {
                            heads,
                            head_size: c.head_size,
                        },
                    )
                    .input(scratch)
                    .input(w(role))
                    .in_out(target),
                );
            }
        }

        if self.fused_cache_write {
            stages.push(
                StageDescriptor::new(
                    "rope_and_kv_cache",
                    StageKind::RopeCacheWrite {
                        pairing: self.rope,
                        n_heads: c.n_heads,
                        n_kv_heads: c.n_kv_heads,
                        head_size: c.head_size,
                        theta: c.rope_theta,
                        layer,
                    },
                )
                .input(Position)
                .in_out(Q)
                .in_out(K)
                .input(V)
                .in_out(KeyCache)
                .in_out(ValueCache),
            );
        } else {
            stages.push(
                StageDescriptor::new(
                    "rope",
                    StageKind::Rope {
                        pairing: self.rope,
                        n_heads: c.n_heads,
                        n_kv_heads: c.n_kv_heads,
                        head_size: c.head_size,
                        theta: c.rope_theta,
                    },
                )
                .input(Position)
                .in_out(Q)
                .in_out(K),
            );
            stages.push(
                StageDescriptor::new("kv_cache_write", StageKind::CacheWrite { layer, kv_dim })
                    .input(Position)
                    .input(K)
                    .input(V)
                    .in_out(KeyCache)
                    .in_out(ValueCache),
            );
        }

        stages.push(
            StageDescriptor::new(
                "attention",
                StageKind::Attention {
                    layer,
                    n_heads: c.n_heads,
                    n_kv_heads: c.n_kv_heads,
                    head_size: c.head_size,
                },
            )
            .input(Position)
            .input(Q)
            .input(KeyCache)
            .input(ValueCache)
            .output(Att)
            .output(AttnOut),
        );
        stages.push(
            StageDescriptor::new(
                "attn_output_proj",
                StageKind::MatVecResidual {
                    rows: c.dim,
                    cols: q_dim,
                    quant,
                },
            )
            .input(AttnOut)
            .input(w(WeightRole::AttentionOutput))
            .in_out(X),
        );
        stages
    }
}
