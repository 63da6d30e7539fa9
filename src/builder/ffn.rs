use serde::{Deserialize, Serialize};

use crate::{
    config::ModelConfig,
    quant::QuantKind,
    stage::{BufferRef, StageDescriptor, StageKind},
    state::BufferId::*,
    weights::WeightRole,
};

use super::Projection;

/// The SiLU-gated feed-forward half of a transformer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FfnVariant {
    /// Separate gate and up matrices, or one stacked matrix followed by a split
    pub gate_up: Projection,
}

impl FfnVariant {
    pub fn required_roles(&self) -> Vec<WeightRole> {
        match self.gate_up {
            Projection::Split => vec![
                WeightRole::FfnNorm,
                WeightRole::Gate,
                WeightRole::Up,
                WeightRole::Down,
            ],
            Projection::Fused => vec![WeightRole::FfnNorm, WeightRole::GateUp, WeightRole::Down],
        }
    }

    pub fn stages(&self, c: &ModelConfig, layer: usize, quant: QuantKind) -> Vec<StageDescriptor> {
        let w = |role| BufferRef::weight(role, layer);
        let mut stages = vec![
            StageDescriptor::new(
                "ffn_rms_reduce",
                StageKind::RmsReduce {
                    len: c.dim,
                    eps: c.rms_norm_eps,
                },
            )
            .input(X)
            .output(FfnNormScratch),
            StageDescriptor::new("ffn_rms_apply", StageKind::RmsApply { len: c.dim })
                .input(X)
                .input(FfnNormScratch)
                .input(w(WeightRole::FfnNorm))
                .output(Xb),
        ];
        match self.gate_up {
            Projection::Split => stages.push(
                StageDescriptor::new(
                    "ffn_gate_up",
                    StageKind::GateUpSilu {
                        hidden: c.hidden_dim,
                        cols: c.dim,
                        quant,
                    },
                )
                .input(Xb)
                .input(w(WeightRole::Gate))
                .input(w(WeightRole::Up))
                .output(Hidden),
            ),
            Projection::Fused => stages.extend([
                StageDescriptor::new(
                    "gate_up_proj",
                    StageKind::MatVec {
                        rows: 2 * c.hidden_dim,
                        cols: c.dim,
                        quant,
                    },
                )
                .input(Xb)
                .input(w(WeightRole::GateUp))
                .output(GateUp),
                StageDescriptor::new(
                    "gate_up_silu",
                    StageKind::SplitGateUpSilu {
                        hidden: c.hidden_dim,
                    },
                )
                .input(GateUp)
                .output(Hidden),
            ]),
        }
        stages.push(
            StageDescriptor::new(
                "ffn_down_proj",
                StageKind::MatVecResidual {
                    rows: c.dim,
                    cols: c.hidden_dim,
                    quant,
                },
            )
            .input(Hidden)
            .input(w(WeightRole::Down))
            .in_out(X),
        );
        stages
    }
}
