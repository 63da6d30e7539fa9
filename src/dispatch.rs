//! The one place that knows every model family.
//!
//! Each family is a small data-producing function: which attention and feed-forward variants it
//! combines and which partition rules it overrides. [`Planner::new`] looks a
//! `(family, quantization)` pair up in [`SUPPORTED`] and pairs the two.

use std::sync::Arc;

use itertools::Itertools;
use tracing::info;

use crate::{
    backend::Backend,
    builder::{ArchitectureSpec, AttentionVariant, FfnVariant, LayerGraphBuilder, Projection},
    config::{ModelConfig, ModelFamily},
    error::{Error, Result},
    graph::ExecutionPlan,
    metadata::{Metadata, TensorEntry},
    partition::{plan_partitions, HeadThreads, PartitionConfig, PartitionRule},
    quant::QuantKind,
    session::InferenceSession,
    stage::{RopePairing, StageOp},
    weights::LayeredWeights,
};

use ModelFamily::*;
use QuantKind::*;

/// Quantization kinds each family has a planner for
pub const SUPPORTED: &[(ModelFamily, &[QuantKind])] = &[
    (Llama, &[F32, F16, Q8_0, Q4_0]),
    (Qwen2, &[F16, Q8_0, Q4_0]),
    (Qwen3, &[F16, Q8_0, Q4_0]),
    (Phi3, &[F16, Q8_0, Q4_0]),
];

/// Attention and feed-forward variants of a family
pub fn architecture(family: ModelFamily) -> ArchitectureSpec {
    let split_ffn = FfnVariant {
        gate_up: Projection::Split,
    };
    match family {
        Llama => ArchitectureSpec {
            family,
            attention: AttentionVariant {
                projection: Projection::Split,
                bias: false,
                head_norm: false,
                rope: RopePairing::Adjacent,
                fused_cache_write: false,
            },
            ffn: split_ffn,
        },
        Qwen2 => ArchitectureSpec {
            family,
            attention: AttentionVariant {
                projection: Projection::Split,
                bias: true,
                head_norm: false,
                rope: RopePairing::HalfOffset,
                fused_cache_write: false,
            },
            ffn: split_ffn,
        },
        Qwen3 => ArchitectureSpec {
            family,
            attention: AttentionVariant {
                projection: Projection::Split,
                bias: false,
                head_norm: true,
                rope: RopePairing::HalfOffset,
                fused_cache_write: true,
            },
            ffn: split_ffn,
        },
        Phi3 => ArchitectureSpec {
            family,
            attention: AttentionVariant {
                projection: Projection::Fused,
                bias: false,
                head_norm: false,
                rope: RopePairing::HalfOffset,
                fused_cache_write: true,
            },
            ffn: FfnVariant {
                gate_up: Projection::Fused,
            },
        },
    }
}

/// Partition rules of a family
pub fn partition_config(family: ModelFamily) -> PartitionConfig {
    let standard = PartitionConfig::standard();
    let two_d_rope = PartitionRule::HeadsByPairs { local: [8, 1] };
    match family {
        Llama | Phi3 => standard,
        Qwen2 => standard
            .with_rule(StageOp::Rope, two_d_rope)
            .with_rule(
                StageOp::Attention,
                PartitionRule::PerHead {
                    threads: HeadThreads::LargestDivisorOfHeadSize { max: 64 },
                },
            ),
        Qwen3 => standard
            .with_rule(StageOp::RopeCacheWrite, two_d_rope)
            .with_rule(
                StageOp::Attention,
                PartitionRule::PerHead {
                    threads: HeadThreads::Fixed(32),
                },
            ),
    }
}

/// Graph builder and partition rules for one `(family, quantization)` pair
#[derive(Debug, Clone, PartialEq)]
pub struct Planner {
    pub builder: LayerGraphBuilder,
    pub partitions: PartitionConfig,
}

impl Planner {
    pub fn new(family: ModelFamily, quant: QuantKind) -> Result<Self> {
        let supported = SUPPORTED
            .iter()
            .find(|(f, _)| *f == family)
            .is_some_and(|(_, kinds)| kinds.contains(&quant));
        if !supported {
            return Err(Error::config(format!(
                "no {family} planner for {quant} weights"
            )));
        }
        Ok(Self {
            builder: LayerGraphBuilder::new(architecture(family), quant),
            partitions: partition_config(family),
        })
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        &self.builder.spec
    }

    /// Check the model against this planner, then build and partition its graphs
    pub fn plan(&self, config: &ModelConfig, weights: &LayeredWeights) -> Result<ExecutionPlan> {
        config.validate()?;
        if config.family != self.spec().family {
            return Err(Error::config(format!(
                "{} model handed to the {} planner",
                config.family,
                self.spec().family
            )));
        }
        if weights.n_layers() != config.n_layers {
            return Err(Error::config(format!(
                "weights hold {} layers, configuration declares {}",
                weights.n_layers(),
                config.n_layers
            )));
        }
        for role in self.spec().required_roles() {
            if !weights.has_role(role) {
                return Err(Error::format(
                    role.to_string(),
                    format!("required by {} but not loaded", config.family),
                ));
            }
            let layers = if role.is_global() { 1 } else { config.n_layers };
            let expected = role.expected_len(config);
            for layer in 0..layers {
                let tensor = weights.tensor(role, Some(layer))?;
                if tensor.len() != expected {
                    return Err(Error::format(
                        tensor.name(),
                        format!("expected {expected} elements for {role}, got {}", tensor.len()),
                    ));
                }
            }
        }
        weights.check_quantization(self.builder.quant)?;

        let graphs = self.builder.build(config)?;
        let table = plan_partitions(&self.partitions, &graphs)?;
        let plan = ExecutionPlan::new(config.clone(), graphs, table)?;
        info!(
            family = %config.family,
            quant = %self.builder.quant,
            layers = config.n_layers,
            stages = plan.stage_count(),
            "planned model"
        );
        Ok(plan)
    }
}

/// Loading knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Cap on the context length. The model's own limit is used when larger or unset.
    pub context_length: Option<usize>,
    /// Planner quantization. Taken from the weights when unset.
    pub quant: Option<QuantKind>,
}

/// A loaded, planned model. Cheap to clone; the weights and plan are shared read-only.
#[derive(Debug, Clone)]
pub struct Model {
    pub config: ModelConfig,
    pub weights: Arc<LayeredWeights>,
    pub plan: Arc<ExecutionPlan>,
}

impl Model {
    pub fn load(
        metadata: &Metadata,
        entries: impl IntoIterator<Item = TensorEntry>,
        options: LoadOptions,
    ) -> Result<Self> {
        let config = ModelConfig::from_metadata(metadata, options.context_length)?;
        config.validate()?;
        let spec = architecture(config.family);
        let weights = LayeredWeights::load(entries, &config, &spec.required_roles())?;

        let quant = match options.quant {
            Some(q) => q,
            None => {
                let kinds = weights.matmul_kinds();
                match kinds.iter().exactly_one() {
                    Ok(q) => *q,
                    Err(_) => {
                        return Err(Error::config(format!(
                            "can't pick a planner for mixed weight quantization {kinds:?}"
                        )))
                    }
                }
            }
        };
        let plan = Planner::new(config.family, quant)?.plan(&config, &weights)?;
        Ok(Self {
            config,
            weights: Arc::new(weights),
            plan: Arc::new(plan),
        })
    }

    /// Start a new sequence on `backend`
    pub fn session<B: Backend>(&self, backend: B) -> InferenceSession<B> {
        InferenceSession::new(self.plan.clone(), self.weights.clone(), backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::CpuBackend,
        quant::QuantizedTensor,
        stage::StageKind,
        tests::{toy_config, toy_model},
        weights::WeightRole,
    };
    use half::f16;
    use std::collections::BTreeMap;
    use strum::IntoEnumIterator;

    #[test]
    fn test_every_family_has_a_planner() {
        for family in ModelFamily::iter() {
            assert!(SUPPORTED.iter().any(|(f, _)| *f == family));
            assert_eq!(architecture(family).family, family);
            Planner::new(family, Q8_0).unwrap();
        }
    }

    #[test]
    fn test_unsupported_quantization() {
        assert!(matches!(
            Planner::new(Phi3, F32),
            Err(Error::Configuration(_))
        ));
        Planner::new(Llama, F32).unwrap();
    }

    #[test]
    fn test_rope_pairing_is_declared() {
        assert_eq!(architecture(Llama).attention.rope, RopePairing::Adjacent);
        for family in [Qwen2, Qwen3, Phi3] {
            assert_eq!(architecture(family).attention.rope, RopePairing::HalfOffset);
        }
    }

    #[test]
    fn test_family_partition_overrides() {
        let config = toy_config(Qwen3);
        let planner = Planner::new(Qwen3, F16).unwrap();
        let graphs = planner.builder.build(&config).unwrap();
        let table = plan_partitions(&planner.partitions, &graphs).unwrap();
        let rope = table.get("layer_0.rope_and_kv_cache").unwrap();
        assert_eq!(rope.dims, 2);
        assert_eq!(table.get("layer_0.attention").unwrap().local, [32, 1]);

        let graph = &graphs[1];
        let attention = graph.stage("attention").unwrap();
        assert!(matches!(attention.kind, StageKind::Attention { n_kv_heads: 2, .. }));
    }

    #[test]
    fn test_short_weight_rejected_when_planning() {
        let config = toy_config(Qwen2);
        let tensor = |role: WeightRole, layer, n| {
            QuantizedTensor::from_f16(&role.tensor_name(layer), vec![n], vec![f16::ONE; n]).unwrap()
        };
        let (mut layers, mut globals) = (BTreeMap::new(), BTreeMap::new());
        for role in architecture(Qwen2).required_roles() {
            let n = match role {
                WeightRole::QueryBias => 1,
                _ => role.expected_len(&config),
            };
            if role.is_global() {
                globals.insert(role, tensor(role, 0, n));
            } else {
                let per_layer = (0..config.n_layers).map(|l| tensor(role, l, n)).collect();
                layers.insert(role, per_layer);
            }
        }
        let weights = LayeredWeights::from_parts(config.n_layers, layers, globals).unwrap();
        let err = Planner::new(Qwen2, F16)
            .unwrap()
            .plan(&config, &weights)
            .unwrap_err();
        assert!(matches!(err, Error::Format { tensor, .. } if tensor == "blk.0.attn_q.bias"));
    }

    #[test]
    fn test_partition_lookup() {
        let model = toy_model(Llama, Q8_0);
        let plan = &model.plan;
        let q_proj = plan.partition("layer_1.q_proj").unwrap();
        assert_eq!(q_proj.dims, 1);
        assert_eq!(q_proj.global[0] % q_proj.local[0], 0);
        assert!(q_proj.global[0] >= model.config.q_dim());
        assert!(plan.partition("layer_9.q_proj").is_none());

        let layer = plan.layer_graph(1).unwrap();
        assert_eq!(layer.name, "layer_1");
        assert_eq!(layer.stage("q_proj").unwrap().partition, Some(q_proj));
        assert!(plan.layer_graph(2).is_none());

        assert_eq!(plan.partitions.len(), plan.stage_count());
        for (name, partition) in plan.partitions.iter() {
            let (graph, stage) = name.split_once('.').unwrap();
            let stage = plan.graph(graph).unwrap().stage(stage).unwrap();
            assert_eq!(stage.partition, Some(partition), "{name}");
        }
        model.session(CpuBackend::new()).forward(0).unwrap();
    }
}
