//! Turns a model configuration into the ordered stage graphs of one forward pass.
//!
//! A forward pass is `activation_update`, then one graph per layer, then `logits`. Residency
//! directives are attached to the first stage of each graph:
//! - a buffer an earlier graph already made resident is carried
//! - the position and the embedding row are refreshed every step
//! - everything else (weights and scratch) is allocated once

mod attention;
mod ffn;

pub use attention::*;
pub use ffn::*;

use itertools::Itertools;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{ModelConfig, ModelFamily},
    error::Result,
    graph::LayerGraph,
    quant::QuantKind,
    stage::{BufferRef, StageDescriptor, StageKind, Transfer, TransferDirective},
    state::BufferId,
    weights::WeightRole,
};

/// Whether a projection is stored as separate matrices or one stacked matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    Split,
    Fused,
}

/// A model family expressed as a combination of attention and feed-forward variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub family: ModelFamily,
    pub attention: AttentionVariant,
    pub ffn: FfnVariant,
}

impl ArchitectureSpec {
    /// Every weight role a model of this architecture must provide
    pub fn required_roles(&self) -> Vec<WeightRole> {
        self.attention
            .required_roles()
            .into_iter()
            .chain(self.ffn.required_roles())
            .chain([
                WeightRole::TokenEmbedding,
                WeightRole::OutputNorm,
                WeightRole::Classifier,
            ])
            .collect()
    }
}

/// Buffers re-uploaded from the host before every step
const REFRESHED: [BufferId; 2] = [BufferId::Position, BufferId::Embedding];

/// Emits the stage graphs for one architecture and weight quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerGraphBuilder {
    pub spec: ArchitectureSpec,
    pub quant: QuantKind,
}

impl LayerGraphBuilder {
    pub fn new(spec: ArchitectureSpec, quant: QuantKind) -> Self {
        Self { spec, quant }
    }

    /// Build every graph of a forward pass, in submission order
    pub fn build(&self, config: &ModelConfig) -> Result<Vec<LayerGraph>> {
        config.validate()?;
        let mut resident = FxHashSet::default();
        let mut graphs = Vec::with_capacity(config.n_layers + 2);
        graphs.push(self.activation_graph(config, &mut resident));
        for layer in 0..config.n_layers {
            graphs.push(self.layer_graph(config, layer, &mut resident));
        }
        graphs.push(self.logits_graph(config, &mut resident));
        debug!(
            family = %self.spec.family,
            quant = %self.quant,
            graphs = graphs.len(),
            "built stage graphs"
        );
        Ok(graphs)
    }

    /// Copy the refreshed embedding row into the residual stream
    fn activation_graph(
        &self,
        config: &ModelConfig,
        resident: &mut FxHashSet<BufferRef>,
    ) -> LayerGraph {
        let mut graph = LayerGraph::new("activation_update", None);
        graph.stages.push(
            StageDescriptor::new("update_x", StageKind::ActivationUpdate { len: config.dim })
                .input(BufferId::Embedding)
                .output(BufferId::X),
        );
        graph.persist.push(BufferId::X.into());
        attach_transfers(&mut graph, resident);
        graph
    }

    fn layer_graph(
        &self,
        config: &ModelConfig,
        layer: usize,
        resident: &mut FxHashSet<BufferRef>,
    ) -> LayerGraph {
        let mut graph = LayerGraph::new(LayerGraph::layer_name(layer), Some(layer));
        graph
            .stages
            .extend(self.spec.attention.stages(config, layer, self.quant));
        graph
            .stages
            .extend(self.spec.ffn.stages(config, layer, self.quant));
        graph.persist.push(BufferId::X.into());
        attach_transfers(&mut graph, resident);
        graph
    }

    /// Final norm and vocabulary projection
    fn logits_graph(
        &self,
        config: &ModelConfig,
        resident: &mut FxHashSet<BufferRef>,
    ) -> LayerGraph {
        let mut graph = LayerGraph::new("logits", None);
        graph.stages.extend([
            StageDescriptor::new(
                "rms_reduce",
                StageKind::RmsReduce {
                    len: config.dim,
                    eps: config.rms_norm_eps,
                },
            )
            .input(BufferId::X)
            .output(BufferId::LogitsNormScratch),
            StageDescriptor::new("rms_apply", StageKind::RmsApply { len: config.dim })
                .input(BufferId::X)
                .input(BufferId::LogitsNormScratch)
                .input(BufferRef::global(WeightRole::OutputNorm))
                .output(BufferId::Xb),
            StageDescriptor::new(
                "projection",
                StageKind::VocabProjection {
                    rows: config.vocab_size,
                    cols: config.dim,
                    quant: self.quant,
                },
            )
            .input(BufferId::Xb)
            .input(BufferRef::global(WeightRole::Classifier))
            .output(BufferId::Logits),
        ]);
        graph.to_host.push(BufferId::Logits.into());
        attach_transfers(&mut graph, resident);
        graph
    }
}

/// Declare, on the first stage, how each buffer the graph touches gets to the device
fn attach_transfers(graph: &mut LayerGraph, resident: &mut FxHashSet<BufferRef>) {
    let buffers = graph
        .stages
        .iter()
        .flat_map(|s| s.bindings.iter().map(|b| b.buffer))
        .unique()
        .collect::<Vec<_>>();
    let transfers = buffers
        .into_iter()
        .map(|buffer| {
            let transfer = if resident.contains(&buffer) {
                Transfer::CarryFromPreviousStage
            } else if matches!(buffer, BufferRef::State(id) if REFRESHED.contains(&id)) {
                Transfer::RefreshEveryStep
            } else {
                Transfer::AllocateOnce
            };
            resident.insert(buffer);
            TransferDirective { buffer, transfer }
        })
        .collect();
    if let Some(first) = graph.stages.first_mut() {
        first.transfers = transfers;
    }
}
