//! Work partitions for every stage of a plan.
//!
//! A [`PartitionConfig`] is a plain table of rules keyed by [`StageOp`]. [`plan_partitions`] is a
//! pure function of that table and the stage graphs, so planners can be tested by handing them a
//! config and looking at the table they produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    error::{Error, Result},
    graph::LayerGraph,
    stage::{StageDescriptor, StageOp, WorkPartition},
};

/// Group width of generic matrix-vector products: one group reduces one output row
pub const MATVEC_GROUP: usize = 32;
/// Extra work-items per row for the (much wider) vocabulary projection
pub const LOGITS_THREAD_SCALE: usize = 8;
/// Group width of elementwise and rotation passes
pub const ELEMENTWISE_GROUP: usize = 128;
/// Group width of full-vector reductions
pub const REDUCTION_GROUP: usize = 256;

/// Work-items given to each attention head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadThreads {
    Fixed(usize),
    /// Largest divisor of the head size that is at most `max`
    LargestDivisorOfHeadSize { max: usize },
}

impl HeadThreads {
    pub fn resolve(&self, head_size: usize) -> usize {
        match *self {
            Self::Fixed(n) => n.max(1),
            Self::LargestDivisorOfHeadSize { max } => (1..=max.min(head_size))
                .rev()
                .find(|d| head_size % d == 0)
                .unwrap_or(1),
        }
    }
}

/// Global extent formula, local extent and dimensionality for one stage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRule {
    /// 1D, `extent * scale` work-items in groups of `local`
    Linear { scale: usize, local: usize },
    /// 1D, one group of `threads` work-items per head
    PerHead { threads: HeadThreads },
    /// 1D, one group per head, one work-item per element of the head
    PerHeadElement,
    /// 2D, heads on the first axis and rotation pairs within a head on the second
    HeadsByPairs { local: [usize; 2] },
}

impl PartitionRule {
    /// Partition `stage` according to this rule
    pub fn apply(&self, stage: &StageDescriptor) -> Result<WorkPartition> {
        let heads = || {
            stage.kind.heads().ok_or_else(|| {
                Error::config(format!(
                    "stage `{}` is not organised by heads but its rule {self:?} needs heads",
                    stage.name
                ))
            })
        };
        Ok(match *self {
            Self::Linear { scale, local } => {
                WorkPartition::one_d(stage.kind.extent() * scale, local)
            }
            Self::PerHead { threads } => {
                let (n, head_size) = heads()?;
                let threads = threads.resolve(head_size);
                WorkPartition::one_d(n * threads, threads)
            }
            Self::PerHeadElement => {
                let (n, head_size) = heads()?;
                WorkPartition::one_d(n * head_size, head_size)
            }
            Self::HeadsByPairs { local } => {
                let (n, head_size) = heads()?;
                WorkPartition::two_d([n, head_size / 2], local)
            }
        })
    }
}

/// Immutable rule table, one rule per stage kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    rules: BTreeMap<StageOp, PartitionRule>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl PartitionConfig {
    /// Rules shared by every architecture
    pub fn standard() -> Self {
        let rules = StageOp::iter()
            .map(|op| {
                let rule = match op {
                    StageOp::MatVec | StageOp::MatVecResidual | StageOp::GateUpSilu => {
                        PartitionRule::Linear {
                            scale: MATVEC_GROUP,
                            local: MATVEC_GROUP,
                        }
                    }
                    StageOp::VocabProjection => PartitionRule::Linear {
                        scale: MATVEC_GROUP * LOGITS_THREAD_SCALE,
                        local: REDUCTION_GROUP,
                    },
                    StageOp::RmsReduce | StageOp::RmsApply => PartitionRule::Linear {
                        scale: 1,
                        local: REDUCTION_GROUP,
                    },
                    StageOp::BiasAdd => PartitionRule::Linear {
                        scale: 1,
                        local: MATVEC_GROUP,
                    },
                    StageOp::HeadRmsReduce | StageOp::HeadRmsApply => PartitionRule::PerHeadElement,
                    StageOp::Attention => PartitionRule::PerHead {
                        threads: HeadThreads::Fixed(8),
                    },
                    StageOp::ActivationUpdate
                    | StageOp::SplitQkv
                    | StageOp::Rope
                    | StageOp::RopeCacheWrite
                    | StageOp::CacheWrite
                    | StageOp::SplitGateUpSilu => PartitionRule::Linear {
                        scale: 1,
                        local: ELEMENTWISE_GROUP,
                    },
                };
                (op, rule)
            })
            .collect();
        Self { rules }
    }

    /// A copy of this config with `rule` used for `op`
    pub fn with_rule(&self, op: StageOp, rule: PartitionRule) -> Self {
        let mut rules = self.rules.clone();
        rules.insert(op, rule);
        Self { rules }
    }

    pub fn rule(&self, op: StageOp) -> Option<PartitionRule> {
        self.rules.get(&op).copied()
    }
}

/// Partition of every stage, keyed by `<graph>.<stage>` (`layer_<i>.<stage>` for layers)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionTable(BTreeMap<String, WorkPartition>);

impl PartitionTable {
    pub fn get(&self, qualified_name: &str) -> Option<WorkPartition> {
        self.0.get(qualified_name).copied()
    }

    pub fn insert(&mut self, qualified_name: String, partition: WorkPartition) {
        self.0.insert(qualified_name, partition);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, WorkPartition)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Partition every stage of `graphs`
pub fn plan_partitions(config: &PartitionConfig, graphs: &[LayerGraph]) -> Result<PartitionTable> {
    let mut table = PartitionTable::default();
    for graph in graphs {
        for stage in &graph.stages {
            let op = stage.kind.op();
            let rule = config
                .rule(op)
                .ok_or_else(|| Error::config(format!("no partition rule for {op} stages")))?;
            table.insert(graph.qualified_name(stage), rule.apply(stage)?);
        }
    }
    Ok(table)
}
