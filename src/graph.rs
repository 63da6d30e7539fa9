use colored::Colorize;
use itertools::Itertools;
use petgraph::{algo::toposort, stable_graph::StableGraph, visit::EdgeRef, Direction};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::ModelConfig,
    error::{Error, Result},
    partition::PartitionTable,
    stage::{BufferRef, StageDescriptor, Transfer, WorkPartition},
};

/// Why one stage has to wait for another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    /// Reads what an earlier stage wrote
    ReadAfterWrite(BufferRef),
    /// Overwrites what an earlier stage reads
    WriteAfterRead(BufferRef),
    /// Overwrites what an earlier stage wrote
    WriteAfterWrite(BufferRef),
}

pub type DependencyGraph = StableGraph<usize, Hazard>;

/// An ordered list of stages submitted together: one transformer layer, or one of the
/// layer-independent graphs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerGraph {
    pub name: String,
    pub layer: Option<usize>,
    pub stages: Vec<StageDescriptor>,
    /// Buffers left on the device for the next graph
    pub persist: Vec<BufferRef>,
    /// Buffers copied back to the host once the graph completes
    pub to_host: Vec<BufferRef>,
}

impl LayerGraph {
    pub fn new(name: impl Into<String>, layer: Option<usize>) -> Self {
        Self {
            name: name.into(),
            layer,
            stages: vec![],
            persist: vec![],
            to_host: vec![],
        }
    }

    /// Name of the graph holding transformer layer `layer`
    pub fn layer_name(layer: usize) -> String {
        format!("layer_{layer}")
    }

    /// Fully qualified name of one of this graph's stages
    pub fn qualified_name(&self, stage: &StageDescriptor) -> String {
        format!("{}.{}", self.name, stage.name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Every buffer some stage of this graph writes
    pub fn produced(&self) -> FxHashSet<BufferRef> {
        self.stages.iter().flat_map(|s| s.writes()).collect()
    }

    /// Hazards between the stages, as edges from the earlier to the later stage. Nodes carry
    /// stage indices.
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        let nodes = (0..self.stages.len())
            .map(|i| graph.add_node(i))
            .collect::<Vec<_>>();
        for (j, later) in self.stages.iter().enumerate() {
            for (i, earlier) in self.stages[..j].iter().enumerate() {
                let hazard = later
                    .reads()
                    .find(|b| earlier.writes().any(|w| w == *b))
                    .map(Hazard::ReadAfterWrite)
                    .or_else(|| {
                        later
                            .writes()
                            .find(|b| earlier.reads().any(|r| r == *b))
                            .map(Hazard::WriteAfterRead)
                    })
                    .or_else(|| {
                        later
                            .writes()
                            .find(|b| earlier.writes().any(|w| w == *b))
                            .map(Hazard::WriteAfterWrite)
                    });
                if let Some(h) = hazard {
                    graph.add_edge(nodes[i], nodes[j], h);
                }
            }
        }
        graph
    }

    /// Group stages into waves. Stages of one wave don't depend on each other, so a backend
    /// that can overlap work may submit a wave at once.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let graph = self.dependency_graph();
        let mut level = vec![0; self.stages.len()];
        // Edges always point forward, so the graph is acyclic
        for node in toposort(&graph, None).unwrap_or_default() {
            let l = graph
                .edges_directed(node, Direction::Incoming)
                .map(|e| level[graph[e.source()]] + 1)
                .max()
                .unwrap_or_default();
            level[graph[node]] = l;
        }
        (0..self.stages.len())
            .into_group_map_by(|s| level[*s])
            .into_iter()
            .sorted_by_key(|(l, _)| *l)
            .map(|(_, stages)| stages)
            .collect()
    }
}

/// Everything the execution backend needs: the ordered graphs and their partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub config: ModelConfig,
    pub graphs: Vec<LayerGraph>,
    pub partitions: PartitionTable,
}

impl ExecutionPlan {
    /// Attach a partition to every stage. Fails if the table misses a stage.
    pub fn new(
        config: ModelConfig,
        mut graphs: Vec<LayerGraph>,
        partitions: PartitionTable,
    ) -> Result<Self> {
        for graph in &mut graphs {
            for i in 0..graph.stages.len() {
                let name = graph.qualified_name(&graph.stages[i]);
                let partition = partitions.get(&name).ok_or_else(|| {
                    Error::config(format!("no work partition planned for stage `{name}`"))
                })?;
                graph.stages[i].partition = Some(partition);
            }
        }
        let plan = Self {
            config,
            graphs,
            partitions,
        };
        plan.validate()?;
        debug!(
            graphs = plan.graphs.len(),
            stages = plan.stage_count(),
            "execution plan ready"
        );
        Ok(plan)
    }

    /// Store the plan next to the weights it was made for
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read back a stored plan. It is validated again before use.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn stage_count(&self) -> usize {
        self.graphs.iter().map(|g| g.stages.len()).sum()
    }

    pub fn graph(&self, name: &str) -> Option<&LayerGraph> {
        self.graphs.iter().find(|g| g.name == name)
    }

    pub fn layer_graph(&self, layer: usize) -> Option<&LayerGraph> {
        self.graphs.iter().find(|g| g.layer == Some(layer))
    }

    /// Partition of a stage by fully qualified name
    pub fn partition(&self, qualified_name: &str) -> Option<WorkPartition> {
        self.partitions.get(qualified_name)
    }

    /// Check the plan can be replayed as is:
    /// - stage names are unique within their graph and every stage has a partition covering it
    /// - submission order agrees with the hazards between stages
    /// - a carried buffer was uploaded or produced by an earlier stage
    /// - nothing is allocated twice
    /// - every buffer a stage reads is already resident
    pub fn validate(&self) -> Result<()> {
        let mut resident = FxHashSet::<BufferRef>::default();
        for graph in &self.graphs {
            if let Some(dup) = graph.stages.iter().map(|s| &s.name).duplicates().next() {
                return Err(Error::config(format!(
                    "stage name `{dup}` used twice in `{}`",
                    graph.name
                )));
            }
            let deps = graph.dependency_graph();
            if toposort(&deps, None).is_err()
                || deps.edge_indices().any(|e| {
                    deps.edge_endpoints(e)
                        .is_some_and(|(a, b)| deps[a] >= deps[b])
                })
            {
                return Err(Error::config(format!(
                    "stages of `{}` are not submitted in dependency order",
                    graph.name
                )));
            }
            for stage in &graph.stages {
                let name = graph.qualified_name(stage);
                match stage.partition {
                    Some(p) if p.covers(stage.kind.extent()) => {}
                    Some(p) => {
                        return Err(Error::config(format!(
                            "partition {p} of `{name}` doesn't cover {} work items",
                            stage.kind.extent()
                        )))
                    }
                    None => return Err(Error::config(format!("`{name}` has no partition"))),
                }
                for t in &stage.transfers {
                    match t.transfer {
                        Transfer::CarryFromPreviousStage if !resident.contains(&t.buffer) => {
                            return Err(Error::config(format!(
                                "`{name}` carries {} which no earlier stage uploaded or produced",
                                t.buffer
                            )))
                        }
                        Transfer::AllocateOnce if !resident.insert(t.buffer) => {
                            return Err(Error::config(format!(
                                "`{name}` allocates {} which is already resident",
                                t.buffer
                            )))
                        }
                        _ => {
                            resident.insert(t.buffer);
                        }
                    }
                }
                if let Some(missing) = stage.reads().find(|b| !resident.contains(b)) {
                    return Err(Error::config(format!(
                        "`{name}` reads {missing} before it is resident"
                    )));
                }
                resident.extend(stage.writes());
            }
        }
        Ok(())
    }

    /// Print every graph with its stages, partitions and bindings
    pub fn print_plan(&self) {
        let width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        println!(
            "{:->2$} Execution Plan {:->2$}",
            "",
            "",
            width.saturating_sub(" Execution Plan ".len()) / 2
        );
        for graph in &self.graphs {
            println!("{}", graph.name.bold().bright_blue());
            for (wave, stages) in graph.waves().into_iter().enumerate() {
                for stage in stages.into_iter().map(|s| &graph.stages[s]) {
                    let partition = stage
                        .partition
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let bindings = stage
                        .bindings
                        .iter()
                        .map(|b| format!("{}:{}", b.access, b.buffer))
                        .join(" ");
                    let label = format!("  {wave:>2} {}", stage.name);
                    print!("{}", label.bold().bright_green());
                    println!(
                        "{:.>1$}",
                        partition.bold(),
                        width.saturating_sub(label.len()).min(60)
                    );
                    println!("       {}", bindings.dimmed());
                }
            }
        }
    }
}
