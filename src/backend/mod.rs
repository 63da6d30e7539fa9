//! Execution backends.
//!
//! A backend replays a [`LayerGraph`] against the shared weights and one sequence's
//! [`RuntimeState`]. [`CpuBackend`] is the reference: it honors residency directives exactly
//! and runs every stage kind with the kernels in [`kernels`].

pub mod kernels;

use std::{io::Write, time::Duration};

use colored::Colorize;
use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    graph::LayerGraph,
    quant::{QuantKind, QuantizedTensor},
    stage::{BufferRef, StageDescriptor, StageKind, Transfer},
    state::{BufferId, Buffers, RuntimeState},
    weights::LayeredWeights,
};

use self::kernels::AttentionShape;

/// A failure inside one stage of a graph
#[derive(Debug)]
pub struct StageFailure {
    /// Fully qualified stage name, `<graph>.<stage>`
    pub stage: String,
    pub error: Error,
}

impl StageFailure {
    pub fn new(graph: &LayerGraph, stage: &StageDescriptor, error: Error) -> Self {
        Self {
            stage: graph.qualified_name(stage),
            error,
        }
    }

    /// Attach the generation step the failure happened in
    pub fn at_step(self, step: usize) -> Error {
        Error::Step {
            step,
            stage: self.stage,
            source: Box::new(self.error),
        }
    }
}

pub trait Backend {
    fn name(&self) -> &str;

    /// Run every stage of `graph` in order
    fn execute_graph(
        &mut self,
        graph: &LayerGraph,
        weights: &LayeredWeights,
        state: &mut RuntimeState,
    ) -> std::result::Result<(), StageFailure>;

    /// Called once a step has run every graph
    fn finish_step(&mut self) {}
}

/// Runs stages on the host, one after another
#[derive(Debug, Default)]
pub struct CpuBackend {
    resident: FxHashSet<BufferRef>,
    uploads: FxHashMap<BufferRef, usize>,
    timing: bool,
    stage_times: FxHashMap<String, Duration>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Print every stage with its wall time as it runs
    pub fn with_timing(mut self) -> Self {
        self.timing = true;
        self
    }

    /// Total uploads issued so far
    pub fn upload_count(&self) -> usize {
        self.uploads.values().sum()
    }

    /// Uploads issued so far for one buffer
    pub fn uploads_of(&self, buffer: BufferRef) -> usize {
        self.uploads.get(&buffer).copied().unwrap_or_default()
    }

    pub fn is_resident(&self, buffer: BufferRef) -> bool {
        self.resident.contains(&buffer)
    }

    /// Forget everything resident, so the next step uploads it all again
    pub fn evict(&mut self) {
        self.resident.clear();
    }

    fn upload(&mut self, buffer: BufferRef, weights: &LayeredWeights) -> Result<()> {
        if let BufferRef::Weight { role, layer } = buffer {
            weights.tensor(role, layer)?;
        }
        *self.uploads.entry(buffer).or_default() += 1;
        self.resident.insert(buffer);
        Ok(())
    }

    fn apply_transfers(&mut self, stage: &StageDescriptor, weights: &LayeredWeights) -> Result<()> {
        for t in &stage.transfers {
            match t.transfer {
                Transfer::AllocateOnce if self.resident.contains(&t.buffer) => {}
                Transfer::AllocateOnce | Transfer::RefreshEveryStep => {
                    self.upload(t.buffer, weights)?
                }
                Transfer::CarryFromPreviousStage if !self.resident.contains(&t.buffer) => {
                    return Err(Error::backend(format!(
                        "{} is carried but not resident",
                        t.buffer
                    )))
                }
                Transfer::CarryFromPreviousStage => {}
            }
        }
        Ok(())
    }

    fn print_times(&mut self) {
        let width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        println!(
            "{:->2$} Total Times {:->2$}",
            "",
            "",
            width.saturating_sub(" Total Times ".len()) / 2
        );
        for (name, elapsed) in self
            .stage_times
            .drain()
            .sorted_by(|(_, a), (_, b)| b.cmp(a))
        {
            print!("{}", name.bold().bright_green());
            println!(
                "{:.>1$}",
                format_duration(elapsed).bold(),
                width.saturating_sub(name.len())
            );
        }
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn execute_graph(
        &mut self,
        graph: &LayerGraph,
        weights: &LayeredWeights,
        state: &mut RuntimeState,
    ) -> std::result::Result<(), StageFailure> {
        let width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        if self.timing {
            let title = format!(" Executing {} ", graph.name);
            println!(
                "{:->2$}{title}{:->2$}",
                "",
                "",
                width.saturating_sub(title.len()) / 2
            );
        }
        for stage in &graph.stages {
            let fail = |e| StageFailure::new(graph, stage, e);
            self.apply_transfers(stage, weights).map_err(fail)?;
            trace!(graph = %graph.name, stage = %stage.name, "run stage");
            if self.timing {
                print!("{}", stage.name.bold().bright_green());
                // Timing output only
                let _ = std::io::stdout().flush();
            }
            let now = std::time::Instant::now();
            run_stage(stage, weights, state).map_err(fail)?;
            let elapsed = now.elapsed();
            if self.timing {
                println!(
                    "{:.>1$}",
                    format_duration(elapsed).bold(),
                    width.saturating_sub(stage.name.len())
                );
                *self.stage_times.entry(stage.kind.op().to_string()).or_default() += elapsed;
            }
        }
        debug!(graph = %graph.name, stages = graph.stages.len(), "graph complete");
        Ok(())
    }

    fn finish_step(&mut self) {
        if self.timing {
            self.print_times();
        }
    }
}

fn format_duration(elapsed: Duration) -> String {
    if elapsed.as_secs() > 0 {
        format!("{:.2}s", elapsed.as_secs_f32())
    } else if elapsed.as_millis() > 0 {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{}µs", elapsed.as_micros())
    }
}

/// State buffer bound at position `i`
fn state_at(stage: &StageDescriptor, i: usize) -> Result<BufferId> {
    match stage.binding(i) {
        Some(BufferRef::State(id)) => Ok(id),
        other => Err(Error::backend(format!(
            "binding {i} of `{}` should be a state buffer, found {other:?}",
            stage.name
        ))),
    }
}

/// Weight bound at position `i`
fn weight_at<'a>(
    stage: &StageDescriptor,
    i: usize,
    weights: &'a LayeredWeights,
) -> Result<&'a QuantizedTensor> {
    match stage.binding(i) {
        Some(BufferRef::Weight { role, layer }) => weights.tensor(role, layer),
        other => Err(Error::backend(format!(
            "binding {i} of `{}` should be a weight, found {other:?}",
            stage.name
        ))),
    }
}

/// Matrix weight bound at position `i`, checked against the planned shape and quantization
fn matrix_at<'a>(
    stage: &StageDescriptor,
    i: usize,
    weights: &'a LayeredWeights,
    (rows, cols, quant): (usize, usize, QuantKind),
) -> Result<&'a QuantizedTensor> {
    let w = weight_at(stage, i, weights)?;
    if w.kind() != quant {
        return Err(Error::backend(format!(
            "`{}` was planned for {quant} but `{}` is {}",
            stage.name,
            w.name(),
            w.kind()
        )));
    }
    if w.len() < rows * cols {
        return Err(Error::backend(format!(
            "`{}` needs a {rows}x{cols} matrix but `{}` holds {} elements",
            stage.name,
            w.name(),
            w.len()
        )));
    }
    Ok(w)
}

/// Vector weight bound at position `i`, which must hold at least `len` values
fn vector_at<'a>(
    stage: &StageDescriptor,
    i: usize,
    weights: &'a LayeredWeights,
    len: usize,
) -> Result<&'a QuantizedTensor> {
    let w = weight_at(stage, i, weights)?;
    if w.len() < len {
        return Err(Error::backend(format!(
            "`{}` needs {len} weights but `{}` holds {}",
            stage.name,
            w.name(),
            w.len()
        )));
    }
    Ok(w)
}

/// Input `id`, which must hold at least `len` values
fn input(buffers: &Buffers, id: BufferId, len: usize) -> Result<&[f32]> {
    buffers.get(id).get(..len).ok_or_else(|| {
        Error::backend(format!(
            "{id} holds {} values, {len} needed",
            buffers.get(id).len()
        ))
    })
}

/// Move `id` out of the arena, hand its first `len` values to `f` along with the rest of the
/// arena, and put it back whatever `f` returns
fn with_output<F>(buffers: &mut Buffers, id: BufferId, len: usize, f: F) -> Result<()>
where
    F: FnOnce(&Buffers, &mut [f32]) -> Result<()>,
{
    let mut out = buffers.take(id);
    let result = match out.get_mut(..len) {
        Some(slice) => f(buffers, slice),
        None => Err(Error::backend(format!(
            "{id} holds {} values, {len} needed",
            out.len()
        ))),
    };
    buffers.put(id, out);
    result
}

fn position(buffers: &Buffers, id: BufferId) -> Result<usize> {
    Ok(input(buffers, id, 1)?[0] as usize)
}

/// Run one stage against `state`
pub fn run_stage(
    stage: &StageDescriptor,
    weights: &LayeredWeights,
    state: &mut RuntimeState,
) -> Result<()> {
    let RuntimeState {
        buffers, kv_cache, ..
    } = state;
    match stage.kind {
        StageKind::ActivationUpdate { len } => {
            let src = state_at(stage, 0)?;
            with_output(buffers, state_at(stage, 1)?, len, |b, x| {
                x.copy_from_slice(input(b, src, len)?);
                Ok(())
            })
        }
        StageKind::RmsReduce { len, eps } => {
            let src = state_at(stage, 0)?;
            with_output(buffers, state_at(stage, 1)?, 1, |b, scratch| {
                scratch[0] = kernels::rms_inv(input(b, src, len)?, eps);
                Ok(())
            })
        }
        StageKind::RmsApply { len } => {
            let (src, scratch) = (state_at(stage, 0)?, state_at(stage, 1)?);
            let weight = vector_at(stage, 2, weights, len)?;
            with_output(buffers, state_at(stage, 3)?, len, |b, dst| {
                kernels::rms_apply(input(b, src, len)?, input(b, scratch, 1)?[0], weight, dst);
                Ok(())
            })
        }
        StageKind::MatVec { rows, cols, quant }
        | StageKind::VocabProjection { rows, cols, quant } => {
            let x = state_at(stage, 0)?;
            let weight = matrix_at(stage, 1, weights, (rows, cols, quant))?;
            with_output(buffers, state_at(stage, 2)?, rows, |b, out| {
                kernels::matvec(weight, input(b, x, cols)?, out);
                Ok(())
            })
        }
        StageKind::MatVecResidual { rows, cols, quant } => {
            let x = state_at(stage, 0)?;
            let weight = matrix_at(stage, 1, weights, (rows, cols, quant))?;
            with_output(buffers, state_at(stage, 2)?, rows, |b, acc| {
                kernels::matvec_residual(weight, input(b, x, cols)?, acc);
                Ok(())
            })
        }
        StageKind::BiasAdd { len } => {
            let bias = vector_at(stage, 0, weights, len)?;
            with_output(buffers, state_at(stage, 1)?, len, |_, target| {
                kernels::bias_add(bias, target);
                Ok(())
            })
        }
        StageKind::SplitQkv { q_dim, kv_dim } => {
            let qkv = input(buffers, state_at(stage, 0)?, q_dim + 2 * kv_dim)?.to_vec();
            let (q, kv) = qkv.split_at(q_dim);
            let (k, v) = kv.split_at(kv_dim);
            for (i, part) in [(1, q), (2, k), (3, v)] {
                with_output(buffers, state_at(stage, i)?, part.len(), |_, out| {
                    out.copy_from_slice(part);
                    Ok(())
                })?;
            }
            Ok(())
        }
        StageKind::HeadRmsReduce {
            heads,
            head_size,
            eps,
        } => {
            let src = state_at(stage, 0)?;
            with_output(buffers, state_at(stage, 1)?, heads, |b, scratch| {
                kernels::head_rms_inv(input(b, src, heads * head_size)?, head_size, eps, scratch);
                Ok(())
            })
        }
        StageKind::HeadRmsApply { heads, head_size } => {
            let scratch = state_at(stage, 0)?;
            let weight = vector_at(stage, 1, weights, head_size)?;
            with_output(buffers, state_at(stage, 2)?, heads * head_size, |b, target| {
                kernels::head_rms_apply(input(b, scratch, heads)?, weight, head_size, target);
                Ok(())
            })
        }
        StageKind::Rope {
            pairing,
            n_heads,
            n_kv_heads,
            head_size,
            theta,
        } => {
            let pos = position(buffers, state_at(stage, 0)?)?;
            for (i, heads) in [(1, n_heads), (2, n_kv_heads)] {
                with_output(buffers, state_at(stage, i)?, heads * head_size, |_, x| {
                    kernels::rope(x, pairing, head_size, pos, theta);
                    Ok(())
                })?;
            }
            Ok(())
        }
        StageKind::RopeCacheWrite {
            pairing,
            n_heads,
            n_kv_heads,
            head_size,
            theta,
            layer,
        } => {
            let pos = position(buffers, state_at(stage, 0)?)?;
            for (i, heads) in [(1, n_heads), (2, n_kv_heads)] {
                with_output(buffers, state_at(stage, i)?, heads * head_size, |_, x| {
                    kernels::rope(x, pairing, head_size, pos, theta);
                    Ok(())
                })?;
            }
            let kv_dim = n_kv_heads * head_size;
            kv_cache.write(
                layer,
                pos,
                input(buffers, state_at(stage, 2)?, kv_dim)?,
                input(buffers, state_at(stage, 3)?, kv_dim)?,
            )
        }
        StageKind::CacheWrite { layer, kv_dim } => {
            let pos = position(buffers, state_at(stage, 0)?)?;
            kv_cache.write(
                layer,
                pos,
                input(buffers, state_at(stage, 1)?, kv_dim)?,
                input(buffers, state_at(stage, 2)?, kv_dim)?,
            )
        }
        StageKind::Attention {
            layer,
            n_heads,
            n_kv_heads,
            head_size,
        } => {
            let pos = position(buffers, state_at(stage, 0)?)?;
            let q = state_at(stage, 1)?;
            let (keys, values) = (kv_cache.keys(layer, pos)?, kv_cache.values(layer, pos)?);
            let shape = AttentionShape {
                n_heads,
                n_kv_heads,
                head_size,
                context_length: kv_cache.context_length(),
            };
            let (att_id, out_id) = (state_at(stage, 4)?, state_at(stage, 5)?);
            let mut att = buffers.take(att_id);
            let result = with_output(buffers, out_id, n_heads * head_size, |b, out| {
                if att.len() < n_heads * shape.context_length {
                    return Err(Error::backend("score buffer is smaller than heads x context"));
                }
                let q = input(b, q, n_heads * head_size)?;
                kernels::attention(shape, pos, q, keys, values, &mut att, out);
                Ok(())
            });
            buffers.put(att_id, att);
            result
        }
        StageKind::GateUpSilu { hidden, cols, quant } => {
            let x = state_at(stage, 0)?;
            let gate = matrix_at(stage, 1, weights, (hidden, cols, quant))?;
            let up = matrix_at(stage, 2, weights, (hidden, cols, quant))?;
            with_output(buffers, state_at(stage, 3)?, hidden, |b, out| {
                kernels::gate_up_silu(gate, up, input(b, x, cols)?, out);
                Ok(())
            })
        }
        StageKind::SplitGateUpSilu { hidden } => {
            let gate_up = state_at(stage, 0)?;
            with_output(buffers, state_at(stage, 1)?, hidden, |b, out| {
                kernels::split_gate_up_silu(input(b, gate_up, 2 * hidden)?, out);
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ModelFamily,
        stage::TransferDirective,
        tests::{assert_close, toy_config},
        weights::WeightRole,
    };
    use std::collections::BTreeMap;

    fn bias_weights(n_layers: usize, len: usize) -> LayeredWeights {
        let bias = (0..n_layers)
            .map(|l| QuantizedTensor::from_f32(&format!("b{l}"), vec![len], vec![1.; len]).unwrap())
            .collect();
        LayeredWeights::from_parts(
            n_layers,
            BTreeMap::from([(WeightRole::QueryBias, bias)]),
            BTreeMap::new(),
        )
        .unwrap()
    }

    fn bias_graph(transfer: Transfer) -> LayerGraph {
        let mut graph = LayerGraph::new("layer_0", Some(0));
        let mut stage = StageDescriptor::new("q_bias", StageKind::BiasAdd { len: 8 })
            .input(BufferRef::weight(WeightRole::QueryBias, 0))
            .in_out(BufferId::Q);
        stage.transfers = vec![
            TransferDirective {
                buffer: BufferRef::weight(WeightRole::QueryBias, 0),
                transfer,
            },
            TransferDirective {
                buffer: BufferId::Q.into(),
                transfer,
            },
        ];
        graph.stages.push(stage);
        graph
    }

    #[test]
    fn test_allocate_once() {
        let config = toy_config(ModelFamily::Llama);
        let weights = bias_weights(config.n_layers, config.q_dim());
        let mut state = RuntimeState::new(&config);
        let mut backend = CpuBackend::new();
        let graph = bias_graph(Transfer::AllocateOnce);
        for _ in 0..3 {
            backend.execute_graph(&graph, &weights, &mut state).unwrap();
        }
        assert_eq!(backend.uploads_of(BufferRef::weight(WeightRole::QueryBias, 0)), 1);
        assert_eq!(backend.upload_count(), 2);
        assert_close(state.buffer(BufferId::Q), &[3.; 8]);
    }

    #[test]
    fn test_refresh_every_step() {
        let config = toy_config(ModelFamily::Llama);
        let weights = bias_weights(config.n_layers, config.q_dim());
        let mut state = RuntimeState::new(&config);
        let mut backend = CpuBackend::new();
        let graph = bias_graph(Transfer::RefreshEveryStep);
        backend.execute_graph(&graph, &weights, &mut state).unwrap();
        backend.execute_graph(&graph, &weights, &mut state).unwrap();
        assert_eq!(backend.upload_count(), 4);
    }

    #[test]
    fn test_evict_uploads_again() {
        let config = toy_config(ModelFamily::Llama);
        let weights = bias_weights(config.n_layers, config.q_dim());
        let mut state = RuntimeState::new(&config);
        let mut backend = CpuBackend::new();
        let graph = bias_graph(Transfer::AllocateOnce);
        let bias = BufferRef::weight(WeightRole::QueryBias, 0);
        assert!(!backend.is_resident(bias));
        backend.execute_graph(&graph, &weights, &mut state).unwrap();
        assert!(backend.is_resident(bias));

        backend.evict();
        assert!(!backend.is_resident(bias));
        backend.execute_graph(&graph, &weights, &mut state).unwrap();
        assert_eq!(backend.uploads_of(bias), 2);
    }

    #[test]
    fn test_short_vector_weight() {
        let config = toy_config(ModelFamily::Qwen2);
        let weights = bias_weights(config.n_layers, 1);
        let mut state = RuntimeState::new(&config);
        let mut backend = CpuBackend::new();
        let failure = backend
            .execute_graph(&bias_graph(Transfer::AllocateOnce), &weights, &mut state)
            .unwrap_err();
        assert_eq!(failure.stage, "layer_0.q_bias");
        assert!(matches!(failure.error, Error::Backend(_)));
        assert_close(state.buffer(BufferId::Q), &[0.; 8]);

        let norm = StageDescriptor::new(
            "q_norm_apply",
            StageKind::HeadRmsApply {
                heads: config.n_heads,
                head_size: config.head_size,
            },
        )
        .input(BufferId::QNormScratch)
        .input(BufferRef::weight(WeightRole::QueryBias, 0))
        .in_out(BufferId::Q);
        assert!(matches!(
            run_stage(&norm, &weights, &mut state),
            Err(Error::Backend(_))
        ));
    }

    #[test]
    fn test_carry_needs_residency() {
        let config = toy_config(ModelFamily::Llama);
        let weights = bias_weights(config.n_layers, config.q_dim());
        let mut state = RuntimeState::new(&config);
        let mut backend = CpuBackend::new();
        let failure = backend
            .execute_graph(&bias_graph(Transfer::CarryFromPreviousStage), &weights, &mut state)
            .unwrap_err();
        assert_eq!(failure.stage, "layer_0.q_bias");
        assert!(matches!(failure.error, Error::Backend(_)));
        // The stage never ran
        assert_close(state.buffer(BufferId::Q), &[0.; 8]);
    }

    #[test]
    fn test_quantization_mismatch() {
        let config = toy_config(ModelFamily::Llama);
        let n = config.q_dim() * config.dim;
        let query = (0..config.n_layers)
            .map(|_| QuantizedTensor::from_f32("q", vec![n], vec![0.; n]).unwrap())
            .collect();
        let weights = LayeredWeights::from_parts(
            config.n_layers,
            BTreeMap::from([(WeightRole::Query, query)]),
            BTreeMap::new(),
        )
        .unwrap();
        let stage = StageDescriptor::new(
            "q_proj",
            StageKind::MatVec {
                rows: config.q_dim(),
                cols: config.dim,
                quant: QuantKind::Q8_0,
            },
        )
        .input(BufferId::Xb)
        .input(BufferRef::weight(WeightRole::Query, 1))
        .output(BufferId::Q);
        let mut state = RuntimeState::new(&config);
        assert!(matches!(
            run_stage(&stage, &weights, &mut state),
            Err(Error::Backend(_))
        ));
        // Buffers are restored after a failure
        assert_eq!(state.buffer(BufferId::Q).len(), config.q_dim());
    }

    #[test]
    fn test_split_qkv() {
        let config = toy_config(ModelFamily::Phi3);
        let weights = bias_weights(config.n_layers, 1);
        let mut state = RuntimeState::new(&config);
        let (q_dim, kv_dim) = (config.q_dim(), config.kv_dim());
        let qkv = (0..q_dim + 2 * kv_dim).map(|i| i as f32).collect::<Vec<_>>();
        state.buffer_mut(BufferId::Qkv).copy_from_slice(&qkv);
        let stage = StageDescriptor::new("split_qkv", StageKind::SplitQkv { q_dim, kv_dim })
            .input(BufferId::Qkv)
            .output(BufferId::Q)
            .output(BufferId::K)
            .output(BufferId::V);
        run_stage(&stage, &weights, &mut state).unwrap();
        assert_close(state.buffer(BufferId::Q), &qkv[..q_dim]);
        assert_close(state.buffer(BufferId::K), &qkv[q_dim..q_dim + kv_dim]);
        assert_close(state.buffer(BufferId::V), &qkv[q_dim + kv_dim..]);
    }
}
