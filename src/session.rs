//! One sequence being generated.

use std::sync::Arc;

use tracing::{debug, debug_span};

use crate::{
    backend::Backend,
    error::{Error, Result},
    graph::ExecutionPlan,
    state::{BufferId, RuntimeState},
    weights::{LayeredWeights, WeightRole},
};

/// Replays an [`ExecutionPlan`] one token at a time. The plan and weights are shared, the
/// runtime state belongs to this session alone.
pub struct InferenceSession<B: Backend> {
    plan: Arc<ExecutionPlan>,
    weights: Arc<LayeredWeights>,
    backend: B,
    state: RuntimeState,
    /// Steps completed so far, which is also the position of the next token
    step: usize,
}

impl<B: Backend> InferenceSession<B> {
    pub fn new(plan: Arc<ExecutionPlan>, weights: Arc<LayeredWeights>, backend: B) -> Self {
        let state = RuntimeState::new(&plan.config);
        Self {
            plan,
            weights,
            backend,
            state,
            step: 0,
        }
    }

    /// Position the next token will be written at
    pub fn position(&self) -> usize {
        self.step
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Feed one token and return the logits for the next one.
    ///
    /// A failing stage is reported as [`Error::Step`]. The position doesn't advance, so the
    /// step can be retried.
    pub fn forward(&mut self, token: usize) -> Result<&[f32]> {
        let config = &self.plan.config;
        let position = self.step;
        if position >= config.context_length {
            return Err(Error::Bounds {
                position,
                limit: config.context_length,
            });
        }
        if token >= config.vocab_size {
            return Err(Error::config(format!(
                "token {token} is outside the vocabulary of {}",
                config.vocab_size
            )));
        }
        let _span = debug_span!("step", step = self.step, token).entered();

        let embedding = self.weights.tensor(WeightRole::TokenEmbedding, None)?;
        let row = &mut self.state.buffer_mut(BufferId::Embedding)[..config.dim];
        embedding.dequantize_row(token, row);
        self.state.set_position(position)?;

        for graph in &self.plan.graphs {
            self.backend
                .execute_graph(graph, &self.weights, &mut self.state)
                .map_err(|f| f.at_step(self.step))?;
        }
        self.backend.finish_step();
        debug!(position, "step complete");
        self.step += 1;
        Ok(self.state.logits())
    }

    /// Feed every token of `tokens` and return the logits after the last
    pub fn prefill(&mut self, tokens: &[usize]) -> Result<&[f32]> {
        let Some((last, rest)) = tokens.split_last() else {
            return Err(Error::config("nothing to prefill"));
        };
        for token in rest {
            self.forward(*token)?;
        }
        self.forward(*last)
    }

    /// Start a new sequence. Weights stay resident on the backend.
    pub fn reset(&mut self) {
        self.state.reset();
        self.step = 0;
    }
}
