use super::*;
use crate::{
    backend::{Backend, CpuBackend, StageFailure},
    error::Error,
    graph::LayerGraph,
    state::{BufferId, RuntimeState},
    stage::BufferRef,
    weights::LayeredWeights,
};

#[test]
fn test_forward_is_deterministic() {
    let model = toy_model(ModelFamily::Llama, QuantKind::F32);
    let mut a = model.session(CpuBackend::new());
    let mut b = model.session(CpuBackend::new());
    for token in [1, 5, 3] {
        let logits = a.forward(token).unwrap().to_vec();
        assert_eq!(logits.len(), 16);
        assert!(logits.iter().all(|l| l.is_finite()));
        assert_exact(&logits, b.forward(token).unwrap());
    }
    assert_eq!(a.position(), 3);
    assert_eq!(a.state().kv_cache().filled(1), 3);
}

#[test]
fn test_residual_passthrough() {
    // Zero attention and feed-forward weights leave the embedding in the residual stream, so the
    // logits are the classifier rows summed over an all-ones input
    let c = toy_config(ModelFamily::Llama);
    let entries = toy_entries(&c, QuantKind::F32, |role, n| match role {
        WeightRole::TokenEmbedding => vec![1.; n],
        WeightRole::Classifier => (0..n).map(|i| (i / c.dim) as f32 * 0.1).collect(),
        WeightRole::AttentionNorm | WeightRole::FfnNorm | WeightRole::OutputNorm => vec![1.; n],
        _ => vec![0.; n],
    });
    let model = Model::load(&toy_metadata(&c), entries, LoadOptions::default()).unwrap();
    let mut session = model.session(CpuBackend::new());
    let expected = (0..c.vocab_size).map(|r| r as f32 * 0.8).collect::<Vec<_>>();
    for token in [0, 7, 15] {
        assert_close(session.forward(token).unwrap(), &expected);
        assert_close(session.state().buffer(BufferId::X), &[1.; 8]);
    }
}

#[test]
fn test_every_family_runs() {
    for (family, quant) in [
        (ModelFamily::Llama, QuantKind::Q8_0),
        (ModelFamily::Qwen2, QuantKind::F16),
        (ModelFamily::Qwen3, QuantKind::F16),
        (ModelFamily::Phi3, QuantKind::Q4_0),
    ] {
        let model = toy_model(family, quant);
        let mut session = model.session(CpuBackend::new());
        for token in 0..4 {
            let logits = session.forward(token).unwrap();
            assert!(logits.iter().all(|l| l.is_finite()), "{family} {quant}");
        }
        assert_eq!(session.state().kv_cache().filled(0), 4);
    }
}

#[test]
fn test_gqa_ratio_rejected() {
    let mut c = toy_config(ModelFamily::Llama);
    c.n_heads = 5;
    c.dim = 10;
    c.head_size = 2;
    let meta = toy_metadata(&c);
    // No tensors are needed to reject the configuration
    assert!(matches!(
        Model::load(&meta, vec![], LoadOptions::default()),
        Err(Error::Configuration(_))
    ));
}

#[test]
fn test_partial_q4_block() {
    let c = toy_config(ModelFamily::Llama);
    let mut entries = toy_entries(&c, QuantKind::Q4_0, random_weights);
    let name = WeightRole::Query.tensor_name(0);
    for e in entries.iter_mut().filter(|e| e.name == name) {
        *e = TensorEntry::new(name.clone(), vec![33], QuantKind::Q4_0, vec![0; 36]);
    }
    let err = Model::load(&toy_metadata(&c), entries, LoadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Format { tensor, .. } if tensor == name));
}

#[test]
fn test_quantization_mismatch() {
    let c = toy_config(ModelFamily::Qwen2);
    let load = |quant| {
        Model::load(
            &toy_metadata(&c),
            toy_entries(&c, QuantKind::Q8_0, random_weights),
            LoadOptions {
                quant,
                ..Default::default()
            },
        )
    };
    assert!(matches!(load(Some(QuantKind::Q4_0)), Err(Error::Configuration(_))));
    // Qwen2 has no f32 planner
    assert!(matches!(load(Some(QuantKind::F32)), Err(Error::Configuration(_))));
    assert!(load(None).is_ok());
}

#[test]
fn test_weights_upload_once() {
    let model = toy_model(ModelFamily::Qwen3, QuantKind::Q8_0);
    let mut session = model.session(CpuBackend::new());
    for token in [2, 4, 6] {
        session.forward(token).unwrap();
    }
    let backend = session.backend();
    for layer in 0..2 {
        assert_eq!(backend.uploads_of(BufferRef::weight(WeightRole::Query, layer)), 1);
        assert_eq!(backend.uploads_of(BufferRef::weight(WeightRole::KeyNorm, layer)), 1);
    }
    assert_eq!(backend.uploads_of(BufferRef::global(WeightRole::Classifier)), 1);
    assert_eq!(backend.uploads_of(BufferId::KeyCache.into()), 1);
    assert_eq!(backend.uploads_of(BufferId::Position.into()), 3);
    assert_eq!(backend.uploads_of(BufferId::Embedding.into()), 3);
}

#[test]
fn test_context_bound() {
    let c = toy_config(ModelFamily::Phi3);
    let model = Model::load(
        &toy_metadata(&c),
        toy_entries(&c, QuantKind::F16, random_weights),
        LoadOptions {
            context_length: Some(2),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(model.config.context_length, 2);
    let mut session = model.session(CpuBackend::new());
    session.forward(1).unwrap();
    session.forward(1).unwrap();
    assert!(matches!(
        session.forward(1),
        Err(Error::Bounds {
            position: 2,
            limit: 2
        })
    ));
    assert_eq!(session.position(), 2);

    session.reset();
    assert_eq!(session.position(), 0);
    session.forward(1).unwrap();
}

#[test]
fn test_out_of_vocabulary_token() {
    let model = toy_model(ModelFamily::Llama, QuantKind::F16);
    let mut session = model.session(CpuBackend::new());
    assert!(session.forward(16).is_err());
    assert_eq!(session.position(), 0);
}

/// Fails the first time it reaches one stage, then behaves like the CPU backend
struct FailOnce {
    inner: CpuBackend,
    stage: &'static str,
    failed: bool,
}

impl Backend for FailOnce {
    fn name(&self) -> &str {
        "fail-once"
    }

    fn execute_graph(
        &mut self,
        graph: &LayerGraph,
        weights: &LayeredWeights,
        state: &mut RuntimeState,
    ) -> std::result::Result<(), StageFailure> {
        if !self.failed {
            let target = graph
                .stages
                .iter()
                .find(|s| graph.qualified_name(s) == self.stage);
            if let Some(stage) = target {
                self.failed = true;
                return Err(StageFailure::new(graph, stage, Error::Backend("device lost".into())));
            }
        }
        self.inner.execute_graph(graph, weights, state)
    }
}

#[test]
fn test_step_failure_names_stage() {
    let model = toy_model(ModelFamily::Llama, QuantKind::Q8_0);
    let mut session = model.session(FailOnce {
        inner: CpuBackend::new(),
        stage: "layer_1.attention",
        failed: false,
    });
    let err = session.forward(3).unwrap_err();
    match &err {
        Error::Step { step, stage, .. } => {
            assert_eq!(*step, 0);
            assert_eq!(stage, "layer_1.attention");
        }
        e => panic!("expected a step error, got {e:?}"),
    }
    assert!(matches!(err.root(), Error::Backend(_)));

    // The position didn't advance and the step can be retried
    assert_eq!(session.position(), 0);
    let retried = session.forward(3).unwrap().to_vec();
    let mut clean = model.session(CpuBackend::new());
    assert_close(&retried, clean.forward(3).unwrap());
}

#[test]
fn test_reset_replays() {
    let model = toy_model(ModelFamily::Qwen2, QuantKind::Q4_0);
    let mut session = model.session(CpuBackend::new());
    let first = session.prefill(&[1, 2, 3]).unwrap().to_vec();
    session.reset();
    assert_exact(&first, session.prefill(&[1, 2, 3]).unwrap());
}

#[test]
fn test_print_plan() {
    let model = toy_model(ModelFamily::Phi3, QuantKind::Q8_0);
    model.plan.print_plan();
    let mut session = model.session(CpuBackend::new().with_timing());
    session.forward(0).unwrap();
}
