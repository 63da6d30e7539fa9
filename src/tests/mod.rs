mod test_model;

use std::fmt::Debug;

use half::f16;
use rand::{thread_rng, Rng};

use crate::{
    config::{ModelConfig, ModelFamily},
    dispatch::{architecture, LoadOptions, Model},
    metadata::{Metadata, MetadataValue, TensorEntry},
    quant::{QuantKind, QuantizedTensor},
    weights::WeightRole,
};

/// Ensure two arrays are nearly equal
pub fn assert_close(a_vec: &[f32], b_vec: &[f32]) {
    assert_close_precision(a_vec, b_vec, 3)
}

/// Ensure two arrays are nearly equal to a decimal place
pub fn assert_close_precision(a_vec: &[f32], b_vec: &[f32], precision: u8) {
    assert_eq!(a_vec.len(), b_vec.len(), "Number of elements doesn't match");
    for (a, b) in a_vec.iter().zip(b_vec.iter()) {
        if (a - b).abs() > f32::powf(10., -(precision as f32)) {
            panic!(
                "{a} is not close to {b}, avg distance: {}",
                a_vec
                    .iter()
                    .zip(b_vec.iter())
                    .map(|(a, b)| (a - b).abs())
                    .sum::<f32>()
                    / a_vec.len() as f32
            );
        }
    }
}

/// Ensure two arrays are exactly equal
pub fn assert_exact<T: PartialEq + Debug>(a_vec: &[T], b_vec: &[T]) {
    assert_eq!(a_vec.len(), b_vec.len(), "Number of elements doesn't match");
    for (a, b) in a_vec.iter().zip(b_vec.iter()) {
        if a != b {
            panic!("{a:?} is not equal to {b:?}");
        }
    }
}

pub fn random_vec(n: usize) -> Vec<f32> {
    let mut rng = thread_rng();
    (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect()
}

/// Tiny model every family can plan: 4 query heads over 2 key/value heads of width 2
pub fn toy_config(family: ModelFamily) -> ModelConfig {
    ModelConfig {
        family,
        dim: 8,
        hidden_dim: 16,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: 2,
        head_size: 2,
        vocab_size: 16,
        context_length: 8,
        rms_norm_eps: 1e-5,
        rope_theta: 10000.,
    }
}

/// Metadata map describing `c`
pub fn toy_metadata(c: &ModelConfig) -> Metadata {
    let p = c.family.metadata_prefix();
    let mut meta = Metadata::new();
    meta.insert("general.architecture", MetadataValue::String(p.clone()));
    for (key, v) in [
        ("embedding_length", c.dim),
        ("feed_forward_length", c.hidden_dim),
        ("block_count", c.n_layers),
        ("attention.head_count", c.n_heads),
        ("attention.head_count_kv", c.n_kv_heads),
        ("attention.key_length", c.head_size),
        ("context_length", c.context_length),
        ("vocab_size", c.vocab_size),
    ] {
        meta.insert(format!("{p}.{key}"), MetadataValue::U32(v as u32));
    }
    meta.insert(
        format!("{p}.attention.layer_norm_rms_epsilon"),
        MetadataValue::F32(c.rms_norm_eps),
    );
    meta.insert(format!("{p}.rope.freq_base"), MetadataValue::F32(c.rope_theta));
    meta
}

/// Encode `data` the way a weight file stores `kind`
pub fn encode(name: &str, kind: QuantKind, data: Vec<f32>) -> TensorEntry {
    let shape = vec![data.len()];
    let tensor = match kind {
        QuantKind::F32 => QuantizedTensor::from_f32(name, shape.clone(), data),
        QuantKind::F16 => QuantizedTensor::from_f16(
            name,
            shape.clone(),
            data.into_iter().map(f16::from_f32).collect(),
        ),
        QuantKind::Q8_0 => QuantizedTensor::quantize_q8(name, shape.clone(), &data),
        QuantKind::Q4_0 => QuantizedTensor::quantize_q4(name, shape.clone(), &data),
    }
    .unwrap();
    TensorEntry::new(name, shape, kind, tensor.to_bytes())
}

/// Norm weights of one, everything else random
pub fn random_weights(role: WeightRole, n: usize) -> Vec<f32> {
    match role {
        WeightRole::AttentionNorm
        | WeightRole::FfnNorm
        | WeightRole::OutputNorm
        | WeightRole::QueryNorm
        | WeightRole::KeyNorm => vec![1.; n],
        _ => random_vec(n),
    }
}

/// Every tensor the family of `c` needs. Matrices and the embedding are stored as `quant`,
/// norms and biases as f32. The classifier is always stored separately.
pub fn toy_entries(
    c: &ModelConfig,
    quant: QuantKind,
    mut fill: impl FnMut(WeightRole, usize) -> Vec<f32>,
) -> Vec<TensorEntry> {
    let mut entries = vec![];
    for role in architecture(c.family).required_roles() {
        let kind = if role.is_matmul() || role == WeightRole::TokenEmbedding {
            quant
        } else {
            QuantKind::F32
        };
        let layers = if role.is_global() { 1 } else { c.n_layers };
        for layer in 0..layers {
            entries.push(encode(
                &role.tensor_name(layer),
                kind,
                fill(role, role.expected_len(c)),
            ));
        }
    }
    entries
}

pub fn toy_model(family: ModelFamily, quant: QuantKind) -> Model {
    let c = toy_config(family);
    Model::load(
        &toy_metadata(&c),
        toy_entries(&c, quant, random_weights),
        LoadOptions::default(),
    )
    .unwrap()
}
