//! Reference kernels. Each mirrors one stage kind and works on plain slices.

use crate::{quant::QuantizedTensor, stage::RopePairing};

/// `1 / sqrt(mean(x^2) + eps)`
pub fn rms_inv(x: &[f32], eps: f32) -> f32 {
    let mean = x.iter().map(|v| v * v).sum::<f32>() / x.len().max(1) as f32;
    1. / (mean + eps).sqrt()
}

/// `dst = src * inv * weight`
pub fn rms_apply(src: &[f32], inv: f32, weight: &QuantizedTensor, dst: &mut [f32]) {
    for (i, (d, s)) in dst.iter_mut().zip(src).enumerate() {
        *d = s * inv * weight.value(i);
    }
}

/// `out[r] = weight[r] . x` for every row of `out`
pub fn matvec(weight: &QuantizedTensor, x: &[f32], out: &mut [f32]) {
    for (r, o) in out.iter_mut().enumerate() {
        *o = weight.dot_row(r, x);
    }
}

/// `acc[r] += weight[r] . x`
pub fn matvec_residual(weight: &QuantizedTensor, x: &[f32], acc: &mut [f32]) {
    for (r, a) in acc.iter_mut().enumerate() {
        *a += weight.dot_row(r, x);
    }
}

pub fn bias_add(bias: &QuantizedTensor, target: &mut [f32]) {
    for (i, t) in target.iter_mut().enumerate() {
        *t += bias.value(i);
    }
}

/// One inverse RMS per head
pub fn head_rms_inv(src: &[f32], head_size: usize, eps: f32, scratch: &mut [f32]) {
    for (s, head) in scratch.iter_mut().zip(src.chunks_exact(head_size)) {
        *s = rms_inv(head, eps);
    }
}

/// Scale each head by its inverse RMS and the shared per-element weight
pub fn head_rms_apply(
    scratch: &[f32],
    weight: &QuantizedTensor,
    head_size: usize,
    target: &mut [f32],
) {
    for (inv, head) in scratch.iter().zip(target.chunks_exact_mut(head_size)) {
        for (i, v) in head.iter_mut().enumerate() {
            *v *= inv * weight.value(i);
        }
    }
}

/// Rotate every head of `x` in place by the angles of `position`.
///
/// Pair `i` of a head turns by `position * theta^(-2i / head_size)`.
pub fn rope(x: &mut [f32], pairing: RopePairing, head_size: usize, position: usize, theta: f32) {
    let half = head_size / 2;
    for head in x.chunks_exact_mut(head_size) {
        for i in 0..half {
            let freq = theta.powf(-2. * i as f32 / head_size as f32);
            let (sin, cos) = (position as f32 * freq).sin_cos();
            let (a, b) = match pairing {
                RopePairing::Adjacent => (2 * i, 2 * i + 1),
                RopePairing::HalfOffset => (i, i + half),
            };
            let (x0, x1) = (head[a], head[b]);
            head[a] = x0 * cos - x1 * sin;
            head[b] = x0 * sin + x1 * cos;
        }
    }
}

pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Sizes of a causal grouped-query attention pass
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_size: usize,
    /// Row stride of the score buffer
    pub context_length: usize,
}

/// Attend each query head over positions `0..=position`.
///
/// `keys` and `values` hold `position + 1` rows of `n_kv_heads * head_size`. Query head `h` reads
/// key/value head `h / (n_heads / n_kv_heads)`.
pub fn attention(
    shape: AttentionShape,
    position: usize,
    q: &[f32],
    keys: &[f32],
    values: &[f32],
    att: &mut [f32],
    out: &mut [f32],
) {
    let AttentionShape {
        n_heads,
        n_kv_heads,
        head_size,
        context_length,
    } = shape;
    let kv_dim = n_kv_heads * head_size;
    let kv_mul = n_heads / n_kv_heads;
    let scale = 1. / (head_size as f32).sqrt();
    for h in 0..n_heads {
        let query = &q[h * head_size..(h + 1) * head_size];
        let kv_offset = (h / kv_mul) * head_size;
        let scores = &mut att[h * context_length..h * context_length + position + 1];
        for (t, score) in scores.iter_mut().enumerate() {
            let key = &keys[t * kv_dim + kv_offset..t * kv_dim + kv_offset + head_size];
            *score = query.iter().zip(key).map(|(a, b)| a * b).sum::<f32>() * scale;
        }
        softmax(scores);

        let head_out = &mut out[h * head_size..(h + 1) * head_size];
        head_out.fill(0.);
        for (t, weight) in scores.iter().enumerate() {
            let value = &values[t * kv_dim + kv_offset..t * kv_dim + kv_offset + head_size];
            for (o, v) in head_out.iter_mut().zip(value) {
                *o += weight * v;
            }
        }
    }
}

pub fn silu(x: f32) -> f32 {
    x / (1. + (-x).exp())
}

/// `hidden[r] = silu(gate[r] . x) * (up[r] . x)`
pub fn gate_up_silu(gate: &QuantizedTensor, up: &QuantizedTensor, x: &[f32], hidden: &mut [f32]) {
    for (r, h) in hidden.iter_mut().enumerate() {
        *h = silu(gate.dot_row(r, x)) * up.dot_row(r, x);
    }
}

/// Same as [`gate_up_silu`] on an already projected `[gate; up]` vector
pub fn split_gate_up_silu(gate_up: &[f32], hidden: &mut [f32]) {
    let (gate, up) = gate_up.split_at(hidden.len());
    for ((h, g), u) in hidden.iter_mut().zip(gate).zip(up) {
        *h = silu(*g) * u;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::tests::{assert_close, assert_close_precision, random_vec};

    fn norm(x: &[f32]) -> f32 {
        x.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    #[test]
    fn test_rope_pairing() {
        // One head of 4: pair 0 turns by `position`, pair 1 by `position / 100`
        let mut adjacent = vec![1., 0., 1., 0.];
        rope(&mut adjacent, RopePairing::Adjacent, 4, 1, 10000.);
        assert_close(&adjacent, &[1f32.cos(), 1f32.sin(), 0.01f32.cos(), 0.01f32.sin()]);

        let mut half = vec![1., 1., 0., 0.];
        rope(&mut half, RopePairing::HalfOffset, 4, 1, 10000.);
        assert_close(&half, &[1f32.cos(), 0.01f32.cos(), 1f32.sin(), 0.01f32.sin()]);

        let mut still = vec![0.3, -0.2, 0.5, 0.1];
        rope(&mut still, RopePairing::HalfOffset, 4, 0, 10000.);
        assert_close(&still, &[0.3, -0.2, 0.5, 0.1]);
    }

    #[test]
    fn test_attention_single_position() {
        // With one position the softmax is 1 and the output is the value row of the shared head
        let shape = AttentionShape {
            n_heads: 2,
            n_kv_heads: 1,
            head_size: 2,
            context_length: 4,
        };
        let q = random_vec(4);
        let (keys, values) = (random_vec(2), vec![0.25, -1.]);
        let (mut att, mut out) = (vec![0.; 8], vec![0.; 4]);
        attention(shape, 0, &q, &keys, &values, &mut att, &mut out);
        assert_close(&out, &[0.25, -1., 0.25, -1.]);
        assert_close(&[att[0], att[4]], &[1., 1.]);
    }

    #[test]
    fn test_attention_weights_sum_to_one() {
        let shape = AttentionShape {
            n_heads: 4,
            n_kv_heads: 2,
            head_size: 4,
            context_length: 8,
        };
        let (q, keys, values) = (random_vec(16), random_vec(8 * 5), random_vec(8 * 5));
        let (mut att, mut out) = (vec![0.; 32], vec![0.; 16]);
        attention(shape, 4, &q, &keys, &values, &mut att, &mut out);
        for h in 0..4 {
            let row = &att[h * 8..h * 8 + 5];
            assert_close_precision(&[row.iter().sum::<f32>()], &[1.], 5);
            // Nothing past the current position is touched
            assert!(att[h * 8 + 5..(h + 1) * 8].iter().all(|v| *v == 0.));
        }
    }

    #[test]
    fn test_silu_gate() {
        let gate_up = vec![0., 2., 3., 0.5];
        let mut hidden = vec![0.; 2];
        split_gate_up_silu(&gate_up, &mut hidden);
        assert_close(&hidden, &[0., silu(2.) * 0.5]);
    }

    proptest! {
        #[test]
        fn rope_preserves_norm(
            x in prop::collection::vec(-4f32..4., 16),
            position in 0usize..4096,
            half in any::<bool>(),
        ) {
            let pairing = if half { RopePairing::HalfOffset } else { RopePairing::Adjacent };
            let mut rotated = x.clone();
            rope(&mut rotated, pairing, 8, position, 10000.);
            for (a, b) in x.chunks(8).zip(rotated.chunks(8)) {
                prop_assert!((norm(a) - norm(b)).abs() <= 1e-3 * norm(a).max(1.));
            }
        }
    }
}
