//! Forward kernel (C5): embedding lookup -> L transformer blocks
//! (pre-attn LN, multi-head causal attention, residual, pre-FFN LN, FFN,
//! residual) -> tied-embedding logits. No in-place mutation of `params`.
//!
//! Numerical policy (`spec.md` §4.5): attention scores are clamped to
//! `[-50, 50]` after max-subtraction and before `exp`; any NaN/Inf
//! produced at any stage is replaced with zero and counted via
//! `health`. Softmax ties break lexicographically (lower index wins)
//! because the causal mask uses `-inf`, which only ever *decreases* a
//! later index's score relative to an earlier tie.

use crate::config::ModelConfig;
use crate::kernel::Activations;
use crate::math::transcendental as tr;
use crate::params::ParamLayout;
use crate::worker::NumericalHealth;

const LN_EPS: f32 = 1e-5;
const CLAMP: f32 = 50.0;

fn clamp_finite(x: f32, health: &NumericalHealth) -> f32 {
    if tr::isnan(x) || tr::isinf(x) {
        health.note_recovery();
        0.0
    } else {
        x
    }
}

/// `out[bt, :] = LayerNorm(inp[bt, :], gamma, beta)`, caching mean/rstd
/// per row for the backward pass.
fn layernorm_forward(
    out: &mut [f32],
    mean: &mut [f32],
    rstd: &mut [f32],
    inp: &[f32],
    gamma: &[f32],
    beta: &[f32],
    bt: usize,
    d: usize,
) {
    for row in 0..bt {
        let x = &inp[row * d..row * d + d];
        let m: f32 = x.iter().sum::<f32>() / d as f32;
        let v: f32 = x.iter().map(|&xi| (xi - m) * (xi - m)).sum::<f32>() / d as f32;
        let s = 1.0 / tr::sqrt(v + LN_EPS);
        for i in 0..d {
            let n = s * (x[i] - m);
            out[row * d + i] = n * gamma[i] + beta[i];
        }
        mean[row] = m;
        rstd[row] = s;
    }
}

/// `out[bt, :] = weight * inp[bt, :] + bias` (row-major `weight[OC][IC]`,
/// the same convention the teacher's `matmul_forward` uses).
fn matmul_forward(out: &mut [f32], inp: &[f32], weight: &[f32], bias: Option<&[f32]>, bt: usize, ic: usize, oc: usize) {
    for row in 0..bt {
        let x = &inp[row * ic..row * ic + ic];
        for o in 0..oc {
            let w = &weight[o * ic..o * ic + ic];
            let mut val = bias.map(|b| b[o]).unwrap_or(0.0);
            for i in 0..ic {
                val += x[i] * w[i];
            }
            out[row * oc + o] = val;
        }
    }
}

/// Causal multi-head attention. Stores the softmax-normalized weights
/// `A[b][h][t][t2]` in `attn_weights`, exactly as the backward pass
/// requires (`spec.md` §4.5c, §4.6).
#[allow(clippy::too_many_arguments)]
fn attention_forward(
    out: &mut [f32],
    attn_weights: &mut [f32],
    q: &[f32],
    k: &[f32],
    v: &[f32],
    b: usize,
    t: usize,
    d: usize,
    h: usize,
    health: &NumericalHealth,
) {
    let hs = d / h;
    let scale = 1.0 / tr::sqrt(hs as f32);
    for bi in 0..b {
        for hi in 0..h {
            for ti in 0..t {
                let q_row = &q[(bi * t + ti) * d + hi * hs..(bi * t + ti) * d + hi * hs + hs];

                // Pass 1: scores against every causally-visible key,
                // tracking the running max for stability.
                let mut scores = vec![f32::NEG_INFINITY; t];
                let mut maxval = f32::NEG_INFINITY;
                for t2 in 0..=ti {
                    let k_row = &k[(bi * t + t2) * d + hi * hs..(bi * t + t2) * d + hi * hs + hs];
                    let mut val = 0.0f32;
                    for i in 0..hs {
                        val += q_row[i] * k_row[i];
                    }
                    val *= scale;
                    val = clamp_finite(val, health);
                    scores[t2] = val;
                    if val > maxval {
                        maxval = val;
                    }
                }

                // Pass 2: shift by the max, clamp to +/-50, exponentiate.
                let weights_base = (bi * h + hi) * t * t + ti * t;
                let mut expsum = 0.0f32;
                for t2 in 0..=ti {
                    let mut shifted = scores[t2] - maxval;
                    if shifted < -CLAMP {
                        shifted = -CLAMP;
                    } else if shifted > CLAMP {
                        shifted = CLAMP;
                    }
                    let e = tr::exp(shifted);
                    attn_weights[weights_base + t2] = e;
                    expsum += e;
                }
                let inv = if expsum > 0.0 { 1.0 / expsum } else { 0.0 };
                for t2 in 0..t {
                    attn_weights[weights_base + t2] = if t2 <= ti {
                        attn_weights[weights_base + t2] * inv
                    } else {
                        0.0
                    };
                }

                // Pass 3: weighted sum of values.
                let out_row_base = (bi * t + ti) * d + hi * hs;
                for i in 0..hs {
                    out[out_row_base + i] = 0.0;
                }
                for t2 in 0..=ti {
                    let a = attn_weights[weights_base + t2];
                    let v_row = &v[(bi * t + t2) * d + hi * hs..(bi * t + t2) * d + hi * hs + hs];
                    for i in 0..hs {
                        out[out_row_base + i] += a * v_row[i];
                    }
                }
            }
        }
    }
}

fn relu_forward(hidden: &mut [f32], pre: &[f32]) {
    for i in 0..pre.len() {
        hidden[i] = if pre[i] > 0.0 { pre[i] } else { 0.0 };
    }
}

fn residual_forward(out: &mut [f32], a: &[f32], b: &[f32]) {
    for i in 0..out.len() {
        out[i] = a[i] + b[i];
    }
}

/// Embedding lookup: `h0[bt, :] = E[tokens[bt], :]`.
fn encoder_forward(out: &mut [f32], tokens: &[u32], wte: &[f32], d: usize) {
    for (row, &tok) in tokens.iter().enumerate() {
        let src = &wte[tok as usize * d..tok as usize * d + d];
        out[row * d..row * d + d].copy_from_slice(src);
    }
}

/// Tied-weight output projection: `logits[bt, v] = E[v, :] . h[bt, :]`.
fn output_projection_forward(logits: &mut [f32], h: &[f32], wte: &[f32], bt: usize, d: usize, v: usize) {
    for row in 0..bt {
        let x = &h[row * d..row * d + d];
        for vi in 0..v {
            let e_row = &wte[vi * d..vi * d + d];
            let mut val = 0.0f32;
            for i in 0..d {
                val += x[i] * e_row[i];
            }
            logits[row * v + vi] = val;
        }
    }
}

fn softmax_forward(probs: &mut [f32], logits: &[f32], bt: usize, v: usize) {
    for row in 0..bt {
        let l = &logits[row * v..row * v + v];
        let maxval = l.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for i in 0..v {
            let e = tr::exp(l[i] - maxval);
            probs[row * v + i] = e;
            sum += e;
        }
        let inv = if sum > 0.0 { 1.0 / sum } else { 0.0 };
        for i in 0..v {
            probs[row * v + i] *= inv;
        }
    }
}

fn crossentropy_forward(losses: &mut [f32], probs: &[f32], targets: &[u32], bt: usize, v: usize) {
    for row in 0..bt {
        let ix = targets[row] as usize;
        let p = probs[row * v + ix].max(1e-12);
        losses[row] = -tr::log(p);
    }
}

/// Runs the forward pass for a `[B, T]` batch of token ids into `act`.
/// When `targets` is provided, also fills `act.probs`/`act.losses` so
/// the caller gets loss-reporting "for free" from the same softmax the
/// backward pass will need (`spec.md` §4.6, last line).
#[allow(clippy::too_many_arguments)]
pub fn forward(
    cfg: &ModelConfig,
    layout: &ParamLayout,
    params: &[f32],
    tokens: &[u32],
    targets: Option<&[u32]>,
    b: usize,
    t: usize,
    act: &mut Activations,
    health: &NumericalHealth,
) {
    let d = cfg.embedding_dim;
    let f = cfg.ff_dim;
    let v = cfg.vocab_size;
    let bt = b * t;

    let wte = &params[layout.wte_offset..layout.wte_offset + layout.wte_len];
    encoder_forward(&mut act.h0[..bt * d], tokens, wte, d);

    let mut h: Vec<f32> = act.h0[..bt * d].to_vec();
    for (li, lo) in layout.layers.iter().enumerate() {
        let la = &mut act.layers[li];

        layernorm_forward(
            &mut la.ln1_out[..bt * d],
            &mut la.mean1[..bt],
            &mut la.rstd1[..bt],
            &h,
            &params[lo.ln1_gamma..lo.ln1_gamma + d],
            &params[lo.ln1_beta..lo.ln1_beta + d],
            bt,
            d,
        );

        matmul_forward(&mut la.q[..bt * d], &la.ln1_out[..bt * d], &params[lo.wq..lo.wq + d * d], None, bt, d, d);
        matmul_forward(&mut la.k[..bt * d], &la.ln1_out[..bt * d], &params[lo.wk..lo.wk + d * d], None, bt, d, d);
        matmul_forward(&mut la.v[..bt * d], &la.ln1_out[..bt * d], &params[lo.wv..lo.wv + d * d], None, bt, d, d);

        attention_forward(
            &mut la.attn_out[..bt * d],
            &mut la.attn_weights[..b * cfg.num_heads * t * t],
            &la.q[..bt * d],
            &la.k[..bt * d],
            &la.v[..bt * d],
            b,
            t,
            d,
            cfg.num_heads,
            health,
        );

        residual_forward(&mut la.resid1[..bt * d], &h, &la.attn_out[..bt * d]);

        layernorm_forward(
            &mut la.ln2_out[..bt * d],
            &mut la.mean2[..bt],
            &mut la.rstd2[..bt],
            &la.resid1[..bt * d],
            &params[lo.ln2_gamma..lo.ln2_gamma + d],
            &params[lo.ln2_beta..lo.ln2_beta + d],
            bt,
            d,
        );

        matmul_forward(
            &mut la.ffn_pre[..bt * f],
            &la.ln2_out[..bt * d],
            &params[lo.w1..lo.w1 + f * d],
            Some(&params[lo.b1..lo.b1 + f]),
            bt,
            d,
            f,
        );
        relu_forward(&mut la.ffn_hidden[..bt * f], &la.ffn_pre[..bt * f]);

        let mut ffn_out = vec![0.0f32; bt * d];
        matmul_forward(
            &mut ffn_out,
            &la.ffn_hidden[..bt * f],
            &params[lo.w2..lo.w2 + d * f],
            Some(&params[lo.b2..lo.b2 + d]),
            bt,
            f,
            d,
        );

        residual_forward(&mut la.resid2[..bt * d], &la.resid1[..bt * d], &ffn_out);

        // Recover any stray NaN/Inf that slipped through the matmuls
        // before handing this layer's output to the next layer.
        for x in la.resid2[..bt * d].iter_mut() {
            *x = clamp_finite(*x, health);
        }
        h = la.resid2[..bt * d].to_vec();
    }

    output_projection_forward(&mut act.logits[..bt * v], &h, wte, bt, d, v);

    if let Some(targets) = targets {
        softmax_forward(&mut act.probs[..bt * v], &act.logits[..bt * v], bt, v);
        crossentropy_forward(&mut act.losses[..bt], &act.probs[..bt * v], targets, bt, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamStore;

    fn tiny_cfg() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        }
    }

    #[test]
    fn forward_is_bit_deterministic() {
        let cfg = tiny_cfg();
        let store = ParamStore::new(cfg.clone(), 1).unwrap();
        let tokens = [1u32, 3, 5, 7];
        let health = NumericalHealth::default();

        let mut act1 = Activations::new(&cfg, 1, 4);
        forward(&cfg, &store.layout, &store.params, &tokens, None, 1, 4, &mut act1, &health);

        let mut act2 = Activations::new(&cfg, 1, 4);
        forward(&cfg, &store.layout, &store.params, &tokens, None, 1, 4, &mut act2, &health);

        assert_eq!(act1.logits, act2.logits);
    }

    #[test]
    fn attention_weights_causal_mask_future_is_zero() {
        let cfg = tiny_cfg();
        let store = ParamStore::new(cfg.clone(), 2).unwrap();
        let tokens = [0u32, 1, 2, 3];
        let health = NumericalHealth::default();
        let mut act = Activations::new(&cfg, 1, 4);
        forward(&cfg, &store.layout, &store.params, &tokens, None, 1, 4, &mut act, &health);

        let t = 4;
        let h = cfg.num_heads;
        let la = &act.layers[0];
        for hi in 0..h {
            for ti in 0..t {
                for t2 in (ti + 1)..t {
                    let idx = hi * t * t + ti * t + t2;
                    assert_eq!(la.attn_weights[idx], 0.0);
                }
                let row_sum: f32 = (0..=ti).map(|t2| la.attn_weights[hi * t * t + ti * t + t2]).sum();
                approx::assert_abs_diff_eq!(row_sum, 1.0, epsilon = 1e-4);
            }
        }
    }
}
