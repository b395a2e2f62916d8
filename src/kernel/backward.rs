//! Backward kernel (C6): exact reverse of `kernel::forward`, starting
//! from `d logits = softmax(logits) - one_hot(target)` and propagating
//! through every block. Because forward stored the softmax-normalized
//! attention weights, the attention backward here is exact -- no
//! outer-product proxy (`spec.md` §4.6, §9).
//!
//! All parameter gradients are *added* into the caller's
//! `grad_segment` (same flat layout as `ParamLayout`), so this function
//! is associative under the root's segment-sum reduction (`spec.md`
//! §4.6 contract). Gradients are clipped element-wise to +/-1e4 before
//! being written; the global L2 clip is the root's job at reduction
//! time (`optim::clip_global_norm`).

use crate::config::ModelConfig;
use crate::kernel::{Activations, BackwardScratch};
use crate::params::ParamLayout;

const ELEMENT_CLIP: f32 = 1e4;

#[inline]
fn clip_elem(g: f32) -> f32 {
    g.clamp(-ELEMENT_CLIP, ELEMENT_CLIP)
}

#[inline]
fn add_grad(dst: &mut f32, contribution: f32) {
    *dst = clip_elem(*dst + contribution);
}

fn crossentropy_softmax_backward(dlogits: &mut [f32], probs: &[f32], targets: &[u32], bt: usize, v: usize) {
    for row in 0..bt {
        let ix = targets[row] as usize;
        for i in 0..v {
            let indicator = if i == ix { 1.0 } else { 0.0 };
            // Mean-per-token loss: scale by 1/bt so the accumulated
            // gradient matches the mean cross-entropy forward computes.
            dlogits[row * v + i] = (probs[row * v + i] - indicator) / bt as f32;
        }
    }
}

/// Backward through the tied output projection: gradients flow to the
/// embedding rows (accumulated directly into `grad_segment`) and to
/// `dh` (the final hidden-state gradient).
fn output_projection_backward(
    dh: &mut [f32],
    d_wte: &mut [f32],
    dlogits: &[f32],
    h: &[f32],
    wte: &[f32],
    bt: usize,
    d: usize,
    v: usize,
) {
    for row in 0..bt {
        let dl_row = &dlogits[row * v..row * v + v];
        let h_row = &h[row * d..row * d + d];
        for vi in 0..v {
            let dl = dl_row[vi];
            if dl == 0.0 {
                continue;
            }
            let e_row = &wte[vi * d..vi * d + d];
            let dwte_row = &mut d_wte[vi * d..vi * d + d];
            for i in 0..d {
                dh[row * d + i] += dl * e_row[i];
                add_grad(&mut dwte_row[i], dl * h_row[i]);
            }
        }
    }
}

fn relu_backward(dpre: &mut [f32], pre: &[f32], dhidden: &[f32]) {
    for i in 0..pre.len() {
        dpre[i] = if pre[i] > 0.0 { dhidden[i] } else { 0.0 };
    }
}

fn residual_backward(da: &mut [f32], db: &mut [f32], dout: &[f32]) {
    for i in 0..dout.len() {
        da[i] += dout[i];
        db[i] += dout[i];
    }
}

/// `matmul_backward`: given `dout`, accumulates `dinp`, `dweight`, and
/// (optionally) `dbias` for `out = inp @ weight^T + bias`, with
/// `weight` laid out row-major as `weight[oc][ic]`.
#[allow(clippy::too_many_arguments)]
fn matmul_backward(
    dinp: &mut [f32],
    dweight: &mut [f32],
    mut dbias: Option<&mut [f32]>,
    dout: &[f32],
    inp: &[f32],
    weight: &[f32],
    bt: usize,
    ic: usize,
    oc: usize,
) {
    for row in 0..bt {
        let dout_row = &dout[row * oc..row * oc + oc];
        let inp_row = &inp[row * ic..row * ic + ic];
        let dinp_row = &mut dinp[row * ic..row * ic + ic];
        for o in 0..oc {
            let d = dout_row[o];
            if d == 0.0 {
                continue;
            }
            let w_row = &weight[o * ic..o * ic + ic];
            for i in 0..ic {
                dinp_row[i] += w_row[i] * d;
            }
        }
    }

    for o in 0..oc {
        let dw_row = &mut dweight[o * ic..o * ic + ic];
        let mut db = 0.0f32;
        for row in 0..bt {
            let d = dout[row * oc + o];
            db += d;
            let inp_row = &inp[row * ic..row * ic + ic];
            for i in 0..ic {
                add_grad(&mut dw_row[i], inp_row[i] * d);
            }
        }
        if let Some(dbias) = dbias.as_deref_mut() {
            add_grad(&mut dbias[o], db);
        }
    }
}

/// Standard per-row closed-form LayerNorm backward, reading the mean
/// and rstd `layernorm_forward` cached.
#[allow(clippy::too_many_arguments)]
fn layernorm_backward(
    dinp: &mut [f32],
    dgamma: &mut [f32],
    dbeta: &mut [f32],
    dout: &[f32],
    inp: &[f32],
    gamma: &[f32],
    mean: &[f32],
    rstd: &[f32],
    bt: usize,
    d: usize,
) {
    for row in 0..bt {
        let dout_row = &dout[row * d..row * d + d];
        let inp_row = &inp[row * d..row * d + d];
        let m = mean[row];
        let s = rstd[row];

        let mut dnorm_mean = 0.0f32;
        let mut dnorm_norm_mean = 0.0f32;
        for i in 0..d {
            let norm_i = (inp_row[i] - m) * s;
            let dnorm_i = gamma[i] * dout_row[i];
            dnorm_mean += dnorm_i;
            dnorm_norm_mean += dnorm_i * norm_i;
        }
        dnorm_mean /= d as f32;
        dnorm_norm_mean /= d as f32;

        let dinp_row = &mut dinp[row * d..row * d + d];
        for i in 0..d {
            let norm_i = (inp_row[i] - m) * s;
            let dnorm_i = gamma[i] * dout_row[i];

            add_grad(&mut dbeta[i], dout_row[i]);
            add_grad(&mut dgamma[i], norm_i * dout_row[i]);

            let mut dval = dnorm_i;
            dval -= dnorm_mean;
            dval -= norm_i * dnorm_norm_mean;
            dval *= s;
            dinp_row[i] += dval;
        }
    }
}

/// Exact attention backward using the stored softmax weights `A`
/// (`spec.md` §4.6.4):
/// `dV[j] = sum_i A[i,j] dO[i]`, `dA[i,j] = dO[i].V[j]`,
/// `dS[i,:] = A[i,:] * (dA[i,:] - sum_k A[i,k] dA[i,k])`,
/// `dQ[i] = sum_j dS[i,j] K[j] / sqrt(d_h)`,
/// `dK[j] = sum_i dS[i,j] Q[i] / sqrt(d_h)`.
#[allow(clippy::too_many_arguments)]
fn attention_backward(
    dq: &mut [f32],
    dk: &mut [f32],
    dv: &mut [f32],
    dout: &[f32],
    q: &[f32],
    k: &[f32],
    v: &[f32],
    attn_weights: &[f32],
    b: usize,
    t: usize,
    d: usize,
    h: usize,
) {
    let hs = d / h;
    let scale = 1.0 / (hs as f32).sqrt();

    for bi in 0..b {
        for hi in 0..h {
            for ti in 0..t {
                let weights_base = (bi * h + hi) * t * t + ti * t;
                let dout_row = &dout[(bi * t + ti) * d + hi * hs..(bi * t + ti) * d + hi * hs + hs];

                // dA[t2] = dOut[t] . V[t2]; accumulate dV[t2] at the
                // same time since both need the same A[t,t2].
                let mut d_attn = vec![0.0f32; ti + 1];
                for t2 in 0..=ti {
                    let a = attn_weights[weights_base + t2];
                    let v_row = &v[(bi * t + t2) * d + hi * hs..(bi * t + t2) * d + hi * hs + hs];
                    let mut da = 0.0f32;
                    for i in 0..hs {
                        da += dout_row[i] * v_row[i];
                    }
                    d_attn[t2] = da;
                    let dv_row = &mut dv[(bi * t + t2) * d + hi * hs..(bi * t + t2) * d + hi * hs + hs];
                    for i in 0..hs {
                        dv_row[i] += a * dout_row[i];
                    }
                }

                // Softmax Jacobian, row-restricted to the causal prefix.
                let mut weighted_sum = 0.0f32;
                for t2 in 0..=ti {
                    weighted_sum += attn_weights[weights_base + t2] * d_attn[t2];
                }
                let mut d_score = vec![0.0f32; ti + 1];
                for t2 in 0..=ti {
                    let a = attn_weights[weights_base + t2];
                    d_score[t2] = a * (d_attn[t2] - weighted_sum);
                }

                let q_row = &q[(bi * t + ti) * d + hi * hs..(bi * t + ti) * d + hi * hs + hs];
                let dq_row = &mut dq[(bi * t + ti) * d + hi * hs..(bi * t + ti) * d + hi * hs + hs];
                for t2 in 0..=ti {
                    let k_row = &k[(bi * t + t2) * d + hi * hs..(bi * t + t2) * d + hi * hs + hs];
                    let ds = d_score[t2] * scale;
                    for i in 0..hs {
                        dq_row[i] += ds * k_row[i];
                    }
                    let dk_row = &mut dk[(bi * t + t2) * d + hi * hs..(bi * t + t2) * d + hi * hs + hs];
                    for i in 0..hs {
                        dk_row[i] += ds * q_row[i];
                    }
                }
            }
        }
    }
}

/// Runs the backward pass for the same `[B, T]` batch `forward` just
/// processed, adding every parameter gradient into `grad_segment`
/// (laid out identically to `layout`). `act` must hold the forward
/// activations for this exact batch (including `act.probs`, so call
/// `forward` with `targets = Some(..)` first).
#[allow(clippy::too_many_arguments)]
pub fn backward(
    cfg: &ModelConfig,
    layout: &ParamLayout,
    params: &[f32],
    grad_segment: &mut [f32],
    tokens: &[u32],
    targets: &[u32],
    act: &Activations,
    scratch: &mut BackwardScratch,
    b: usize,
    t: usize,
) {
    let d = cfg.embedding_dim;
    let f = cfg.ff_dim;
    let v = cfg.vocab_size;
    let bt = b * t;

    scratch.clear();

    crossentropy_softmax_backward(&mut scratch.d_logits[..bt * v], &act.probs[..bt * v], targets, bt, v);

    let final_h = if cfg.num_layers == 0 {
        &act.h0[..bt * d]
    } else {
        &act.layers[cfg.num_layers - 1].resid2[..bt * d]
    };
    {
        // Scoped so this mutable borrow of `grad_segment`'s embedding
        // range ends before the per-layer loop below takes its own.
        let wte = &params[layout.wte_offset..layout.wte_offset + layout.wte_len];
        let d_wte = &mut grad_segment[layout.wte_offset..layout.wte_offset + layout.wte_len];
        output_projection_backward(
            &mut scratch.d_h_final[..bt * d],
            d_wte,
            &scratch.d_logits[..bt * v],
            final_h,
            wte,
            bt,
            d,
            v,
        );
    }

    let mut d_h_next = scratch.d_h_final[..bt * d].to_vec();

    for li in (0..cfg.num_layers).rev() {
        let la = &act.layers[li];
        let lg = &mut scratch.layers[li];
        let lo = &layout.layers[li];

        let h_prev = if li == 0 {
            &act.h0[..bt * d]
        } else {
            &act.layers[li - 1].resid2[..bt * d]
        };

        // Residual split at the FFN output: `d_h_next` flows straight
        // through into `d_resid1` and, unchanged, into the FFN branch.
        let mut d_ffn_out = vec![0.0f32; bt * d];
        residual_backward(&mut lg.d_resid1[..bt * d], &mut d_ffn_out, &d_h_next[..bt * d]);

        matmul_backward(
            &mut lg.d_ffn_hidden[..bt * f],
            &mut grad_segment[lo.w2..lo.w2 + d * f],
            Some(&mut grad_segment[lo.b2..lo.b2 + d]),
            &d_ffn_out,
            &la.ffn_hidden[..bt * f],
            &params[lo.w2..lo.w2 + d * f],
            bt,
            f,
            d,
        );

        let mut d_ffn_pre = vec![0.0f32; bt * f];
        relu_backward(&mut d_ffn_pre, &la.ffn_pre[..bt * f], &lg.d_ffn_hidden[..bt * f]);

        matmul_backward(
            &mut lg.d_ln2_out[..bt * d],
            &mut grad_segment[lo.w1..lo.w1 + f * d],
            Some(&mut grad_segment[lo.b1..lo.b1 + f]),
            &d_ffn_pre,
            &la.ln2_out[..bt * d],
            &params[lo.w1..lo.w1 + f * d],
            bt,
            d,
            f,
        );

        layernorm_backward(
            &mut lg.d_resid1[..bt * d],
            &mut grad_segment[lo.ln2_gamma..lo.ln2_gamma + d],
            &mut grad_segment[lo.ln2_beta..lo.ln2_beta + d],
            &lg.d_ln2_out[..bt * d],
            &la.resid1[..bt * d],
            &params[lo.ln2_gamma..lo.ln2_gamma + d],
            &la.mean2[..bt],
            &la.rstd2[..bt],
            bt,
            d,
        );

        // Residual split at the attention output: `d_resid1` is now
        // complete and flows straight through into `d_h_prev` and,
        // unchanged, into the attention branch.
        let mut d_h_prev = vec![0.0f32; bt * d];
        let mut d_attn_out = vec![0.0f32; bt * d];
        residual_backward(&mut d_h_prev, &mut d_attn_out, &lg.d_resid1[..bt * d]);

        attention_backward(
            &mut lg.d_q[..bt * d],
            &mut lg.d_k[..bt * d],
            &mut lg.d_v[..bt * d],
            &d_attn_out,
            &la.q[..bt * d],
            &la.k[..bt * d],
            &la.v[..bt * d],
            &la.attn_weights[..b * cfg.num_heads * t * t],
            b,
            t,
            d,
            cfg.num_heads,
        );

        matmul_backward(
            &mut lg.d_ln1_out[..bt * d],
            &mut grad_segment[lo.wq..lo.wq + d * d],
            None,
            &lg.d_q[..bt * d],
            &la.ln1_out[..bt * d],
            &params[lo.wq..lo.wq + d * d],
            bt,
            d,
            d,
        );
        matmul_backward(
            &mut lg.d_ln1_out[..bt * d],
            &mut grad_segment[lo.wk..lo.wk + d * d],
            None,
            &lg.d_k[..bt * d],
            &la.ln1_out[..bt * d],
            &params[lo.wk..lo.wk + d * d],
            bt,
            d,
            d,
        );
        matmul_backward(
            &mut lg.d_ln1_out[..bt * d],
            &mut grad_segment[lo.wv..lo.wv + d * d],
            None,
            &lg.d_v[..bt * d],
            &la.ln1_out[..bt * d],
            &params[lo.wv..lo.wv + d * d],
            bt,
            d,
            d,
        );

        layernorm_backward(
            &mut d_h_prev[..bt * d],
            &mut grad_segment[lo.ln1_gamma..lo.ln1_gamma + d],
            &mut grad_segment[lo.ln1_beta..lo.ln1_beta + d],
            &lg.d_ln1_out[..bt * d],
            h_prev,
            &params[lo.ln1_gamma..lo.ln1_gamma + d],
            &la.mean1[..bt],
            &la.rstd1[..bt],
            bt,
            d,
        );

        d_h_next = d_h_prev;
    }

    // Embedding gradient: `d_h_next` now holds `d(h0)`, mirroring the
    // teacher's `encoder_backward` -- every occurrence of a token
    // contributes its row of `d_h0` to that token's embedding row.
    let d_wte = &mut grad_segment[layout.wte_offset..layout.wte_offset + layout.wte_len];
    for (row, &tok) in tokens.iter().enumerate() {
        let dh_row = &d_h_next[row * d..row * d + d];
        let dwte_row = &mut d_wte[tok as usize * d..tok as usize * d + d];
        for i in 0..d {
            add_grad(&mut dwte_row[i], dh_row[i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::forward::forward as run_forward;
    use crate::params::ParamStore;
    use crate::worker::NumericalHealth;

    fn tiny_cfg() -> ModelConfig {
        ModelConfig {
            vocab_size: 12,
            embedding_dim: 8,
            num_layers: 2,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        }
    }

    /// Finite-difference check on a handful of embedding-row weights:
    /// confirms the analytic gradient from `backward` matches a
    /// numerical estimate from `forward`'s own loss output.
    #[test]
    fn embedding_gradient_matches_finite_difference() {
        let cfg = tiny_cfg();
        let store = ParamStore::new(cfg.clone(), 7).unwrap();
        let tokens = [1u32, 2, 3, 4];
        let targets = [2u32, 3, 4, 5];
        let health = NumericalHealth::default();
        let b = 1;
        let t = 4;
        let bt = b * t;
        let v = cfg.vocab_size;

        let mut act = Activations::new(&cfg, b, t);
        run_forward(&cfg, &store.layout, &store.params, &tokens, Some(&targets), b, t, &mut act, &health);

        let mut scratch = BackwardScratch::new(&cfg, b, t);
        let mut grad = vec![0.0f32; store.layout.padded_len];
        backward(&cfg, &store.layout, &store.params, &mut grad, &tokens, &targets, &act, &mut scratch, b, t);

        let mean_loss = |probs: &[f32], targets: &[u32]| -> f32 {
            let mut sum = 0.0f32;
            for row in 0..bt {
                let ix = targets[row] as usize;
                sum += -probs[row * v + ix].max(1e-12).ln();
            }
            sum / bt as f32
        };

        let eps = 1e-3f32;
        let probe_idx = store.layout.wte_offset + (tokens[0] as usize) * cfg.embedding_dim;

        let mut params_plus = store.params.clone();
        params_plus[probe_idx] += eps;
        let mut act_plus = Activations::new(&cfg, b, t);
        run_forward(&cfg, &store.layout, &params_plus, &tokens, Some(&targets), b, t, &mut act_plus, &health);
        let loss_plus = mean_loss(&act_plus.probs[..bt * v], &targets);

        let mut params_minus = store.params.clone();
        params_minus[probe_idx] -= eps;
        let mut act_minus = Activations::new(&cfg, b, t);
        run_forward(&cfg, &store.layout, &params_minus, &tokens, Some(&targets), b, t, &mut act_minus, &health);
        let loss_minus = mean_loss(&act_minus.probs[..bt * v], &targets);

        let numeric = (loss_plus - loss_minus) / (2.0 * eps);
        let analytic = grad[probe_idx];

        approx::assert_abs_diff_eq!(numeric, analytic, epsilon = 5e-2);
    }

    #[test]
    fn zero_layers_routes_embedding_gradient_directly() {
        let cfg = ModelConfig {
            vocab_size: 10,
            embedding_dim: 4,
            num_layers: 0,
            num_heads: 1,
            ff_dim: 4,
            context_len: 4,
        };
        let store = ParamStore::new_unchecked(cfg.clone(), 3);
        let tokens = [0u32, 1, 2, 3];
        let targets = [1u32, 2, 3, 4];
        let health = NumericalHealth::default();
        let mut act = Activations::new(&cfg, 1, 4);
        run_forward(&cfg, &store.layout, &store.params, &tokens, Some(&targets), 1, 4, &mut act, &health);

        let mut scratch = BackwardScratch::new(&cfg, 1, 4);
        let mut grad = vec![0.0f32; store.layout.padded_len];
        backward(&cfg, &store.layout, &store.params, &mut grad, &tokens, &targets, &act, &mut scratch, 1, 4);

        assert!(grad[store.layout.wte_offset..store.layout.wte_offset + store.layout.wte_len]
            .iter()
            .any(|&g| g != 0.0));
    }
}
