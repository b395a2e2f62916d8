//! Forward (C5) and backward (C6) kernels, plus the activation/gradient
//! scratch shapes they share. Each worker owns exactly one `Activations`
//! and one `BackwardScratch`, preallocated once at pool startup and
//! reused across every step it is assigned (`spec.md` §3, §8).
//!
//! Unlike the teacher kernel (`examples/GuillaumeGomez-llm.rs`), which
//! data-parallelizes a single forward/backward call across `B` and `T`
//! with `rayon` + `AtomicPtr`, each worker here processes its assigned
//! batch sequentially in its own pinned thread -- the twelve-way
//! hierarchy (C10) is the parallelism, not intra-kernel fan-out. The
//! loop nests, flat-buffer layout, and step-by-step commentary are kept;
//! only the fan-out mechanism changed.

pub mod backward;
pub mod forward;

use crate::config::ModelConfig;

/// Per-layer forward activations, flat-buffer `[B][T][...]` layout
/// exactly like the teacher's encoder/layernorm/attention buffers.
#[derive(Debug, Clone)]
pub struct LayerActivations {
    pub ln1_out: Vec<f32>,
    pub mean1: Vec<f32>,
    pub rstd1: Vec<f32>,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    /// Softmax-normalized attention weights `A[H][T][T]`. Mandatory:
    /// the backward pass is incorrect without it (`spec.md` §3, §4.6).
    pub attn_weights: Vec<f32>,
    pub attn_out: Vec<f32>,
    /// `h` after the attention residual add; also the pre-FFN-LN input.
    pub resid1: Vec<f32>,
    pub ln2_out: Vec<f32>,
    pub mean2: Vec<f32>,
    pub rstd2: Vec<f32>,
    /// FFN pre-activation (`W1*h' + b1`, before ReLU) -- kept for the
    /// backward ReLU mask.
    pub ffn_pre: Vec<f32>,
    pub ffn_hidden: Vec<f32>,
    /// `h` after the FFN residual add; this layer's output / next
    /// layer's input.
    pub resid2: Vec<f32>,
}

impl LayerActivations {
    fn new(max_b: usize, max_t: usize, d: usize, h: usize, f: usize) -> Self {
        let bt = max_b * max_t;
        let btd = bt * d;
        let btf = bt * f;
        let bhtt = max_b * h * max_t * max_t;
        LayerActivations {
            ln1_out: vec![0.0; btd],
            mean1: vec![0.0; bt],
            rstd1: vec![0.0; bt],
            q: vec![0.0; btd],
            k: vec![0.0; btd],
            v: vec![0.0; btd],
            attn_weights: vec![0.0; bhtt],
            attn_out: vec![0.0; btd],
            resid1: vec![0.0; btd],
            ln2_out: vec![0.0; btd],
            mean2: vec![0.0; bt],
            rstd2: vec![0.0; bt],
            ffn_pre: vec![0.0; btf],
            ffn_hidden: vec![0.0; btf],
            resid2: vec![0.0; btd],
        }
    }
}

/// Every forward activation a worker needs for one step, sized for the
/// maximum batch/sequence length declared at pool startup and reused
/// across every subsequent step (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Activations {
    pub max_b: usize,
    pub max_t: usize,
    pub h0: Vec<f32>,
    pub layers: Vec<LayerActivations>,
    pub logits: Vec<f32>,
    pub probs: Vec<f32>,
    pub losses: Vec<f32>,
}

impl Activations {
    pub fn new(cfg: &ModelConfig, max_b: usize, max_t: usize) -> Self {
        let d = cfg.embedding_dim;
        let v = cfg.vocab_size;
        let bt = max_b * max_t;
        let layers = (0..cfg.num_layers)
            .map(|_| LayerActivations::new(max_b, max_t, d, cfg.num_heads, cfg.ff_dim))
            .collect();
        Activations {
            max_b,
            max_t,
            h0: vec![0.0; bt * d],
            layers,
            logits: vec![0.0; bt * v],
            probs: vec![0.0; bt * v],
            losses: vec![0.0; bt],
        }
    }
}

/// Gradient-of-activation scratch, mirroring `Activations` shape,
/// used only between a worker's forward and its own backward -- never
/// shared, never written by the root. `d_attn_weights`/softmax-Jacobian
/// intermediates are small (`<= T` wide) and allocated inline inside
/// `kernel::backward::attention_backward` rather than preallocated here,
/// since they are already bounded by the causal prefix, not `T^2`.
#[derive(Debug, Clone)]
pub struct LayerGradScratch {
    pub d_ln1_out: Vec<f32>,
    pub d_q: Vec<f32>,
    pub d_k: Vec<f32>,
    pub d_v: Vec<f32>,
    pub d_attn_out: Vec<f32>,
    pub d_resid1: Vec<f32>,
    pub d_ln2_out: Vec<f32>,
    pub d_ffn_hidden: Vec<f32>,
}

impl LayerGradScratch {
    fn new(max_b: usize, max_t: usize, d: usize, f: usize) -> Self {
        let bt = max_b * max_t;
        let btd = bt * d;
        let btf = bt * f;
        LayerGradScratch {
            d_ln1_out: vec![0.0; btd],
            d_q: vec![0.0; btd],
            d_k: vec![0.0; btd],
            d_v: vec![0.0; btd],
            d_attn_out: vec![0.0; btd],
            d_resid1: vec![0.0; btd],
            d_ln2_out: vec![0.0; btd],
            d_ffn_hidden: vec![0.0; btf],
        }
    }

    fn clear(&mut self) {
        for v in [
            &mut self.d_ln1_out,
            &mut self.d_q,
            &mut self.d_k,
            &mut self.d_v,
            &mut self.d_attn_out,
            &mut self.d_resid1,
            &mut self.d_ln2_out,
        ] {
            v.iter_mut().for_each(|x| *x = 0.0);
        }
        self.d_ffn_hidden.iter_mut().for_each(|x| *x = 0.0);
    }
}

#[derive(Debug, Clone)]
pub struct BackwardScratch {
    pub d_logits: Vec<f32>,
    pub d_h_final: Vec<f32>,
    pub layers: Vec<LayerGradScratch>,
}

impl BackwardScratch {
    pub fn new(cfg: &ModelConfig, max_b: usize, max_t: usize) -> Self {
        let d = cfg.embedding_dim;
        let v = cfg.vocab_size;
        let bt = max_b * max_t;
        let layers = (0..cfg.num_layers)
            .map(|_| LayerGradScratch::new(max_b, max_t, d, cfg.ff_dim))
            .collect();
        BackwardScratch {
            d_logits: vec![0.0; bt * v],
            d_h_final: vec![0.0; bt * d],
            layers,
        }
    }

    pub fn clear(&mut self) {
        self.d_logits.iter_mut().for_each(|x| *x = 0.0);
        self.d_h_final.iter_mut().for_each(|x| *x = 0.0);
        for l in &mut self.layers {
            l.clear();
        }
    }
}
