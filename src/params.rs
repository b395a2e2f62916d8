//! Parameter store (C4): a single contiguous parameter arena and a
//! parallel, identically-shaped gradient arena, laid out by a
//! `ParamLayout` so that callers (the forward/backward kernels, the
//! optimizer, and the twelve-way gradient segmentation in `worker`) can
//! all agree on offsets without threading a dozen separate slices
//! through every call.

use crate::config::ModelConfig;
use crate::error::Result;
use crate::rng::Lcg;

/// Cache line size in f32 elements, used to pad each worker's gradient
/// segment so segments never share a cache line (`spec.md` §5).
pub const CACHE_LINE_FLOATS: usize = 16; // 64 bytes / 4

/// Per-layer tensor offsets (in f32 elements) into the shared arena.
#[derive(Debug, Clone, Copy)]
pub struct LayerOffsets {
    pub ln1_gamma: usize,
    pub ln1_beta: usize,
    pub wq: usize,
    pub wk: usize,
    pub wv: usize,
    pub ln2_gamma: usize,
    pub ln2_beta: usize,
    pub w1: usize,
    pub b1: usize,
    pub w2: usize,
    pub b2: usize,
}

/// Computes and owns every tensor's offset/length within the flat
/// parameter/gradient arenas, and the arena's total (padded) length.
#[derive(Debug, Clone)]
pub struct ParamLayout {
    pub cfg: ModelConfig,
    pub wte_offset: usize,
    pub wte_len: usize,
    pub layers: Vec<LayerOffsets>,
    /// Raw (unpadded) element count spanning every tensor.
    pub raw_len: usize,
    /// `raw_len` rounded up so it is evenly divisible into
    /// `SYMMETRY_ORDER` cache-line-aligned segments.
    pub padded_len: usize,
}

impl ParamLayout {
    pub fn new(cfg: ModelConfig) -> Self {
        let d = cfg.embedding_dim;
        let f = cfg.ff_dim;
        let v = cfg.vocab_size;

        let mut offset = 0usize;
        let wte_offset = offset;
        let wte_len = v * d;
        offset += wte_len;

        let mut layers = Vec::with_capacity(cfg.num_layers);
        for _ in 0..cfg.num_layers {
            let ln1_gamma = offset;
            offset += d;
            let ln1_beta = offset;
            offset += d;
            let wq = offset;
            offset += d * d;
            let wk = offset;
            offset += d * d;
            let wv = offset;
            offset += d * d;
            let ln2_gamma = offset;
            offset += d;
            let ln2_beta = offset;
            offset += d;
            let w1 = offset;
            offset += f * d;
            let b1 = offset;
            offset += f;
            let w2 = offset;
            offset += d * f;
            let b2 = offset;
            offset += d;
            layers.push(LayerOffsets {
                ln1_gamma,
                ln1_beta,
                wq,
                wk,
                wv,
                ln2_gamma,
                ln2_beta,
                w1,
                b1,
                w2,
                b2,
            });
        }

        let raw_len = offset;
        let symmetry_order = crate::config::SYMMETRY_ORDER;
        let unit = symmetry_order * CACHE_LINE_FLOATS;
        let padded_len = ((raw_len + unit - 1) / unit) * unit;

        ParamLayout {
            cfg,
            wte_offset,
            wte_len,
            layers,
            raw_len,
            padded_len,
        }
    }

    /// Size in f32 elements of each of the twelve disjoint, cache-line
    /// padded gradient segments (`spec.md` §3, §5).
    pub fn segment_len(&self) -> usize {
        self.padded_len / crate::config::SYMMETRY_ORDER
    }
}

/// Owns the parameter arena, the gradient arena, and the embedding-only
/// Adam moment buffers. Frozen (read-only) between Point A and Point B;
/// mutated only by the root during the optimizer step.
pub struct ParamStore {
    pub layout: ParamLayout,
    pub params: Vec<f32>,
    pub grads: Vec<f32>,
    pub adam_m: Vec<f32>,
    pub adam_v: Vec<f32>,
    pub adam_step: u64,
    #[cfg(debug_assertions)]
    frozen: std::sync::atomic::AtomicBool,
}

impl ParamStore {
    /// Builds a fresh store, initializing every weight matrix from
    /// `N(0, 2/fan_in)` via the crate's own LCG+Box-Muller RNG
    /// (`spec.md` §4.4). Biases are zero, LayerNorm gamma is one and
    /// beta is zero.
    pub fn new(cfg: ModelConfig, seed: u64) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::build(cfg, seed))
    }

    /// Builds a store without running `ModelConfig::validate`, for tests
    /// that need to exercise a shape `new` would otherwise reject (e.g.
    /// `num_layers == 0`, to check the embedding-only gradient path).
    #[cfg(test)]
    pub(crate) fn new_unchecked(cfg: ModelConfig, seed: u64) -> Self {
        Self::build(cfg, seed)
    }

    fn build(cfg: ModelConfig, seed: u64) -> Self {
        let layout = ParamLayout::new(cfg.clone());
        let mut params = vec![0.0f32; layout.padded_len];
        let mut rng = Lcg::new(seed);

        init_matrix(
            &mut params,
            layout.wte_offset,
            layout.wte_len,
            cfg.embedding_dim,
            &mut rng,
        );

        for l in &layout.layers {
            fill(&mut params, l.ln1_gamma, cfg.embedding_dim, 1.0);
            fill(&mut params, l.ln1_beta, cfg.embedding_dim, 0.0);
            init_matrix(&mut params, l.wq, cfg.embedding_dim * cfg.embedding_dim, cfg.embedding_dim, &mut rng);
            init_matrix(&mut params, l.wk, cfg.embedding_dim * cfg.embedding_dim, cfg.embedding_dim, &mut rng);
            init_matrix(&mut params, l.wv, cfg.embedding_dim * cfg.embedding_dim, cfg.embedding_dim, &mut rng);
            fill(&mut params, l.ln2_gamma, cfg.embedding_dim, 1.0);
            fill(&mut params, l.ln2_beta, cfg.embedding_dim, 0.0);
            init_matrix(&mut params, l.w1, cfg.ff_dim * cfg.embedding_dim, cfg.embedding_dim, &mut rng);
            fill(&mut params, l.b1, cfg.ff_dim, 0.0);
            init_matrix(&mut params, l.w2, cfg.embedding_dim * cfg.ff_dim, cfg.ff_dim, &mut rng);
            fill(&mut params, l.b2, cfg.embedding_dim, 0.0);
        }

        let grads = vec![0.0f32; layout.padded_len];
        let adam_m = vec![0.0f32; layout.wte_len];
        let adam_v = vec![0.0f32; layout.wte_len];

        ParamStore {
            layout,
            params,
            grads,
            adam_m,
            adam_v,
            adam_step: 0,
            #[cfg(debug_assertions)]
            frozen: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Rebuilds a store from parts read off a checkpoint stream
    /// (`checkpoint::read_checkpoint`), bypassing the random
    /// initialization `new` performs.
    pub fn from_parts(
        layout: ParamLayout,
        params: Vec<f32>,
        grads: Vec<f32>,
        adam_m: Vec<f32>,
        adam_v: Vec<f32>,
        adam_step: u64,
    ) -> Self {
        ParamStore {
            layout,
            params,
            grads,
            adam_m,
            adam_v,
            adam_step,
            #[cfg(debug_assertions)]
            frozen: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Zeros the gradient arena. Called at the start of every optimizer
    /// step (`spec.md` §3).
    pub fn zero_grad(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Marks the store read-only for the A-to-B window. Debug builds
    /// assert this in `assert_not_frozen`; release builds are a no-op
    /// (the barrier protocol itself is the real guarantee).
    #[cfg(debug_assertions)]
    pub fn freeze(&self) {
        self.frozen.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(debug_assertions)]
    pub fn unfreeze(&self) {
        self.frozen
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(debug_assertions)]
    pub fn assert_not_frozen(&self) {
        assert!(
            !self.frozen.load(std::sync::atomic::Ordering::SeqCst),
            "parameter store mutated while frozen between Point A and Point B"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub fn assert_not_frozen(&self) {}
}

fn fill(buf: &mut [f32], offset: usize, len: usize, value: f32) {
    buf[offset..offset + len].iter_mut().for_each(|x| *x = value);
}

fn init_matrix(buf: &mut [f32], offset: usize, len: usize, fan_in: usize, rng: &mut Lcg) {
    let variance = 2.0 / fan_in.max(1) as f32;
    for i in 0..len {
        buf[offset + i] = rng.next_normal(variance);
    }
}

impl std::fmt::Debug for ParamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamStore")
            .field("num_params", &self.layout.raw_len)
            .field("padded_len", &self.layout.padded_len)
            .field("adam_step", &self.adam_step)
            .finish()
    }
}
