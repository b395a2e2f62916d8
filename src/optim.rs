//! Optimizer + LR scheduler (C7): Adam on the embedding table, vanilla
//! SGD on every other parameter, linear warmup into cosine decay. This
//! is the root's exclusive job, invoked exactly once per batch after
//! Point B (`spec.md` §4.7, §5).

use crate::config::TrainConfig;
use crate::math::transcendental as tr;
use crate::params::ParamStore;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

/// A batch is dropped outright (parameters untouched) when its pre-clip
/// gradient norm exceeds this multiple of `max_grad_norm` (`spec.md`
/// §7, "Gradient explosion").
const EXPLOSION_MULTIPLE: f32 = 10.0;

/// `lr(step) = base * step/warmup` during warmup, then cosine decay
/// from `base` down to `min_lr` by `max_step`, holding `min_lr` after
/// (`spec.md` §4.7).
pub fn lr_at(step: u64, train: &TrainConfig) -> f32 {
    if step < train.warmup_steps {
        return train.base_lr * (step as f32 / train.warmup_steps.max(1) as f32);
    }
    if step >= train.max_step {
        return train.min_lr;
    }
    let progress = (step - train.warmup_steps) as f32 / (train.max_step - train.warmup_steps) as f32;
    let cos = tr::cos(tr::PI * progress);
    train.min_lr + 0.5 * (train.base_lr - train.min_lr) * (1.0 + cos)
}

/// L2 norm of a gradient arena.
pub fn grad_global_norm(grads: &[f32]) -> f32 {
    let sum_sq: f32 = grads.iter().map(|&g| g * g).sum();
    tr::sqrt(sum_sq)
}

/// Scales `grads` in place so its L2 norm is at most `max_norm`.
/// Returns the norm actually used to compute the scale (the pre-clip
/// norm). A no-op (scale 1.0) when already within bounds.
pub fn clip_global_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grad_global_norm(grads);
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        for g in grads.iter_mut() {
            *g *= scale;
        }
    }
    norm
}

/// Outcome of one `optimizer_step` call, surfaced to `ProgressSink`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Applied { lr: f32, grad_norm: f32 },
    Exploded { grad_norm: f32 },
}

/// Runs the root's post-reduction optimizer step: checks for gradient
/// explosion on the *pre-clip* norm, otherwise clips to `max_grad_norm`
/// and applies Adam (embeddings) / SGD (everything else) at the
/// schedule's learning rate for `lr_step` (`spec.md` §4.7, §7).
///
/// On `StepOutcome::Exploded`, `store` is left completely untouched --
/// including the Adam step counter, so bias correction only ever
/// advances on steps that actually move the parameters.
pub fn optimizer_step(store: &mut ParamStore, train: &TrainConfig, lr_step: u64) -> StepOutcome {
    let raw_norm = grad_global_norm(&store.grads);
    if raw_norm > EXPLOSION_MULTIPLE * train.max_grad_norm {
        return StepOutcome::Exploded { grad_norm: raw_norm };
    }

    store.assert_not_frozen();
    clip_global_norm(&mut store.grads, train.max_grad_norm);
    let lr = lr_at(lr_step, train);

    let wte_offset = store.layout.wte_offset;
    let wte_len = store.layout.wte_len;
    store.adam_step += 1;
    let t = store.adam_step as i32;
    let bc1 = 1.0 - ADAM_BETA1.powi(t);
    let bc2 = 1.0 - ADAM_BETA2.powi(t);

    for i in 0..wte_len {
        let g = store.grads[wte_offset + i];
        let m = ADAM_BETA1 * store.adam_m[i] + (1.0 - ADAM_BETA1) * g;
        let v = ADAM_BETA2 * store.adam_v[i] + (1.0 - ADAM_BETA2) * g * g;
        store.adam_m[i] = m;
        store.adam_v[i] = v;
        let m_hat = m / bc1;
        let v_hat = v / bc2;
        store.params[wte_offset + i] -= lr * m_hat / (tr::sqrt(v_hat) + ADAM_EPS);
    }

    for idx in 0..store.layout.padded_len {
        if idx >= wte_offset && idx < wte_offset + wte_len {
            continue;
        }
        store.params[idx] -= lr * store.grads[idx];
    }

    StepOutcome::Applied { lr, grad_norm: raw_norm.min(train.max_grad_norm) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;

    fn train_cfg() -> TrainConfig {
        TrainConfig {
            warmup_steps: 10,
            max_step: 110,
            base_lr: 1e-2,
            min_lr: 1e-4,
            max_grad_norm: 1.0,
            batch_size: 2,
            seq_len: 4,
            checkpoint_every: 0,
        }
    }

    #[test]
    fn lr_schedule_properties() {
        let train = train_cfg();
        assert_eq!(lr_at(0, &train), 0.0);
        approx::assert_abs_diff_eq!(lr_at(train.warmup_steps, &train), train.base_lr, epsilon = 1e-6);
        assert_eq!(lr_at(train.max_step, &train), train.min_lr);
        assert_eq!(lr_at(train.max_step + 50, &train), train.min_lr);

        let mut prev = lr_at(train.warmup_steps, &train);
        for step in (train.warmup_steps + 1)..=train.max_step {
            let cur = lr_at(step, &train);
            assert!(cur <= prev + 1e-6, "lr increased at step {step}: {prev} -> {cur}");
            prev = cur;
        }
    }

    #[test]
    fn clip_reduces_norm_to_max() {
        let mut grads = vec![3.0f32, 4.0]; // norm = 5
        let norm = clip_global_norm(&mut grads, 1.0);
        approx::assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-4);
        let new_norm = grad_global_norm(&grads);
        approx::assert_abs_diff_eq!(new_norm, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn explosion_leaves_store_untouched() {
        let cfg = ModelConfig {
            vocab_size: 8,
            embedding_dim: 4,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 8,
            context_len: 4,
        };
        let mut store = ParamStore::new(cfg, 5).unwrap();
        let params_before = store.params.clone();
        store.grads.iter_mut().for_each(|g| *g = 100.0);

        let train = train_cfg();
        let outcome = optimizer_step(&mut store, &train, 0);
        assert!(matches!(outcome, StepOutcome::Exploded { .. }));
        assert_eq!(store.params, params_before);
        assert_eq!(store.adam_step, 0);
    }

    #[test]
    fn applied_step_advances_adam_counter_and_params() {
        let cfg = ModelConfig {
            vocab_size: 8,
            embedding_dim: 4,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 8,
            context_len: 4,
        };
        let mut store = ParamStore::new(cfg, 5).unwrap();
        let params_before = store.params.clone();
        store.grads.iter_mut().for_each(|g| *g = 0.1);

        let train = train_cfg();
        let outcome = optimizer_step(&mut store, &train, 50);
        assert!(matches!(outcome, StepOutcome::Applied { .. }));
        assert_eq!(store.adam_step, 1);
        assert_ne!(store.params, params_before);
    }
}
