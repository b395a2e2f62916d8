//! Concurrency regression (`spec.md` §8, scenario 4): with every batch
//! routed to the same symmetry group, only that one worker ever
//! computes, and the loss trajectory matches a single-threaded
//! reference run over the identical batches.

use crystalline::config::{ModelConfig, TrainConfig};
use crystalline::hierarchy::HierarchyController;
use crystalline::kernel::backward::backward;
use crystalline::kernel::forward::forward;
use crystalline::kernel::{Activations, BackwardScratch};
use crystalline::optim::optimizer_step;
use crystalline::params::ParamStore;
use crystalline::worker::NumericalHealth;

fn cfg() -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        embedding_dim: 8,
        num_layers: 1,
        num_heads: 2,
        ff_dim: 16,
        context_len: 4,
    }
}

fn train_cfg() -> TrainConfig {
    TrainConfig {
        warmup_steps: 2,
        max_step: 1000,
        base_lr: 1e-2,
        min_lr: 1e-4,
        max_grad_norm: 1.0,
        batch_size: 1,
        seq_len: 4,
        checkpoint_every: 0,
    }
}

#[test]
fn single_worker_batches_match_single_threaded_reference() {
    let cfg = cfg();
    let train = train_cfg();
    let tokens = vec![0u32, 12, 0, 12];
    let targets = vec![12u32, 0, 12, 0];
    let seed = 42;

    let mut reference = ParamStore::new(cfg.clone(), seed).unwrap();
    let health = NumericalHealth::default();
    let mut reference_losses = Vec::new();
    for step in 0..20u64 {
        let mut act = Activations::new(&cfg, 1, 4);
        forward(&cfg, &reference.layout, &reference.params, &tokens, Some(&targets), 1, 4, &mut act, &health);
        reference_losses.push(act.losses.iter().sum::<f32>() / act.losses.len() as f32);

        let mut scratch = BackwardScratch::new(&cfg, 1, 4);
        reference.zero_grad();
        backward(&cfg, &reference.layout, &reference.params, &mut reference.grads, &tokens, &targets, &act, &mut scratch, 1, 4);
        optimizer_step(&mut reference, &train, step);
    }

    let mut store = ParamStore::new(cfg.clone(), seed).unwrap();
    let mut controller = HierarchyController::new(&cfg, &store, 1, 4);
    let mut hierarchy_losses = Vec::new();
    for step in 0..20u64 {
        let report = controller
            .run_batch(&mut store, &train, step, tokens.clone(), targets.clone(), 1, 4)
            .unwrap();
        hierarchy_losses.push(report.mean_loss);
    }

    let counts = controller.batches_processed();
    assert_eq!(counts[0], 20);
    assert!(counts[1..].iter().all(|&c| c == 0));

    for (r, h) in reference_losses.iter().zip(hierarchy_losses.iter()) {
        approx::assert_abs_diff_eq!(r, h, epsilon = 1e-3);
    }

    controller.shutdown();
}
