//! Hierarchy controller (C10): builds one root (the calling/driver
//! thread) and twelve pinned worker threads keyed by symmetry group,
//! routes each batch to the worker of its dominant residue class, and
//! drives the Point A / Point B protocol (`spec.md` §4.10).
//!
//! The root participates as the thread that calls `run_batch` rather
//! than a thirteenth spawned thread: the only invariant `spec.md` §4.10
//! states is that exactly one root participates per epoch and never
//! runs a kernel, and the driver thread already satisfies that without
//! an extra relay thread or channel.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crate::barrier::StepBarriers;
use crate::config::{ModelConfig, SYMMETRY_ORDER};
use crate::error::{EngineError, Result};
use crate::kernel::backward::backward as kernel_backward;
use crate::kernel::forward::forward as kernel_forward;
use crate::params::{ParamLayout, ParamStore};
use crate::worker::{split_segments, NumericalHealth, WorkerContext};

/// One pulled batch, already packed into `[B, T]` shape and routed to
/// a single worker by dominant symmetry group (`spec.md` §4.10). An
/// empty `tokens` means no real work this round (used to drain the
/// pool cleanly at shutdown).
#[derive(Clone, Default)]
struct BatchSlot {
    tokens: Vec<u32>,
    targets: Vec<u32>,
    b: usize,
    t: usize,
    target_sphere: u32,
    terminate: bool,
}

struct SlotCell(UnsafeCell<BatchSlot>);

// Safety: the driver thread writes this cell strictly before calling
// `point_a.wait()`; worker threads only read it strictly after their
// own `point_a.wait()` returns. The barrier is the happens-before edge
// -- there is never a concurrent read and write.
unsafe impl Sync for SlotCell {}

#[derive(Clone, Copy)]
struct ParamsView {
    ptr: *const f32,
    len: usize,
}

// Safety: the backing arena is owned by `HierarchyController` and
// never reallocated after construction. Workers only read it, and
// only between Point A and Point B, while the root is the only thread
// that ever mutates it (strictly between Point B and the next Point A).
unsafe impl Send for ParamsView {}

impl ParamsView {
    fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

#[derive(Clone, Copy)]
struct WorkerHandle {
    ptr: *const WorkerContext,
}

// Safety: the pointee is a `Box<WorkerContext>` moved into exactly one
// worker thread and kept alive until `HierarchyController::shutdown`
// joins that thread. This handle only ever reads the context's atomic
// fields (`health`, `batches_processed`, `mean_loss`), never the
// activation or gradient scratch the owning thread mutates exclusively.
unsafe impl Send for WorkerHandle {}
unsafe impl Sync for WorkerHandle {}

impl WorkerHandle {
    fn health(&self) -> &NumericalHealth {
        unsafe { &(*self.ptr).health }
    }

    fn batches_processed(&self) -> u64 {
        unsafe { &*self.ptr }.batches_processed()
    }

    fn mean_loss(&self) -> f32 {
        unsafe { &*self.ptr }.mean_loss()
    }

    fn has_crashed(&self) -> bool {
        unsafe { &*self.ptr }.has_crashed()
    }
}

/// Counts `tokens[t] mod 12` and returns the argmax symmetry group,
/// ties broken by the lowest group id (`spec.md` §4.10).
pub fn route_batch(tokens: &[u32]) -> u32 {
    let mut counts = [0u32; SYMMETRY_ORDER];
    for &tok in tokens {
        counts[(tok as usize) % SYMMETRY_ORDER] += 1;
    }
    let mut best_group = 0u32;
    let mut best_count = counts[0];
    for (g, &c) in counts.iter().enumerate().skip(1) {
        if c > best_count {
            best_count = c;
            best_group = g as u32;
        }
    }
    best_group
}

/// What the controller learned from reducing and optimizing after one
/// `run_batch` call, enough to build a `ProgressSink` record
/// (`spec.md` §6).
#[derive(Debug, Clone, Copy)]
pub struct BatchReport {
    pub step: u64,
    pub mean_loss: f32,
    pub grad_norm: f32,
    pub exploded: bool,
    pub nan_inf_recoveries: u64,
}

fn worker_loop(
    sphere_id: u32,
    mut context: Box<WorkerContext>,
    cfg: ModelConfig,
    layout: ParamLayout,
    barriers: Arc<StepBarriers>,
    slot: Arc<SlotCell>,
    params: ParamsView,
) {
    loop {
        barriers.point_a.wait();

        // Safety: see `SlotCell`'s impl comment -- this read happens
        // strictly after the driver's write, which happened strictly
        // before this barrier.
        let batch = unsafe { (*slot.0.get()).clone() };

        if batch.terminate {
            barriers.point_b.wait();
            break;
        }

        // Every worker zeros its own segment every round, target or
        // not, so the root's unconditional twelve-way sum at Point B
        // never double-counts a stale contribution from a round this
        // worker sat out (`spec.md` §3, "each worker has |gradients|/12
        // contiguous bytes it alone writes").
        context.segment.zero();

        if sphere_id == batch.target_sphere && !batch.tokens.is_empty() {
            // A panic inside either kernel call is caught here rather
            // than left to unwind across the barrier: an unwinding
            // worker would never reach `point_b.wait()` below and every
            // other party (including the root) would block forever
            // (`spec.md` §7, "worker crash" is fatal but must still be
            // observable, not a hang).
            let context_ref = &mut *context;
            let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
                kernel_forward(
                    &cfg,
                    &layout,
                    params.as_slice(),
                    &batch.tokens,
                    Some(&batch.targets),
                    batch.b,
                    batch.t,
                    &mut context_ref.activations,
                    &context_ref.health,
                );

                let bt = batch.b * batch.t;
                let mean_loss = context_ref.activations.losses[..bt].iter().sum::<f32>() / bt as f32;
                context_ref.set_mean_loss(mean_loss);

                kernel_backward(
                    &cfg,
                    &layout,
                    params.as_slice(),
                    context_ref.segment.as_mut_slice(),
                    &batch.tokens,
                    &batch.targets,
                    &context_ref.activations,
                    &mut context_ref.backward,
                    batch.b,
                    batch.t,
                );
            }))
            .is_err();

            if crashed {
                context.note_crashed();
            } else {
                context.note_batch_processed();
            }
        }

        barriers.point_b.wait();
    }
}

/// Owns the barrier pair, the batch routing slot, the twelve-worker
/// gradient arena, and the twelve pinned worker threads. The root
/// (whatever thread calls `run_batch`) never runs `kernel::forward` or
/// `kernel::backward` -- it only reduces segments and runs the
/// optimizer (`spec.md` §4.10).
pub struct HierarchyController {
    barriers: Arc<StepBarriers>,
    slot: Arc<SlotCell>,
    handles: Vec<WorkerHandle>,
    join_handles: Vec<thread::JoinHandle<()>>,
    grad_arena: Vec<f32>,
    segment_len: usize,
}

impl HierarchyController {
    pub fn new(cfg: &ModelConfig, store: &ParamStore, max_b: usize, max_t: usize) -> Self {
        let barriers = Arc::new(StepBarriers::new());
        let slot = Arc::new(SlotCell(UnsafeCell::new(BatchSlot::default())));

        let mut grad_arena = vec![0.0f32; store.layout.padded_len * SYMMETRY_ORDER];
        let segment_len = store.layout.padded_len;
        let segments = split_segments(&mut grad_arena, SYMMETRY_ORDER);

        let params_view = ParamsView {
            ptr: store.params.as_ptr(),
            len: store.params.len(),
        };

        let mut handles = Vec::with_capacity(SYMMETRY_ORDER);
        let mut join_handles = Vec::with_capacity(SYMMETRY_ORDER);

        for (sphere_id, segment) in segments.into_iter().enumerate() {
            let cfg_owned = cfg.clone();
            let layout_owned = store.layout.clone();
            let barriers = Arc::clone(&barriers);
            let slot = Arc::clone(&slot);

            let context = Box::new(WorkerContext::new(sphere_id as u32, segment, cfg, max_b, max_t));
            handles.push(WorkerHandle {
                ptr: Box::as_ref(&context) as *const WorkerContext,
            });

            let join = thread::Builder::new()
                .name(format!("crystalline-sphere-{sphere_id}"))
                .spawn(move || worker_loop(sphere_id as u32, context, cfg_owned, layout_owned, barriers, slot, params_view))
                .expect("failed to spawn worker thread");
            join_handles.push(join);
        }

        HierarchyController {
            barriers,
            slot,
            handles,
            join_handles,
            grad_arena,
            segment_len,
        }
    }

    /// `true` once `request_stop` has been called; `fit`'s loop checks
    /// this before pulling the next batch (`spec.md` §5).
    pub fn is_stopped(&self) -> bool {
        self.barriers.is_stopped()
    }

    pub fn request_stop(&self) {
        self.barriers.request_stop();
    }

    /// Routes `tokens`/`targets` (packed `[B, T]`) to the worker of
    /// their dominant symmetry group, drives one A/B cycle, reduces
    /// the twelve segments into `store.grads`, and runs the optimizer
    /// (`spec.md` §4.10, §4.7). Returns `Err(WorkerPanicked)` if any
    /// worker's kernel call panicked this round; the reduction and
    /// optimizer step are skipped in that case (`spec.md` §7).
    pub fn run_batch(
        &mut self,
        store: &mut ParamStore,
        train: &crate::config::TrainConfig,
        step: u64,
        tokens: Vec<u32>,
        targets: Vec<u32>,
        b: usize,
        t: usize,
    ) -> Result<BatchReport> {
        let target_sphere = route_batch(&tokens);

        unsafe {
            *self.slot.0.get() = BatchSlot {
                tokens,
                targets,
                b,
                t,
                target_sphere,
                terminate: false,
            };
        }

        // Parameters are read-only for every worker from here until
        // Point B; `optimizer_step` is the only path allowed to write
        // `store.params`, and only after `unfreeze` below (`spec.md`
        // §3, §4.4).
        #[cfg(debug_assertions)]
        store.freeze();

        self.barriers.point_a.wait();
        self.barriers.point_b.wait();

        #[cfg(debug_assertions)]
        store.unfreeze();

        if let Some(sphere_id) = self.handles.iter().position(|h| h.has_crashed()) {
            return Err(EngineError::WorkerPanicked {
                sphere_id: sphere_id as u32,
            });
        }

        store.grads.iter_mut().for_each(|g| *g = 0.0);
        for seg_idx in 0..SYMMETRY_ORDER {
            let base = seg_idx * self.segment_len;
            let seg = &self.grad_arena[base..base + self.segment_len];
            for i in 0..self.segment_len {
                store.grads[i] += seg[i];
            }
        }

        let outcome = crate::optim::optimizer_step(store, train, step);

        let mean_loss = self.handles[target_sphere as usize].mean_loss();
        let nan_inf_recoveries: u64 = self.handles.iter().map(|h| h.health().recoveries()).sum();

        Ok(match outcome {
            crate::optim::StepOutcome::Applied { grad_norm, .. } => BatchReport {
                step,
                mean_loss,
                grad_norm,
                exploded: false,
                nan_inf_recoveries,
            },
            crate::optim::StepOutcome::Exploded { grad_norm } => BatchReport {
                step,
                mean_loss,
                grad_norm,
                exploded: true,
                nan_inf_recoveries,
            },
        })
    }

    /// Total batches every worker has processed, keyed by sphere id --
    /// used by the "root never computes" regression (`spec.md` §8).
    pub fn batches_processed(&self) -> Vec<u64> {
        self.handles.iter().map(|h| h.batches_processed()).collect()
    }

    /// Drains the pool: broadcasts a terminate marker through one
    /// final A/B cycle, then joins every worker thread (`spec.md`
    /// §4.11, "clean termination").
    pub fn shutdown(mut self) {
        unsafe {
            *self.slot.0.get() = BatchSlot {
                terminate: true,
                ..BatchSlot::default()
            };
        }
        self.barriers.point_a.wait();
        self.barriers.point_b.wait();
        for join in self.join_handles.drain(..) {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_dominant_residue_class() {
        let tokens = [12u32, 24, 36, 1, 2]; // three tokens with residue 0, two others
        assert_eq!(route_batch(&tokens), 0);
    }

    #[test]
    fn ties_break_to_lowest_group() {
        let tokens = [1u32, 2]; // residues 1 and 2, tied at count 1 each
        assert_eq!(route_batch(&tokens), 1);
    }

    #[test]
    fn root_never_computes_and_only_target_worker_advances() {
        let cfg = ModelConfig {
            vocab_size: 16,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        };
        let train = crate::config::TrainConfig {
            warmup_steps: 2,
            max_step: 100,
            base_lr: 1e-2,
            min_lr: 1e-4,
            max_grad_norm: 1.0,
            batch_size: 1,
            seq_len: 4,
            checkpoint_every: 0,
        };
        let mut store = ParamStore::new(cfg.clone(), 11).unwrap();
        let mut controller = HierarchyController::new(&cfg, &store, 1, 4);

        // All tokens are congruent to 0 mod 12 (and within vocab_size),
        // so every batch routes to sphere 0 (`spec.md` §8, scenario 4).
        let tokens = vec![0u32, 12, 0, 12];
        let targets = vec![12u32, 0, 12, 0];

        for step in 0..5u64 {
            controller
                .run_batch(&mut store, &train, step, tokens.clone(), targets.clone(), 1, 4)
                .unwrap();
        }

        let counts = controller.batches_processed();
        assert_eq!(counts[0], 5);
        for &c in &counts[1..] {
            assert_eq!(c, 0);
        }

        controller.shutdown();
    }

    #[test]
    fn panicking_worker_is_reported_instead_of_hanging() {
        let cfg = ModelConfig {
            vocab_size: 16,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        };
        let train = crate::config::TrainConfig {
            warmup_steps: 2,
            max_step: 100,
            base_lr: 1e-2,
            min_lr: 1e-4,
            max_grad_norm: 1.0,
            batch_size: 1,
            seq_len: 4,
            checkpoint_every: 0,
        };
        let mut store = ParamStore::new(cfg.clone(), 5).unwrap();
        let mut controller = HierarchyController::new(&cfg, &store, 1, 4);

        // Token 999 is out of vocab bounds, so the embedding lookup in
        // the target worker's forward pass panics deterministically.
        let tokens = vec![999u32, 12, 0, 12];
        let targets = vec![12u32, 0, 12, 0];

        let result = controller.run_batch(&mut store, &train, 0, tokens, targets, 1, 4);
        assert!(matches!(result, Err(EngineError::WorkerPanicked { sphere_id: 0 })));

        controller.shutdown();
    }
}
