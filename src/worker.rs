//! Worker context (C8): per-worker identity, gradient segment, and
//! preallocated forward/backward scratch. Grounded in the teacher's own
//! pattern of handing raw pointers across thread boundaries
//! (`AtomicPtr::new` + `Ordering::SeqCst` loads in
//! `examples/GuillaumeGomez-llm.rs`'s `matmul_forward`/`attention_forward`)
//! -- here a single `GradSegment` raw pointer is handed to exactly one
//! worker thread for the lifetime of the run, rather than reloaded every
//! rayon closure invocation, because the owning thread itself is
//! pinned and long-lived.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::ModelConfig;
use crate::kernel::{Activations, BackwardScratch};

/// State machine a worker thread walks through every step
/// (`spec.md` §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    WaitingA,
    Working,
    WaitingB,
    Terminating,
    Terminated,
}

/// Counters for locally-recovered numerical issues, surfaced through
/// `ProgressSink` rather than propagated as errors (`spec.md` §7).
#[derive(Debug, Default)]
pub struct NumericalHealth {
    nan_inf_recoveries: AtomicU64,
    gradient_explosions: AtomicU64,
}

impl NumericalHealth {
    pub fn note_recovery(&self) {
        self.nan_inf_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_explosion(&self) {
        self.gradient_explosions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recoveries(&self) -> u64 {
        self.nan_inf_recoveries.load(Ordering::Relaxed)
    }

    pub fn explosions(&self) -> u64 {
        self.gradient_explosions.load(Ordering::Relaxed)
    }
}

/// A raw, disjoint slice of the shared gradient arena. Exactly one
/// worker (or the root, during reduction) touches a given segment's
/// bytes at a time; that discipline is enforced by the barrier
/// protocol in `barrier`, not by the type system, which is why this
/// wrapper is `unsafe`.
pub struct GradSegment {
    ptr: *mut f32,
    len: usize,
}

// Safety: segments are disjoint, non-overlapping slices of one arena,
// and the barrier protocol guarantees at most one thread ever holds the
// corresponding `&mut [f32]` live at a time.
unsafe impl Send for GradSegment {}

impl GradSegment {
    /// # Safety
    /// `ptr` must be valid for `len` contiguous `f32` writes for the
    /// entire lifetime this segment is held, and no other live
    /// reference may alias that range while this segment exists.
    pub unsafe fn new(ptr: *mut f32, len: usize) -> Self {
        GradSegment { ptr, len }
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn as_slice(&self) -> &[f32] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().iter_mut().for_each(|x| *x = 0.0);
    }
}

/// Splits a contiguous gradient arena into `n` equal, disjoint
/// `GradSegment`s. Each segment is a full, parameter-shaped gradient
/// buffer: the arena backing this split is `n * layout.padded_len`
/// elements (one complete copy per worker), so "each worker has
/// `|gradients| / 12` contiguous bytes" (`spec.md` §3) reads as 1/12 of
/// the full *twelve-way replicated* storage, not 1/12 of a single
/// model's gradient shape -- a worker running a real backward pass
/// must be able to write a gradient for every parameter it touched,
/// which a same-size-as-the-model segment allows and a 1/12-sized one
/// would not. `arena.len()` must be evenly divisible by `n`.
pub fn split_segments(arena: &mut [f32], n: usize) -> Vec<GradSegment> {
    assert_eq!(arena.len() % n, 0, "arena must be evenly divisible");
    let seg_len = arena.len() / n;
    let base = arena.as_mut_ptr();
    (0..n)
        .map(|i| unsafe { GradSegment::new(base.add(i * seg_len), seg_len) })
        .collect()
}

/// Everything one worker owns for the lifetime of the run: its
/// identity, its gradient segment, and its preallocated scratch.
pub struct WorkerContext {
    pub sphere_id: u32,
    pub symmetry_group: u32,
    pub segment: GradSegment,
    pub activations: Activations,
    pub backward: BackwardScratch,
    pub health: NumericalHealth,
    pub state: WorkerState,
    pub batches_processed: AtomicU64,
    /// Bit pattern of the mean loss from this worker's most recently
    /// processed batch, so the controller can read it for
    /// `ProgressSink` after Point B without a channel round-trip.
    last_mean_loss: AtomicU32,
    /// Set once, from inside `catch_unwind`, if a kernel call panics.
    /// A worker that crashes still reaches Point B so the root never
    /// deadlocks on the barrier; the root inspects this flag afterward
    /// and reports `EngineError::WorkerPanicked` (`spec.md` §7, "worker
    /// crash").
    crashed: std::sync::atomic::AtomicBool,
}

impl WorkerContext {
    pub fn new(
        sphere_id: u32,
        segment: GradSegment,
        cfg: &ModelConfig,
        max_b: usize,
        max_t: usize,
    ) -> Self {
        WorkerContext {
            sphere_id,
            symmetry_group: sphere_id,
            segment,
            activations: Activations::new(cfg, max_b, max_t),
            backward: BackwardScratch::new(cfg, max_b, max_t),
            health: NumericalHealth::default(),
            state: WorkerState::Init,
            batches_processed: AtomicU64::new(0),
            last_mean_loss: AtomicU32::new(0.0f32.to_bits()),
            crashed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn note_batch_processed(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches_processed(&self) -> u64 {
        self.batches_processed.load(Ordering::Relaxed)
    }

    pub fn set_mean_loss(&self, loss: f32) {
        self.last_mean_loss.store(loss.to_bits(), Ordering::Relaxed);
    }

    pub fn mean_loss(&self) -> f32 {
        f32::from_bits(self.last_mean_loss.load(Ordering::Relaxed))
    }

    pub fn note_crashed(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_are_disjoint_and_cover_the_arena() {
        let mut arena = vec![0.0f32; 24 * 16];
        {
            let mut segs = split_segments(&mut arena, 12);
            for (i, seg) in segs.iter_mut().enumerate() {
                seg.zero();
                seg.as_mut_slice()[0] = i as f32 + 1.0;
            }
        }
        for i in 0..12 {
            assert_eq!(arena[i * (24 * 16 / 12)], i as f32 + 1.0);
        }
    }
}
