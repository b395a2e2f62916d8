//! Barrier runtime (C9): two POSIX-style barriers of width N+1 framing
//! every batch, plus the shared cancellation flag. No condition
//! variables and no per-worker mutex sit in the hot path between A and
//! B (`spec.md` §4.9, §5) -- the barriers themselves are the only
//! synchronization primitive a worker touches while computing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;

use crate::config::SYMMETRY_ORDER;

/// Mirrors the root's side of the per-step state machine (`spec.md`
/// §4.9). Tracked for introspection/testing; the root here runs on the
/// calling (driver) thread rather than a thirteenth spawned thread, so
/// this is bookkeeping rather than a concurrently-observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
    Init,
    Reducing,
    Optimizing,
    WaitingA,
}

/// Point A (start) and Point B (end) barriers, plus the shared `stop`
/// flag checked before every Point A (`spec.md` §4.9, §5). Width is
/// always `SYMMETRY_ORDER + 1`: twelve workers and the root/driver
/// thread that calls `run_batch`.
pub struct StepBarriers {
    pub point_a: Barrier,
    pub point_b: Barrier,
    stop: AtomicBool,
}

impl StepBarriers {
    pub fn new() -> Self {
        let width = SYMMETRY_ORDER + 1;
        StepBarriers {
            point_a: Barrier::new(width),
            point_b: Barrier::new(width),
            stop: AtomicBool::new(false),
        }
    }

    /// Requests cancellation. The driver checks this before pulling the
    /// next batch and stops calling `run_batch`; workers then drain via
    /// the explicit terminate marker `HierarchyController::shutdown`
    /// broadcasts through one final A/B cycle (`spec.md` §5,
    /// "Cancellation").
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl Default for StepBarriers {
    fn default() -> Self {
        Self::new()
    }
}
