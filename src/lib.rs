//! A from-scratch transformer training engine built on a self-contained
//! numeric kernel: no external math runtime, no autograd library, no
//! GPU offload. Three layers make up the core:
//!
//! - A numeric kernel with its own prime sieve (`math::sieve`),
//!   transcendental library (`math::transcendental`), and a standalone
//!   prime-lattice coordinate map (`lattice`).
//! - A fixed twelve-way "kissing spheres" concurrent training runtime:
//!   a non-computing root coordinating twelve pinned worker threads
//!   through a pair of barriers (`barrier`, `worker`, `hierarchy`),
//!   with lock-free, disjoint per-worker gradient reduction.
//! - The training loop itself: a tied-embedding transformer forward
//!   and exact backward (`kernel`), an Adam/SGD optimizer with a
//!   warmup-then-cosine schedule (`optim`), and the driver that pulls
//!   batches and emits checkpoints (`driver`, `checkpoint`).

pub mod barrier;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod error;
pub mod hierarchy;
pub mod kernel;
pub mod lattice;
pub mod math;
pub mod optim;
pub mod params;
pub mod rng;
pub mod worker;

pub use error::{EngineError, Result};
