use thiserror::Error;

/// Crate-wide result alias; every fallible boundary returns this.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Semantic error kinds for the training engine.
///
/// `Numerical` recoveries (NaN/Inf clamps) are deliberately not a variant
/// here: they are handled locally and surfaced as counters through
/// `ProgressSink`, never as an `Err` (see `worker::NumericalHealth`).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid model/training configuration. Fatal, raised before any
    /// thread is spawned.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Post-clip gradient L2 norm still exceeds 10x the configured
    /// max-norm. The batch is dropped; parameters are left unchanged.
    #[error("gradient explosion: norm {norm} exceeds 10x max-norm {threshold}")]
    GradientExplosion { norm: f32, threshold: f32 },

    /// I/O failure on the checkpoint sink or while decoding a checkpoint.
    #[error("checkpoint I/O error: {0}")]
    CheckpointIo(String),

    /// A worker thread panicked inside a kernel. Fatal: the runtime
    /// aborts every thread and attempts one final checkpoint.
    #[error("worker {sphere_id} panicked")]
    WorkerPanicked { sphere_id: u32 },

    /// Cooperative cancellation was requested; `fit` is unwinding in an
    /// orderly fashion. Not a true error, modeled here so call sites can
    /// use `?` uniformly.
    #[error("training run was cancelled")]
    Cancelled,
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::CheckpointIo(e.to_string())
    }
}
