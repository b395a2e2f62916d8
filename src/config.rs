//! Model/training configuration and the one-shot environment overrides
//! read at driver init (`spec.md` §6).

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Fixed fan-out of the hierarchy controller (C10). Never configurable:
/// `spec.md` §9 fixes this design, no toggle is exposed.
pub const SYMMETRY_ORDER: usize = 12;

/// Shape of the model. Immutable after `ModelConfig::validate` succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embedding_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub ff_dim: usize,
    pub context_len: usize,
}

impl ModelConfig {
    /// Validates shape invariants from `spec.md` §7 ("Configuration"
    /// errors are fatal and reported before any thread is spawned).
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(EngineError::Configuration("vocab_size must be > 0".into()));
        }
        if self.embedding_dim == 0 {
            return Err(EngineError::Configuration(
                "embedding_dim must be > 0".into(),
            ));
        }
        if self.num_heads == 0 || self.embedding_dim % self.num_heads != 0 {
            return Err(EngineError::Configuration(format!(
                "num_heads ({}) must divide embedding_dim ({})",
                self.num_heads, self.embedding_dim
            )));
        }
        if self.num_layers == 0 {
            return Err(EngineError::Configuration("num_layers must be > 0".into()));
        }
        if self.ff_dim == 0 {
            return Err(EngineError::Configuration("ff_dim must be > 0".into()));
        }
        if self.context_len == 0 {
            return Err(EngineError::Configuration(
                "context_len must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Head dimension `d_h = D / H`.
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.num_heads
    }

    /// Parses and validates a `ModelConfig` from a JSON document, the
    /// on-disk format an external CLI driver would hand the engine.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: ModelConfig =
            serde_json::from_str(s).map_err(|e| EngineError::Configuration(format!("invalid model config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Optimizer and LR-schedule configuration (C7), plus batch shape and
/// checkpoint cadence owned by the training driver (C11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub warmup_steps: u64,
    pub max_step: u64,
    pub base_lr: f32,
    pub min_lr: f32,
    /// Global L2 gradient clip threshold (max-norm), applied by the root
    /// at reduction time.
    pub max_grad_norm: f32,
    pub batch_size: usize,
    pub seq_len: usize,
    /// Emit a checkpoint request every N steps; 0 disables periodic
    /// checkpoints (still emitted at epoch end).
    pub checkpoint_every: u64,
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_step <= self.warmup_steps {
            return Err(EngineError::Configuration(
                "max_step must be greater than warmup_steps".into(),
            ));
        }
        if self.base_lr <= 0.0 || self.min_lr < 0.0 || self.min_lr > self.base_lr {
            return Err(EngineError::Configuration(
                "require 0 < min_lr <= base_lr".into(),
            ));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(EngineError::Configuration(
                "max_grad_norm must be > 0".into(),
            ));
        }
        if self.batch_size == 0 || self.seq_len == 0 {
            return Err(EngineError::Configuration(
                "batch_size and seq_len must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a `TrainConfig` from a JSON document.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: TrainConfig =
            serde_json::from_str(s).map_err(|e| EngineError::Configuration(format!("invalid train config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Log verbosity, mapped onto a `tracing` filter directive by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Environment variables read once at driver init (`spec.md` §6). A
/// thread-count override below `SYMMETRY_ORDER` is ignored: the hierarchy
/// is fixed at twelve workers.
#[derive(Debug, Clone)]
pub struct EnvOverrides {
    pub thread_count: usize,
    pub rng_seed: u64,
    pub log_level: LogLevel,
}

impl EnvOverrides {
    pub const THREAD_COUNT_VAR: &'static str = "CRYSTALLINE_THREADS";
    pub const SEED_VAR: &'static str = "CRYSTALLINE_SEED";
    pub const LOG_VAR: &'static str = "CRYSTALLINE_LOG";

    /// Reads the three documented environment variables once. Missing or
    /// unparsable values fall back to defaults rather than failing --
    /// these are conveniences, not configuration contracts.
    pub fn from_env() -> Self {
        let thread_count = std::env::var(Self::THREAD_COUNT_VAR)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n >= SYMMETRY_ORDER)
            .unwrap_or(SYMMETRY_ORDER);
        let rng_seed = std::env::var(Self::SEED_VAR)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0x5EED_1234_ABCD_EF01);
        let log_level = std::env::var(Self::LOG_VAR)
            .ok()
            .map(|v| LogLevel::parse(&v))
            .unwrap_or(LogLevel::Info);
        EnvOverrides {
            thread_count,
            rng_seed,
            log_level,
        }
    }
}
