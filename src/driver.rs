//! Training driver (C11): the external interfaces the core touches
//! (`BatchSource`, `CheckpointSink`, `ProgressSink`), and `fit`, which
//! pulls batches, drives the hierarchy controller, reports progress,
//! and emits checkpoints on cadence (`spec.md` §4.11, §6).
//!
//! The command-line wiring, tokenizer, and any concrete file-backed
//! `BatchSource`/`CheckpointSink` are out of scope here (`spec.md`
//! §1) -- these traits are the seam; callers outside this crate supply
//! the implementations.

use tracing::{debug, error, info, warn};

use crate::checkpoint;
use crate::config::{ModelConfig, TrainConfig};
use crate::error::Result;
use crate::hierarchy::HierarchyController;
use crate::params::ParamStore;

/// One training example: a fixed-length input/target pair
/// (`spec.md` §6).
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub target_ids: Vec<u32>,
}

/// Pull interface the driver consumes once per step. `None` signals
/// end of epoch (`spec.md` §6).
pub trait BatchSource {
    fn next_batch(&mut self) -> Option<Batch>;
}

/// Push interface for checkpoint bytes (`spec.md` §6). A no-op
/// `CheckpointSink` is valid -- the contract only requires `write` not
/// fail silently corrupt data.
pub trait CheckpointSink {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

/// One record per optimizer step, pushed to an observer that may be a
/// no-op (`spec.md` §6).
#[derive(Debug, Clone, Copy)]
pub struct ProgressRecord {
    pub step: u64,
    pub epoch: u64,
    pub mean_loss: f32,
    pub lr: f32,
    pub grad_norm: f32,
}

pub trait ProgressSink {
    fn report(&mut self, record: ProgressRecord);
}

/// A `ProgressSink` that does nothing; the default when the caller
/// supplies none.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&mut self, _record: ProgressRecord) {}
}

/// Holds the mutable step counter, loss accumulator, and checkpoint
/// cadence across one `fit` call (`spec.md` §4.11).
pub struct TrainingDriver {
    model_cfg: ModelConfig,
    train_cfg: TrainConfig,
    controller: HierarchyController,
    step: u64,
    epoch: u64,
}

impl TrainingDriver {
    pub fn new(model_cfg: ModelConfig, train_cfg: TrainConfig, store: &ParamStore) -> Result<Self> {
        model_cfg.validate()?;
        train_cfg.validate()?;
        let controller = HierarchyController::new(&model_cfg, store, train_cfg.batch_size, train_cfg.seq_len);
        Ok(TrainingDriver {
            model_cfg,
            train_cfg,
            controller,
            step: 0,
            epoch: 0,
        })
    }

    pub fn request_stop(&self) {
        self.controller.request_stop();
    }

    /// Packs `batch_size` pulled examples of length `seq_len` into one
    /// `[B, T]` batch and drives it through the hierarchy, up to
    /// `max_steps` optimizer steps or until `batch_source` is
    /// exhausted or cancellation is requested (`spec.md` §4.11, §5).
    pub fn fit<S, C, P>(
        &mut self,
        store: &mut ParamStore,
        batch_source: &mut S,
        checkpoint_sink: &mut C,
        progress_sink: &mut P,
        max_steps: u64,
    ) -> Result<()>
    where
        S: BatchSource,
        C: CheckpointSink,
        P: ProgressSink,
    {
        let b = self.train_cfg.batch_size;
        let t = self.train_cfg.seq_len;

        'epochs: loop {
            self.begin_epoch();

            loop {
                if self.controller.is_stopped() || self.step >= max_steps {
                    break 'epochs;
                }

                let mut tokens = Vec::with_capacity(b * t);
                let mut targets = Vec::with_capacity(b * t);
                let mut pulled = 0;
                while pulled < b {
                    match batch_source.next_batch() {
                        Some(example) => {
                            debug_assert_eq!(example.input_ids.len(), t);
                            debug_assert_eq!(example.target_ids.len(), t);
                            tokens.extend_from_slice(&example.input_ids);
                            targets.extend_from_slice(&example.target_ids);
                            pulled += 1;
                        }
                        None => break,
                    }
                }

                if pulled == 0 {
                    // End of epoch: no examples left this pass.
                    break;
                }
                let b_actual = pulled;

                let report = match self
                    .controller
                    .run_batch(store, &self.train_cfg, self.step, tokens, targets, b_actual, t)
                {
                    Ok(report) => report,
                    Err(e) => {
                        // Worker crash is fatal: attempt one last checkpoint
                        // before propagating, per `spec.md` §7.
                        error!(step = self.step, error = %e, "worker panicked, aborting run");
                        let _ = self.emit_checkpoint(store, checkpoint_sink);
                        return Err(e);
                    }
                };

                if report.exploded {
                    warn!(step = self.step, norm = report.grad_norm, "gradient explosion, batch dropped");
                } else {
                    debug!(step = self.step, loss = report.mean_loss, "batch applied");
                }
                if report.nan_inf_recoveries > 0 {
                    debug!(step = self.step, recoveries = report.nan_inf_recoveries, "numerical recoveries so far");
                }

                progress_sink.report(ProgressRecord {
                    step: self.step,
                    epoch: self.epoch,
                    mean_loss: report.mean_loss,
                    lr: crate::optim::lr_at(self.step, &self.train_cfg),
                    grad_norm: report.grad_norm,
                });

                self.step += 1;

                let checkpoint_due = self.train_cfg.checkpoint_every > 0 && self.step % self.train_cfg.checkpoint_every == 0;
                if checkpoint_due {
                    self.emit_checkpoint(store, checkpoint_sink)?;
                }
            }

            self.end_epoch(store, checkpoint_sink)?;
            self.epoch += 1;
        }

        self.emit_checkpoint(store, checkpoint_sink)?;
        info!(step = self.step, epoch = self.epoch, "training run finished");
        Ok(())
    }

    fn begin_epoch(&mut self) {
        info!(epoch = self.epoch, "beginning epoch");
    }

    fn end_epoch<C: CheckpointSink>(&mut self, store: &ParamStore, checkpoint_sink: &mut C) -> Result<()> {
        self.emit_checkpoint(store, checkpoint_sink)
    }

    fn emit_checkpoint<C: CheckpointSink>(&self, store: &ParamStore, checkpoint_sink: &mut C) -> Result<()> {
        let mut buf = Vec::new();
        checkpoint::write_checkpoint(&mut buf, store)?;
        checkpoint_sink.write(&buf)
    }

    /// Consumes the driver and shuts down the worker pool cleanly.
    pub fn shutdown(self) {
        self.controller.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RepeatingSource {
        sequence: Vec<u32>,
        pos: usize,
        seq_len: usize,
        remaining: usize,
    }

    impl BatchSource for RepeatingSource {
        fn next_batch(&mut self) -> Option<Batch> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            let input_ids: Vec<u32> = (0..self.seq_len)
                .map(|i| self.sequence[(self.pos + i) % self.sequence.len()])
                .collect();
            let target_ids: Vec<u32> = (0..self.seq_len)
                .map(|i| self.sequence[(self.pos + i + 1) % self.sequence.len()])
                .collect();
            self.pos = (self.pos + 1) % self.sequence.len();
            Some(Batch { input_ids, target_ids })
        }
    }

    struct VecSink(Vec<Vec<u8>>);
    impl CheckpointSink for VecSink {
        fn write(&mut self, bytes: &[u8]) -> Result<()> {
            self.0.push(bytes.to_vec());
            Ok(())
        }
    }

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
            .try_init();
    }

    #[test]
    fn fit_runs_to_max_steps_and_checkpoints() {
        init_test_tracing();
        let model_cfg = ModelConfig {
            vocab_size: 8,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        };
        let train_cfg = TrainConfig {
            warmup_steps: 1,
            max_step: 20,
            base_lr: 1e-2,
            min_lr: 1e-4,
            max_grad_norm: 1.0,
            batch_size: 1,
            seq_len: 4,
            checkpoint_every: 2,
        };
        let mut store = ParamStore::new(model_cfg.clone(), 3).unwrap();
        let mut driver = TrainingDriver::new(model_cfg, train_cfg, &store).unwrap();

        let mut source = RepeatingSource {
            sequence: vec![0, 1, 2, 3, 4, 5, 6, 7],
            pos: 0,
            seq_len: 4,
            remaining: 100,
        };
        let mut sink = VecSink(Vec::new());
        let mut progress = NullProgressSink;

        driver.fit(&mut store, &mut source, &mut sink, &mut progress, 5).unwrap();
        assert_eq!(driver.step, 5);
        assert!(!sink.0.is_empty());

        driver.shutdown();
    }

    #[test]
    fn request_stop_ends_fit_within_one_cycle() {
        let model_cfg = ModelConfig {
            vocab_size: 8,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        };
        let train_cfg = TrainConfig {
            warmup_steps: 1,
            max_step: 10_000,
            base_lr: 1e-2,
            min_lr: 1e-4,
            max_grad_norm: 1.0,
            batch_size: 1,
            seq_len: 4,
            checkpoint_every: 0,
        };
        let mut store = ParamStore::new(model_cfg.clone(), 9).unwrap();
        let mut driver = TrainingDriver::new(model_cfg, train_cfg, &store).unwrap();

        let mut source = RepeatingSource {
            sequence: vec![0, 1, 2, 3, 4, 5, 6, 7],
            pos: 0,
            seq_len: 4,
            remaining: 10_000,
        };
        let mut sink = VecSink(Vec::new());
        let mut progress = NullProgressSink;

        driver.request_stop();
        driver.fit(&mut store, &mut source, &mut sink, &mut progress, 10_000).unwrap();
        assert_eq!(driver.step, 0);

        driver.shutdown();
    }
}
