//! Training loop: step-indexed optimization with crash-safe checkpoints.
//!
//! The trainer exclusively owns the model parameters, optimizer state and
//! step counter for the duration of a run; the checkpoint layer only reads
//! them on save and replaces them wholesale on restore. One logical thread
//! drives the loop; the only internal fan-out is the synchronous sharded
//! forward inside the device plan.

use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointId};
use crate::config::TrainConfig;
use crate::data::{VocoderDataset, VocoderLoader};
use crate::device::ForwardPlan;
use crate::error::{TrainError, TrainResult};
use crate::generate::gen_testset;
use crate::logging::{log_checkpoint_save, log_step};
use crate::loss::Objective;
use crate::model::WaveRnn;
use crate::optim::{clip_scale, compute_grad_norm, Adam};
use crate::paths::Paths;

/// Statistics for one completed optimization step.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub loss: f64,
    /// Pre-clip gradient norm; None when clipping is disabled
    pub grad_norm: Option<f64>,
}

/// Main trainer holding model + optimizer + step counter.
pub struct Trainer {
    pub model: WaveRnn,
    pub varmap: VarMap,
    optim: Adam,
    objective: Objective,
    plan: ForwardPlan,
    pub config: TrainConfig,
    pub paths: Paths,
    pub device: Device,
    /// Completed optimization steps; the single source of truth for run
    /// progress, persisted with every checkpoint
    pub global_step: usize,
}

impl Trainer {
    pub fn new(config: TrainConfig, paths: Paths, plan: ForwardPlan) -> TrainResult<Self> {
        let device = plan.primary().clone();
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = WaveRnn::new(&config, vb)?;
        let optim = Adam::new(&varmap, config.lr)?;
        let objective = Objective::for_mode(config.mode, config.bits);

        Ok(Self {
            model,
            varmap,
            optim,
            objective,
            plan,
            config,
            paths,
            device,
            global_step: 0,
        })
    }

    /// Persist the (weights, optimizer state) pair for `id`.
    pub fn save(&self, id: &CheckpointId, silent: bool) -> TrainResult<()> {
        checkpoint::save(
            &self.paths,
            id,
            &self.varmap,
            self.global_step,
            &self.optim,
            silent,
        )
    }

    /// Restore the pair for `id` into the live model and optimizer.
    ///
    /// The model already sits on its device, so the restored optimizer state
    /// lands next to the parameters it tracks.
    pub fn restore(&mut self, id: &CheckpointId, create_if_missing: bool) -> TrainResult<()> {
        self.global_step = checkpoint::restore(
            &self.paths,
            id,
            &self.varmap,
            &mut self.optim,
            create_if_missing,
        )?;
        Ok(())
    }

    /// Execute a single training step: forward, loss, backward, clip, apply.
    pub fn train_step(&mut self, x: &Tensor, y: &Tensor, mels: &Tensor) -> TrainResult<StepStats> {
        let y_hat = self.plan.forward(&self.model, x, mels)?;
        let loss = self.objective.loss(&y_hat, y)?;
        let grads = loss.backward()?;

        let (scale, grad_norm) = match self.config.grad_clip {
            Some(clip) => {
                let norm = compute_grad_norm(&grads, &self.varmap)?;
                if norm.is_nan() {
                    // Divergence tolerance: a single bad batch is logged and
                    // the (degenerate) update still applies.
                    warn!(step = self.global_step, "gradient norm was NaN");
                }
                (clip_scale(norm, clip), Some(norm))
            }
            None => (1.0, None),
        };

        self.optim.step(&grads, scale)?;
        self.global_step += 1;

        Ok(StepStats {
            loss: loss.to_scalar::<f32>()? as f64,
            grad_norm,
        })
    }

    /// Run training until the step counter reaches `total_steps`.
    ///
    /// Every `checkpoint_every` steps: generate from the held-out set, then
    /// save `latest` plus a named step snapshot. The latest pair is also
    /// saved at every epoch boundary so an ordinary stop never replays
    /// completed steps on resume.
    pub fn train_loop(
        &mut self,
        train_set: &dyn VocoderDataset,
        test_set: &dyn VocoderDataset,
        total_steps: usize,
    ) -> TrainResult<()> {
        self.optim.set_lr(self.config.lr);

        let iters = train_set.len() / self.config.batch_size;
        if iters == 0 {
            return Err(TrainError::Config(format!(
                "training set of {} items is smaller than one batch of {}",
                train_set.len(),
                self.config.batch_size
            )));
        }
        if self.global_step >= total_steps {
            info!(
                step = self.global_step,
                total_steps, "target step count already reached"
            );
            return Ok(());
        }

        let epochs = (total_steps - self.global_step).div_ceil(iters);

        for e in 1..=epochs {
            let epoch_start = Instant::now();
            let mut running_loss = 0.0;
            let mut msg = String::new();

            let seed = e as u64 * 1000 + self.global_step as u64;
            let loader = VocoderLoader::new(train_set, &self.config, true, seed, &self.device);
            let batches = loader.n_batches();

            for (i, batch) in loader.enumerate() {
                let i = i + 1;
                let (x, y, mels) = batch?;
                let stats = self.train_step(&x, &y, &mels)?;

                running_loss += stats.loss;
                let avg_loss = running_loss / i as f64;
                let speed = i as f64 / epoch_start.elapsed().as_secs_f64();
                let step = self.global_step;

                if step.is_multiple_of(self.config.checkpoint_every) {
                    gen_testset(&self.model, test_set, &self.config, &self.paths, step)?;
                    self.save(&CheckpointId::Latest, true)?;
                    let name = format!("wave_step{}K", step / 1000);
                    self.save(&CheckpointId::Named(name.clone()), true)?;
                    log_checkpoint_save(step, &name);
                }

                msg = format!(
                    "Epoch {e}/{epochs} ({i}/{batches}) | loss {avg_loss:.4} | {speed:.1} steps/s | step {}k",
                    step / 1000
                );
                if self.config.log_interval > 0
                    && step.is_multiple_of(self.config.log_interval)
                {
                    log_step(step, total_steps, e, epochs, i, batches, avg_loss, speed);
                }

                if self.global_step >= total_steps {
                    break;
                }
            }

            // The latest optimizer state must land with the weights, or
            // resuming produces artifacts.
            self.save(&CheckpointId::Latest, true)?;
            self.paths.append_log(&msg)?;

            if self.global_step >= total_steps {
                break;
            }
        }

        info!(step = self.global_step, "training loop finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticVocoderDataset;
    use candle_core::Device;

    fn tiny_trainer(dir: &std::path::Path) -> Trainer {
        let config = TrainConfig::test();
        let paths = Paths::new(dir.join("run"));
        let plan = ForwardPlan::new(Device::Cpu, 1, config.batch_size).unwrap();
        Trainer::new(config, paths, plan).unwrap()
    }

    fn tiny_sets(config: &TrainConfig, n: usize) -> SyntheticVocoderDataset {
        SyntheticVocoderDataset::new(
            n,
            config.num_mels,
            config.mel_window() + 2,
            config.hop_length,
            42,
        )
    }

    #[test]
    fn test_train_step_advances_counter() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path());
        let ds = tiny_sets(&trainer.config, 4);

        let mut loader =
            VocoderLoader::new(&ds, &trainer.config, false, 1, &Device::Cpu);
        let (x, y, mels) = loader.next().unwrap()?;

        assert_eq!(trainer.global_step, 0);
        let stats = trainer.train_step(&x, &y, &mels)?;
        assert_eq!(trainer.global_step, 1);
        assert!(stats.loss.is_finite());
        assert!(stats.grad_norm.unwrap().is_finite());
        Ok(())
    }

    #[test]
    fn test_train_loop_writes_checkpoints() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path());
        trainer.config.total_steps = 4;
        trainer.config.checkpoint_every = 2;

        let train_set = tiny_sets(&trainer.config, 4); // 2 batches per epoch
        let test_set = tiny_sets(&trainer.config, 2);

        trainer.train_loop(&train_set, &test_set, 4)?;

        assert_eq!(trainer.global_step, 4);
        assert!(trainer.paths.latest_weights.exists());
        assert!(trainer.paths.latest_optim.exists());
        assert!(trainer.paths.named_weights("wave_step0K").exists());
        assert!(trainer.paths.log_file.exists());
        // Generation ran at the periodic checkpoints.
        assert!(trainer.paths.output.join("0k_steps_0_target.wav").exists());
        Ok(())
    }

    #[test]
    fn test_train_loop_noop_when_target_reached() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path());
        trainer.global_step = 10;

        let train_set = tiny_sets(&trainer.config, 4);
        let test_set = tiny_sets(&trainer.config, 2);

        trainer.train_loop(&train_set, &test_set, 10)?;
        assert_eq!(trainer.global_step, 10);
        assert!(!trainer.paths.latest_weights.exists());
        Ok(())
    }

    #[test]
    fn test_loop_without_clipping() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path());
        trainer.config.grad_clip = None;

        let ds = tiny_sets(&trainer.config, 4);
        let mut loader =
            VocoderLoader::new(&ds, &trainer.config, false, 1, &Device::Cpu);
        let (x, y, mels) = loader.next().unwrap()?;

        let stats = trainer.train_step(&x, &y, &mels)?;
        assert!(stats.grad_norm.is_none());
        Ok(())
    }
}
