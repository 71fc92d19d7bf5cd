//! Dual-objective training loop and evaluation.
//!
//! Each mini-batch gets two passes. The first updates only the coefficient
//! network from a REINFORCE estimate; the second runs a fresh forward pass and
//! updates every other parameter from the likelihood.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{OutputSpec, PissmConfig, TrainingConfig};
use crate::dataset::{SequenceBatch, SequenceDataset};
use crate::error::{PissmError, Result};
use crate::losses;
use crate::model::{ModelOutput, PissmModel, Prediction};
use crate::optimizer::{ClippedAdam, OptimizerConfig};

/// Per-step training metrics.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Global step (0-based)
    pub step: usize,
    /// Epoch (0-based)
    pub epoch: usize,
    /// REINFORCE loss of the coefficient pass
    pub reinforce_loss: f64,
    /// Likelihood loss of the base pass
    pub nll_loss: f64,
    /// Coefficient group gradient norm before clipping
    pub coefficient_grad_norm: f64,
    /// Base group gradient norm before clipping
    pub base_grad_norm: f64,
}

/// Serializable trainer state stored next to the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Steps completed
    pub step: usize,
    /// Epoch to resume from; equals `epochs` once a run has finished
    pub epoch: usize,
    /// Learning rate of both optimizers
    pub learning_rate: f64,
}

/// Training orchestrator.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use pissm_rs::dataset::DataSplits;
/// use pissm_rs::{PissmConfig, PissmModel, Trainer};
/// use rand::SeedableRng;
///
/// # fn main() -> pissm_rs::Result<()> {
/// let config = PissmConfig::from_preset("toy-linear")?;
/// let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(config.seed);
/// let splits = DataSplits::simulate(&config, &mut rng)?;
///
/// let mut model = PissmModel::dense(&config.model, &Device::Cpu, config.seed)?;
/// let mut trainer = Trainer::from_config(&config, &model)?;
/// let history = trainer.train(&mut model, &splits.train, Some(&splits.validation))?;
/// let rmse = trainer.test(&mut model, &splits.test)?;
/// # Ok(())
/// # }
/// ```
pub struct Trainer {
    config: TrainingConfig,
    output: OutputSpec,
    run_config: Option<PissmConfig>,
    coefficient_optimizer: ClippedAdam,
    base_optimizer: ClippedAdam,
    step: usize,
    epoch: usize,
    rng: ChaCha8Rng,
    checkpoint_dir: Option<PathBuf>,
    /// Metrics of every completed step
    pub training_metrics: Vec<StepMetrics>,
}

impl Trainer {
    /// Create a trainer with one optimizer per parameter group of `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if the training configuration is invalid.
    pub fn new(model: &PissmModel, config: TrainingConfig, seed: u64) -> Result<Self> {
        config.validate()?;

        let optimizer_config = OptimizerConfig {
            learning_rate: config.learning_rate,
            max_grad_norm: config.max_grad_norm,
            ..OptimizerConfig::default()
        };
        let coefficient_optimizer = optimizer_config.build(model.coefficient_vars())?;
        let base_optimizer = optimizer_config.build(model.base_vars())?;
        tracing::info!(
            "Initialized optimizers with lr={}: {} coefficient / {} base tensors",
            config.learning_rate,
            coefficient_optimizer.num_vars(),
            base_optimizer.num_vars()
        );

        Ok(Self {
            output: model.config().output.clone(),
            config,
            run_config: None,
            coefficient_optimizer,
            base_optimizer,
            step: 0,
            epoch: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            checkpoint_dir: None,
            training_metrics: Vec::new(),
        })
    }

    /// Create a trainer from a full run configuration.
    ///
    /// Checkpoints written by this trainer include `config.yaml`, and
    /// intermediate checkpoints go under `output_dir`.
    pub fn from_config(config: &PissmConfig, model: &PissmModel) -> Result<Self> {
        config.validate()?;
        let mut trainer = Self::new(model, config.training.clone(), config.seed)?;
        trainer.run_config = Some(config.clone());
        trainer.checkpoint_dir = Some(PathBuf::from(&config.output_dir));
        Ok(trainer)
    }

    /// Steps completed so far.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Epoch in progress, or the configured epoch count after a finished run.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Run the training loop and return the per-step loss history.
    ///
    /// Each entry is `(reinforce + nll) / batch_size`. A trailing partial
    /// batch is dropped. A NaN loss stops the current epoch early.
    ///
    /// Training starts at [`Trainer::epoch`], so after
    /// [`Trainer::load_checkpoint`] only the remaining epochs run. An epoch
    /// interrupted by a mid-epoch checkpoint is rerun from its first batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the training set holds fewer sequences than one
    /// batch, or a forward/backward pass fails.
    pub fn train(
        &mut self,
        model: &mut PissmModel,
        train: &SequenceDataset,
        valid: Option<&SequenceDataset>,
    ) -> Result<Vec<f64>> {
        let batch_size = self.config.batch_size;
        let batches = train.batches(batch_size)?;
        if batches.is_empty() {
            return Err(PissmError::Training(format!(
                "training set has {} sequences, fewer than batch size {}",
                train.len(),
                batch_size
            )));
        }
        let valid = valid.filter(|v| !v.is_empty());

        tracing::info!("Starting training");
        tracing::info!("  Cell: {}", model.cell_type());
        tracing::info!("  Parameters: {}", model.num_parameters());
        tracing::info!("  Epochs: {}", self.config.epochs);
        tracing::info!("  Batches per epoch: {}", batches.len());

        let start_epoch = self.epoch.min(self.config.epochs);
        if start_epoch > 0 {
            tracing::info!("  Resuming at epoch {}", start_epoch + 1);
        }
        let total_steps = (self.config.epochs - start_epoch) * batches.len();
        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );

        self.training_metrics.clear();
        let mut history = Vec::with_capacity(total_steps);
        let log_every = self.config.log_ratio - 1;

        for epoch in start_epoch..self.config.epochs {
            self.epoch = epoch;
            tracing::info!("Starting epoch {}/{}", epoch + 1, self.config.epochs);
            let mut running = 0.0;

            for (i, batch) in batches.iter().enumerate() {
                let Some(metrics) = self.training_step(model, batch)? else {
                    tracing::warn!(
                        "NaN loss at step {} (epoch {}), stopping epoch early",
                        self.step,
                        epoch + 1
                    );
                    break;
                };

                let total = (metrics.reinforce_loss + metrics.nll_loss) / batch_size as f64;
                history.push(total);
                running += total;
                self.training_metrics.push(metrics);

                if let Some(valid) = valid {
                    if self.step % self.config.validation_interval == 0 {
                        let (reinforce, nll) = self.validate_batch(model, valid)?;
                        tracing::info!(
                            "Step {}: validation loss {:.4} (reinforce {:.4}, nll {:.4})",
                            self.step,
                            reinforce + nll,
                            reinforce,
                            nll
                        );
                    }
                }

                if i > 0 && i % log_every == 0 {
                    tracing::info!(
                        "Step {}/{}, Epoch {}, Loss: {:.4}",
                        self.step,
                        total_steps,
                        epoch + 1,
                        running
                    );
                    running = 0.0;
                }

                pb.set_message(format!("{:.4}", total));
                pb.inc(1);
                self.step += 1;

                if self.config.save_steps > 0 && self.step % self.config.save_steps == 0 {
                    if let Some(dir) = &self.checkpoint_dir {
                        let dir = dir.join(format!("checkpoint-{}", self.step));
                        self.save_checkpoint(model, &dir)?;
                    }
                }
            }
        }

        self.epoch = self.config.epochs;
        pb.finish_with_message("Training complete");
        Ok(history)
    }

    /// One coefficient pass and one base pass. `None` if a loss was NaN.
    fn training_step(
        &mut self,
        model: &mut PissmModel,
        batch: &SequenceBatch,
    ) -> Result<Option<StepMetrics>> {
        let mask = validity_mask(model, batch)?;

        let out = model.forward(&batch.observations, mask.as_ref())?;
        let reinforce = self.reinforce_objective(&out, &batch.targets)?;
        let reinforce_loss = losses::scalar(&reinforce)?;
        if reinforce_loss.is_nan() {
            return Ok(None);
        }
        let coefficient_grad_norm = self.coefficient_optimizer.backward_step(&reinforce)?;

        let out = model.forward(&batch.observations, mask.as_ref())?;
        let nll = self.likelihood_objective(&out, &batch.targets)?;
        let nll_loss = losses::scalar(&nll)?;
        if nll_loss.is_nan() {
            return Ok(None);
        }
        let base_grad_norm = self.base_optimizer.backward_step(&nll)?;

        tracing::debug!(
            "step {}: reinforce={:.4} nll={:.4} |g_coef|={:.4} |g_base|={:.4}",
            self.step,
            reinforce_loss,
            nll_loss,
            coefficient_grad_norm,
            base_grad_norm
        );

        Ok(Some(StepMetrics {
            step: self.step,
            epoch: self.epoch,
            reinforce_loss,
            nll_loss,
            coefficient_grad_norm,
            base_grad_norm,
        }))
    }

    /// Both losses on a random validation batch, without updates.
    fn validate_batch(
        &mut self,
        model: &mut PissmModel,
        valid: &SequenceDataset,
    ) -> Result<(f64, f64)> {
        let batch = valid.random_batch(self.config.batch_size, &mut self.rng)?;
        let mask = validity_mask(model, &batch)?;
        let out = model.forward(&batch.observations, mask.as_ref())?;
        let reinforce = losses::scalar(&self.reinforce_objective(&out, &batch.targets)?)?;
        let nll = losses::scalar(&self.likelihood_objective(&out, &batch.targets)?)?;
        Ok((reinforce, nll))
    }

    fn reinforce_objective(&self, out: &ModelOutput, targets: &Tensor) -> Result<Tensor> {
        let targets = targets.to_dtype(DType::F32)?;
        match (&out.prediction, &self.output) {
            (Prediction::Gaussian { mean, var }, _) => {
                losses::reinforce_gaussian(&targets, mean, var, &out.logp)
            }
            (Prediction::Bernoulli { probs }, OutputSpec::Image { uint8_targets, .. }) => {
                losses::reinforce_bernoulli(&targets, probs, *uint8_targets, &out.logp)
            }
            (Prediction::Bernoulli { probs }, _) => {
                losses::reinforce_bernoulli(&targets, probs, false, &out.logp)
            }
        }
    }

    fn likelihood_objective(&self, out: &ModelOutput, targets: &Tensor) -> Result<Tensor> {
        let targets = targets.to_dtype(DType::F32)?;
        match (&out.prediction, &self.output) {
            (Prediction::Gaussian { mean, var }, _) => losses::gaussian_nll(&targets, mean, var),
            (Prediction::Bernoulli { probs }, OutputSpec::Image { uint8_targets, .. }) => {
                losses::bernoulli_nll(&targets, probs, *uint8_targets)
            }
            (Prediction::Bernoulli { probs }, _) => losses::bernoulli_nll(&targets, probs, false),
        }
    }

    /// Evaluate RMSE per sequence with batch size 1.
    ///
    /// Every `log_ratio - 1` sequences the running sum is logged and reset;
    /// the mean of the logged sums is reported at the end. A NaN RMSE stops
    /// evaluation early.
    pub fn test(&mut self, model: &mut PissmModel, data: &SequenceDataset) -> Result<Vec<f64>> {
        let log_every = self.config.log_ratio - 1;
        let mut rmses = Vec::with_capacity(data.len());
        let mut running = 0.0;
        let mut logged = Vec::new();

        for (i, batch) in data.batches(1)?.iter().enumerate() {
            let mask = validity_mask(model, batch)?;
            let out = model.forward(&batch.observations, mask.as_ref())?;
            let targets = match &self.output {
                OutputSpec::Image {
                    uint8_targets: true,
                    ..
                } => batch.targets.to_dtype(DType::F32)?.affine(1.0 / 255.0, 0.0)?,
                _ => batch.targets.to_dtype(DType::F32)?,
            };
            let rmse = losses::scalar(&losses::rmse(&targets, out.prediction.point())?)?;
            if rmse.is_nan() {
                tracing::warn!("NaN RMSE at test sequence {}, stopping early", i);
                break;
            }
            rmses.push(rmse);
            running += rmse;

            if i > 0 && i % log_every == 0 {
                tracing::info!("Test sequence {}: RMSE sum {:.4}", i, running);
                logged.push(running);
                running = 0.0;
            }
        }

        if !logged.is_empty() {
            let mean = logged.iter().sum::<f64>() / logged.len() as f64;
            tracing::info!("Mean of logged RMSE sums: {:.4}", mean);
        }
        if !rmses.is_empty() {
            let mean = rmses.iter().sum::<f64>() / rmses.len() as f64;
            tracing::info!("Mean test RMSE over {} sequences: {:.4}", rmses.len(), mean);
        }
        Ok(rmses)
    }

    /// Write weights, trainer state and (if known) the run config to `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, model: &PissmModel, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        model.save_weights(dir)?;

        let state = TrainingState {
            step: self.step,
            epoch: self.epoch,
            learning_rate: self.base_optimizer.learning_rate(),
        };
        let state_json = serde_json::to_string_pretty(&state)?;
        std::fs::write(dir.join("training_state.json"), state_json)?;

        if let Some(config) = &self.run_config {
            config.to_file(dir.join("config.yaml"))?;
        }

        tracing::info!("Saved checkpoint to {}", dir.display());
        Ok(())
    }

    /// Restore weights and trainer state from `dir`.
    ///
    /// Optimizer moment estimates are not stored and restart from zero.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if a file is missing or malformed.
    pub fn load_checkpoint<P: AsRef<Path>>(
        &mut self,
        model: &mut PissmModel,
        dir: P,
    ) -> Result<()> {
        let dir = dir.as_ref();
        let state_path = dir.join("training_state.json");
        let state_json = std::fs::read_to_string(&state_path)
            .map_err(|e| PissmError::Checkpoint(format!("Failed to read state: {}", e)))?;
        let state: TrainingState = serde_json::from_str(&state_json)
            .map_err(|e| PissmError::Checkpoint(format!("Failed to parse state: {}", e)))?;

        model.load_weights(dir)?;
        self.step = state.step;
        self.epoch = state.epoch;
        self.coefficient_optimizer.set_learning_rate(state.learning_rate);
        self.base_optimizer.set_learning_rate(state.learning_rate);

        tracing::info!(
            "Resumed from {} at step {}, epoch {}",
            dir.display(),
            self.step,
            self.epoch
        );
        Ok(())
    }
}

/// The batch mask, or an all-valid mask when the data carries none and the
/// model needs one.
fn validity_mask(model: &PissmModel, batch: &SequenceBatch) -> Result<Option<Tensor>> {
    if let Some(valid) = &batch.obs_valid {
        return Ok(Some(valid.clone()));
    }
    if model.config().never_invalid {
        return Ok(None);
    }
    let dims = batch.observations.dims();
    Ok(Some(Tensor::ones(
        (dims[0], dims[1], 1),
        DType::F32,
        batch.observations.device(),
    )?))
}
