//! Sequence datasets: simulation, batching, masking and persistence.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::PissmConfig;
use crate::error::{PissmError, Result};
use crate::simulator::SystemModel;

/// One mini-batch in model layout.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    /// Observations, `[B, T, ...]`.
    pub observations: Tensor,
    /// Targets, `[B, T, ...]`.
    pub targets: Tensor,
    /// Validity mask, `[B, T, 1]`.
    pub obs_valid: Option<Tensor>,
}

/// A set of equally long sequences in model layout.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use pissm_rs::dataset::SequenceDataset;
///
/// # fn main() -> pissm_rs::Result<()> {
/// // Simulator layout: [N, n, T] and [N, m, T]
/// let input = Tensor::zeros((10, 1, 5), DType::F32, &Device::Cpu)?;
/// let target = Tensor::zeros((10, 2, 5), DType::F32, &Device::Cpu)?;
/// let data = SequenceDataset::from_simulation(&input, &target)?;
///
/// assert_eq!(data.len(), 10);
/// assert_eq!(data.observations().dims(), &[10, 5, 1]);
/// assert_eq!(data.batches(4)?.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SequenceDataset {
    observations: Tensor,
    targets: Tensor,
    obs_valid: Option<Tensor>,
}

impl SequenceDataset {
    /// Wrap tensors already in model layout.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the sequence count or length differ between
    /// tensors, or the mask is not `[N, T, 1]`.
    pub fn new(observations: Tensor, targets: Tensor, obs_valid: Option<Tensor>) -> Result<Self> {
        if observations.rank() < 3 || targets.rank() < 3 {
            return Err(PissmError::shape_mismatch(
                "observations and targets of rank >= 3 ([N, T, ...])",
                format!("{:?} and {:?}", observations.dims(), targets.dims()),
            ));
        }
        let (n, t) = (observations.dim(0)?, observations.dim(1)?);
        if targets.dim(0)? != n || targets.dim(1)? != t {
            return Err(PissmError::shape_mismatch(
                format!("targets starting with [{n}, {t}]"),
                format!("{:?}", targets.dims()),
            ));
        }
        if let Some(valid) = &obs_valid {
            if valid.dims() != [n, t, 1].as_slice() {
                return Err(PissmError::shape_mismatch(
                    format!("obs_valid of shape [{n}, {t}, 1]"),
                    format!("{:?}", valid.dims()),
                ));
            }
        }
        Ok(Self {
            observations,
            targets,
            obs_valid,
        })
    }

    /// Convert simulator output `(input [N, n, T], target [N, m, T])`.
    pub fn from_simulation(input: &Tensor, target: &Tensor) -> Result<Self> {
        Self::new(
            input.transpose(1, 2)?.contiguous()?,
            target.transpose(1, 2)?.contiguous()?,
            None,
        )
    }

    /// Simulate `size` trajectories of the system's horizon.
    pub fn simulate(system: &mut SystemModel, size: usize, random_init: bool) -> Result<Self> {
        let (input, target) = system.generate_batch(size, system.horizon(), random_init)?;
        Self::from_simulation(&input, &target)
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.observations.dims()[0]
    }

    /// Whether the dataset holds no sequences.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence length.
    pub fn horizon(&self) -> usize {
        self.observations.dims()[1]
    }

    /// Observations, `[N, T, ...]`.
    pub fn observations(&self) -> &Tensor {
        &self.observations
    }

    /// Targets, `[N, T, ...]`.
    pub fn targets(&self) -> &Tensor {
        &self.targets
    }

    /// Validity mask, `[N, T, 1]`, if any.
    pub fn obs_valid(&self) -> Option<&Tensor> {
        self.obs_valid.as_ref()
    }

    /// Consecutive sequences `start..start + size`.
    pub fn batch(&self, start: usize, size: usize) -> Result<SequenceBatch> {
        if start + size > self.len() {
            return Err(PissmError::Dataset(format!(
                "batch {}..{} out of range for {} sequences",
                start,
                start + size,
                self.len()
            )));
        }
        Ok(SequenceBatch {
            observations: self.observations.narrow(0, start, size)?,
            targets: self.targets.narrow(0, start, size)?,
            obs_valid: self
                .obs_valid
                .as_ref()
                .map(|v| v.narrow(0, start, size))
                .transpose()?,
        })
    }

    /// All full mini-batches in order. A trailing partial batch is dropped.
    pub fn batches(&self, batch_size: usize) -> Result<Vec<SequenceBatch>> {
        if batch_size == 0 {
            return Err(PissmError::Dataset("batch size must be > 0".into()));
        }
        (0..self.len() / batch_size)
            .map(|i| self.batch(i * batch_size, batch_size))
            .collect()
    }

    /// A mini-batch of sequences drawn uniformly with replacement.
    pub fn random_batch(&self, batch_size: usize, rng: &mut ChaCha8Rng) -> Result<SequenceBatch> {
        if self.is_empty() {
            return Err(PissmError::Dataset("cannot sample from an empty dataset".into()));
        }
        let indices: Vec<u32> = (0..batch_size)
            .map(|_| rng.random_range(0..self.len() as u32))
            .collect();
        let indices = Tensor::from_vec(indices, batch_size, self.observations.device())?;
        Ok(SequenceBatch {
            observations: self.observations.index_select(&indices, 0)?,
            targets: self.targets.index_select(&indices, 0)?,
            obs_valid: self
                .obs_valid
                .as_ref()
                .map(|v| v.index_select(&indices, 0))
                .transpose()?,
        })
    }

    /// Split into `(first, rest)` after `n` sequences.
    pub fn split_at(&self, n: usize) -> Result<(Self, Self)> {
        if n > self.len() {
            return Err(PissmError::Dataset(format!(
                "cannot split {} sequences at {}",
                self.len(),
                n
            )));
        }
        let rest = self.len() - n;
        let first = self.batch(0, n)?;
        let second = self.batch(n, rest)?;
        Ok((
            Self::new(first.observations, first.targets, first.obs_valid)?,
            Self::new(second.observations, second.targets, second.obs_valid)?,
        ))
    }

    /// Mark each step invalid with probability `prob`.
    ///
    /// Invalid observations are zeroed. Any existing mask is replaced.
    pub fn mask_observations(&mut self, prob: f32, rng: &mut ChaCha8Rng) -> Result<()> {
        if !(0.0..1.0).contains(&prob) {
            return Err(PissmError::Dataset(format!(
                "missing probability must be in [0, 1), got {prob}"
            )));
        }
        let (n, t) = (self.len(), self.horizon());
        let mask: Vec<f32> = (0..n * t)
            .map(|_| if rng.random::<f32>() < prob { 0.0 } else { 1.0 })
            .collect();
        let device = self.observations.device().clone();
        let valid = Tensor::from_vec(mask, (n, t, 1), &device)?;

        let obs_shape = self.observations.dims().to_vec();
        let flat = self.observations.flatten_from(2)?;
        let zeroed = flat.broadcast_mul(&valid.to_dtype(flat.dtype())?)?;
        self.observations = zeroed.reshape(obs_shape)?;
        self.obs_valid = Some(valid);
        Ok(())
    }

    /// Tensors keyed by name, with `prefix` prepended.
    fn named_tensors(&self, prefix: &str) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::new();
        tensors.insert(format!("{prefix}observations"), self.observations.clone());
        tensors.insert(format!("{prefix}targets"), self.targets.clone());
        if let Some(valid) = &self.obs_valid {
            tensors.insert(format!("{prefix}obs_valid"), valid.clone());
        }
        tensors
    }

    fn from_named(tensors: &mut HashMap<String, Tensor>, prefix: &str) -> Result<Self> {
        let mut take = |name: &str| tensors.remove(&format!("{prefix}{name}"));
        let observations = take("observations")
            .ok_or_else(|| PissmError::Dataset(format!("missing {prefix}observations")))?;
        let targets = take("targets")
            .ok_or_else(|| PissmError::Dataset(format!("missing {prefix}targets")))?;
        let obs_valid = take("obs_valid");
        Self::new(observations, targets, obs_valid)
    }

    /// Save to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        candle_core::safetensors::save(&self.named_tensors(""), path)?;
        Ok(())
    }

    /// Load from a safetensors file written by [`SequenceDataset::save`].
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        Self::from_named(&mut tensors, "")
    }

    /// Move all tensors to `device` as `f32`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let convert = |t: &Tensor| t.to_device(device).and_then(|t| t.to_dtype(DType::F32));
        Self::new(
            convert(&self.observations)?,
            convert(&self.targets)?,
            self.obs_valid.as_ref().map(convert).transpose()?,
        )
    }
}

/// Train, validation and test sets.
#[derive(Debug, Clone)]
pub struct DataSplits {
    /// Training sequences.
    pub train: SequenceDataset,
    /// Validation sequences.
    pub validation: SequenceDataset,
    /// Test sequences.
    pub test: SequenceDataset,
}

impl DataSplits {
    /// Simulate all three splits from a run config.
    ///
    /// When `data.missing_probability > 0` every split gets a random mask.
    pub fn simulate(config: &PissmConfig, rng: &mut ChaCha8Rng) -> Result<Self> {
        let mut system = SystemModel::from_config(&config.system, config.seed)?;
        let random_init = config.system.random_init;
        let data = &config.data;

        let total = data.train_size + data.valid_size + data.test_size;
        tracing::info!(
            "Simulating {} trajectories ({} train / {} valid / {} test), horizon {}",
            total,
            data.train_size,
            data.valid_size,
            data.test_size,
            config.system.horizon
        );
        let all = SequenceDataset::simulate(&mut system, total, random_init)?;
        let (train, rest) = all.split_at(data.train_size)?;
        let (validation, test) = rest.split_at(data.valid_size)?;

        let mut splits = Self {
            train,
            validation,
            test,
        };
        if data.missing_probability > 0.0 {
            for split in [&mut splits.train, &mut splits.validation, &mut splits.test] {
                if !split.is_empty() {
                    split.mask_observations(data.missing_probability, rng)?;
                }
            }
        }
        Ok(splits)
    }

    /// Save all splits into one safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = self.train.named_tensors("train.");
        tensors.extend(self.validation.named_tensors("validation."));
        tensors.extend(self.test.named_tensors("test."));
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Load splits written by [`DataSplits::save`].
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)?;
        Ok(Self {
            train: SequenceDataset::from_named(&mut tensors, "train.")?,
            validation: SequenceDataset::from_named(&mut tensors, "validation.")?,
            test: SequenceDataset::from_named(&mut tensors, "test.")?,
        })
    }
}
