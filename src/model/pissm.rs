//! Encoder, transition cell and decoder assembled into one sequence model.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{ConvTranspose2d, ConvTranspose2dConfig, Linear, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{ModelConfig, OutputSpec};
use crate::error::{PissmError, Result};
use crate::model::cell::{CellType, LatentBeliefs, PissmCell, RecurrentCell, TransitionCell};
use crate::model::layers::{
    elu_plus_one, l2_normalize, linear_with_random_bias, DenseArchitecture, HiddenLayers,
    SequenceArchitecture,
};

/// File name of the coefficient group weights.
pub const COEFFICIENT_WEIGHTS: &str = "coefficient.safetensors";
/// File name of the base group weights.
pub const BASE_WEIGHTS: &str = "base.safetensors";

const ENCODER_BIAS_STD: f64 = 0.05;
const IMAGE_FEATURE_CHANNELS: usize = 8;

/// Latent observations produced by the encoder.
#[derive(Debug, Clone)]
pub struct EncodedObservations {
    /// Unit-norm mean, `[B, T, L]`.
    pub mean: Tensor,
    /// Positive diagonal covariance, `[B, T, L]`.
    pub covar: Tensor,
}

/// Decoder output.
#[derive(Debug, Clone)]
pub enum Prediction {
    /// Gaussian over vector targets, both `[B, T, D]`.
    Gaussian {
        /// Predicted mean.
        mean: Tensor,
        /// Predicted variance (> 0).
        var: Tensor,
    },
    /// Pixel probabilities, `[B, T, H, W, C]`.
    Bernoulli {
        /// Probabilities in (0, 1).
        probs: Tensor,
    },
}

impl Prediction {
    /// Point estimate: the mean or the pixel probabilities.
    pub fn point(&self) -> &Tensor {
        match self {
            Self::Gaussian { mean, .. } => mean,
            Self::Bernoulli { probs } => probs,
        }
    }
}

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Decoder output.
    pub prediction: Prediction,
    /// Per-step transition log-probabilities, `[B, T, 1]`.
    pub logp: Tensor,
    /// Filtered beliefs.
    pub beliefs: LatentBeliefs,
    /// Encoder output.
    pub encoded: EncodedObservations,
}

enum Decoder {
    Gaussian {
        mean_hidden: HiddenLayers,
        mean_out: Linear,
        var_hidden: HiddenLayers,
        var_out: Linear,
    },
    Image {
        hidden: HiddenLayers,
        projection: Linear,
        deconv: ConvTranspose2d,
        height: usize,
        width: usize,
        channels: usize,
    },
}

impl Decoder {
    fn new(
        output: &OutputSpec,
        latent_dim: usize,
        arch: &dyn SequenceArchitecture,
        vb: VarBuilder,
    ) -> Result<Self> {
        match *output {
            OutputSpec::Vector { dim } => {
                let mean_hidden = arch.mean_decoder_hidden(latent_dim, vb.pp("mean_hidden"))?;
                let mean_out = candle_nn::linear(mean_hidden.out_dim, dim, vb.pp("mean_out"))?;
                let var_hidden = arch.var_decoder_hidden(latent_dim, vb.pp("var_hidden"))?;
                let var_out = candle_nn::linear(var_hidden.out_dim, dim, vb.pp("var_out"))?;
                Ok(Self::Gaussian {
                    mean_hidden,
                    mean_out,
                    var_hidden,
                    var_out,
                })
            }
            OutputSpec::Image {
                height,
                width,
                channels,
                ..
            } => {
                let hidden = arch.mean_decoder_hidden(latent_dim, vb.pp("hidden"))?;
                let projection = candle_nn::linear(
                    hidden.out_dim,
                    IMAGE_FEATURE_CHANNELS * height * width,
                    vb.pp("projection"),
                )?;
                let cfg = ConvTranspose2dConfig {
                    padding: 1,
                    ..Default::default()
                };
                let deconv = candle_nn::conv_transpose2d(
                    IMAGE_FEATURE_CHANNELS,
                    channels,
                    3,
                    cfg,
                    vb.pp("deconv"),
                )?;
                Ok(Self::Image {
                    hidden,
                    projection,
                    deconv,
                    height,
                    width,
                    channels,
                })
            }
        }
    }

    fn forward(&self, post_mean: &Tensor, post_covar: &Tensor) -> Result<Prediction> {
        match self {
            Self::Gaussian {
                mean_hidden,
                mean_out,
                var_hidden,
                var_out,
            } => {
                let mean = mean_out.forward(&mean_hidden.forward(post_mean)?)?;
                let var = elu_plus_one(&var_out.forward(&var_hidden.forward(post_covar)?)?)?;
                Ok(Prediction::Gaussian { mean, var })
            }
            Self::Image {
                hidden,
                projection,
                deconv,
                height,
                width,
                channels,
            } => {
                let (b, t, _) = post_mean.dims3()?;
                let features = projection
                    .forward(&hidden.forward(post_mean)?)?
                    .relu()?
                    .reshape((b * t, IMAGE_FEATURE_CHANNELS, *height, *width))?;
                let probs = candle_nn::ops::sigmoid(&deconv.forward(&features)?)?
                    .permute((0, 2, 3, 1))?
                    .contiguous()?
                    .reshape((b, t, *height, *width, *channels))?;
                Ok(Prediction::Bernoulli { probs })
            }
        }
    }
}

/// Encoder / latent filter / decoder sequence model.
///
/// Parameters are split into two disjoint groups: the coefficient network of
/// the basis-mixture cell, and everything else. Each group has its own
/// [`VarMap`] so it can be optimized independently.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use pissm_rs::{PissmConfig, PissmModel};
///
/// # fn main() -> pissm_rs::Result<()> {
/// let config = PissmConfig::toy_linear_preset();
/// let mut model = PissmModel::dense(&config.model, &Device::Cpu, config.seed)?;
///
/// let obs = Tensor::zeros((4, 20, 1), candle_core::DType::F32, &Device::Cpu)?;
/// let valid = Tensor::ones((4, 20, 1), candle_core::DType::F32, &Device::Cpu)?;
/// let out = model.forward(&obs, Some(&valid))?;
/// assert_eq!(out.prediction.point().dims(), &[4, 20, 2]);
/// # Ok(())
/// # }
/// ```
pub struct PissmModel {
    config: ModelConfig,
    cell_type: CellType,
    device: Device,
    coefficient_vars: VarMap,
    base_vars: VarMap,
    encoder_hidden: HiddenLayers,
    encoder_mean: Linear,
    encoder_covar: Linear,
    cell: Box<dyn TransitionCell>,
    decoder: Decoder,
    rng: ChaCha8Rng,
}

impl PissmModel {
    /// Create a model with ReLU dense hidden layers sized from the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn dense(config: &ModelConfig, device: &Device, seed: u64) -> Result<Self> {
        Self::new(config, &DenseArchitecture::from_config(config), device, seed)
    }

    /// Create a model with hidden layers supplied by `arch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a layer cannot be
    /// created.
    pub fn new(
        config: &ModelConfig,
        arch: &dyn SequenceArchitecture,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let cell_type = config.cell_type()?;
        let lod = config.latent_obs_dim;

        let coefficient_vars = VarMap::new();
        let base_vars = VarMap::new();
        let coefficient_vb = VarBuilder::from_varmap(&coefficient_vars, DType::F32, device);
        let base_vb = VarBuilder::from_varmap(&base_vars, DType::F32, device);

        let encoder_hidden =
            arch.encoder_hidden(config.observation_dim(), base_vb.pp("encoder.hidden"))?;
        let encoder_mean = linear_with_random_bias(
            encoder_hidden.out_dim,
            lod,
            ENCODER_BIAS_STD,
            base_vb.pp("encoder.mean"),
        )?;
        let encoder_covar =
            candle_nn::linear(encoder_hidden.out_dim, lod, base_vb.pp("encoder.covar"))?;

        let cell: Box<dyn TransitionCell> = match cell_type {
            CellType::Pissm => Box::new(PissmCell::new(
                config,
                coefficient_vb.pp("coefficient_net"),
                base_vb.pp("cell"),
            )?),
            CellType::Lstm | CellType::Gru => {
                Box::new(RecurrentCell::new(cell_type, lod, base_vb.pp("cell"))?)
            }
        };

        let decoder = Decoder::new(&config.output, lod, arch, base_vb.pp("decoder"))?;

        tracing::debug!(
            "Built {} model: {} coefficient / {} base tensors",
            cell_type,
            coefficient_vars.all_vars().len(),
            base_vars.all_vars().len()
        );

        Ok(Self {
            config: config.clone(),
            cell_type,
            device: device.clone(),
            coefficient_vars,
            base_vars,
            encoder_hidden,
            encoder_mean,
            encoder_covar,
            cell,
            decoder,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Selected transition cell.
    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Coefficient network parameters (REINFORCE group).
    pub fn coefficient_vars(&self) -> &VarMap {
        &self.coefficient_vars
    }

    /// All remaining parameters (likelihood group).
    pub fn base_vars(&self) -> &VarMap {
        &self.base_vars
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.coefficient_vars
            .all_vars()
            .iter()
            .chain(self.base_vars.all_vars().iter())
            .map(|v| v.elem_count())
            .sum()
    }

    /// Encode observations `[B, T, ...]` into latent observations.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the trailing dimensions do not flatten to the
    /// configured observation size.
    pub fn encode(&self, obs: &Tensor) -> Result<EncodedObservations> {
        if obs.rank() < 3 {
            return Err(PissmError::shape_mismatch(
                "observations of rank >= 3 ([B, T, ...])",
                format!("{:?}", obs.dims()),
            ));
        }
        let x = obs
            .to_device(&self.device)?
            .to_dtype(DType::F32)?
            .flatten_from(2)?;
        let dim = x.dim(2)?;
        if dim != self.config.observation_dim() {
            return Err(PissmError::shape_mismatch(
                format!("{} observation features", self.config.observation_dim()),
                dim.to_string(),
            ));
        }
        let h = self.encoder_hidden.forward(&x)?;
        let mean = l2_normalize(&self.encoder_mean.forward(&h)?)?;
        let covar = elu_plus_one(&self.encoder_covar.forward(&h)?)?;
        Ok(EncodedObservations { mean, covar })
    }

    /// Full forward pass.
    ///
    /// `obs_valid` is `[B, T, 1]` with 1.0 for valid steps. It may be omitted
    /// only when the model is configured with `never_invalid`.
    ///
    /// # Errors
    ///
    /// Returns [`PissmError::MissingValidityMask`] when the mask is required
    /// but absent, or a shape error for malformed inputs.
    pub fn forward(&mut self, obs: &Tensor, obs_valid: Option<&Tensor>) -> Result<ModelOutput> {
        if obs_valid.is_none() && !self.config.never_invalid {
            return Err(PissmError::MissingValidityMask);
        }
        let encoded = self.encode(obs)?;
        let (b, t, _) = encoded.mean.dims3()?;

        let valid = match obs_valid {
            Some(v) => {
                if v.dims() != [b, t, 1].as_slice() {
                    return Err(PissmError::shape_mismatch(
                        format!("obs_valid of shape [{b}, {t}, 1]"),
                        format!("{:?}", v.dims()),
                    ));
                }
                Some(v.to_device(&self.device)?.to_dtype(DType::F32)?)
            }
            None => None,
        };

        let beliefs = self
            .cell
            .filter(&encoded.mean, &encoded.covar, valid.as_ref(), &mut self.rng)?;
        let prediction = self.decoder.forward(&beliefs.post_mean, &beliefs.post_covar)?;

        Ok(ModelOutput {
            prediction,
            logp: beliefs.logp.clone(),
            beliefs,
            encoded,
        })
    }

    /// Write both parameter groups to `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save_weights<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.coefficient_vars.save(dir.join(COEFFICIENT_WEIGHTS))?;
        self.base_vars.save(dir.join(BASE_WEIGHTS))?;
        Ok(())
    }

    /// Load both parameter groups from `dir`.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if a file is missing or does not match the
    /// model layout.
    pub fn load_weights<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        for (name, vars) in [
            (COEFFICIENT_WEIGHTS, &mut self.coefficient_vars),
            (BASE_WEIGHTS, &mut self.base_vars),
        ] {
            let path = dir.join(name);
            if !path.exists() {
                return Err(PissmError::Checkpoint(format!(
                    "missing weights file {}",
                    path.display()
                )));
            }
            vars.load(&path)
                .map_err(|e| PissmError::Checkpoint(format!("{}: {}", path.display(), e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn vector_config(cell_type: &str) -> ModelConfig {
        ModelConfig {
            observation_shape: vec![3],
            latent_obs_dim: 4,
            output: OutputSpec::Vector { dim: 2 },
            num_basis: 3,
            trans_net_hidden_units: vec![8],
            encoder_hidden_units: vec![8],
            decoder_hidden_units: vec![8],
            var_decoder_hidden_units: vec![8],
            cell_type: cell_type.into(),
            ..Default::default()
        }
    }

    fn ones(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shapes() {
        let mut model = PissmModel::dense(&vector_config("pissm"), &Device::Cpu, 0).unwrap();
        let obs = Tensor::randn(0f32, 1.0, (2, 6, 3), &Device::Cpu).unwrap();
        let out = model.forward(&obs, Some(&ones(&[2, 6, 1]))).unwrap();

        match &out.prediction {
            Prediction::Gaussian { mean, var } => {
                assert_eq!(mean.dims(), &[2, 6, 2]);
                let var = var.flatten_all().unwrap().to_vec1::<f32>().unwrap();
                assert!(var.iter().all(|&v| v > 0.0));
            }
            Prediction::Bernoulli { .. } => panic!("expected Gaussian prediction"),
        }
        assert_eq!(out.logp.dims(), &[2, 6, 1]);
        assert_eq!(out.beliefs.post_mean.dims(), &[2, 6, 4]);
    }

    #[test]
    fn test_encoder_unit_norm_and_positive_covar() {
        let model = PissmModel::dense(&vector_config("pissm"), &Device::Cpu, 0).unwrap();
        let obs = Tensor::randn(0f32, 3.0, (3, 5, 3), &Device::Cpu).unwrap();
        let encoded = model.encode(&obs).unwrap();

        let norms = encoded
            .mean
            .sqr()
            .and_then(|m| m.sum(2))
            .and_then(|m| m.flatten_all())
            .and_then(|m| m.to_vec1::<f32>())
            .unwrap();
        assert!(norms.iter().all(|n| (n - 1.0).abs() < 1e-4));
        let covar = encoded.covar.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(covar.iter().all(|&c| c > 0.0));
    }

    #[test]
    fn test_missing_mask_requires_never_invalid() {
        let mut model = PissmModel::dense(&vector_config("pissm"), &Device::Cpu, 0).unwrap();
        let obs = ones(&[1, 2, 3]);
        assert!(matches!(
            model.forward(&obs, None),
            Err(PissmError::MissingValidityMask)
        ));

        let config = ModelConfig {
            never_invalid: true,
            ..vector_config("pissm")
        };
        let mut model = PissmModel::dense(&config, &Device::Cpu, 0).unwrap();
        assert!(model.forward(&obs, None).is_ok());
    }

    #[test]
    fn test_wrong_observation_size() {
        let mut model = PissmModel::dense(&vector_config("pissm"), &Device::Cpu, 0).unwrap();
        let obs = ones(&[1, 2, 5]);
        assert!(matches!(
            model.forward(&obs, Some(&ones(&[1, 2, 1]))),
            Err(PissmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_cell_type_fails_fast() {
        let result = PissmModel::dense(&vector_config("transformer"), &Device::Cpu, 0);
        assert!(matches!(result, Err(PissmError::InvalidCellType(_))));
    }

    #[test]
    fn test_parameter_groups_are_disjoint() {
        let model = PissmModel::dense(&vector_config("gin"), &Device::Cpu, 0).unwrap();
        let coefficient: HashSet<_> = model
            .coefficient_vars()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().id())
            .collect();
        let base: HashSet<_> = model
            .base_vars()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().id())
            .collect();
        assert!(!coefficient.is_empty());
        assert!(!base.is_empty());
        assert!(coefficient.is_disjoint(&base));
    }

    #[test]
    fn test_baseline_has_empty_coefficient_group() {
        for cell in ["lstm", "gru"] {
            let mut model = PissmModel::dense(&vector_config(cell), &Device::Cpu, 0).unwrap();
            assert!(model.coefficient_vars().all_vars().is_empty());
            let out = model
                .forward(&ones(&[2, 3, 3]), Some(&ones(&[2, 3, 1])))
                .unwrap();
            assert!(out.beliefs.transition.is_none());
        }
    }

    #[test]
    fn test_image_decoder_channels_last() {
        let config = ModelConfig {
            output: OutputSpec::Image {
                height: 4,
                width: 5,
                channels: 1,
                uint8_targets: true,
            },
            observation_shape: vec![4, 5, 1],
            ..vector_config("pissm")
        };
        let mut model = PissmModel::dense(&config, &Device::Cpu, 0).unwrap();
        let obs = ones(&[2, 3, 4, 5, 1]);
        let out = model.forward(&obs, Some(&ones(&[2, 3, 1]))).unwrap();
        match out.prediction {
            Prediction::Bernoulli { probs } => {
                assert_eq!(probs.dims(), &[2, 3, 4, 5, 1]);
                let p = probs.flatten_all().unwrap().to_vec1::<f32>().unwrap();
                assert!(p.iter().all(|&v| v > 0.0 && v < 1.0));
            }
            Prediction::Gaussian { .. } => panic!("expected Bernoulli prediction"),
        }
    }

    #[test]
    fn test_save_and_load_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = vector_config("pissm");
        let model = PissmModel::dense(&config, &Device::Cpu, 1).unwrap();
        model.save_weights(dir.path()).unwrap();
        assert!(dir.path().join(COEFFICIENT_WEIGHTS).exists());
        assert!(dir.path().join(BASE_WEIGHTS).exists());

        let mut restored = PissmModel::dense(&config, &Device::Cpu, 2).unwrap();
        restored.load_weights(dir.path()).unwrap();

        let obs = ones(&[1, 2, 3]);
        let a = model.encode(&obs).unwrap().mean.flatten_all().unwrap();
        let b = restored.encode(&obs).unwrap().mean.flatten_all().unwrap();
        assert_eq!(a.to_vec1::<f32>().unwrap(), b.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_load_weights_missing_dir() {
        let mut model = PissmModel::dense(&vector_config("pissm"), &Device::Cpu, 0).unwrap();
        assert!(matches!(
            model.load_weights("/nonexistent/checkpoint"),
            Err(PissmError::Checkpoint(_))
        ));
    }
}
