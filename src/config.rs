//! Configuration parsing and validation.

use std::path::Path;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::dynamics::{MotionModel, ObservationModel};
use crate::error::{PissmError, Result};
use crate::model::CellType;

/// Main configuration for a simulate/train/test run.
///
/// # Example
///
/// ```rust
/// use pissm_rs::PissmConfig;
///
/// # fn main() -> pissm_rs::Result<()> {
/// let config = PissmConfig::from_preset("nclt-odometry")?;
/// config.validate()?;
/// assert_eq!(config.system.state_dim, 4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PissmConfig {
    /// Simulated system (motion/observation models and noise).
    pub system: SystemConfig,

    /// Dataset sizes and masking.
    #[serde(default)]
    pub data: DataConfig,

    /// Encoder / transition cell / decoder settings.
    pub model: ModelConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// State-space system used to generate training trajectories.
///
/// # Example
///
/// ```rust
/// use pissm_rs::config::SystemConfig;
/// use pissm_rs::dynamics::{MotionModel, ObservationModel};
///
/// let system = SystemConfig {
///     motion: MotionModel::Identity,
///     observation: ObservationModel::Projection { indices: vec![0] },
///     state_dim: 2,
///     obs_dim: 1,
///     ..Default::default()
/// };
/// assert!(system.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Transition function f.
    #[serde(default)]
    pub motion: MotionModel,

    /// Emission function h.
    #[serde(default)]
    pub observation: ObservationModel,

    /// State dimension m.
    pub state_dim: usize,

    /// Observation dimension n.
    pub obs_dim: usize,

    /// Process noise standard deviation q.
    #[serde(default)]
    pub process_noise: f32,

    /// Observation noise standard deviation r.
    #[serde(default)]
    pub observation_noise: f32,

    /// Sequence length T.
    #[serde(default = "default_horizon")]
    pub horizon: usize,

    /// Initial state mean m1x_0 (zeros when empty).
    #[serde(default)]
    pub initial_mean: Vec<f32>,

    /// Initial state covariance m2x_0, row-major `m * m` (identity when empty).
    #[serde(default)]
    pub initial_covariance: Vec<f32>,

    /// Scale of the uniform randomized initial state.
    #[serde(default = "default_init_variance")]
    pub init_variance: f32,

    /// Randomize the initial state of every trajectory.
    #[serde(default = "default_true")]
    pub random_init: bool,
}

fn default_horizon() -> usize {
    50
}
fn default_init_variance() -> f32 {
    100.0
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            motion: MotionModel::default(),
            observation: ObservationModel::default(),
            state_dim: 2,
            obs_dim: 2,
            process_noise: 0.0,
            observation_noise: 0.0,
            horizon: default_horizon(),
            initial_mean: Vec::new(),
            initial_covariance: Vec::new(),
            init_variance: default_init_variance(),
            random_init: true,
        }
    }
}

impl SystemConfig {
    /// Initial mean, filling in zeros when unset.
    pub fn m1x_0(&self) -> Vec<f32> {
        if self.initial_mean.is_empty() {
            vec![0.0; self.state_dim]
        } else {
            self.initial_mean.clone()
        }
    }

    /// Initial covariance, filling in the identity when unset.
    pub fn m2x_0(&self) -> Vec<f32> {
        if self.initial_covariance.is_empty() {
            let m = self.state_dim;
            (0..m * m)
                .map(|i| if i / m == i % m { 1.0 } else { 0.0 })
                .collect()
        } else {
            self.initial_covariance.clone()
        }
    }

    /// Validate dimensions, noise scales and models.
    pub fn validate(&self) -> Result<()> {
        if self.state_dim == 0 || self.obs_dim == 0 {
            return Err(PissmError::Config(
                "system.state_dim and system.obs_dim must be > 0".into(),
            ));
        }
        if self.horizon == 0 {
            return Err(PissmError::Config("system.horizon must be > 0".into()));
        }
        if self.process_noise < 0.0 || self.observation_noise < 0.0 {
            return Err(PissmError::Config("noise scales must be >= 0".into()));
        }
        if !self.initial_mean.is_empty() && self.initial_mean.len() != self.state_dim {
            return Err(PissmError::shape_mismatch(
                format!("initial_mean of length {}", self.state_dim),
                self.initial_mean.len().to_string(),
            ));
        }
        let m2 = self.state_dim * self.state_dim;
        if !self.initial_covariance.is_empty() && self.initial_covariance.len() != m2 {
            return Err(PissmError::shape_mismatch(
                format!("initial_covariance of length {m2}"),
                self.initial_covariance.len().to_string(),
            ));
        }
        self.motion.validate(self.state_dim)?;
        self.observation.validate(self.state_dim, self.obs_dim)
    }
}

/// Dataset sizes and observation masking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Number of training trajectories.
    #[serde(default = "default_train_size")]
    pub train_size: usize,

    /// Number of validation trajectories.
    #[serde(default = "default_valid_size")]
    pub valid_size: usize,

    /// Number of test trajectories.
    #[serde(default = "default_test_size")]
    pub test_size: usize,

    /// Probability that an observation is marked invalid.
    #[serde(default)]
    pub missing_probability: f32,
}

fn default_train_size() -> usize {
    1000
}
fn default_valid_size() -> usize {
    100
}
fn default_test_size() -> usize {
    100
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_size: default_train_size(),
            valid_size: default_valid_size(),
            test_size: default_test_size(),
            missing_probability: 0.0,
        }
    }
}

/// How the transition cell picks a basis matrix at each step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSelection {
    /// Sample from the predicted categorical distribution.
    #[default]
    Sample,
    /// Take the most likely basis matrix.
    Greedy,
}

/// Decoder output space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputSpec {
    /// Gaussian mean/variance over a flat vector.
    Vector {
        /// Output dimensionality.
        dim: usize,
    },
    /// Bernoulli pixel probabilities, channels last.
    Image {
        /// Image height.
        height: usize,
        /// Image width.
        width: usize,
        /// Number of channels.
        channels: usize,
        /// Targets are integers in [0, 255].
        #[serde(default = "default_true")]
        uint8_targets: bool,
    },
}

impl OutputSpec {
    /// Number of scalars per time step.
    pub fn flat_dim(&self) -> usize {
        match self {
            Self::Vector { dim } => *dim,
            Self::Image {
                height,
                width,
                channels,
                ..
            } => height * width * channels,
        }
    }
}

/// Encoder / transition cell / decoder configuration.
///
/// # Example
///
/// ```rust
/// use pissm_rs::config::{ModelConfig, OutputSpec};
///
/// let model = ModelConfig {
///     observation_shape: vec![1],
///     output: OutputSpec::Vector { dim: 2 },
///     num_basis: 4,
///     ..Default::default()
/// };
/// assert!(model.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Shape of one observation (trailing dims are flattened by the encoder).
    pub observation_shape: Vec<usize>,

    /// Latent observation dimension (the latent state has the same size).
    #[serde(default = "default_lod")]
    pub latent_obs_dim: usize,

    /// Decoder output.
    pub output: OutputSpec,

    /// Number of candidate transition matrices.
    #[serde(default = "default_num_basis")]
    pub num_basis: usize,

    /// Hidden units of the coefficient network.
    #[serde(default = "default_trans_net_hidden")]
    pub trans_net_hidden_units: Vec<usize>,

    /// Hidden units of the encoder.
    #[serde(default = "default_hidden")]
    pub encoder_hidden_units: Vec<usize>,

    /// Hidden units of the mean decoder.
    #[serde(default = "default_hidden")]
    pub decoder_hidden_units: Vec<usize>,

    /// Hidden units of the variance decoder.
    #[serde(default = "default_hidden")]
    pub var_decoder_hidden_units: Vec<usize>,

    /// Transition cell: "pissm" (alias "gin"), "lstm" or "gru".
    #[serde(default = "default_cell_type")]
    pub cell_type: String,

    /// Observations are known to always be valid; no mask is needed.
    #[serde(default)]
    pub never_invalid: bool,

    /// Diagonal of the initial latent covariance.
    #[serde(default = "default_initial_covar")]
    pub initial_covar: f32,

    /// Std of the random perturbation around identity for basis matrices.
    #[serde(default = "default_basis_init_noise")]
    pub basis_init_noise: f32,

    /// Basis selection rule.
    #[serde(default)]
    pub transition_selection: TransitionSelection,
}

fn default_lod() -> usize {
    8
}
fn default_num_basis() -> usize {
    8
}
fn default_trans_net_hidden() -> Vec<usize> {
    vec![32]
}
fn default_hidden() -> Vec<usize> {
    vec![64]
}
fn default_cell_type() -> String {
    "pissm".into()
}
fn default_initial_covar() -> f32 {
    1.0
}
fn default_basis_init_noise() -> f32 {
    0.1
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            observation_shape: vec![2],
            latent_obs_dim: default_lod(),
            output: OutputSpec::Vector { dim: 2 },
            num_basis: default_num_basis(),
            trans_net_hidden_units: default_trans_net_hidden(),
            encoder_hidden_units: default_hidden(),
            decoder_hidden_units: default_hidden(),
            var_decoder_hidden_units: default_hidden(),
            cell_type: default_cell_type(),
            never_invalid: false,
            initial_covar: default_initial_covar(),
            basis_init_noise: default_basis_init_noise(),
            transition_selection: TransitionSelection::Sample,
        }
    }
}

impl ModelConfig {
    /// Flattened observation size.
    pub fn observation_dim(&self) -> usize {
        self.observation_shape.iter().product()
    }

    /// Parsed cell type.
    pub fn cell_type(&self) -> Result<CellType> {
        self.cell_type.parse()
    }

    /// Validate layer sizes and the cell type.
    pub fn validate(&self) -> Result<()> {
        self.cell_type()?;
        if self.observation_shape.is_empty() || self.observation_dim() == 0 {
            return Err(PissmError::Config(
                "model.observation_shape must be non-empty with non-zero dims".into(),
            ));
        }
        if self.latent_obs_dim == 0 {
            return Err(PissmError::Config("model.latent_obs_dim must be > 0".into()));
        }
        if self.num_basis == 0 {
            return Err(PissmError::Config("model.num_basis must be > 0".into()));
        }
        if self.output.flat_dim() == 0 {
            return Err(PissmError::Config("model.output must be non-empty".into()));
        }
        if self.initial_covar <= 0.0 {
            return Err(PissmError::Config("model.initial_covar must be > 0".into()));
        }
        let layers = self
            .trans_net_hidden_units
            .iter()
            .chain(&self.encoder_hidden_units)
            .chain(&self.decoder_hidden_units)
            .chain(&self.var_decoder_hidden_units);
        if layers.into_iter().any(|&units| units == 0) {
            return Err(PissmError::Config("hidden layers must have > 0 units".into()));
        }
        Ok(())
    }
}

/// Training hyperparameters.
///
/// # Example
///
/// ```rust
/// use pissm_rs::TrainingConfig;
///
/// let training = TrainingConfig {
///     epochs: 5,
///     batch_size: 10,
///     ..Default::default()
/// };
/// assert_eq!(training.max_grad_norm, 5.0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Mini-batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Learning rate shared by both optimizers.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Per-tensor gradient norm bound.
    #[serde(default = "default_grad_norm")]
    pub max_grad_norm: f64,

    /// Evaluate on a validation mini-batch every N steps.
    #[serde(default = "default_validation_interval")]
    pub validation_interval: usize,

    /// Log aggregated losses every `log_ratio - 1` steps.
    #[serde(default = "default_log_ratio")]
    pub log_ratio: usize,

    /// Save a checkpoint every N steps (0 disables intermediate checkpoints).
    #[serde(default)]
    pub save_steps: usize,
}

fn default_epochs() -> usize {
    10
}
fn default_batch_size() -> usize {
    50
}
fn default_lr() -> f64 {
    1e-3
}
fn default_grad_norm() -> f64 {
    5.0
}
fn default_validation_interval() -> usize {
    10
}
fn default_log_ratio() -> usize {
    10
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            max_grad_norm: default_grad_norm(),
            validation_interval: default_validation_interval(),
            log_ratio: default_log_ratio(),
            save_steps: 0,
        }
    }
}

impl TrainingConfig {
    /// Validate hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PissmError::Config("training.batch_size must be > 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(PissmError::Config("training.learning_rate must be > 0".into()));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(PissmError::Config("training.max_grad_norm must be > 0".into()));
        }
        if self.validation_interval == 0 {
            return Err(PissmError::Config(
                "training.validation_interval must be > 0".into(),
            ));
        }
        if self.log_ratio < 2 {
            return Err(PissmError::Config("training.log_ratio must be >= 2".into()));
        }
        Ok(())
    }
}

impl PissmConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"nclt-odometry"` - constant-velocity robot observed through wheel velocities
    /// - `"toy-linear"` - 2-D rotation observed through its first coordinate
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "nclt-odometry" => Ok(Self::nclt_odometry_preset()),
            "toy-linear" => Ok(Self::toy_linear_preset()),
            _ => Err(PissmError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Constant-velocity planar motion; only the two velocities are observed.
    #[must_use]
    pub fn nclt_odometry_preset() -> Self {
        Self {
            system: SystemConfig {
                motion: MotionModel::ConstantVelocity { delta_t: 1.0 },
                observation: ObservationModel::Projection {
                    indices: vec![2, 3],
                },
                state_dim: 4,
                obs_dim: 2,
                process_noise: 0.1,
                observation_noise: 0.1,
                horizon: 50,
                ..Default::default()
            },
            data: DataConfig::default(),
            model: ModelConfig {
                observation_shape: vec![2],
                output: OutputSpec::Vector { dim: 4 },
                latent_obs_dim: 8,
                num_basis: 15,
                ..Default::default()
            },
            training: TrainingConfig::default(),
            output_dir: "./outputs/nclt-odometry".into(),
            seed: 42,
        }
    }

    /// Slowly rotating 2-D state observed through its first coordinate.
    #[must_use]
    pub fn toy_linear_preset() -> Self {
        let (s, c) = 0.1f32.sin_cos();
        Self {
            system: SystemConfig {
                motion: MotionModel::Linear {
                    matrix: DMatrix::from_row_slice(2, 2, &[c, -s, s, c]),
                },
                observation: ObservationModel::Projection { indices: vec![0] },
                state_dim: 2,
                obs_dim: 1,
                process_noise: 0.01,
                observation_noise: 0.05,
                horizon: 20,
                initial_mean: vec![1.0, 0.0],
                init_variance: 1.0,
                ..Default::default()
            },
            data: DataConfig {
                train_size: 200,
                valid_size: 20,
                test_size: 20,
                missing_probability: 0.0,
            },
            model: ModelConfig {
                observation_shape: vec![1],
                output: OutputSpec::Vector { dim: 2 },
                latent_obs_dim: 4,
                num_basis: 4,
                trans_net_hidden_units: vec![16],
                encoder_hidden_units: vec![16],
                decoder_hidden_units: vec![16],
                var_decoder_hidden_units: vec![16],
                ..Default::default()
            },
            training: TrainingConfig {
                epochs: 5,
                batch_size: 10,
                ..Default::default()
            },
            output_dir: "./outputs/toy-linear".into(),
            seed: 42,
        }
    }

    /// Validate the configuration.
    ///
    /// Besides the per-section checks, the simulator and the model must agree:
    /// the model reads `obs_dim` observations and, in vector mode, predicts the
    /// `state_dim` targets.
    pub fn validate(&self) -> Result<()> {
        self.system.validate()?;
        self.model.validate()?;
        self.training.validate()?;

        if !(0.0..1.0).contains(&self.data.missing_probability) {
            return Err(PissmError::Config(
                "data.missing_probability must be in [0, 1)".into(),
            ));
        }
        if self.data.missing_probability > 0.0 && self.model.never_invalid {
            return Err(PissmError::Config(
                "model.never_invalid cannot be set when observations are masked".into(),
            ));
        }
        if self.data.train_size < self.training.batch_size {
            return Err(PissmError::Config(format!(
                "data.train_size ({}) must be at least training.batch_size ({})",
                self.data.train_size, self.training.batch_size
            )));
        }
        if self.model.observation_dim() != self.system.obs_dim {
            return Err(PissmError::shape_mismatch(
                format!("model.observation_shape with {} elements", self.system.obs_dim),
                format!("{:?}", self.model.observation_shape),
            ));
        }
        if let OutputSpec::Vector { dim } = self.model.output {
            if dim != self.system.state_dim {
                return Err(PissmError::shape_mismatch(
                    format!("model.output.dim == system.state_dim ({})", self.system.state_dim),
                    dim.to_string(),
                ));
            }
        }
        Ok(())
    }
}
