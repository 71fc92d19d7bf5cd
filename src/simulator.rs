//! Stochastic state-space trajectory simulator.
//!
//! Trajectories follow
//!
//! ```text
//! x_t = f(x_{t-1}) + w_t,   w_t ~ N(0, Q)
//! y_t = h(x_t)     + v_t,   v_t ~ N(0, R)
//! ```
//!
//! with `Q = q^2 I_m` and `R = r^2 I_n` unless full matrices are supplied via
//! [`SystemModel::update_covariance_matrix`].

use candle_core::{Device, Tensor};
use nalgebra::{Cholesky, DMatrix, DVector, SymmetricEigen};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::config::SystemConfig;
use crate::dynamics::{MotionModel, StateFunction};
use crate::error::{PissmError, Result};

/// One simulated trajectory.
#[derive(Debug, Clone)]
pub struct Trajectory {
    /// True states, shape `[m, T]`.
    pub states: Tensor,
    /// Noisy observations, shape `[n, T]`.
    pub observations: Tensor,
}

/// Additive Gaussian noise source described by a covariance matrix.
#[derive(Debug, Clone)]
struct GaussianNoise {
    covariance: DMatrix<f32>,
    /// A square root `L` with `L L^T = covariance`; `None` when the
    /// covariance is all zeros.
    factor: Option<DMatrix<f32>>,
}

impl GaussianNoise {
    fn isotropic(dim: usize, std: f32) -> Self {
        Self::from_covariance(DMatrix::from_diagonal_element(dim, dim, std * std))
    }

    fn from_covariance(covariance: DMatrix<f32>) -> Self {
        let factor = if covariance.iter().all(|&c| c == 0.0) {
            None
        } else {
            Some(psd_square_root(&covariance))
        };
        Self { covariance, factor }
    }

    fn perturb(&self, x: &mut [f32], rng: &mut ChaCha8Rng) {
        let Some(factor) = &self.factor else {
            return;
        };
        let z = DVector::<f32>::from_fn(factor.ncols(), |_, _| rng.sample(StandardNormal));
        let w = factor * z;
        for (xi, wi) in x.iter_mut().zip(w.iter()) {
            *xi += wi;
        }
    }
}

/// Lower Cholesky factor, or a symmetric eigen square root when the matrix is
/// only positive semi-definite.
fn psd_square_root(covariance: &DMatrix<f32>) -> DMatrix<f32> {
    Cholesky::new(covariance.clone())
        .map(|chol| chol.l())
        .filter(|l| l.iter().all(|v| v.is_finite()))
        .unwrap_or_else(|| {
            let eigen = SymmetricEigen::new(covariance.clone());
            let sqrt = eigen.eigenvalues.map(|l| l.max(0.0).sqrt());
            &eigen.eigenvectors * DMatrix::from_diagonal(&sqrt)
        })
}

/// Simulator for a nonlinear system with additive Gaussian noise.
///
/// # Example
///
/// ```rust
/// use pissm_rs::dynamics::{MotionModel, ObservationModel};
/// use pissm_rs::SystemModel;
///
/// # fn main() -> pissm_rs::Result<()> {
/// let mut sys = SystemModel::new(
///     MotionModel::Identity,
///     0.0,
///     ObservationModel::Projection { indices: vec![0] },
///     0.0,
///     5,
///     2,
///     1,
/// );
/// sys.init_sequence(vec![1.0, 0.0], vec![1.0, 0.0, 0.0, 1.0])?;
/// let traj = sys.generate_sequence(5)?;
/// assert_eq!(traj.observations.to_vec2::<f32>()?, vec![vec![1.0; 5]]);
/// # Ok(())
/// # }
/// ```
pub struct SystemModel {
    f: Box<dyn StateFunction>,
    h: Box<dyn StateFunction>,
    q: f32,
    r: f32,
    process_noise: GaussianNoise,
    observation_noise: GaussianNoise,
    horizon: usize,
    m: usize,
    n: usize,
    m1x_0: Vec<f32>,
    m2x_0: Vec<f32>,
    variance: f32,
    delta_t: f32,
    rng: ChaCha8Rng,
}

impl std::fmt::Debug for SystemModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemModel")
            .field("q", &self.q)
            .field("r", &self.r)
            .field("horizon", &self.horizon)
            .field("m", &self.m)
            .field("n", &self.n)
            .field("m1x_0", &self.m1x_0)
            .field("variance", &self.variance)
            .field("delta_t", &self.delta_t)
            .finish_non_exhaustive()
    }
}

impl SystemModel {
    /// Create a simulator with zero initial mean and identity initial covariance.
    pub fn new<F, H>(f: F, q: f32, h: H, r: f32, horizon: usize, m: usize, n: usize) -> Self
    where
        F: StateFunction + 'static,
        H: StateFunction + 'static,
    {
        Self {
            f: Box::new(f),
            h: Box::new(h),
            q,
            r,
            process_noise: GaussianNoise::isotropic(m, q),
            observation_noise: GaussianNoise::isotropic(n, r),
            horizon,
            m,
            n,
            m1x_0: vec![0.0; m],
            m2x_0: DMatrix::<f32>::identity(m, m).as_slice().to_vec(),
            variance: 1.0,
            delta_t: 1.0,
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    /// Build a simulator from the `system` section of a run config.
    ///
    /// # Errors
    ///
    /// Returns an error if the system configuration is invalid.
    pub fn from_config(config: &SystemConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let delta_t = match config.motion {
            MotionModel::ConstantVelocity { delta_t } => delta_t,
            _ => 1.0,
        };
        let mut sys = Self::new(
            config.motion.clone(),
            config.process_noise,
            config.observation.clone(),
            config.observation_noise,
            config.horizon,
            config.state_dim,
            config.obs_dim,
        )
        .with_seed(seed)
        .with_variance(config.init_variance)
        .with_delta_t(delta_t);
        sys.init_sequence(config.m1x_0(), config.m2x_0())?;
        Ok(sys)
    }

    /// Reseed the internal RNG.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Scale of randomized initial states.
    #[must_use]
    pub fn with_variance(mut self, variance: f32) -> Self {
        self.variance = variance;
        self
    }

    /// Integration time step of the underlying motion model.
    #[must_use]
    pub fn with_delta_t(mut self, delta_t: f32) -> Self {
        self.delta_t = delta_t;
        self
    }

    /// Replace the initial mean and covariance.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `m1x_0` is not of length `m` or `m2x_0` is
    /// not of length `m * m`.
    pub fn init_sequence(&mut self, m1x_0: Vec<f32>, m2x_0: Vec<f32>) -> Result<()> {
        check_len("m1x_0", &m1x_0, self.m)?;
        check_len("m2x_0", &m2x_0, self.m * self.m)?;
        self.m1x_0 = m1x_0;
        self.m2x_0 = m2x_0;
        Ok(())
    }

    /// Replace the noise scales and rebuild `Q = q^2 I` and `R = r^2 I`.
    pub fn update_covariance_gain(&mut self, q: f32, r: f32) {
        self.q = q;
        self.r = r;
        self.process_noise = GaussianNoise::isotropic(self.m, q);
        self.observation_noise = GaussianNoise::isotropic(self.n, r);
    }

    /// Replace the full noise covariances (row-major `[m, m]` and `[n, n]`).
    ///
    /// # Errors
    ///
    /// Returns a shape error if either matrix has the wrong size.
    pub fn update_covariance_matrix(&mut self, q_mat: Vec<f32>, r_mat: Vec<f32>) -> Result<()> {
        check_len("Q", &q_mat, self.m * self.m)?;
        check_len("R", &r_mat, self.n * self.n)?;
        self.process_noise =
            GaussianNoise::from_covariance(DMatrix::from_row_slice(self.m, self.m, &q_mat));
        self.observation_noise =
            GaussianNoise::from_covariance(DMatrix::from_row_slice(self.n, self.n, &r_mat));
        Ok(())
    }

    /// Process noise covariance `Q`.
    pub fn process_covariance(&self) -> &DMatrix<f32> {
        &self.process_noise.covariance
    }

    /// Observation noise covariance `R`.
    pub fn observation_covariance(&self) -> &DMatrix<f32> {
        &self.observation_noise.covariance
    }

    /// Initial mean.
    pub fn m1x_0(&self) -> &[f32] {
        &self.m1x_0
    }

    /// Initial covariance, row-major.
    pub fn m2x_0(&self) -> &[f32] {
        &self.m2x_0
    }

    /// Configured horizon.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// State dimension `m`.
    pub fn state_dim(&self) -> usize {
        self.m
    }

    /// Observation dimension `n`.
    pub fn obs_dim(&self) -> usize {
        self.n
    }

    /// Integration time step.
    pub fn delta_t(&self) -> f32 {
        self.delta_t
    }

    /// Generate one trajectory of length `t` starting from `m1x_0`.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `f` or `h` return the wrong number of values.
    pub fn generate_sequence(&mut self, t: usize) -> Result<Trajectory> {
        let x0 = self.m1x_0.clone();
        self.generate_from(&x0, t)
    }

    /// Generate `size` trajectories of length `t`.
    ///
    /// Returns `(input [size, n, t], target [size, m, t])`. With `random_init`
    /// every trajectory starts from `uniform[0, 1)^m * variance`, otherwise
    /// all of them start from `m1x_0`.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `f` or `h` return the wrong number of values.
    pub fn generate_batch(
        &mut self,
        size: usize,
        t: usize,
        random_init: bool,
    ) -> Result<(Tensor, Tensor)> {
        if size == 0 {
            return Err(PissmError::Dataset("batch size must be > 0".into()));
        }
        let mut inputs = Vec::with_capacity(size);
        let mut targets = Vec::with_capacity(size);
        for _ in 0..size {
            let x0 = if random_init {
                (0..self.m)
                    .map(|_| self.rng.random::<f32>() * self.variance)
                    .collect()
            } else {
                self.m1x_0.clone()
            };
            let traj = self.generate_from(&x0, t)?;
            inputs.push(traj.observations);
            targets.push(traj.states);
        }
        tracing::debug!("Generated {} trajectories of length {}", size, t);
        Ok((Tensor::stack(&inputs, 0)?, Tensor::stack(&targets, 0)?))
    }

    fn generate_from(&mut self, x0: &[f32], t: usize) -> Result<Trajectory> {
        if t == 0 {
            return Err(PissmError::Config("sequence length must be > 0".into()));
        }
        // Column-major so rows index the state dimension.
        let mut states = vec![0.0f32; self.m * t];
        let mut observations = vec![0.0f32; self.n * t];

        let mut x_prev = x0.to_vec();
        for step in 0..t {
            let mut xt = self.f.apply(&x_prev)?;
            check_len("f(x)", &xt, self.m)?;
            self.process_noise.perturb(&mut xt, &mut self.rng);

            let mut yt = self.h.apply(&xt)?;
            check_len("h(x)", &yt, self.n)?;
            self.observation_noise.perturb(&mut yt, &mut self.rng);

            for (i, v) in xt.iter().enumerate() {
                states[i * t + step] = *v;
            }
            for (i, v) in yt.iter().enumerate() {
                observations[i * t + step] = *v;
            }
            x_prev = xt;
        }

        Ok(Trajectory {
            states: Tensor::from_vec(states, (self.m, t), &Device::Cpu)?,
            observations: Tensor::from_vec(observations, (self.n, t), &Device::Cpu)?,
        })
    }
}

fn check_len(what: &str, values: &[f32], expected: usize) -> Result<()> {
    if values.len() != expected {
        return Err(PissmError::shape_mismatch(
            format!("{what} of length {expected}"),
            values.len().to_string(),
        ));
    }
    Ok(())
}
