//! Latent transition cells.
//!
//! A cell consumes encoded latent observations `[B, T, L]` and produces the
//! filtered belief sequence. The basis-mixture cell is a Kalman filter with
//! identity observation model whose transition matrix is picked per step from
//! a learned set of candidates by a small coefficient network. The LSTM/GRU
//! cells are black-box baselines.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::rnn::{GRUConfig, LSTMConfig, GRU, LSTM, RNN};
use candle_nn::{Init, Linear, VarBuilder};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::{ModelConfig, TransitionSelection};
use crate::error::{PissmError, Result};
use crate::model::layers::{elu_plus_one, Activation, DenseStack};

/// Transition cell implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    /// Probabilistic basis-mixture cell.
    Pissm,
    /// LSTM baseline.
    Lstm,
    /// GRU baseline.
    Gru,
}

impl FromStr for CellType {
    type Err = PissmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pissm" | "gin" => Ok(Self::Pissm),
            "lstm" => Ok(Self::Lstm),
            "gru" => Ok(Self::Gru),
            _ => Err(PissmError::InvalidCellType(s.to_string())),
        }
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pissm => "pissm",
            Self::Lstm => "lstm",
            Self::Gru => "gru",
        };
        f.write_str(name)
    }
}

/// Filtered belief sequence produced by a transition cell.
#[derive(Debug, Clone)]
pub struct LatentBeliefs {
    /// Posterior mean, `[B, T, L]`.
    pub post_mean: Tensor,
    /// Posterior diagonal covariance, `[B, T, L]`.
    pub post_covar: Tensor,
    /// Prior mean, `[B, T, L]`.
    pub prior_mean: Tensor,
    /// Prior diagonal covariance, `[B, T, L]`.
    pub prior_covar: Tensor,
    /// Log-probability of the selected transition, `[B, T, 1]`.
    pub logp: Tensor,
    /// Realized transition matrices, `[B, T, L, L]`; `None` for baselines.
    pub transition: Option<Tensor>,
}

/// A recurrent latent filter.
pub trait TransitionCell {
    /// Run the filter over a full sequence.
    ///
    /// `obs_valid` is `[B, T, 1]` with 1.0 for valid steps.
    fn filter(
        &self,
        obs_mean: &Tensor,
        obs_covar: &Tensor,
        obs_valid: Option<&Tensor>,
        rng: &mut ChaCha8Rng,
    ) -> Result<LatentBeliefs>;
}

/// Kalman filter over a sampled mixture of learned transition matrices.
pub struct PissmCell {
    latent_dim: usize,
    num_basis: usize,
    coefficient_net: DenseStack,
    coefficient_out: Linear,
    /// Offsets from the identity, `[K, L, L]`.
    basis_delta: Tensor,
    /// Pre-activation transition noise, `[L]`.
    raw_transition_noise: Tensor,
    initial_covar: f32,
    selection: TransitionSelection,
    device: Device,
}

impl PissmCell {
    /// Build the cell.
    ///
    /// The coefficient network lives under `coefficient_vb`, the basis and
    /// transition noise under `base_vb`.
    pub fn new(
        config: &ModelConfig,
        coefficient_vb: VarBuilder,
        base_vb: VarBuilder,
    ) -> Result<Self> {
        let l = config.latent_obs_dim;
        let k = config.num_basis;
        let coefficient_net = DenseStack::new(
            2 * l,
            &config.trans_net_hidden_units,
            Activation::Tanh,
            coefficient_vb.pp("hidden"),
        )?;
        let coefficient_out =
            candle_nn::linear(coefficient_net.out_dim(), k, coefficient_vb.pp("logits"))?;
        let basis_delta = base_vb.get_with_hints(
            (k, l, l),
            "basis_delta",
            Init::Randn {
                mean: 0.0,
                stdev: f64::from(config.basis_init_noise),
            },
        )?;
        // elu(-1) + 1 = exp(-1)
        let raw_transition_noise =
            base_vb.get_with_hints(l, "transition_noise", Init::Const(-1.0))?;

        Ok(Self {
            latent_dim: l,
            num_basis: k,
            coefficient_net,
            coefficient_out,
            basis_delta,
            raw_transition_noise,
            initial_covar: config.initial_covar,
            selection: config.transition_selection,
            device: base_vb.device().clone(),
        })
    }

    /// Candidate transition matrices `I + delta`, `[K, L, L]`.
    pub fn basis(&self) -> Result<Tensor> {
        let eye = Tensor::eye(self.latent_dim, DType::F32, &self.device)?;
        Ok(self.basis_delta.broadcast_add(&eye)?)
    }

    /// Diagonal transition noise, `[L]`.
    pub fn transition_noise(&self) -> Result<Tensor> {
        elu_plus_one(&self.raw_transition_noise)
    }

    /// Logits over the basis for each batch row, `[B, K]`.
    fn coefficients(&self, prev_mean: &Tensor, obs_mean: &Tensor) -> Result<Tensor> {
        let input = Tensor::cat(&[prev_mean, obs_mean], D::Minus1)?;
        let hidden = self.coefficient_net.forward(&input)?;
        Ok(self.coefficient_out.forward(&hidden)?)
    }

    fn select(&self, log_probs: &Tensor, rng: &mut ChaCha8Rng) -> Result<Tensor> {
        let probs = log_probs.exp()?.to_vec2::<f32>()?;
        let mut one_hot = vec![0.0f32; probs.len() * self.num_basis];
        for (row, p) in probs.iter().enumerate() {
            let idx = match self.selection {
                TransitionSelection::Greedy => argmax(p),
                TransitionSelection::Sample => sample_categorical(p, rng),
            };
            one_hot[row * self.num_basis + idx] = 1.0;
        }
        Ok(Tensor::from_vec(
            one_hot,
            (probs.len(), self.num_basis),
            &self.device,
        )?)
    }
}

impl TransitionCell for PissmCell {
    fn filter(
        &self,
        obs_mean: &Tensor,
        obs_covar: &Tensor,
        obs_valid: Option<&Tensor>,
        rng: &mut ChaCha8Rng,
    ) -> Result<LatentBeliefs> {
        let (b, t, l) = obs_mean.dims3()?;
        let basis = self.basis()?.reshape((self.num_basis, l * l))?;
        let q_trans = self.transition_noise()?;

        let mut mean = Tensor::zeros((b, l), DType::F32, &self.device)?;
        let mut covar = Tensor::full(self.initial_covar, (b, l), &self.device)?;

        let mut post_means = Vec::with_capacity(t);
        let mut post_covars = Vec::with_capacity(t);
        let mut prior_means = Vec::with_capacity(t);
        let mut prior_covars = Vec::with_capacity(t);
        let mut logps = Vec::with_capacity(t);
        let mut transitions = Vec::with_capacity(t);

        for step in 0..t {
            let y_mean = obs_mean.narrow(1, step, 1)?.squeeze(1)?;
            let y_covar = obs_covar.narrow(1, step, 1)?.squeeze(1)?;

            let logits = self.coefficients(&mean, &y_mean)?;
            let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
            let one_hot = self.select(&log_probs, rng)?;
            let logp = log_probs.mul(&one_hot)?.sum_keepdim(D::Minus1)?;

            // One-hot rows pick a single matrix, so A∘A is the square of the pick.
            let a = one_hot.matmul(&basis)?.reshape((b, l, l))?;
            let prior_mean = a.matmul(&mean.unsqueeze(2)?)?.squeeze(2)?;
            let prior_covar = a
                .sqr()?
                .matmul(&covar.unsqueeze(2)?)?
                .squeeze(2)?
                .broadcast_add(&q_trans)?;

            let gain = prior_covar.div(&prior_covar.add(&y_covar)?)?;
            let mut post_mean = prior_mean.add(&gain.mul(&y_mean.sub(&prior_mean)?)?)?;
            let mut post_covar = gain.affine(-1.0, 1.0)?.mul(&prior_covar)?;

            if let Some(valid) = obs_valid {
                let v = valid.narrow(1, step, 1)?.squeeze(1)?;
                let inv = v.affine(-1.0, 1.0)?;
                post_mean = post_mean
                    .broadcast_mul(&v)?
                    .add(&prior_mean.broadcast_mul(&inv)?)?;
                post_covar = post_covar
                    .broadcast_mul(&v)?
                    .add(&prior_covar.broadcast_mul(&inv)?)?;
            }

            mean = post_mean.clone();
            covar = post_covar.clone();
            post_means.push(post_mean);
            post_covars.push(post_covar);
            prior_means.push(prior_mean);
            prior_covars.push(prior_covar);
            logps.push(logp);
            transitions.push(a);
        }

        Ok(LatentBeliefs {
            post_mean: Tensor::stack(&post_means, 1)?,
            post_covar: Tensor::stack(&post_covars, 1)?,
            prior_mean: Tensor::stack(&prior_means, 1)?,
            prior_covar: Tensor::stack(&prior_covars, 1)?,
            logp: Tensor::stack(&logps, 1)?,
            transition: Some(Tensor::stack(&transitions, 1)?),
        })
    }
}

fn argmax(p: &[f32]) -> usize {
    p.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}

fn sample_categorical(p: &[f32], rng: &mut ChaCha8Rng) -> usize {
    let total: f32 = p.iter().sum();
    let u = rng.random::<f32>() * total;
    let mut acc = 0.0;
    for (i, &pi) in p.iter().enumerate() {
        acc += pi;
        if u < acc {
            return i;
        }
    }
    p.len().saturating_sub(1)
}

enum Recurrent {
    Lstm(LSTM),
    Gru(GRU),
}

/// LSTM/GRU baseline with hidden size `2 L`.
///
/// The hidden state is split into a mean and an `elu + 1` covariance. The
/// prior is the posterior and the transition log-probability is zero.
pub struct RecurrentCell {
    rnn: Recurrent,
    latent_dim: usize,
}

impl RecurrentCell {
    /// Build an LSTM or GRU baseline.
    pub fn new(cell_type: CellType, latent_dim: usize, vb: VarBuilder) -> Result<Self> {
        // Inputs are [obs_mean, obs_covar, valid].
        let in_dim = 2 * latent_dim + 1;
        let hidden = 2 * latent_dim;
        let rnn = match cell_type {
            CellType::Lstm => Recurrent::Lstm(candle_nn::rnn::lstm(
                in_dim,
                hidden,
                LSTMConfig::default(),
                vb,
            )?),
            CellType::Gru => Recurrent::Gru(candle_nn::rnn::gru(
                in_dim,
                hidden,
                GRUConfig::default(),
                vb,
            )?),
            CellType::Pissm => {
                return Err(PissmError::Config(
                    "the pissm cell is not a recurrent baseline".into(),
                ))
            }
        };
        Ok(Self { rnn, latent_dim })
    }
}

impl TransitionCell for RecurrentCell {
    fn filter(
        &self,
        obs_mean: &Tensor,
        obs_covar: &Tensor,
        obs_valid: Option<&Tensor>,
        _rng: &mut ChaCha8Rng,
    ) -> Result<LatentBeliefs> {
        let (b, t, _) = obs_mean.dims3()?;
        let valid = match obs_valid {
            Some(v) => v.to_dtype(obs_mean.dtype())?,
            None => Tensor::ones((b, t, 1), obs_mean.dtype(), obs_mean.device())?,
        };
        let input = Tensor::cat(&[obs_mean, obs_covar, &valid], D::Minus1)?;

        let hidden = match &self.rnn {
            Recurrent::Lstm(rnn) => rnn.states_to_tensor(&rnn.seq(&input)?)?,
            Recurrent::Gru(rnn) => rnn.states_to_tensor(&rnn.seq(&input)?)?,
        };
        let mean = hidden.narrow(D::Minus1, 0, self.latent_dim)?;
        let covar = elu_plus_one(&hidden.narrow(D::Minus1, self.latent_dim, self.latent_dim)?)?;

        Ok(LatentBeliefs {
            prior_mean: mean.clone(),
            prior_covar: covar.clone(),
            post_mean: mean,
            post_covar: covar,
            logp: Tensor::zeros((b, t, 1), obs_mean.dtype(), obs_mean.device())?,
            transition: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn cell_config(l: usize, k: usize) -> ModelConfig {
        ModelConfig {
            latent_obs_dim: l,
            num_basis: k,
            trans_net_hidden_units: vec![8],
            ..Default::default()
        }
    }

    fn build_cell(config: &ModelConfig) -> (PissmCell, VarMap, VarMap) {
        let coefficient = VarMap::new();
        let base = VarMap::new();
        let cell = PissmCell::new(
            config,
            VarBuilder::from_varmap(&coefficient, DType::F32, &Device::Cpu),
            VarBuilder::from_varmap(&base, DType::F32, &Device::Cpu),
        )
        .unwrap();
        (cell, coefficient, base)
    }

    fn observations(b: usize, t: usize, l: usize) -> (Tensor, Tensor) {
        let mean = Tensor::randn(0f32, 1.0, (b, t, l), &Device::Cpu).unwrap();
        let covar = Tensor::full(0.5f32, (b, t, l), &Device::Cpu).unwrap();
        (mean, covar)
    }

    #[test]
    fn test_cell_type_parsing() {
        assert_eq!("pissm".parse::<CellType>().unwrap(), CellType::Pissm);
        assert_eq!("gin".parse::<CellType>().unwrap(), CellType::Pissm);
        assert_eq!("LSTM".parse::<CellType>().unwrap(), CellType::Lstm);
        assert_eq!("gru".parse::<CellType>().unwrap(), CellType::Gru);
        assert!(matches!(
            "rkn".parse::<CellType>(),
            Err(PissmError::InvalidCellType(_))
        ));
        assert_eq!(CellType::Gru.to_string(), "gru");
    }

    #[test]
    fn test_pissm_cell_shapes() {
        let config = cell_config(3, 4);
        let (cell, coefficient, base) = build_cell(&config);
        assert_eq!(coefficient.all_vars().len(), 4);
        assert_eq!(base.all_vars().len(), 2);

        let (mean, covar) = observations(2, 5, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let beliefs = cell.filter(&mean, &covar, None, &mut rng).unwrap();
        assert_eq!(beliefs.post_mean.dims(), &[2, 5, 3]);
        assert_eq!(beliefs.prior_covar.dims(), &[2, 5, 3]);
        assert_eq!(beliefs.logp.dims(), &[2, 5, 1]);
        assert_eq!(beliefs.transition.unwrap().dims(), &[2, 5, 3, 3]);

        let logp = beliefs.logp.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(logp.iter().all(|&v| v <= 0.0 && v.is_finite()));
    }

    #[test]
    fn test_posterior_equals_prior_when_all_invalid() {
        let config = cell_config(2, 3);
        let (cell, _, _) = build_cell(&config);
        let (mean, covar) = observations(3, 4, 2);
        let valid = Tensor::zeros((3, 4, 1), DType::F32, &Device::Cpu).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let beliefs = cell.filter(&mean, &covar, Some(&valid), &mut rng).unwrap();

        let to_vec = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(to_vec(&beliefs.post_mean), to_vec(&beliefs.prior_mean));
        assert_eq!(to_vec(&beliefs.post_covar), to_vec(&beliefs.prior_covar));
    }

    #[test]
    fn test_update_shrinks_covariance() {
        let config = cell_config(2, 2);
        let (cell, _, _) = build_cell(&config);
        let (mean, covar) = observations(1, 3, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let beliefs = cell.filter(&mean, &covar, None, &mut rng).unwrap();

        let post = beliefs.post_covar.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let prior = beliefs.prior_covar.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (po, pr) in post.iter().zip(&prior) {
            assert!(*po > 0.0);
            assert!(po < pr);
            assert!(*po < 0.5);
        }
    }

    #[test]
    fn test_transition_is_a_basis_matrix() {
        let config = ModelConfig {
            transition_selection: TransitionSelection::Greedy,
            ..cell_config(2, 3)
        };
        let (cell, _, _) = build_cell(&config);
        let (mean, covar) = observations(1, 2, 2);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let beliefs = cell.filter(&mean, &covar, None, &mut rng).unwrap();

        let basis = cell.basis().unwrap().to_vec3::<f32>().unwrap();
        let transition = beliefs.transition.unwrap();
        for step in 0..2 {
            let a = transition
                .get(0)
                .and_then(|t| t.get(step))
                .and_then(|t| t.to_vec2::<f32>())
                .unwrap();
            assert!(basis.iter().any(|m| *m == a));
        }
    }

    #[test]
    fn test_sample_categorical_respects_mass() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..100 {
            assert_eq!(sample_categorical(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), 1);
    }

    #[test]
    fn test_recurrent_baselines() {
        for cell_type in [CellType::Lstm, CellType::Gru] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let cell = RecurrentCell::new(cell_type, 3, vb).unwrap();
            let (mean, covar) = observations(2, 4, 3);
            let mut rng = ChaCha8Rng::seed_from_u64(5);
            let beliefs = cell.filter(&mean, &covar, None, &mut rng).unwrap();

            assert_eq!(beliefs.post_mean.dims(), &[2, 4, 3]);
            assert!(beliefs.transition.is_none());
            let logp = beliefs.logp.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(logp.iter().all(|&v| v == 0.0));
            let covar = beliefs.post_covar.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(covar.iter().all(|&v| v > 0.0));
        }
    }

    #[test]
    fn test_recurrent_cell_rejects_pissm() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(RecurrentCell::new(CellType::Pissm, 2, vb).is_err());
    }
}
