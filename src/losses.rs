//! Loss functions for the latent state-space model.
//!
//! All losses take `[B, T, ...]` tensors. Per-sample variants return `[B, T]`
//! and are what the REINFORCE reward is built from.

use candle_core::{DType, Tensor, D};

use crate::error::Result;

/// Additive variance floor in the Gaussian NLL.
pub const GAUSSIAN_EPS: f64 = 1e-8;

/// Log stabilizer in the Bernoulli NLL.
pub const BERNOULLI_EPS: f64 = 1e-12;

const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Per-time-step Gaussian NLL summed over the output dimension.
///
/// Inputs are `[B, T, D]`; the result is `[B, T]`.
pub fn sample_wise_gaussian_nll(target: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let var = var.affine(1.0, GAUSSIAN_EPS)?;
    let sq = target.sub(mean)?.sqr()?;
    let element = var
        .log()?
        .add(&sq.div(&var)?)?
        .affine(0.5, 0.5 * LOG_2PI)?;
    Ok(element.sum(D::Minus1)?)
}

/// Gaussian negative log-likelihood, averaged over batch and time.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use pissm_rs::losses::gaussian_nll;
///
/// # fn main() -> pissm_rs::Result<()> {
/// let t = Tensor::zeros((2, 3, 1), candle_core::DType::F32, &Device::Cpu)?;
/// let var = Tensor::ones((2, 3, 1), candle_core::DType::F32, &Device::Cpu)?;
/// let nll = gaussian_nll(&t, &t, &var)?.to_scalar::<f32>()?;
/// assert!((nll - 0.918_938_5).abs() < 1e-5);
/// # Ok(())
/// # }
/// ```
pub fn gaussian_nll(target: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    Ok(sample_wise_gaussian_nll(target, mean, var)?.mean_all()?)
}

/// Root mean squared error of the predicted mean. Variance is ignored.
pub fn rmse(target: &Tensor, mean: &Tensor) -> Result<Tensor> {
    Ok(target.sub(mean)?.sqr()?.mean_all()?.sqrt()?)
}

/// Per-time-step binary cross-entropy summed over all trailing axes.
///
/// `probs` and `target` are `[B, T, ...]`; the result is `[B, T]`. When
/// `uint8_targets` is set the targets are rescaled from `[0, 255]`.
pub fn sample_wise_bernoulli_nll(
    target: &Tensor,
    probs: &Tensor,
    uint8_targets: bool,
) -> Result<Tensor> {
    let target = target.to_dtype(probs.dtype())?;
    let target = if uint8_targets {
        target.affine(1.0 / 255.0, 0.0)?
    } else {
        target
    };
    let log_p = probs.affine(1.0, BERNOULLI_EPS)?.log()?;
    let log_1mp = probs.affine(-1.0, 1.0)?.affine(1.0, BERNOULLI_EPS)?.log()?;
    let one_minus_t = target.affine(-1.0, 1.0)?;
    let ll = target.mul(&log_p)?.add(&one_minus_t.mul(&log_1mp)?)?;
    Ok(ll.flatten_from(2)?.sum(D::Minus1)?.neg()?)
}

/// Bernoulli negative log-likelihood, averaged over batch and time.
pub fn bernoulli_nll(target: &Tensor, probs: &Tensor, uint8_targets: bool) -> Result<Tensor> {
    Ok(sample_wise_bernoulli_nll(target, probs, uint8_targets)?.mean_all()?)
}

/// REINFORCE with a per-time-step batch-mean baseline.
///
/// `rewards` is `[B, T]` and `logp` is `[B, T]` or `[B, T, 1]`. Rewards and
/// the baseline are detached so only `logp` receives gradient.
pub fn reinforce_loss(rewards: &Tensor, logp: &Tensor) -> Result<Tensor> {
    let logp = if logp.rank() == 3 {
        logp.squeeze(D::Minus1)?
    } else {
        logp.clone()
    };
    let rewards = rewards.detach().to_dtype(logp.dtype())?;
    let baseline = rewards.mean_keepdim(0)?;
    let advantage = rewards.broadcast_sub(&baseline)?;
    Ok(advantage.mul(&logp)?.mean_all()?.neg()?)
}

/// REINFORCE loss with the reward set to the negative per-step Gaussian NLL.
pub fn reinforce_gaussian(
    target: &Tensor,
    mean: &Tensor,
    var: &Tensor,
    logp: &Tensor,
) -> Result<Tensor> {
    let reward = sample_wise_gaussian_nll(target, mean, var)?.neg()?;
    reinforce_loss(&reward, logp)
}

/// REINFORCE loss with the reward set to the negative per-step Bernoulli NLL.
pub fn reinforce_bernoulli(
    target: &Tensor,
    probs: &Tensor,
    uint8_targets: bool,
    logp: &Tensor,
) -> Result<Tensor> {
    let reward = sample_wise_bernoulli_nll(target, probs, uint8_targets)?.neg()?;
    reinforce_loss(&reward, logp)
}

/// Read a scalar loss tensor as `f64`.
pub fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
