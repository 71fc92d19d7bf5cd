//! Adam optimizer bound to a single parameter group, with gradient clipping.

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::error::{PissmError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay (0 gives plain Adam)
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Norm bound applied to each gradient tensor separately
    pub max_grad_norm: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-7,
            max_grad_norm: 5.0,
        }
    }
}

impl OptimizerConfig {
    /// Build an optimizer over every variable of `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, varmap: &VarMap) -> Result<ClippedAdam> {
        let vars = varmap.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let inner = candle_nn::AdamW::new(vars.clone(), params)
            .map_err(|e| PissmError::Training(format!("Failed to create Adam: {}", e)))?;

        Ok(ClippedAdam {
            inner,
            vars,
            max_grad_norm: self.max_grad_norm,
        })
    }
}

/// Adam over one parameter group.
///
/// Gradients for variables outside the group are ignored, so the same loss
/// graph can be shared between groups without cross-talk.
pub struct ClippedAdam {
    inner: candle_nn::AdamW,
    vars: Vec<Var>,
    max_grad_norm: f64,
}

impl ClippedAdam {
    /// Number of variables in the group.
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Backpropagate `loss`, clip and apply one step to the group.
    ///
    /// Returns the global gradient norm of the group before clipping. An empty
    /// group is a no-op returning 0.
    ///
    /// # Errors
    ///
    /// Returns an error if backpropagation or the step fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f64> {
        if self.vars.is_empty() {
            return Ok(0.0);
        }
        let mut grads = loss.backward()?;
        let norm = self.clip_gradients(&mut grads)?;
        self.inner
            .step(&grads)
            .map_err(|e| PissmError::Training(format!("Optimizer step failed: {}", e)))?;
        Ok(norm)
    }

    /// Rescale each group gradient whose norm exceeds the bound.
    ///
    /// Returns the global norm of the group gradients before clipping.
    pub fn clip_gradients(&self, grads: &mut GradStore) -> Result<f64> {
        let mut total_sq = 0.0f64;
        for var in &self.vars {
            let Some(grad) = grads.get(var.as_tensor()).cloned() else {
                continue;
            };
            let sq = grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
            total_sq += sq;
            let norm = sq.sqrt();
            if norm > self.max_grad_norm {
                let clipped = grad.affine(self.max_grad_norm / norm, 0.0)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
        Ok(total_sq.sqrt())
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.weight_decay, 0.0);
        assert_eq!(config.max_grad_norm, 5.0);
    }

    #[test]
    fn test_build_on_empty_group() -> Result<()> {
        let varmap = VarMap::new();
        let mut optimizer = OptimizerConfig::default().build(&varmap)?;
        assert_eq!(optimizer.num_vars(), 0);

        let loss = Tensor::new(1.0f32, &Device::Cpu)?;
        assert_eq!(optimizer.backward_step(&loss)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_clip_gradients_bounds_each_tensor() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let w = vb.get_with_hints(4, "w", Init::Const(1.0))?;
        let optimizer = OptimizerConfig::default().build(&varmap)?;

        // d/dw sum(100 w) = 100 per element, norm 200.
        let loss = w.affine(100.0, 0.0)?.sum_all()?;
        let mut grads = loss.backward()?;
        let norm = optimizer.clip_gradients(&mut grads)?;
        assert!((norm - 200.0).abs() < 1e-3);

        let clipped = grads.get(&w).map(|g| g.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>());
        let clipped = clipped.transpose()?.unwrap_or_default();
        assert!((clipped - 5.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_step_only_touches_group() -> Result<()> {
        let group = VarMap::new();
        let other = VarMap::new();
        let a = VarBuilder::from_varmap(&group, DType::F32, &Device::Cpu)
            .get_with_hints(2, "a", Init::Const(1.0))?;
        let b = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu)
            .get_with_hints(2, "b", Init::Const(1.0))?;
        let mut optimizer = OptimizerConfig::default().build(&group)?;

        let loss = a.mul(&b)?.sum_all()?;
        optimizer.backward_step(&loss)?;

        assert!(a.to_vec1::<f32>()?.iter().all(|&v| v < 1.0));
        assert_eq!(b.to_vec1::<f32>()?, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_learning_rate_update() -> Result<()> {
        let mut optimizer = OptimizerConfig::default().build(&VarMap::new())?;
        optimizer.set_learning_rate(0.5);
        assert_eq!(optimizer.learning_rate(), 0.5);
        Ok(())
    }
}
