//! Dense building blocks shared by the encoder, decoders and transition cell.

use candle_core::{Module, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder};

use crate::config::ModelConfig;
use crate::error::Result;

/// Hidden activation of a dense stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// max(x, 0)
    Relu,
    /// tanh(x)
    Tanh,
}

impl Activation {
    fn apply(self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Tanh => x.tanh(),
        }
    }
}

/// A stack of dense layers, each followed by the same activation.
///
/// Works on `[B, D]` and on time-distributed `[B, T, D]` inputs. An empty
/// stack is the identity.
pub struct DenseStack {
    layers: Vec<Linear>,
    activation: Activation,
    out_dim: usize,
}

impl DenseStack {
    /// Build `units.len()` layers starting from `input_dim` features.
    pub fn new(
        input_dim: usize,
        units: &[usize],
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(units.len());
        let mut in_dim = input_dim;
        for (i, &out) in units.iter().enumerate() {
            layers.push(candle_nn::linear(in_dim, out, vb.pp(format!("layer_{i}")))?);
            in_dim = out;
        }
        Ok(Self {
            layers,
            activation,
            out_dim: in_dim,
        })
    }

    /// Feature size of the stack output.
    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl Module for DenseStack {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = self.activation.apply(&layer.forward(&h)?)?;
        }
        Ok(h)
    }
}

/// Hidden layers returned by a [`SequenceArchitecture`].
pub struct HiddenLayers {
    /// The layers.
    pub module: Box<dyn Module>,
    /// Output feature size.
    pub out_dim: usize,
}

impl HiddenLayers {
    /// Wrap a [`DenseStack`].
    pub fn dense(stack: DenseStack) -> Self {
        let out_dim = stack.out_dim();
        Self {
            module: Box::new(stack),
            out_dim,
        }
    }

    /// Apply the layers.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.module.forward(xs)?)
    }
}

/// Supplies the hidden layers around the latent filter.
///
/// The model adds its own output heads (latent mean/covariance after the
/// encoder, mean/variance after the decoders), so implementations only build
/// the feature extractors.
pub trait SequenceArchitecture {
    /// Layers between the flattened observation and the latent observation heads.
    fn encoder_hidden(&self, input_dim: usize, vb: VarBuilder) -> Result<HiddenLayers>;

    /// Layers between the posterior mean and the output mean (or image projection).
    fn mean_decoder_hidden(&self, latent_dim: usize, vb: VarBuilder) -> Result<HiddenLayers>;

    /// Layers between the posterior covariance and the output variance.
    fn var_decoder_hidden(&self, latent_dim: usize, vb: VarBuilder) -> Result<HiddenLayers>;
}

/// ReLU dense stacks sized from the model config.
#[derive(Debug, Clone, Default)]
pub struct DenseArchitecture {
    /// Encoder hidden units.
    pub encoder_units: Vec<usize>,
    /// Mean decoder hidden units.
    pub decoder_units: Vec<usize>,
    /// Variance decoder hidden units.
    pub var_decoder_units: Vec<usize>,
}

impl DenseArchitecture {
    /// Take layer sizes from a [`ModelConfig`].
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            encoder_units: config.encoder_hidden_units.clone(),
            decoder_units: config.decoder_hidden_units.clone(),
            var_decoder_units: config.var_decoder_hidden_units.clone(),
        }
    }
}

impl SequenceArchitecture for DenseArchitecture {
    fn encoder_hidden(&self, input_dim: usize, vb: VarBuilder) -> Result<HiddenLayers> {
        let stack = DenseStack::new(input_dim, &self.encoder_units, Activation::Relu, vb)?;
        Ok(HiddenLayers::dense(stack))
    }

    fn mean_decoder_hidden(&self, latent_dim: usize, vb: VarBuilder) -> Result<HiddenLayers> {
        let stack = DenseStack::new(latent_dim, &self.decoder_units, Activation::Relu, vb)?;
        Ok(HiddenLayers::dense(stack))
    }

    fn var_decoder_hidden(&self, latent_dim: usize, vb: VarBuilder) -> Result<HiddenLayers> {
        let stack = DenseStack::new(latent_dim, &self.var_decoder_units, Activation::Relu, vb)?;
        Ok(HiddenLayers::dense(stack))
    }
}

/// Dense layer with a N(0, `bias_std`) bias initialization.
pub fn linear_with_random_bias(
    in_dim: usize,
    out_dim: usize,
    bias_std: f64,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = vb.get_with_hints(
        out_dim,
        "bias",
        Init::Randn {
            mean: 0.0,
            stdev: bias_std,
        },
    )?;
    Ok(Linear::new(weight, Some(bias)))
}

/// `elu(x) + 1`, strictly positive.
pub fn elu_plus_one(x: &Tensor) -> Result<Tensor> {
    Ok(x.elu(1.0)?.affine(1.0, 1.0)?)
}

/// Normalize the last axis to unit L2 norm.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.affine(1.0, 1e-12)?.sqrt()?;
    Ok(x.broadcast_div(&norm)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_dense_stack_time_distributed() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let stack = DenseStack::new(3, &[5, 4], Activation::Relu, vb)?;
        assert_eq!(stack.out_dim(), 4);

        let x = Tensor::ones((2, 6, 3), DType::F32, &Device::Cpu)?;
        let y = stack.forward(&x)?;
        assert_eq!(y.dims(), &[2, 6, 4]);
        assert!(y.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v >= 0.0));
        assert_eq!(varmap.all_vars().len(), 4);
        Ok(())
    }

    #[test]
    fn test_empty_stack_is_identity() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let stack = DenseStack::new(3, &[], Activation::Tanh, vb)?;
        let x = Tensor::new(&[[1.0f32, -2.0, 3.0]], &Device::Cpu)?;
        assert_eq!(stack.out_dim(), 3);
        assert_eq!(stack.forward(&x)?.to_vec2::<f32>()?, x.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_elu_plus_one_positive() -> Result<()> {
        let x = Tensor::new(&[-5.0f32, -1.0, 0.0, 2.0], &Device::Cpu)?;
        let y = elu_plus_one(&x)?.to_vec1::<f32>()?;
        assert!(y.iter().all(|&v| v > 0.0));
        assert!((y[2] - 1.0).abs() < 1e-6);
        assert!((y[3] - 3.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_l2_normalize_unit_norm() -> Result<()> {
        let x = Tensor::new(&[[3.0f32, 4.0], [0.5, -0.5]], &Device::Cpu)?;
        let y = l2_normalize(&x)?.to_vec2::<f32>()?;
        assert!((y[0][0] - 0.6).abs() < 1e-6);
        for row in y {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_dense_architecture_from_config() {
        let config = ModelConfig {
            encoder_hidden_units: vec![7],
            decoder_hidden_units: vec![],
            ..Default::default()
        };
        let arch = DenseArchitecture::from_config(&config);
        assert_eq!(arch.encoder_units, vec![7]);
        assert!(arch.decoder_units.is_empty());
    }
}
