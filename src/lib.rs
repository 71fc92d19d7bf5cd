//! # pissm-rs
//!
//! Learn latent linear state-space models from sequential observations.
//!
//! The crate has two halves:
//!
//! - a stochastic state-space **simulator** that turns a motion model `f`, an
//!   observation model `h` and Gaussian noise scales into training trajectories
//! - a probabilistic **sequence model** (encoder, latent transition cell,
//!   decoder) trained with two alternating objectives: REINFORCE for the cell's
//!   coefficient network and Gaussian likelihood for everything else
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a preset config
//! pissm init --preset toy-linear config.yaml
//!
//! # Simulate data, train, evaluate
//! pissm simulate config.yaml --output data.safetensors
//! pissm train config.yaml --data data.safetensors
//! pissm test config.yaml --checkpoint ./outputs/toy-linear/checkpoint-final --data data.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use candle_core::Device;
//! use pissm_rs::dataset::DataSplits;
//! use pissm_rs::{PissmConfig, PissmModel, Trainer};
//! use rand::SeedableRng;
//!
//! # fn main() -> pissm_rs::Result<()> {
//! let config = PissmConfig::from_preset("nclt-odometry")?;
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(config.seed);
//! let splits = DataSplits::simulate(&config, &mut rng)?;
//!
//! let mut model = PissmModel::dense(&config.model, &Device::Cpu, config.seed)?;
//! let mut trainer = Trainer::from_config(&config, &model)?;
//! trainer.train(&mut model, &splits.train, Some(&splits.validation))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Simulating Trajectories
//!
//! ```rust
//! use pissm_rs::dynamics::{MotionModel, ObservationModel};
//! use pissm_rs::SystemModel;
//!
//! # fn main() -> pissm_rs::Result<()> {
//! let mut sys = SystemModel::new(
//!     MotionModel::ConstantVelocity { delta_t: 1.0 },
//!     0.1,
//!     ObservationModel::Projection { indices: vec![2, 3] },
//!     0.1,
//!     50,
//!     4,
//!     2,
//! )
//! .with_seed(7);
//! let (input, target) = sys.generate_batch(16, 50, true)?;
//! assert_eq!(input.dims(), &[16, 2, 50]);
//! assert_eq!(target.dims(), &[16, 4, 50]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dataset;
pub mod dynamics;
pub mod error;
pub mod losses;
pub mod model;
pub mod optimizer;
pub mod simulator;
pub mod trainer;

pub use config::{PissmConfig, TrainingConfig};
pub use error::{PissmError, Result};
pub use model::PissmModel;
pub use simulator::SystemModel;
pub use trainer::Trainer;
