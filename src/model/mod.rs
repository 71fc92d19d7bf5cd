//! Sequence model: encoder, latent transition cell and decoder.
//!
//! - [`layers`]: dense stacks and the [`SequenceArchitecture`] trait
//! - [`cell`]: the basis-mixture cell and the LSTM/GRU baselines
//! - [`pissm`]: the assembled [`PissmModel`]

pub mod cell;
pub mod layers;
pub mod pissm;

pub use cell::{CellType, LatentBeliefs, PissmCell, RecurrentCell, TransitionCell};
pub use layers::{DenseArchitecture, DenseStack, HiddenLayers, SequenceArchitecture};
pub use pissm::{EncodedObservations, ModelOutput, PissmModel, Prediction};
