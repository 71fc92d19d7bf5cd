//! Error types for pissm-rs.
//!
//! This module provides error types and result aliases for the library.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use pissm_rs::{PissmConfig, PissmError};
//!
//! # fn main() {
//! match PissmConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(PissmError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for pissm-rs operations.
pub type Result<T> = std::result::Result<T, PissmError>;

/// Errors that can occur in pissm-rs.
///
/// # Example
///
/// ```rust
/// use pissm_rs::{PissmError, Result};
///
/// fn check_horizon(horizon: usize) -> Result<()> {
///     if horizon == 0 {
///         return Err(PissmError::Config("horizon must be > 0".to_string()));
///     }
///     Ok(())
/// }
///
/// assert!(check_horizon(0).is_err());
/// assert!(check_horizon(50).is_ok());
/// ```
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PissmError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Tensor or vector shape does not match what the model expects.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// Unknown transition cell type.
    #[error("invalid cell type '{0}', needs to be one of 'pissm' (alias 'gin'), 'lstm' or 'gru'")]
    InvalidCellType(String),

    /// Forward pass without a validity mask on a model that may see invalid observations.
    #[error("if invalid inputs are possible, an obs_valid mask needs to be provided")]
    MissingValidityMask,

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl PissmError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<indicatif::style::TemplateError> for PissmError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        PissmError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = PissmError::Config("invalid parameter".to_string());
        assert_eq!(error.to_string(), "configuration error: invalid parameter");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let error = PissmError::shape_mismatch("[2]", "[3]");
        assert_eq!(error.to_string(), "shape mismatch: expected [2], got [3]");
    }

    #[test]
    fn test_invalid_cell_type_names_allowed_set() {
        let error = PissmError::InvalidCellType("rkn".to_string());
        let msg = error.to_string();
        assert!(msg.contains("'rkn'"));
        assert!(msg.contains("'pissm'"));
        assert!(msg.contains("'lstm'"));
        assert!(msg.contains("'gru'"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: PissmError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error =
            serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::").unwrap_err();
        let error: PissmError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let tensor1 = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let tensor2 = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();

        let candle_error = tensor1.broadcast_add(&tensor2).unwrap_err();
        let error: PissmError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: PissmError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(error.source().is_some());
    }
}
