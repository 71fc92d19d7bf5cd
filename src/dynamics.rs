//! Motion and observation models for the trajectory simulator.
//!
//! The simulator accepts any [`StateFunction`]: plain closures work out of the
//! box, and [`MotionModel`] / [`ObservationModel`] provide serializable models
//! that can be selected from a YAML config.
//!
//! # Example
//!
//! ```rust
//! use pissm_rs::dynamics::{MotionModel, ObservationModel, StateFunction};
//!
//! # fn main() -> pissm_rs::Result<()> {
//! let f = MotionModel::ConstantVelocity { delta_t: 0.5 };
//! // state layout: [p_x, p_y, v_x, v_y]
//! assert_eq!(f.apply(&[0.0, 0.0, 2.0, -2.0])?, vec![1.0, -1.0, 2.0, -2.0]);
//!
//! let h = ObservationModel::Projection { indices: vec![2, 3] };
//! assert_eq!(h.apply(&[0.0, 0.0, 2.0, -2.0])?, vec![2.0, -2.0]);
//! # Ok(())
//! # }
//! ```

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{PissmError, Result};

/// A deterministic map from one state-space vector to another.
///
/// Used for both the transition `f: R^m -> R^m` and the emission
/// `h: R^m -> R^n`. Output lengths are checked by the simulator.
pub trait StateFunction: Send + Sync {
    /// Apply the map.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the map cannot act on a vector of `x.len()`.
    fn apply(&self, x: &[f32]) -> Result<Vec<f32>>;
}

impl<F> StateFunction for F
where
    F: Fn(&[f32]) -> Vec<f32> + Send + Sync,
{
    fn apply(&self, x: &[f32]) -> Result<Vec<f32>> {
        Ok(self(x))
    }
}

/// Built-in motion (state transition) models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MotionModel {
    /// `x_{t+1} = x_t`.
    Identity,
    /// Constant-velocity kinematics.
    ///
    /// The state holds `d` positions followed by `d` velocities; positions
    /// advance by `velocity * delta_t`, velocities are carried over.
    ConstantVelocity {
        /// Integration time step.
        delta_t: f32,
    },
    /// `x_{t+1} = F x_t`.
    Linear {
        /// Transition matrix, written as a list of rows in YAML.
        #[serde(with = "matrix_rows")]
        matrix: DMatrix<f32>,
    },
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::ConstantVelocity { delta_t: 1.0 }
    }
}

impl MotionModel {
    /// Check that the model can act on an `m`-dimensional state.
    pub fn validate(&self, m: usize) -> Result<()> {
        match self {
            Self::Identity => Ok(()),
            Self::ConstantVelocity { delta_t } => {
                if m % 2 != 0 {
                    return Err(PissmError::Config(format!(
                        "constant_velocity needs an even state dimension, got {m}"
                    )));
                }
                if !delta_t.is_finite() {
                    return Err(PissmError::Config("delta_t must be finite".into()));
                }
                Ok(())
            }
            Self::Linear { matrix } => check_shape(matrix, m, m, "motion matrix"),
        }
    }
}

impl StateFunction for MotionModel {
    fn apply(&self, x: &[f32]) -> Result<Vec<f32>> {
        match self {
            Self::Identity => Ok(x.to_vec()),
            Self::ConstantVelocity { delta_t } => {
                if x.len() % 2 != 0 {
                    return Err(PissmError::shape_mismatch(
                        "constant_velocity state of even length",
                        x.len().to_string(),
                    ));
                }
                let d = x.len() / 2;
                let mut next = x.to_vec();
                for i in 0..d {
                    next[i] = x[i] + x[d + i] * delta_t;
                }
                Ok(next)
            }
            Self::Linear { matrix } => mat_vec(matrix, x, "motion matrix"),
        }
    }
}

/// Built-in observation (emission) models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservationModel {
    /// `y_t = x_t`.
    Identity,
    /// Select a subset of state coordinates.
    Projection {
        /// State indices to observe, in output order.
        indices: Vec<usize>,
    },
    /// `y_t = H x_t`.
    Linear {
        /// Observation matrix, written as a list of rows in YAML.
        #[serde(with = "matrix_rows")]
        matrix: DMatrix<f32>,
    },
}

impl Default for ObservationModel {
    fn default() -> Self {
        Self::Identity
    }
}

impl ObservationModel {
    /// Check that the model maps an `m`-dimensional state to `n` outputs.
    pub fn validate(&self, m: usize, n: usize) -> Result<()> {
        match self {
            Self::Identity => {
                if m != n {
                    return Err(PissmError::shape_mismatch(
                        format!("identity observation with n == m ({m})"),
                        format!("n = {n}"),
                    ));
                }
                Ok(())
            }
            Self::Projection { indices } => {
                if indices.len() != n {
                    return Err(PissmError::shape_mismatch(
                        format!("{n} projection indices"),
                        indices.len().to_string(),
                    ));
                }
                if let Some(bad) = indices.iter().find(|&&i| i >= m) {
                    return Err(PissmError::Config(format!(
                        "projection index {bad} out of range for state dimension {m}"
                    )));
                }
                Ok(())
            }
            Self::Linear { matrix } => check_shape(matrix, n, m, "observation matrix"),
        }
    }
}

impl StateFunction for ObservationModel {
    fn apply(&self, x: &[f32]) -> Result<Vec<f32>> {
        match self {
            Self::Identity => Ok(x.to_vec()),
            Self::Projection { indices } => indices
                .iter()
                .map(|&i| {
                    x.get(i).copied().ok_or_else(|| {
                        PissmError::shape_mismatch(
                            format!("state with more than {i} elements"),
                            x.len().to_string(),
                        )
                    })
                })
                .collect(),
            Self::Linear { matrix } => mat_vec(matrix, x, "observation matrix"),
        }
    }
}

fn mat_vec(matrix: &DMatrix<f32>, x: &[f32], what: &str) -> Result<Vec<f32>> {
    if matrix.ncols() != x.len() {
        return Err(PissmError::shape_mismatch(
            format!("{what} with {} columns", x.len()),
            format!("[{}, {}]", matrix.nrows(), matrix.ncols()),
        ));
    }
    let y = matrix * DVector::from_column_slice(x);
    Ok(y.as_slice().to_vec())
}

fn check_shape(matrix: &DMatrix<f32>, rows: usize, cols: usize, what: &str) -> Result<()> {
    if matrix.shape() != (rows, cols) {
        return Err(PissmError::shape_mismatch(
            format!("{what} of shape [{rows}, {cols}]"),
            format!("[{}, {}]", matrix.nrows(), matrix.ncols()),
        ));
    }
    Ok(())
}

/// Serialize a matrix as a list of rows so configs stay readable.
mod matrix_rows {
    use nalgebra::DMatrix;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(matrix: &DMatrix<f32>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rows: Vec<Vec<f32>> = matrix
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect();
        rows.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DMatrix<f32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let rows = Vec::<Vec<f32>>::deserialize(deserializer)?;
        let ncols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|row| row.len() != ncols) {
            return Err(D::Error::custom(format!(
                "matrix row {bad} has {} entries, expected {ncols}",
                rows[bad].len()
            )));
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Ok(DMatrix::from_row_slice(rows.len(), ncols, &flat))
    }
}
