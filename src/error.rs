//! Error types for resampling and transform setup.
//!
//! Hot-path numeric routines never return errors. Errors are raised once,
//! when a grid, transform or engine is configured.

use thiserror::Error;

use crate::image::ScalarType;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum ResliceError {
    /// A configuration value is outside its legal range.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The scalar type is not accepted by the component.
    #[error("Unsupported scalar type {actual:?} for {context}")]
    UnsupportedScalarType {
        context: &'static str,
        actual: ScalarType,
    },

    /// Wrong number of components per voxel.
    #[error("Expected {expected} components, got {actual}")]
    ComponentMismatch { expected: usize, actual: usize },

    /// An extent with no samples on at least one axis.
    #[error("Empty extent: {0}")]
    EmptyExtent(String),

    /// Data length does not match the declared geometry.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A matrix that had to be inverted is singular.
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    /// Spline degree outside `0..=9`.
    #[error("Invalid spline degree {0}, supported range is 0..=9")]
    InvalidSplineDegree(usize),

    /// Configuration (de)serialization failure.
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for resampling operations.
pub type Result<T> = std::result::Result<T, ResliceError>;

impl ResliceError {
    /// Create an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an empty extent error.
    pub fn empty_extent(msg: impl Into<String>) -> Self {
        Self::EmptyExtent(msg.into())
    }

    /// Create a singular matrix error.
    pub fn singular(msg: impl Into<String>) -> Self {
        Self::SingularMatrix(msg.into())
    }
}
