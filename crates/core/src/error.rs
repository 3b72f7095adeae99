//! Error types for scaling-recipe operations.

use thiserror::Error;

/// Errors surfaced by the recipe engine.
///
/// Structural and configuration errors are raised before any caller buffer is
/// written. Degenerate amax values are never reported here; they are absorbed by
/// the scale estimator's fallback policy.
#[derive(Error, Debug)]
pub enum RecipeError {
    /// A history, scale, grid or reduction buffer disagrees with the declared shape.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// The operation is not defined for the given tensor, option or device.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A tensor lives on a different device than the execution queue.
    #[error("tensor device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch { expected: String, actual: String },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl RecipeError {
    pub(crate) fn shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedConfiguration(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, RecipeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = RecipeError::shape("scale", &[2], &[3]);
        assert_eq!(
            err.to_string(),
            "shape mismatch for scale: expected [2], got [3]"
        );
    }

    #[test]
    fn test_candle_error_converts() {
        let err: RecipeError = candle_core::Error::Msg("boom".to_string()).into();
        assert!(matches!(err, RecipeError::Tensor(_)));
    }
}
