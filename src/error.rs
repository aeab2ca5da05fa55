//! Unified error types for linnet.
//!
//! This module provides [`LinnetError`], the single error type returned by
//! chain construction, the value-and-gradient engine, the trainer, and the
//! evaluator. It uses the `thiserror` crate for ergonomic error handling.
//!
//! # Example
//!
//! ```rust
//! use linnet::LinnetError;
//!
//! fn check_params(expected: usize, got: usize) -> Result<(), LinnetError> {
//!     if expected != got {
//!         return Err(LinnetError::parameter_size(expected, got));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::config::ConfigError;

/// Unified error type for linnet operations.
///
/// Static chains report shape problems at construction; dynamic chains report
/// them at the first forward call. Size checks always run before any numeric
/// work begins.
#[derive(Error, Debug)]
pub enum LinnetError {
    /// A layer received an input shape it cannot process.
    #[error("Layer {layer} ({context}): expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Index of the offending layer in the chain.
        layer: usize,
        /// Which part of the layer's contract was violated.
        context: &'static str,
        /// Dimensions the layer requires.
        expected: Vec<usize>,
        /// Dimensions it received.
        got: Vec<usize>,
    },

    /// A batch's per-example shape disagrees with the chain's static shape.
    #[error("Input shape mismatch: chain expects {expected:?}, batch has {got:?}")]
    InputShape {
        /// The chain's declared input dimensions.
        expected: Vec<usize>,
        /// The batch's per-example dimensions.
        got: Vec<usize>,
    },

    /// Flat batch data does not divide evenly into examples.
    #[error("Data length {got} is not a multiple of example length {example_len}")]
    DataSize {
        /// Element count of one example.
        example_len: usize,
        /// Total element count supplied.
        got: usize,
    },

    /// Parameter vector length differs from the chain's computed total.
    #[error("Parameter vector has {got} elements, chain requires {expected}")]
    ParameterSize {
        /// The chain's total parameter count.
        expected: usize,
        /// Length of the vector supplied.
        got: usize,
    },

    /// Caller-provided output buffer has the wrong length.
    #[error("Output buffer has {got} elements, expected {expected}")]
    OutputSize {
        /// Required element count (`examples * output length`).
        expected: usize,
        /// Length of the buffer supplied.
        got: usize,
    },

    /// Loss targets do not cover every addressed example.
    #[error("Loss targets cover {got} examples, {needed} required")]
    TargetSize {
        /// Examples the call addresses.
        needed: usize,
        /// Examples the target container covers.
        got: usize,
    },

    /// A classification label is outside the output width.
    #[error("Example {example}: class label {class} out of range for {classes} classes")]
    InvalidLabel {
        /// Absolute example position.
        example: usize,
        /// The offending label.
        class: u32,
        /// Number of classes the chain produces.
        classes: usize,
    },

    /// Configuration error raised at chain or trainer construction.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Training or evaluation was invoked with zero examples.
    #[error("Empty batch: at least one example is required")]
    EmptyBatch,

    /// A parallel gradient worker failed; the minibatch was abandoned before
    /// the optimizer step.
    #[error("Gradient worker failed: {0}")]
    Worker(#[source] Box<LinnetError>),

    /// The worker pool could not be built.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Result type alias for linnet operations.
pub type LinnetResult<T> = Result<T, LinnetError>;

impl LinnetError {
    /// Creates a per-layer shape mismatch error.
    pub fn shape_mismatch(
        layer: usize,
        context: &'static str,
        expected: &[usize],
        got: &[usize],
    ) -> Self {
        LinnetError::ShapeMismatch {
            layer,
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Creates an input shape mismatch error.
    pub fn input_shape(expected: &[usize], got: &[usize]) -> Self {
        LinnetError::InputShape {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }

    /// Creates a data length error.
    pub fn data_size(example_len: usize, got: usize) -> Self {
        LinnetError::DataSize { example_len, got }
    }

    /// Creates a parameter size error.
    pub fn parameter_size(expected: usize, got: usize) -> Self {
        LinnetError::ParameterSize { expected, got }
    }

    /// Creates an output buffer size error.
    pub fn output_size(expected: usize, got: usize) -> Self {
        LinnetError::OutputSize { expected, got }
    }

    /// Creates a target coverage error.
    pub fn target_size(needed: usize, got: usize) -> Self {
        LinnetError::TargetSize { needed, got }
    }

    /// Creates an out-of-range label error.
    pub fn invalid_label(example: usize, class: u32, classes: usize) -> Self {
        LinnetError::InvalidLabel {
            example,
            class,
            classes,
        }
    }

    /// Wraps an error that occurred inside a gradient worker.
    pub fn worker(inner: LinnetError) -> Self {
        LinnetError::Worker(Box::new(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_message() {
        let err = LinnetError::shape_mismatch(2, "convolution input", &[5, 5, 1], &[3, 3]);
        let msg = err.to_string();
        assert!(msg.contains("Layer 2"));
        assert!(msg.contains("convolution input"));
        assert!(msg.contains("[5, 5, 1]"));
        assert!(msg.contains("[3, 3]"));
    }

    #[test]
    fn test_parameter_size_message() {
        let err = LinnetError::parameter_size(44426, 100);
        let msg = err.to_string();
        assert!(msg.contains("44426"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: LinnetError = ConfigError::DenseWidth.into();
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_worker_wrap() {
        let err = LinnetError::worker(LinnetError::EmptyBatch);
        let msg = err.to_string();
        assert!(msg.contains("worker failed"));
        assert!(msg.contains("Empty batch"));
    }
}
