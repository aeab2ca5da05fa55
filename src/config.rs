//! Training configuration for linnet chains.
//!
//! # Example
//!
//! ```rust
//! use linnet::TrainConfig;
//!
//! let config = TrainConfig {
//!     epochs: 20,
//!     batch: Some(64),
//!     seed: 42,
//!     shuffle: true,
//! };
//! assert!(config.validate().is_ok());
//! ```

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use thiserror::Error;

/// Examples processed per forward pass by the evaluator. Bounds evaluator
/// scratch memory independently of dataset size.
pub const EVAL_CHUNK: usize = 256;

/// Configuration for a batched training run.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainConfig {
    /// Full passes over the dataset.
    pub epochs: usize,
    /// Minibatch size. `None` runs one full-batch step per epoch.
    pub batch: Option<usize>,
    /// Base seed for shuffling and dropout streams. Runs with the same seed,
    /// worker count and data are bitwise reproducible.
    pub seed: u64,
    /// Reshuffle the example order at the start of every epoch.
    pub shuffle: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            epochs: 1,
            batch: None,
            seed: 0,
            shuffle: false,
        }
    }
}

impl TrainConfig {
    /// Creates a config running `epochs` full-batch passes.
    pub fn with_epochs(epochs: usize) -> Self {
        TrainConfig {
            epochs,
            ..Default::default()
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.epochs == 0 {
            return Err(ConfigError::ZeroEpochs);
        }
        if self.batch == Some(0) {
            return Err(ConfigError::ZeroBatch);
        }
        Ok(())
    }
}

/// Errors raised while validating layer, chain or trainer configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Dense layer with zero output width.
    #[error("Dense layer width must be > 0")]
    DenseWidth,

    /// Convolution kernel with a zero dimension.
    #[error("Convolution kernel must be non-empty, got {kh}x{kw}")]
    ConvKernel {
        /// Kernel height.
        kh: usize,
        /// Kernel width.
        kw: usize,
    },

    /// Convolution with zero output channels.
    #[error("Convolution must produce at least one output channel")]
    ConvChannels,

    /// Pooling window with a zero dimension.
    #[error("Pooling window must be non-empty, got {ph}x{pw}")]
    PoolWindow {
        /// Window height.
        ph: usize,
        /// Window width.
        pw: usize,
    },

    /// Dropout rate outside the open interval (0, 1).
    #[error("Dropout rate must lie in (0, 1), got {0}")]
    DropoutRate(f32),

    /// A shape with a zero dimension reached the planner.
    #[error("Shape dimensions must be > 0")]
    ZeroDim,

    /// A loss layer appeared before the end of the chain.
    #[error("A loss layer may only appear at the end of a chain")]
    LossNotTerminal,

    /// Training or evaluation requires a terminal loss layer.
    #[error("Chain has no terminal loss layer")]
    MissingLoss,

    /// A shape-dependent query on a chain built without a static input shape.
    #[error("Chain has no static input shape; supply one explicitly")]
    MissingInputShape,

    /// Training with zero epochs.
    #[error("Epoch count must be > 0")]
    ZeroEpochs,

    /// Minibatch size of zero.
    #[error("Minibatch size must be > 0")]
    ZeroBatch,

    /// Gradient buffer or worker pool with zero workers.
    #[error("Worker count must be > 0")]
    ZeroWorkers,
}
