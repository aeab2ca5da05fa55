//! # Linnet - Minimal Feed-Forward Network Engine
//!
//! Strictly linear layer chains with static shape propagation, a flat
//! parameter layout, and a fused value-and-gradient pass over reusable
//! scratch memory. No graph, no tensors, no allocation in the hot path.
//!
//! ## Architecture
//! - A [`Chain`] folds layer descriptors into a [`Plan`]: per-layer shapes
//!   plus contiguous offsets into one flat parameter vector
//! - [`valgrad`] runs forward and backward in one call over a [`Scratch`]
//!   arena, destroying intermediate activations as the backward walk
//!   consumes them
//! - [`train_batched`] splits each minibatch across gradient columns on an
//!   explicit rayon pool and applies ADAM once per reduced gradient
//!
//! ## Usage
//! ```rust
//! use linnet::{
//!     evaluate, train_batched, worker_pool, Activation, AdamConfig, Batch, Chain, GradBuffer,
//!     Layer, LossSpec, Scratch, Shape, TrainConfig,
//! };
//! use rand::rngs::SmallRng;
//! use rand::SeedableRng;
//!
//! # fn main() -> linnet::LinnetResult<()> {
//! // 2 -> 4 -> 1 regression chain with squared-error loss
//! let chain = Chain::with_input(Shape::d1(2), vec![
//!     Layer::dense(4, Activation::Relu),
//!     Layer::dense(1, Activation::Identity),
//! ])?
//! .add_loss(LossSpec::squared_error(vec![0.0, 1.0, 1.0, 0.0]))?;
//!
//! let data = [0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
//! let batch = Batch::new(&data, Shape::d1(2))?;
//!
//! let mut rng = SmallRng::seed_from_u64(42);
//! let mut params = chain.init_params(&mut rng)?;
//!
//! let mut grad = GradBuffer::for_chain(&chain, 2)?;
//! let pool = worker_pool(Some(2))?;
//! train_batched(
//!     &mut grad,
//!     params.as_mut_slice(),
//!     &chain,
//!     &batch,
//!     &AdamConfig::default(),
//!     &TrainConfig::with_epochs(10),
//!     &pool,
//! )?;
//!
//! let mut scratch = Scratch::new();
//! let eval = evaluate(&chain, params.as_slice(), &batch, &mut scratch)?;
//! assert!(eval.loss.is_finite());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod buffer;
pub mod chain;
pub mod config;
pub mod error;
mod kernel;
pub mod layer;
pub mod loss;
pub mod optimizer;
pub mod penalty;
pub mod shape;
pub mod train;
pub mod valgrad;

// Re-exports
pub use batch::Batch;
pub use buffer::{AlignedBuf, Scratch, CACHE_LINE};
pub use chain::{Chain, LayerPlan, Plan};
pub use config::{ConfigError, TrainConfig, EVAL_CHUNK};
pub use error::{LinnetError, LinnetResult};
pub use layer::{Activation, Layer};
pub use loss::{LossKind, LossSpec, Targets};
pub use optimizer::{AdamConfig, AdamState};
pub use penalty::{ChainPenalty, FrontLastPenalty, L1Penalty, L2Penalty, NoPenalty, Penalty};
pub use shape::Shape;
pub use train::{
    evaluate, train_batched, train_batched_penalized, worker_pool, Evaluation, GradBuffer,
};
pub use valgrad::{predict, valgrad};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
