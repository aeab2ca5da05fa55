//! Parameter penalties applied after gradient reduction.
//!
//! A [`Penalty`] scores one flat parameter slice; a [`ChainPenalty`] maps
//! penalties over the per-layer parameter ranges of a [`Plan`]. Every plain
//! penalty is a chain penalty that treats all layers alike, while
//! [`FrontLastPenalty`] splits the chain at its last non-loss layer and
//! applies a different penalty on each side.
//!
//! The trainer calls [`ChainPenalty::accumulate`] exactly once per
//! optimizer step, on the reduced gradient, so penalty strength does not
//! depend on the worker count.
//!
//! # Example
//!
//! ```rust
//! use linnet::{FrontLastPenalty, L1Penalty, L2Penalty};
//!
//! // L2 on all layers but the last, L1 on the last
//! let penalty = FrontLastPenalty::new(L2Penalty::new(1e-4), L1Penalty::new(1e-4));
//! ```

use crate::chain::Plan;
use crate::kernel;

/// A differentiable score over one flat parameter slice.
pub trait Penalty {
    /// The penalty value.
    fn value(&self, params: &[f32]) -> f32;

    /// Adds the penalty gradient to `grad` and returns the value.
    fn accumulate(&self, grad: &mut [f32], params: &[f32]) -> f32;
}

/// `lambda * sum(|p|)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L1Penalty {
    /// Penalty strength.
    pub lambda: f32,
}

impl L1Penalty {
    /// L1 penalty with strength `lambda`.
    pub fn new(lambda: f32) -> Self {
        L1Penalty { lambda }
    }
}

impl Penalty for L1Penalty {
    fn value(&self, params: &[f32]) -> f32 {
        self.lambda * params.iter().map(|p| p.abs()).sum::<f32>()
    }

    fn accumulate(&self, grad: &mut [f32], params: &[f32]) -> f32 {
        debug_assert_eq!(grad.len(), params.len());
        for (g, p) in grad.iter_mut().zip(params) {
            // subgradient 0 at p == 0
            if *p != 0.0 {
                *g += self.lambda * p.signum();
            }
        }
        Penalty::value(self, params)
    }
}

/// `lambda * sum(p^2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L2Penalty {
    /// Penalty strength.
    pub lambda: f32,
}

impl L2Penalty {
    /// L2 penalty with strength `lambda`.
    pub fn new(lambda: f32) -> Self {
        L2Penalty { lambda }
    }
}

impl Penalty for L2Penalty {
    fn value(&self, params: &[f32]) -> f32 {
        self.lambda * kernel::dot(params, params)
    }

    fn accumulate(&self, grad: &mut [f32], params: &[f32]) -> f32 {
        debug_assert_eq!(grad.len(), params.len());
        kernel::axpy(2.0 * self.lambda, params, grad);
        Penalty::value(self, params)
    }
}

/// The no-op penalty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NoPenalty;

impl Penalty for NoPenalty {
    fn value(&self, _params: &[f32]) -> f32 {
        0.0
    }

    fn accumulate(&self, _grad: &mut [f32], _params: &[f32]) -> f32 {
        0.0
    }
}

/// A penalty mapped over a chain's per-layer parameter ranges.
pub trait ChainPenalty {
    /// Total penalty value over the chain.
    fn value(&self, plan: &Plan, params: &[f32]) -> f32;

    /// Adds the penalty gradient to `grad` and returns the total value.
    fn accumulate(&self, plan: &Plan, grad: &mut [f32], params: &[f32]) -> f32;
}

impl<P: Penalty> ChainPenalty for P {
    fn value(&self, plan: &Plan, params: &[f32]) -> f32 {
        let mut total = 0.0;
        for i in 0..plan.layer_count() {
            let range = plan.layer_param_range(i);
            if !range.is_empty() {
                total += Penalty::value(self, &params[range]);
            }
        }
        total
    }

    fn accumulate(&self, plan: &Plan, grad: &mut [f32], params: &[f32]) -> f32 {
        let mut total = 0.0;
        for i in 0..plan.layer_count() {
            let range = plan.layer_param_range(i);
            if !range.is_empty() {
                total += Penalty::accumulate(self, &mut grad[range.clone()], &params[range]);
            }
        }
        total
    }
}

/// Applies `last` to the chain's last non-loss layer and `front` to every
/// layer before it.
///
/// Zero-parameter ranges are skipped, so when the chain ends in a
/// parameterless layer (dropout, pooling, flatten) the `last` penalty
/// covers nothing and every parameterized layer falls to `front`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrontLastPenalty<F, L> {
    /// Penalty on the layers before the last non-loss layer.
    pub front: F,
    /// Penalty on the last non-loss layer.
    pub last: L,
}

impl<F, L> FrontLastPenalty<F, L> {
    /// Splits penalty application at the chain's last non-loss layer.
    pub fn new(front: F, last: L) -> Self {
        FrontLastPenalty { front, last }
    }
}

impl<F: Penalty, L: Penalty> ChainPenalty for FrontLastPenalty<F, L> {
    fn value(&self, plan: &Plan, params: &[f32]) -> f32 {
        let Some(split) = plan.last_non_loss_layer() else {
            return 0.0;
        };
        let mut total = 0.0;
        for i in 0..plan.layer_count() {
            let range = plan.layer_param_range(i);
            if range.is_empty() {
                continue;
            }
            total += if i == split {
                self.last.value(&params[range])
            } else {
                self.front.value(&params[range])
            };
        }
        total
    }

    fn accumulate(&self, plan: &Plan, grad: &mut [f32], params: &[f32]) -> f32 {
        let Some(split) = plan.last_non_loss_layer() else {
            return 0.0;
        };
        let mut total = 0.0;
        for i in 0..plan.layer_count() {
            let range = plan.layer_param_range(i);
            if range.is_empty() {
                continue;
            }
            total += if i == split {
                self.last.accumulate(&mut grad[range.clone()], &params[range])
            } else {
                self.front.accumulate(&mut grad[range.clone()], &params[range])
            };
        }
        total
    }
}
