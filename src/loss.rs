//! Loss layers and their forward/backward math.
//!
//! A [`LossSpec`] pairs a loss function with the targets of the full
//! dataset. The targets ride with the chain, so the engine can resolve each
//! example's target by absolute position no matter how the trainer shuffles
//! or partitions the batch:
//!
//! - [`LossSpec::squared_error`] — `sum((y_hat - y)^2)` per example
//! - [`LossSpec::logit_cross_entropy`] — softmax cross-entropy on raw logits
//!
//! Per-example losses are summed, not averaged, by the gradient engine; the
//! evaluator reports the mean.
//!
//! # Example
//!
//! ```rust
//! use linnet::LossSpec;
//!
//! // One class label per example, matched by absolute example position.
//! let loss = LossSpec::logit_cross_entropy(vec![3, 1, 0, 2]);
//! ```

use std::sync::Arc;

use crate::error::{LinnetError, LinnetResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which loss function a [`LossSpec`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LossKind {
    /// Sum of squared differences against a target vector per example.
    SquaredError,
    /// Softmax cross-entropy against a class label per example.
    LogitCrossEntropy,
}

/// Target storage for a loss layer.
///
/// Targets are shared, not copied, so cloning a chain or spec is cheap.
#[derive(Debug, Clone)]
pub enum Targets {
    /// One `f32` row per example, rows as wide as the chain output.
    Values(Arc<[f32]>),
    /// One class label per example.
    Classes(Arc<[u32]>),
}

/// A loss function bound to the targets it scores against.
#[derive(Debug, Clone)]
pub struct LossSpec {
    kind: LossKind,
    targets: Targets,
}

impl LossSpec {
    /// Squared-error loss over target value rows.
    ///
    /// `values` holds one row per example, each as wide as the chain's
    /// output; row `i` scores example `i` of the dataset.
    pub fn squared_error(values: Vec<f32>) -> Self {
        LossSpec {
            kind: LossKind::SquaredError,
            targets: Targets::Values(values.into()),
        }
    }

    /// Softmax cross-entropy over raw logits.
    ///
    /// `classes[i]` is the label of example `i`; labels must be smaller
    /// than the chain's output width.
    pub fn logit_cross_entropy(classes: Vec<u32>) -> Self {
        LossSpec {
            kind: LossKind::LogitCrossEntropy,
            targets: Targets::Classes(classes.into()),
        }
    }

    /// The loss function.
    #[inline]
    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// The bound targets.
    #[inline]
    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    /// Per-example f32 cache the gradient engine needs for this loss.
    #[inline]
    pub(crate) fn cache_per_example(&self) -> usize {
        match self.kind {
            // Caches the log-sum-exp of each logit row at forward time
            LossKind::LogitCrossEntropy => 1,
            LossKind::SquaredError => 0,
        }
    }

    /// Checks that the targets cover examples `0..limit` of the dataset and
    /// that every label fits the output width.
    pub(crate) fn validate(&self, out_len: usize, limit: usize) -> LinnetResult<()> {
        match &self.targets {
            Targets::Values(values) => {
                let covered = values.len() / out_len;
                if covered < limit || values.len() % out_len != 0 {
                    return Err(LinnetError::target_size(limit, covered));
                }
            }
            Targets::Classes(classes) => {
                if classes.len() < limit {
                    return Err(LinnetError::target_size(limit, classes.len()));
                }
                for (i, &c) in classes[..limit].iter().enumerate() {
                    if c as usize >= out_len {
                        return Err(LinnetError::invalid_label(i, c, out_len));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Numerically stable `log(sum(exp(row)))`.
#[inline]
pub(crate) fn log_sum_exp(row: &[f32]) -> f32 {
    let mut max = f32::NEG_INFINITY;
    for &z in row {
        if z > max {
            max = z;
        }
    }
    let mut sum = 0.0f32;
    for &z in row {
        sum += (z - max).exp();
    }
    max + sum.ln()
}

/// Summed squared-error loss over the addressed examples.
///
/// Row `j` of `z` is scored against target row `ids[j]`.
pub(crate) fn squared_loss(z: &[f32], out_len: usize, ids: &[u32], values: &[f32]) -> f64 {
    let mut total = 0.0f64;
    for (j, &id) in ids.iter().enumerate() {
        let row = &z[j * out_len..(j + 1) * out_len];
        let target = &values[id as usize * out_len..(id as usize + 1) * out_len];
        let mut acc = 0.0f64;
        for (y, t) in row.iter().zip(target) {
            let d = (y - t) as f64;
            acc += d * d;
        }
        total += acc;
    }
    total
}

/// Seeds the backward walk for squared error: `z <- 2 (z - t)` in place.
pub(crate) fn squared_backward(z: &mut [f32], out_len: usize, ids: &[u32], values: &[f32]) {
    for (j, &id) in ids.iter().enumerate() {
        let row = &mut z[j * out_len..(j + 1) * out_len];
        let target = &values[id as usize * out_len..(id as usize + 1) * out_len];
        for (y, t) in row.iter_mut().zip(target) {
            *y = 2.0 * (*y - t);
        }
    }
}

/// Summed cross-entropy loss, caching each row's log-sum-exp into `lse`.
pub(crate) fn ce_forward(
    z: &[f32],
    out_len: usize,
    ids: &[u32],
    classes: &[u32],
    lse: &mut [f32],
) -> f64 {
    debug_assert_eq!(ids.len(), lse.len());
    let mut total = 0.0f64;
    for (j, &id) in ids.iter().enumerate() {
        let row = &z[j * out_len..(j + 1) * out_len];
        let l = log_sum_exp(row);
        lse[j] = l;
        total += (l - row[classes[id as usize] as usize]) as f64;
    }
    total
}

/// Summed cross-entropy loss without the gradient cache.
pub(crate) fn ce_loss(z: &[f32], out_len: usize, ids: &[u32], classes: &[u32]) -> f64 {
    let mut total = 0.0f64;
    for (j, &id) in ids.iter().enumerate() {
        let row = &z[j * out_len..(j + 1) * out_len];
        total += (log_sum_exp(row) - row[classes[id as usize] as usize]) as f64;
    }
    total
}

/// Seeds the backward walk for cross-entropy: `z <- softmax(z) - onehot`.
///
/// Runs off the cached log-sum-exp values; by the time the backward walk
/// reaches this point the forward logits are the only live copy, and this
/// overwrite destroys them.
pub(crate) fn ce_backward(z: &mut [f32], out_len: usize, ids: &[u32], classes: &[u32], lse: &[f32]) {
    for (j, &id) in ids.iter().enumerate() {
        let row = &mut z[j * out_len..(j + 1) * out_len];
        let l = lse[j];
        for y in row.iter_mut() {
            *y = (*y - l).exp();
        }
        row[classes[id as usize] as usize] -= 1.0;
    }
}

/// Index of the largest element, first occurrence on ties.
#[inline]
pub(crate) fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best = i;
        }
    }
    best
}

/// Counts rows whose argmax matches the target class.
///
/// Squared-error targets count a row as correct when its argmax matches the
/// argmax of the target row.
pub(crate) fn count_correct(z: &[f32], out_len: usize, ids: &[u32], targets: &Targets) -> usize {
    let mut correct = 0;
    for (j, &id) in ids.iter().enumerate() {
        let row = &z[j * out_len..(j + 1) * out_len];
        let predicted = argmax(row);
        let expected = match targets {
            Targets::Classes(classes) => classes[id as usize] as usize,
            Targets::Values(values) => {
                argmax(&values[id as usize * out_len..(id as usize + 1) * out_len])
            }
        };
        if predicted == expected {
            correct += 1;
        }
    }
    correct
}
