//! Adam optimizer over a flat parameter vector.

use crate::buffer::AlignedBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Adam optimizer configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdamConfig {
    /// Learning rate (alpha).
    pub lr: f32,

    /// First moment decay (beta1).
    pub beta1: f32,

    /// Second moment decay (beta2).
    pub beta2: f32,

    /// Epsilon for numerical stability.
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Creates config with learning rate.
    pub fn with_lr(lr: f32) -> Self {
        Self {
            lr,
            ..Default::default()
        }
    }
}

/// Adam moment estimates for one flat parameter vector.
///
/// The state persists between steps; one training run keeps a single state
/// alive across all minibatches and epochs.
#[derive(Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdamState {
    /// First moment (mean of gradients).
    pub m: AlignedBuf,

    /// Second moment (variance of gradients).
    pub v: AlignedBuf,

    /// Timestep for bias correction.
    pub t: usize,
}

impl AdamState {
    /// Creates zeroed state for `size` parameters.
    pub fn new(size: usize) -> Self {
        Self {
            m: AlignedBuf::zeroed(size),
            v: AlignedBuf::zeroed(size),
            t: 0,
        }
    }

    /// Resets the state.
    pub fn reset(&mut self) {
        self.m.zero();
        self.v.zero();
        self.t = 0;
    }

    /// Applies one Adam update to `params` from `grad`.
    ///
    /// Moment updates and the bias-corrected step follow the standard form:
    ///
    /// ```text
    /// m <- beta1 m + (1 - beta1) g        m_hat = m / (1 - beta1^t)
    /// v <- beta2 v + (1 - beta2) g^2      v_hat = v / (1 - beta2^t)
    /// p <- p - lr * m_hat / (sqrt(v_hat) + epsilon)
    /// ```
    pub fn step(&mut self, config: &AdamConfig, params: &mut [f32], grad: &[f32]) {
        debug_assert_eq!(params.len(), grad.len());
        debug_assert_eq!(params.len(), self.m.len());

        self.t += 1;
        let bc1 = 1.0 - config.beta1.powi(self.t as i32);
        let bc2 = 1.0 - config.beta2.powi(self.t as i32);

        let m = self.m.as_mut_slice();
        let v = self.v.as_mut_slice();

        for i in 0..params.len() {
            let g = grad[i];
            m[i] = config.beta1 * m[i] + (1.0 - config.beta1) * g;
            v[i] = config.beta2 * v[i] + (1.0 - config.beta2) * g * g;

            let m_hat = m[i] / bc1;
            let v_hat = v[i] / bc2;
            params[i] -= config.lr * m_hat / (v_hat.sqrt() + config.epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hyperparameters() {
        let config = AdamConfig::default();
        assert_eq!(config.lr, 0.001);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.epsilon, 1e-8);
    }

    #[test]
    fn test_first_step_magnitude() {
        // With constant gradient g, bias correction makes the first step
        // exactly lr * g / (|g| + eps)
        let config = AdamConfig::with_lr(0.1);
        let mut state = AdamState::new(1);
        let mut params = [0.0f32];
        state.step(&config, &mut params, &[-8.0]);
        assert!((params[0] - 0.1).abs() < 1e-5);
        assert_eq!(state.t, 1);
    }

    #[test]
    fn test_step_moves_against_gradient() {
        let config = AdamConfig::default();
        let mut state = AdamState::new(3);
        let mut params = [1.0f32, 1.0, 1.0];
        let grad = [1.0f32, -1.0, 0.0];
        state.step(&config, &mut params, &grad);
        assert!(params[0] < 1.0);
        assert!(params[1] > 1.0);
        assert_eq!(params[2], 1.0);
    }

    #[test]
    fn test_state_persists_between_steps() {
        let config = AdamConfig::with_lr(0.01);
        let mut state = AdamState::new(1);
        let mut params = [0.0f32];
        for _ in 0..5 {
            state.step(&config, &mut params, &[1.0]);
        }
        assert_eq!(state.t, 5);
        assert!(state.m[0] > 0.0);
        assert!(state.v[0] > 0.0);

        state.reset();
        assert_eq!(state.t, 0);
        assert_eq!(state.m[0], 0.0);
    }
}
