//! Layer descriptors and their shape and parameter policies.
//!
//! A [`Layer`] is a plain description; it owns no parameters and no buffers.
//! Parameters for the whole chain live in one flat `f32` vector, and each
//! layer's slice of it is assigned by the planner in chain order, weights
//! first, then biases:
//!
//! | Layer | Parameters | Output shape |
//! |-------|------------|--------------|
//! | `Dense` | `out * (flat_in + 1)` | `(out)` |
//! | `Conv` | `kh * kw * c_in * c_out + c_out` | `(h - kh + 1, w - kw + 1, c_out)` |
//! | `MaxPool` | 0 | `(h / ph, w / pw, c)` |
//! | `Dropout` | 0 | unchanged |
//! | `Flatten` | 0 | dims `from..` collapsed |
//! | `Loss` | 0 | scalar |
//!
//! Convolution is valid-mode with stride one; pooling windows tile without
//! overlap and truncate ragged edges.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::error::{LinnetError, LinnetResult};
use crate::loss::LossSpec;
use crate::shape::Shape;

/// Elementwise activation applied by dense and convolution layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Activation {
    /// Pass-through.
    Identity,
    /// `max(0, z)`.
    Relu,
    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Applies the activation at pre-activation value `z`.
    #[inline]
    pub(crate) fn eval(self, z: f32) -> f32 {
        match self {
            Activation::Identity => z,
            Activation::Relu => z.max(0.0),
            Activation::Tanh => z.tanh(),
        }
    }

    /// Derivative expressed through the activation output `y`.
    ///
    /// All supported activations admit this form, which is what lets the
    /// backward walk run off cached outputs instead of pre-activations:
    /// relu's slope is the sign of `y`, tanh's is `1 - y^2`.
    #[inline]
    pub(crate) fn grad_factor(self, y: f32) -> f32 {
        match self {
            Activation::Identity => 1.0,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Tanh => 1.0 - y * y,
        }
    }

    /// Whether the backward walk needs a cached derivative factor.
    #[inline]
    pub(crate) fn needs_cache(self) -> bool {
        !matches!(self, Activation::Identity)
    }
}

/// One step of a chain.
///
/// Build layers with the constructor helpers and hand them to
/// [`Chain::new`](crate::Chain::new) or
/// [`Chain::with_input`](crate::Chain::with_input):
///
/// ```rust
/// use linnet::{Activation, Layer};
///
/// let layers = vec![
///     Layer::conv((5, 5), 6, Activation::Relu),
///     Layer::max_pool(2, 2),
///     Layer::flatten(0),
///     Layer::dense(10, Activation::Identity),
/// ];
/// ```
#[derive(Debug, Clone)]
pub enum Layer {
    /// Fully connected layer. Rank > 1 inputs are read as flat vectors.
    Dense {
        /// Output width.
        out: usize,
        /// Elementwise activation.
        activation: Activation,
    },
    /// Valid-mode stride-one 2D convolution over `(height, width, channels)`.
    Conv {
        /// Kernel height.
        kh: usize,
        /// Kernel width.
        kw: usize,
        /// Output channels.
        out_channels: usize,
        /// Elementwise activation.
        activation: Activation,
    },
    /// Non-overlapping max pooling over `(height, width, channels)`.
    MaxPool {
        /// Window height.
        ph: usize,
        /// Window width.
        pw: usize,
    },
    /// Dropout with keep scaling at inference time.
    ///
    /// In gradient mode each element is zeroed with probability `rate` and
    /// kept unscaled otherwise. In inference mode every element is scaled
    /// by `1 - rate`.
    Dropout {
        /// Drop probability, strictly inside (0, 1).
        rate: f32,
    },
    /// Collapses dimensions `from..` into one.
    Flatten {
        /// First dimension of the collapsed tail; 0 flattens everything.
        from: usize,
    },
    /// Terminal loss layer carrying its own targets.
    Loss(LossSpec),
}

impl Layer {
    /// Dense layer with `out` outputs.
    pub fn dense(out: usize, activation: Activation) -> Self {
        Layer::Dense { out, activation }
    }

    /// Convolution with a `(kh, kw)` kernel and `out_channels` filters.
    pub fn conv(kernel: (usize, usize), out_channels: usize, activation: Activation) -> Self {
        Layer::Conv {
            kh: kernel.0,
            kw: kernel.1,
            out_channels,
            activation,
        }
    }

    /// Max pooling with a `ph x pw` window.
    pub fn max_pool(ph: usize, pw: usize) -> Self {
        Layer::MaxPool { ph, pw }
    }

    /// Dropout with the given drop probability.
    pub fn dropout(rate: f32) -> Self {
        Layer::Dropout { rate }
    }

    /// Flatten collapsing dimensions `from..`.
    pub fn flatten(from: usize) -> Self {
        Layer::Flatten { from }
    }

    /// True for the terminal loss layer.
    #[inline]
    pub fn is_loss(&self) -> bool {
        matches!(self, Layer::Loss(_))
    }

    /// Shape-independent configuration checks.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Layer::Dense { out, .. } => {
                if out == 0 {
                    return Err(ConfigError::DenseWidth);
                }
            }
            Layer::Conv {
                kh,
                kw,
                out_channels,
                ..
            } => {
                if kh == 0 || kw == 0 {
                    return Err(ConfigError::ConvKernel { kh, kw });
                }
                if out_channels == 0 {
                    return Err(ConfigError::ConvChannels);
                }
            }
            Layer::MaxPool { ph, pw } => {
                if ph == 0 || pw == 0 {
                    return Err(ConfigError::PoolWindow { ph, pw });
                }
            }
            Layer::Dropout { rate } => {
                // NaN fails both comparisons and is rejected with the rest
                if !(rate > 0.0 && rate < 1.0) {
                    return Err(ConfigError::DropoutRate(rate));
                }
            }
            Layer::Flatten { .. } | Layer::Loss(_) => {}
        }
        Ok(())
    }

    /// Applies the layer's shape and parameter policy to `input`.
    ///
    /// Returns `(parameter_count, output_shape)`. The layer index is only
    /// used to label errors.
    pub(crate) fn fold(&self, index: usize, input: Shape) -> LinnetResult<(usize, Shape)> {
        match *self {
            Layer::Dense { out, .. } => {
                let flat_in = input.len();
                Ok((out * (flat_in + 1), Shape::d1(out)))
            }
            Layer::Conv {
                kh,
                kw,
                out_channels,
                ..
            } => {
                if input.rank() != 3 {
                    return Err(LinnetError::shape_mismatch(
                        index,
                        "convolution input rank",
                        &[kh, kw, 1],
                        input.dims(),
                    ));
                }
                let (h, w, c_in) = (input.height(), input.width(), input.channels());
                if h < kh || w < kw {
                    return Err(LinnetError::shape_mismatch(
                        index,
                        "convolution kernel extent",
                        &[kh, kw, c_in],
                        input.dims(),
                    ));
                }
                let count = kh * kw * c_in * out_channels + out_channels;
                let out = Shape::d3(h - kh + 1, w - kw + 1, out_channels);
                Ok((count, out))
            }
            Layer::MaxPool { ph, pw } => {
                if input.rank() != 3 {
                    return Err(LinnetError::shape_mismatch(
                        index,
                        "pooling input rank",
                        &[ph, pw, 1],
                        input.dims(),
                    ));
                }
                let out = Shape::d3(input.height() / ph, input.width() / pw, input.channels());
                if out.is_empty() {
                    return Err(LinnetError::shape_mismatch(
                        index,
                        "pooling window extent",
                        &[ph, pw, input.channels()],
                        input.dims(),
                    ));
                }
                Ok((0, out))
            }
            Layer::Dropout { .. } => Ok((0, input)),
            Layer::Flatten { from } => match input.flatten_from(from) {
                Some(out) => Ok((0, out)),
                None => Err(LinnetError::shape_mismatch(
                    index,
                    "flatten start dimension",
                    &[from + 1],
                    input.dims(),
                )),
            },
            Layer::Loss(_) => Ok((0, Shape::d1(1))),
        }
    }
}
