//! Chains and their static execution plans.
//!
//! A [`Chain`] is an ordered list of [`Layer`] descriptors, optionally bound
//! to a static input [`Shape`]. Binding the shape lets the planner run once
//! at construction: it folds every layer's shape policy, assigns each
//! parameterized layer a contiguous slice of the flat parameter vector and
//! fixes the scratch layout. The resulting [`Plan`] is cached on the chain,
//! so forward and gradient calls do no shape work at all. A chain built
//! without a static shape re-plans against each batch's shape instead.
//!
//! # Example
//!
//! ```rust
//! use linnet::{Activation, Chain, Layer, Shape};
//!
//! let chain = Chain::with_input(Shape::d3(28, 28, 1), vec![
//!     Layer::conv((5, 5), 6, Activation::Relu),
//!     Layer::max_pool(2, 2),
//!     Layer::flatten(0),
//!     Layer::dense(10, Activation::Identity),
//! ]).unwrap();
//!
//! assert_eq!(chain.output_shape().unwrap(), Shape::d1(10));
//! ```

use std::borrow::Cow;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::buffer::AlignedBuf;
use crate::config::ConfigError;
use crate::error::{LinnetError, LinnetResult};
use crate::layer::Layer;
use crate::loss::LossSpec;
use crate::shape::Shape;

/// Planned execution of one layer.
///
/// `offset..offset + len` is the layer's slice of the flat parameter
/// vector. Cache fields count per-example scratch elements the gradient
/// engine records at forward time for the backward walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) in_shape: Shape,
    pub(crate) out_shape: Shape,
    /// Per-example f32 cache elements (activation factors, dropout masks,
    /// log-sum-exp values).
    pub(crate) cache_f: usize,
    /// Per-example u32 cache elements (pooling argmax positions).
    pub(crate) cache_u: usize,
    /// In-place layers reuse their input block instead of allocating one.
    pub(crate) in_place: bool,
}

/// Shape, parameter and scratch layout of a chain, fixed before any data
/// flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub(crate) input: Shape,
    pub(crate) steps: Vec<LayerPlan>,
    pub(crate) n_params: usize,
    /// Output shape of the last non-loss layer.
    pub(crate) out_shape: Shape,
    /// Index of the terminal loss layer, when present.
    pub(crate) loss_index: Option<usize>,
}

impl Plan {
    /// Total parameter count of the chain.
    #[inline]
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// The input shape this plan was folded from.
    #[inline]
    pub fn input_shape(&self) -> Shape {
        self.input
    }

    /// Output shape of the last non-loss layer.
    #[inline]
    pub fn output_shape(&self) -> Shape {
        self.out_shape
    }

    /// Flat element count of the output.
    #[inline]
    pub fn output_len(&self) -> usize {
        self.out_shape.len()
    }

    /// Number of planned layers, the terminal loss included.
    #[inline]
    pub fn layer_count(&self) -> usize {
        self.steps.len()
    }

    /// Parameter range of layer `i` in the flat vector. Empty for
    /// parameterless layers.
    #[inline]
    pub fn layer_param_range(&self, i: usize) -> std::ops::Range<usize> {
        let step = &self.steps[i];
        step.offset..step.offset + step.len
    }

    /// Index of the last non-loss layer, when one exists.
    pub fn last_non_loss_layer(&self) -> Option<usize> {
        match self.loss_index {
            Some(i) => i.checked_sub(1),
            None => self.steps.len().checked_sub(1),
        }
    }

    /// Scratch lane sizes for a pass over `n` examples, in `(f32, u32)`
    /// elements. Gradient passes (`training`) additionally count the
    /// derived-value caches.
    pub fn scratch_sizes(&self, n: usize, training: bool) -> (usize, usize) {
        let mut f = n * self.input.len();
        let mut u = n; // example id lane
        for step in &self.steps {
            if !step.in_place {
                f += n * step.out_shape.len();
            }
            if training {
                f += n * step.cache_f;
                u += n * step.cache_u;
            }
        }
        (f, u)
    }

    #[inline]
    pub(crate) fn steps(&self) -> &[LayerPlan] {
        &self.steps
    }
}

/// Folds layer policies over `input`, producing the full execution plan.
fn build_plan(input: Shape, layers: &[Layer]) -> LinnetResult<Plan> {
    if input.is_empty() {
        return Err(ConfigError::ZeroDim.into());
    }

    let mut steps = Vec::with_capacity(layers.len());
    let mut shape = input;
    let mut offset = 0usize;
    let mut out_shape = input;
    let mut loss_index = None;

    for (i, layer) in layers.iter().enumerate() {
        let (len, next) = layer.fold(i, shape)?;

        let (cache_f, cache_u, in_place) = match layer {
            Layer::Dense { activation, .. } | Layer::Conv { activation, .. } => {
                let f = if activation.needs_cache() { next.len() } else { 0 };
                (f, 0, false)
            }
            Layer::MaxPool { .. } => (0, next.len(), false),
            Layer::Dropout { .. } => (shape.len(), 0, true),
            Layer::Flatten { .. } => (0, 0, true),
            Layer::Loss(spec) => {
                loss_index = Some(i);
                (spec.cache_per_example(), 0, true)
            }
        };

        steps.push(LayerPlan {
            offset,
            len,
            in_shape: shape,
            out_shape: next,
            cache_f,
            cache_u,
            in_place,
        });

        offset += len;
        if !layer.is_loss() {
            shape = next;
            out_shape = next;
        }
    }

    Ok(Plan {
        input,
        steps,
        n_params: offset,
        out_shape,
        loss_index,
    })
}

/// An ordered stack of layers, optionally bound to a static input shape.
///
/// Chains are cheap to clone; layer descriptors are small and loss targets
/// are reference-counted.
#[derive(Debug, Clone)]
pub struct Chain {
    input: Option<Shape>,
    layers: Vec<Layer>,
    plan: Option<Plan>,
}

impl Chain {
    /// Builds a chain without a static input shape.
    ///
    /// Shape folding is deferred to the first call that sees a batch.
    /// Configuration errors (zero widths, out-of-range dropout rates, a
    /// loss layer before the end) are still caught here.
    pub fn new(layers: Vec<Layer>) -> LinnetResult<Self> {
        validate_layers(&layers)?;
        Ok(Chain {
            input: None,
            layers,
            plan: None,
        })
    }

    /// Builds a chain with a static input shape and plans it immediately.
    ///
    /// All shape errors surface here rather than at the first forward call.
    pub fn with_input(input: Shape, layers: Vec<Layer>) -> LinnetResult<Self> {
        validate_layers(&layers)?;
        let plan = build_plan(input, &layers)?;
        Ok(Chain {
            input: Some(input),
            layers,
            plan: Some(plan),
        })
    }

    /// Appends a terminal loss layer, consuming and returning the chain.
    ///
    /// ```rust
    /// use linnet::{Activation, Chain, Layer, LossSpec, Shape};
    ///
    /// let chain = Chain::with_input(Shape::d1(4), vec![
    ///     Layer::dense(3, Activation::Identity),
    /// ]).unwrap()
    /// .add_loss(LossSpec::logit_cross_entropy(vec![0, 2, 1])).unwrap();
    ///
    /// assert!(chain.loss().is_some());
    /// ```
    pub fn add_loss(mut self, spec: LossSpec) -> LinnetResult<Self> {
        if self.layers.iter().any(Layer::is_loss) {
            return Err(ConfigError::LossNotTerminal.into());
        }
        self.layers.push(Layer::Loss(spec));
        if let Some(input) = self.input {
            self.plan = Some(build_plan(input, &self.layers)?);
        }
        Ok(self)
    }

    /// The chain's layers in order.
    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The static input shape, when one was bound.
    #[inline]
    pub fn input_shape(&self) -> Option<Shape> {
        self.input
    }

    /// The terminal loss spec, when one was added.
    pub fn loss(&self) -> Option<&LossSpec> {
        match self.layers.last() {
            Some(Layer::Loss(spec)) => Some(spec),
            _ => None,
        }
    }

    /// The cached plan of a static chain.
    pub fn plan(&self) -> LinnetResult<&Plan> {
        self.plan
            .as_ref()
            .ok_or_else(|| ConfigError::MissingInputShape.into())
    }

    /// Plans the chain against an explicit input shape.
    pub fn plan_for(&self, input: Shape) -> LinnetResult<Plan> {
        build_plan(input, &self.layers)
    }

    /// Total parameter count of a static chain.
    pub fn param_count(&self) -> LinnetResult<usize> {
        Ok(self.plan()?.n_params())
    }

    /// Total parameter count against an explicit input shape.
    pub fn param_count_for(&self, input: Shape) -> LinnetResult<usize> {
        Ok(self.plan_for(input)?.n_params())
    }

    /// Output shape of a static chain (before the loss layer).
    pub fn output_shape(&self) -> LinnetResult<Shape> {
        Ok(self.plan()?.output_shape())
    }

    /// Freshly initialized parameters for a static chain.
    ///
    /// Dense weights draw from a normal distribution with Glorot variance
    /// `2 / (fan_in + fan_out)`; convolution weights draw uniformly from
    /// the matching Glorot bound. All biases start at zero. The same seed
    /// yields the same parameters.
    pub fn init_params<R: Rng>(&self, rng: &mut R) -> LinnetResult<AlignedBuf> {
        Ok(init_from_plan(self.plan()?, &self.layers, rng))
    }

    /// Freshly initialized parameters against an explicit input shape.
    pub fn init_params_for<R: Rng>(&self, input: Shape, rng: &mut R) -> LinnetResult<AlignedBuf> {
        Ok(init_from_plan(&self.plan_for(input)?, &self.layers, rng))
    }

    /// Borrows the cached plan or folds one for the batch shape.
    pub(crate) fn resolve(&self, batch: Option<Shape>) -> LinnetResult<Cow<'_, Plan>> {
        match (&self.plan, batch) {
            (Some(plan), Some(shape)) => {
                if plan.input != shape {
                    return Err(LinnetError::input_shape(plan.input.dims(), shape.dims()));
                }
                Ok(Cow::Borrowed(plan))
            }
            (Some(plan), None) => Ok(Cow::Borrowed(plan)),
            (None, Some(shape)) => Ok(Cow::Owned(build_plan(shape, &self.layers)?)),
            (None, None) => Err(ConfigError::MissingInputShape.into()),
        }
    }
}

fn validate_layers(layers: &[Layer]) -> Result<(), ConfigError> {
    for (i, layer) in layers.iter().enumerate() {
        layer.validate()?;
        if layer.is_loss() && i + 1 != layers.len() {
            return Err(ConfigError::LossNotTerminal);
        }
    }
    Ok(())
}

fn init_from_plan<R: Rng>(plan: &Plan, layers: &[Layer], rng: &mut R) -> AlignedBuf {
    let mut buf = AlignedBuf::zeroed(plan.n_params());
    let params = buf.as_mut_slice();

    for (layer, step) in layers.iter().zip(plan.steps()) {
        match *layer {
            Layer::Dense { out, .. } => {
                let flat_in = step.in_shape.len();
                let std = (2.0 / (flat_in + out) as f32).sqrt();
                let weights = &mut params[step.offset..step.offset + out * flat_in];
                for w in weights.iter_mut() {
                    let z: f32 = rng.sample(StandardNormal);
                    *w = z * std;
                }
                // biases stay zero
            }
            Layer::Conv {
                kh,
                kw,
                out_channels,
                ..
            } => {
                let c_in = step.in_shape.channels();
                let fan_in = kh * kw * c_in;
                let fan_out = kh * kw * out_channels;
                let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
                let weights = &mut params[step.offset..step.offset + fan_in * out_channels];
                for w in weights.iter_mut() {
                    *w = rng.gen_range(-bound..bound);
                }
            }
            _ => {}
        }
    }

    buf
}
