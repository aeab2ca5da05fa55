//! Fused value-and-gradient evaluation.
//!
//! One call to [`valgrad`] runs the forward walk and the backward walk over
//! a single [`Scratch`], returning the summed loss and accumulating
//! parameter gradients. The engine is built around a destructive buffer
//! discipline:
//!
//! - the forward walk gathers the addressed examples into scratch, then
//!   writes each layer's output into a fresh block while recording the
//!   derived values the backward walk will need (activation slopes, dropout
//!   masks, pooling argmax positions, per-row log-sum-exp);
//! - the backward walk runs the layers in reverse, and each step may
//!   overwrite both its incoming adjoint block and its forward input block.
//!   Adjoints reuse activation storage, so the walk never allocates.
//!
//! Nothing here touches caller data: batches are read-only and parameter
//! gradients are the only output written outside the scratch.
//!
//! [`predict`] runs the forward walk alone in inference mode, where dropout
//! scales by its keep probability instead of sampling a mask.

#![allow(clippy::too_many_arguments)]

use rand::Rng;

use crate::batch::Batch;
use crate::buffer::{Scratch, Step};
use crate::chain::{Chain, LayerPlan, Plan};
use crate::config::ConfigError;
use crate::error::{LinnetError, LinnetResult};
use crate::kernel;
use crate::layer::{Activation, Layer};
use crate::loss::{self, LossSpec, Targets};
use crate::shape::Shape;

/// One engine invocation bound to a plan, parameters and batch data.
pub(crate) struct EngineInput<'a> {
    pub(crate) plan: &'a Plan,
    pub(crate) layers: &'a [Layer],
    pub(crate) params: &'a [f32],
    pub(crate) data: &'a [f32],
    /// Absolute example ids to process; `None` walks `base..base + n`.
    pub(crate) ids: Option<&'a [u32]>,
    /// Absolute position of `data`'s first example.
    pub(crate) base: usize,
    pub(crate) n: usize,
}

/// Computes the summed loss over `batch` and writes the parameter gradient
/// into `grad`.
///
/// The chain must end in a loss layer. `grad` is overwritten, not
/// accumulated into. Dropout layers draw their masks from `rng`, which is
/// the only source of nondeterminism; a fixed seed reproduces the call
/// exactly.
///
/// # Example
///
/// ```rust
/// use linnet::{Activation, Batch, Chain, Layer, LossSpec, Scratch, Shape};
/// use rand::rngs::SmallRng;
/// use rand::SeedableRng;
///
/// # fn main() -> linnet::LinnetResult<()> {
/// let chain = Chain::with_input(Shape::d1(2), vec![
///     Layer::dense(1, Activation::Identity),
/// ])?
/// .add_loss(LossSpec::squared_error(vec![4.0]))?;
///
/// let params = vec![0.0f32; 3];
/// let mut grad = vec![0.0f32; 3];
/// let data = [1.0f32, 1.0];
/// let batch = Batch::new(&data, Shape::d1(2))?;
///
/// let mut scratch = Scratch::new();
/// let mut rng = SmallRng::seed_from_u64(0);
/// let loss = linnet::valgrad(&mut grad, &params, &chain, &batch, &mut scratch, &mut rng)?;
/// assert_eq!(loss, 16.0);
/// assert_eq!(grad, [-8.0, -8.0, -8.0]);
/// # Ok(())
/// # }
/// ```
pub fn valgrad<R: Rng>(
    grad: &mut [f32],
    params: &[f32],
    chain: &Chain,
    batch: &Batch<'_>,
    scratch: &mut Scratch,
    rng: &mut R,
) -> LinnetResult<f32> {
    if batch.is_empty() {
        return Err(LinnetError::EmptyBatch);
    }
    let plan = chain.resolve(Some(batch.shape()))?;
    if params.len() != plan.n_params() {
        return Err(LinnetError::parameter_size(plan.n_params(), params.len()));
    }
    if grad.len() != plan.n_params() {
        return Err(LinnetError::parameter_size(plan.n_params(), grad.len()));
    }
    let spec = chain.loss().ok_or(ConfigError::MissingLoss)?;
    spec.validate(plan.output_len(), batch.base() + batch.len())?;

    grad.fill(0.0);
    let input = EngineInput {
        plan: &*plan,
        layers: chain.layers(),
        params,
        data: batch.data(),
        ids: None,
        base: batch.base(),
        n: batch.len(),
    };
    let loss = train_pass(&input, grad, scratch, rng)?;
    Ok(loss as f32)
}

/// Runs the chain forward in inference mode, writing the final activations
/// into `out` (`batch.len() * output_len` elements, example-major).
///
/// A terminal loss layer, if present, is skipped.
pub fn predict(
    chain: &Chain,
    params: &[f32],
    batch: &Batch<'_>,
    out: &mut [f32],
    scratch: &mut Scratch,
) -> LinnetResult<()> {
    if batch.is_empty() {
        return Err(LinnetError::EmptyBatch);
    }
    let plan = chain.resolve(Some(batch.shape()))?;
    if params.len() != plan.n_params() {
        return Err(LinnetError::parameter_size(plan.n_params(), params.len()));
    }
    let expected = batch.len() * plan.output_len();
    if out.len() != expected {
        return Err(LinnetError::output_size(expected, out.len()));
    }

    let input = EngineInput {
        plan: &*plan,
        layers: chain.layers(),
        params,
        data: batch.data(),
        ids: None,
        base: batch.base(),
        n: batch.len(),
    };
    let final_off = infer_forward(&input, scratch)?;
    let (f, _) = scratch.lanes_mut();
    out.copy_from_slice(&f[final_off..final_off + expected]);
    Ok(())
}

fn loss_spec<'a>(input: &EngineInput<'a>) -> LinnetResult<&'a LossSpec> {
    match input.plan.loss_index.and_then(|i| input.layers.get(i)) {
        Some(Layer::Loss(spec)) => Ok(spec),
        _ => Err(ConfigError::MissingLoss.into()),
    }
}

#[inline]
fn alloc(top: &mut usize, len: usize) -> usize {
    let off = *top;
    *top += len;
    off
}

fn fill_ids(ids: &mut [u32], source: Option<&[u32]>, base: usize) {
    match source {
        Some(src) => {
            debug_assert_eq!(ids.len(), src.len());
            ids.copy_from_slice(src);
        }
        None => {
            for (j, id) in ids.iter_mut().enumerate() {
                *id = (base + j) as u32;
            }
        }
    }
}

/// Copies the addressed examples into scratch, in id order. This is the
/// only place batch data is read; everything downstream works on the copy.
fn gather(f: &mut [f32], b0: usize, in_len: usize, ids: &[u32], base: usize, data: &[f32]) {
    for (j, &id) in ids.iter().enumerate() {
        let row = id as usize - base;
        let src = &data[row * in_len..(row + 1) * in_len];
        f[b0 + j * in_len..b0 + (j + 1) * in_len].copy_from_slice(src);
    }
}

#[inline]
fn split_params<'p>(params: &'p [f32], step: &LayerPlan, w_len: usize) -> (&'p [f32], &'p [f32]) {
    params[step.offset..step.offset + step.len].split_at(w_len)
}

/// Forward and backward over one example group, accumulating into `grad`.
///
/// Returns the summed loss. `grad` must be zeroed by the caller when
/// accumulation across calls is not wanted.
pub(crate) fn train_pass<R: Rng>(
    input: &EngineInput<'_>,
    grad: &mut [f32],
    scratch: &mut Scratch,
    rng: &mut R,
) -> LinnetResult<f64> {
    let plan = input.plan;
    let n = input.n;
    debug_assert!(n > 0);
    debug_assert_eq!(grad.len(), plan.n_params());

    let spec = loss_spec(input)?;

    let (f_need, u_need) = plan.scratch_sizes(n, true);
    scratch.ensure(f_need, u_need);
    let mut steps = std::mem::take(&mut scratch.steps);
    steps.clear();
    steps.reserve(plan.steps().len());

    let (f, u) = scratch.lanes_mut();
    let f = &mut f[..f_need];
    let u = &mut u[..u_need];

    let mut ftop = 0usize;
    let mut utop = 0usize;

    let ids_off = alloc(&mut utop, n);
    fill_ids(&mut u[ids_off..ids_off + n], input.ids, input.base);

    let in_len = plan.input_shape().len();
    let b0 = alloc(&mut ftop, n * in_len);
    gather(f, b0, in_len, &u[..n], input.base, input.data);

    // forward walk
    let mut cur = b0;
    let mut loss_sum = 0.0f64;

    for (layer, step) in input.layers.iter().zip(plan.steps()) {
        match layer {
            Layer::Dense { out, activation } => {
                let d_in = step.in_shape.len();
                let out_off = alloc(&mut ftop, n * out);
                let cache = activation
                    .needs_cache()
                    .then(|| alloc(&mut ftop, n * out));
                let (w, b) = split_params(input.params, step, out * d_in);
                dense_forward(f, w, b, cur, out_off, cache, n, d_in, *out, *activation);
                steps.push(Step {
                    in_off: cur,
                    out_off,
                    cache,
                    idx: None,
                });
                cur = out_off;
            }
            Layer::Conv {
                kh,
                kw,
                out_channels,
                activation,
            } => {
                let out_elems = step.out_shape.len();
                let out_off = alloc(&mut ftop, n * out_elems);
                let cache = activation
                    .needs_cache()
                    .then(|| alloc(&mut ftop, n * out_elems));
                let w_len = kh * kw * step.in_shape.channels() * out_channels;
                let (w, b) = split_params(input.params, step, w_len);
                conv_forward(
                    f,
                    w,
                    b,
                    cur,
                    out_off,
                    cache,
                    n,
                    step.in_shape,
                    *kh,
                    *kw,
                    *out_channels,
                    *activation,
                );
                steps.push(Step {
                    in_off: cur,
                    out_off,
                    cache,
                    idx: None,
                });
                cur = out_off;
            }
            Layer::MaxPool { ph, pw } => {
                let out_elems = step.out_shape.len();
                let out_off = alloc(&mut ftop, n * out_elems);
                let idx_off = alloc(&mut utop, n * out_elems);
                pool_forward(
                    f,
                    Some(&mut u[idx_off..idx_off + n * out_elems]),
                    cur,
                    out_off,
                    n,
                    step.in_shape,
                    *ph,
                    *pw,
                );
                steps.push(Step {
                    in_off: cur,
                    out_off,
                    cache: None,
                    idx: Some(idx_off),
                });
                cur = out_off;
            }
            Layer::Dropout { rate } => {
                let len = n * step.in_shape.len();
                let mask_off = alloc(&mut ftop, len);
                dropout_forward(f, cur, mask_off, len, *rate, rng);
                steps.push(Step {
                    in_off: cur,
                    out_off: cur,
                    cache: Some(mask_off),
                    idx: None,
                });
            }
            Layer::Flatten { .. } => {
                steps.push(Step {
                    in_off: cur,
                    out_off: cur,
                    cache: None,
                    idx: None,
                });
            }
            Layer::Loss(spec) => {
                let d = step.in_shape.len();
                let mut cache = None;
                loss_sum = match spec.targets() {
                    Targets::Values(values) => {
                        loss::squared_loss(&f[cur..cur + n * d], d, &u[..n], values)
                    }
                    Targets::Classes(classes) => {
                        let lse_off = alloc(&mut ftop, n);
                        cache = Some(lse_off);
                        let (head, tail) = f.split_at_mut(lse_off);
                        loss::ce_forward(&head[cur..cur + n * d], d, &u[..n], classes, &mut tail[..n])
                    }
                };
                steps.push(Step {
                    in_off: cur,
                    out_off: cur,
                    cache,
                    idx: None,
                });
            }
        }
    }

    debug_assert_eq!(ftop, f_need);
    debug_assert_eq!(utop, u_need);

    // backward walk; adjoints overwrite forward blocks layer by layer
    for i in (0..steps.len()).rev() {
        let rec = steps[i];
        let step = &plan.steps()[i];
        match &input.layers[i] {
            Layer::Loss(_) => {
                let d = step.in_shape.len();
                match spec.targets() {
                    Targets::Values(values) => {
                        loss::squared_backward(&mut f[rec.in_off..rec.in_off + n * d], d, &u[..n], values);
                    }
                    Targets::Classes(classes) => {
                        debug_assert!(rec.cache.is_some());
                        if let Some(lse_off) = rec.cache {
                            let (head, tail) = f.split_at_mut(lse_off);
                            loss::ce_backward(
                                &mut head[rec.in_off..rec.in_off + n * d],
                                d,
                                &u[..n],
                                classes,
                                &tail[..n],
                            );
                        }
                    }
                }
            }
            Layer::Dense { out, .. } => {
                let d_in = step.in_shape.len();
                if let Some(cache_off) = rec.cache {
                    apply_factor(f, rec.out_off, cache_off, n * out);
                }
                let w_len = out * d_in;
                let (w, _) = split_params(input.params, step, w_len);
                let layer_grad = &mut grad[step.offset..step.offset + step.len];
                let (gw, gb) = layer_grad.split_at_mut(w_len);
                dense_backward(f, w, gw, gb, rec.in_off, rec.out_off, n, d_in, *out);
            }
            Layer::Conv {
                kh,
                kw,
                out_channels,
                ..
            } => {
                let out_elems = step.out_shape.len();
                if let Some(cache_off) = rec.cache {
                    apply_factor(f, rec.out_off, cache_off, n * out_elems);
                }
                let w_len = kh * kw * step.in_shape.channels() * out_channels;
                let (w, _) = split_params(input.params, step, w_len);
                let layer_grad = &mut grad[step.offset..step.offset + step.len];
                let (gw, gb) = layer_grad.split_at_mut(w_len);
                conv_backward(
                    f,
                    w,
                    gw,
                    gb,
                    rec.in_off,
                    rec.out_off,
                    n,
                    step.in_shape,
                    *kh,
                    *kw,
                    *out_channels,
                );
            }
            Layer::MaxPool { .. } => {
                debug_assert!(rec.idx.is_some());
                if let Some(idx_off) = rec.idx {
                    let in_elems = step.in_shape.len();
                    let out_elems = step.out_shape.len();
                    pool_backward(
                        f,
                        &u[idx_off..idx_off + n * out_elems],
                        rec.in_off,
                        rec.out_off,
                        n,
                        in_elems,
                        out_elems,
                    );
                }
            }
            Layer::Dropout { .. } => {
                debug_assert!(rec.cache.is_some());
                if let Some(mask_off) = rec.cache {
                    apply_factor(f, rec.out_off, mask_off, n * step.in_shape.len());
                }
            }
            Layer::Flatten { .. } => {}
        }
    }

    scratch.set_used(ftop, utop);
    scratch.steps = steps;
    Ok(loss_sum)
}

/// Forward walk in inference mode. Returns the offset of the final
/// activations (before any loss layer) in the scratch f32 lane.
fn infer_forward(input: &EngineInput<'_>, scratch: &mut Scratch) -> LinnetResult<usize> {
    let plan = input.plan;
    let n = input.n;
    debug_assert!(n > 0);

    let (f_need, u_need) = plan.scratch_sizes(n, false);
    scratch.ensure(f_need, u_need);
    let (f, u) = scratch.lanes_mut();
    let f = &mut f[..f_need];
    let u = &mut u[..u_need];

    let mut ftop = 0usize;
    fill_ids(&mut u[..n], input.ids, input.base);

    let in_len = plan.input_shape().len();
    let b0 = alloc(&mut ftop, n * in_len);
    gather(f, b0, in_len, &u[..n], input.base, input.data);

    let mut cur = b0;
    for (layer, step) in input.layers.iter().zip(plan.steps()) {
        match layer {
            Layer::Dense { out, activation } => {
                let d_in = step.in_shape.len();
                let out_off = alloc(&mut ftop, n * out);
                let (w, b) = split_params(input.params, step, out * d_in);
                dense_forward(f, w, b, cur, out_off, None, n, d_in, *out, *activation);
                cur = out_off;
            }
            Layer::Conv {
                kh,
                kw,
                out_channels,
                activation,
            } => {
                let out_off = alloc(&mut ftop, n * step.out_shape.len());
                let w_len = kh * kw * step.in_shape.channels() * out_channels;
                let (w, b) = split_params(input.params, step, w_len);
                conv_forward(
                    f,
                    w,
                    b,
                    cur,
                    out_off,
                    None,
                    n,
                    step.in_shape,
                    *kh,
                    *kw,
                    *out_channels,
                    *activation,
                );
                cur = out_off;
            }
            Layer::MaxPool { ph, pw } => {
                let out_off = alloc(&mut ftop, n * step.out_shape.len());
                pool_forward(f, None, cur, out_off, n, step.in_shape, *ph, *pw);
                cur = out_off;
            }
            Layer::Dropout { rate } => {
                // keep scaling instead of sampling
                let len = n * step.in_shape.len();
                kernel::scale(&mut f[cur..cur + len], 1.0 - rate);
            }
            Layer::Flatten { .. } | Layer::Loss(_) => {}
        }
    }

    debug_assert_eq!(ftop, f_need);
    scratch.set_used(ftop, n);
    Ok(cur)
}

/// Inference forward plus loss and accuracy against the chain's targets.
///
/// Returns `(summed loss, correct count)`.
pub(crate) fn eval_pass(input: &EngineInput<'_>, scratch: &mut Scratch) -> LinnetResult<(f64, usize)> {
    let spec = loss_spec(input)?;
    let final_off = infer_forward(input, scratch)?;

    let n = input.n;
    let d = input.plan.output_len();
    let (f, u) = scratch.lanes_mut();
    let z = &f[final_off..final_off + n * d];
    let ids = &u[..n];

    let loss = match spec.targets() {
        Targets::Values(values) => loss::squared_loss(z, d, ids, values),
        Targets::Classes(classes) => loss::ce_loss(z, d, ids, classes),
    };
    let correct = loss::count_correct(z, d, ids, spec.targets());
    Ok((loss, correct))
}

fn dense_forward(
    f: &mut [f32],
    w: &[f32],
    b: &[f32],
    in_off: usize,
    out_off: usize,
    cache: Option<usize>,
    n: usize,
    d_in: usize,
    d_out: usize,
    act: Activation,
) {
    debug_assert!(in_off + n * d_in <= out_off);
    let (head, tail) = f.split_at_mut(out_off);
    let x_all = &head[in_off..in_off + n * d_in];
    let (y_all, rest) = tail.split_at_mut(n * d_out);

    for j in 0..n {
        let x = &x_all[j * d_in..(j + 1) * d_in];
        let y = &mut y_all[j * d_out..(j + 1) * d_out];
        for (o, y_o) in y.iter_mut().enumerate() {
            let z = b[o] + kernel::dot(&w[o * d_in..(o + 1) * d_in], x);
            *y_o = act.eval(z);
        }
    }

    if let Some(cache_off) = cache {
        // the factor cache sits directly after the output block
        debug_assert_eq!(cache_off, out_off + n * d_out);
        for (c, y) in rest[..n * d_out].iter_mut().zip(y_all.iter()) {
            *c = act.grad_factor(*y);
        }
    }
}

/// Parameter gradients first, then the input adjoint overwrites the inputs.
fn dense_backward(
    f: &mut [f32],
    w: &[f32],
    grad_w: &mut [f32],
    grad_b: &mut [f32],
    in_off: usize,
    out_off: usize,
    n: usize,
    d_in: usize,
    d_out: usize,
) {
    let (head, tail) = f.split_at_mut(out_off);
    let x_all = &mut head[in_off..in_off + n * d_in];
    let delta_all = &tail[..n * d_out];

    for j in 0..n {
        let x = &x_all[j * d_in..(j + 1) * d_in];
        let delta = &delta_all[j * d_out..(j + 1) * d_out];
        for (o, &d) in delta.iter().enumerate() {
            grad_b[o] += d;
            kernel::axpy(d, x, &mut grad_w[o * d_in..(o + 1) * d_in]);
        }
    }

    for j in 0..n {
        let delta = &delta_all[j * d_out..(j + 1) * d_out];
        let xbar = &mut x_all[j * d_in..(j + 1) * d_in];
        xbar.fill(0.0);
        for (o, &d) in delta.iter().enumerate() {
            kernel::axpy(d, &w[o * d_in..(o + 1) * d_in], xbar);
        }
    }
}

/// Multiplies a value block by its cached factor block elementwise. Serves
/// both activation slopes and dropout masks.
fn apply_factor(f: &mut [f32], value_off: usize, factor_off: usize, len: usize) {
    debug_assert!(value_off + len <= factor_off);
    let (head, tail) = f.split_at_mut(factor_off);
    let values = &mut head[value_off..value_off + len];
    for (v, factor) in values.iter_mut().zip(&tail[..len]) {
        *v *= factor;
    }
}

fn conv_forward(
    f: &mut [f32],
    w: &[f32],
    b: &[f32],
    in_off: usize,
    out_off: usize,
    cache: Option<usize>,
    n: usize,
    in_shape: Shape,
    kh: usize,
    kw: usize,
    oc: usize,
    act: Activation,
) {
    let (ih, iw, ic) = (in_shape.height(), in_shape.width(), in_shape.channels());
    let oh = ih - kh + 1;
    let ow = iw - kw + 1;
    let in_elems = ih * iw * ic;
    let out_elems = oh * ow * oc;

    let (head, tail) = f.split_at_mut(out_off);
    let x_all = &head[in_off..in_off + n * in_elems];
    let (y_all, rest) = tail.split_at_mut(n * out_elems);

    for j in 0..n {
        let x = &x_all[j * in_elems..(j + 1) * in_elems];
        let y = &mut y_all[j * out_elems..(j + 1) * out_elems];

        for px in y.chunks_exact_mut(oc) {
            px.copy_from_slice(b);
        }
        for oy in 0..oh {
            for ox in 0..ow {
                let out_px = &mut y[(oy * ow + ox) * oc..(oy * ow + ox + 1) * oc];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = ((oy + ky) * iw + (ox + kx)) * ic;
                        for ci in 0..ic {
                            let w_row = ((ky * kw + kx) * ic + ci) * oc;
                            kernel::axpy(x[row + ci], &w[w_row..w_row + oc], out_px);
                        }
                    }
                }
            }
        }
    }

    if act.needs_cache() {
        for y in y_all.iter_mut() {
            *y = act.eval(*y);
        }
    }
    if let Some(cache_off) = cache {
        debug_assert_eq!(cache_off, out_off + n * out_elems);
        for (c, y) in rest[..n * out_elems].iter_mut().zip(y_all.iter()) {
            *c = act.grad_factor(*y);
        }
    }
}

fn conv_backward(
    f: &mut [f32],
    w: &[f32],
    grad_w: &mut [f32],
    grad_b: &mut [f32],
    in_off: usize,
    out_off: usize,
    n: usize,
    in_shape: Shape,
    kh: usize,
    kw: usize,
    oc: usize,
) {
    let (ih, iw, ic) = (in_shape.height(), in_shape.width(), in_shape.channels());
    let oh = ih - kh + 1;
    let ow = iw - kw + 1;
    let in_elems = ih * iw * ic;
    let out_elems = oh * ow * oc;

    let (head, tail) = f.split_at_mut(out_off);
    let x_all = &mut head[in_off..in_off + n * in_elems];
    let delta_all = &tail[..n * out_elems];

    for j in 0..n {
        let x = &x_all[j * in_elems..(j + 1) * in_elems];
        let delta = &delta_all[j * out_elems..(j + 1) * out_elems];

        for d_px in delta.chunks_exact(oc) {
            kernel::add_assign(grad_b, d_px);
        }
        for oy in 0..oh {
            for ox in 0..ow {
                let d_px = &delta[(oy * ow + ox) * oc..(oy * ow + ox + 1) * oc];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = ((oy + ky) * iw + (ox + kx)) * ic;
                        for ci in 0..ic {
                            let w_row = ((ky * kw + kx) * ic + ci) * oc;
                            kernel::axpy(x[row + ci], d_px, &mut grad_w[w_row..w_row + oc]);
                        }
                    }
                }
            }
        }
    }

    x_all.fill(0.0);
    for j in 0..n {
        let delta = &delta_all[j * out_elems..(j + 1) * out_elems];
        let xbar = &mut x_all[j * in_elems..(j + 1) * in_elems];
        for oy in 0..oh {
            for ox in 0..ow {
                let d_px = &delta[(oy * ow + ox) * oc..(oy * ow + ox + 1) * oc];
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = ((oy + ky) * iw + (ox + kx)) * ic;
                        for ci in 0..ic {
                            let w_row = ((ky * kw + kx) * ic + ci) * oc;
                            xbar[row + ci] += kernel::dot(d_px, &w[w_row..w_row + oc]);
                        }
                    }
                }
            }
        }
    }
}

fn pool_forward(
    f: &mut [f32],
    mut idx: Option<&mut [u32]>,
    in_off: usize,
    out_off: usize,
    n: usize,
    in_shape: Shape,
    ph: usize,
    pw: usize,
) {
    let (ih, iw, c) = (in_shape.height(), in_shape.width(), in_shape.channels());
    let oh = ih / ph;
    let ow = iw / pw;
    let in_elems = ih * iw * c;
    let out_elems = oh * ow * c;

    let (head, tail) = f.split_at_mut(out_off);
    let x_all = &head[in_off..in_off + n * in_elems];
    let y_all = &mut tail[..n * out_elems];

    for j in 0..n {
        let x = &x_all[j * in_elems..(j + 1) * in_elems];
        let y = &mut y_all[j * out_elems..(j + 1) * out_elems];
        for oy in 0..oh {
            for ox in 0..ow {
                for ch in 0..c {
                    let mut best = f32::NEG_INFINITY;
                    let mut best_i = 0usize;
                    for py in 0..ph {
                        for px in 0..pw {
                            // first maximum wins on ties
                            let ii = ((oy * ph + py) * iw + (ox * pw + px)) * c + ch;
                            if x[ii] > best {
                                best = x[ii];
                                best_i = ii;
                            }
                        }
                    }
                    let o = (oy * ow + ox) * c + ch;
                    y[o] = best;
                    if let Some(ids) = idx.as_deref_mut() {
                        ids[j * out_elems + o] = best_i as u32;
                    }
                }
            }
        }
    }
}

/// Routes each adjoint back to its argmax position; everything else in the
/// input block becomes zero.
fn pool_backward(
    f: &mut [f32],
    idx: &[u32],
    in_off: usize,
    out_off: usize,
    n: usize,
    in_elems: usize,
    out_elems: usize,
) {
    let (head, tail) = f.split_at_mut(out_off);
    let x_all = &mut head[in_off..in_off + n * in_elems];
    let delta_all = &tail[..n * out_elems];

    x_all.fill(0.0);
    for j in 0..n {
        let xbar = &mut x_all[j * in_elems..(j + 1) * in_elems];
        let delta = &delta_all[j * out_elems..(j + 1) * out_elems];
        let ids = &idx[j * out_elems..(j + 1) * out_elems];
        for (o, &d) in delta.iter().enumerate() {
            xbar[ids[o] as usize] += d;
        }
    }
}

/// Gradient-mode dropout: zeroes with probability `rate`, keeps survivors
/// unscaled, and records the 0/1 mask for the backward walk.
fn dropout_forward<R: Rng>(
    f: &mut [f32],
    off: usize,
    mask_off: usize,
    len: usize,
    rate: f32,
    rng: &mut R,
) {
    debug_assert!(off + len <= mask_off);
    let (head, tail) = f.split_at_mut(mask_off);
    let x = &mut head[off..off + len];
    let mask = &mut tail[..len];
    for (v, m) in x.iter_mut().zip(mask.iter_mut()) {
        if rng.gen::<f32>() < rate {
            *v = 0.0;
            *m = 0.0;
        } else {
            *m = 1.0;
        }
    }
}
