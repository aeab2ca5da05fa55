//! Numerical Gradient Checking for the Fused Backward Walk
//!
//! Verifies that the analytical gradients accumulated by `valgrad` match
//! numerical gradients computed via central difference approximation.
//!
//! # Methodology
//!
//! For each parameter `w`, we compute:
//! - Analytical gradient: one `valgrad` call
//! - Numerical gradient: `(L(w+ε) - L(w-ε)) / (2ε)`
//!
//! Chains whose loss is piecewise polynomial in a single parameter (identity
//! and ReLU activations, frozen pooling argmax) get a tight 1e-4 relative
//! tolerance; smooth nonlinear chains (tanh, cross-entropy) use 1e-2. ReLU
//! and pooling cases are pinned to inputs whose pre-activation margins are
//! larger than any ε-induced shift, so no kink is crossed during the check.
//!
//! # Reference
//!
//! See: https://cs231n.github.io/neural-networks-3/#gradcheck

use linnet::{valgrad, Activation, Batch, Chain, Layer, LossSpec, Scratch, Shape};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Small constant to prevent division by zero in relative error.
const DELTA: f32 = 1e-8;

/// For small gradients (|grad| < this threshold), we use absolute error instead.
const SMALL_GRAD_THRESHOLD: f32 = 1e-3;

/// Maximum absolute error for small gradients.
const MAX_ABSOLUTE_ERROR: f32 = 1e-5;

/// Minimum fraction of checks that must pass.
const MIN_PASS_RATE: f32 = 0.95;

/// Computes relative error between two values.
fn relative_error(ana: f32, num: f32) -> f32 {
    (ana - num).abs() / (ana.abs() + num.abs() + DELTA)
}

/// Checks one gradient entry. Small gradients use absolute error, larger
/// ones relative error against `max_rel`.
fn gradient_check_passes(ana: f32, num: f32, max_rel: f32) -> bool {
    let abs_err = (ana - num).abs();
    let max_abs = ana.abs().max(num.abs());

    if max_abs < SMALL_GRAD_THRESHOLD {
        abs_err < MAX_ABSOLUTE_ERROR
    } else {
        relative_error(ana, num) < max_rel
    }
}

/// Summed loss for a parameter vector, via the same path training uses.
fn loss_at(chain: &Chain, params: &[f32], batch: &Batch<'_>) -> f32 {
    let mut grad = vec![0.0f32; params.len()];
    let mut scratch = Scratch::new();
    let mut rng = SmallRng::seed_from_u64(0);
    valgrad(&mut grad, params, chain, batch, &mut scratch, &mut rng).unwrap()
}

fn analytic_gradient(chain: &Chain, params: &[f32], batch: &Batch<'_>) -> Vec<f32> {
    let mut grad = vec![0.0f32; params.len()];
    let mut scratch = Scratch::new();
    let mut rng = SmallRng::seed_from_u64(0);
    valgrad(&mut grad, params, chain, batch, &mut scratch, &mut rng).unwrap();
    grad
}

/// Central difference through the full engine for one parameter.
fn numerical_gradient(
    chain: &Chain,
    params: &[f32],
    batch: &Batch<'_>,
    idx: usize,
    eps: f32,
) -> f32 {
    let mut perturbed = params.to_vec();
    perturbed[idx] = params[idx] + eps;
    let loss_plus = loss_at(chain, &perturbed, batch) as f64;
    perturbed[idx] = params[idx] - eps;
    let loss_minus = loss_at(chain, &perturbed, batch) as f64;
    ((loss_plus - loss_minus) / (2.0 * eps as f64)) as f32
}

/// Checks every parameter of `chain` against central differences.
fn run_gradient_check(
    chain: &Chain,
    params: &[f32],
    batch: &Batch<'_>,
    eps: f32,
    max_rel: f32,
    test_name: &str,
) {
    println!("\n=== Gradient Check: {} ===", test_name);
    let ana = analytic_gradient(chain, params, batch);

    let mut total_checks = 0;
    let mut passed_checks = 0;
    let mut max_error: f32 = 0.0;

    for idx in 0..params.len() {
        let num = numerical_gradient(chain, params, batch, idx, eps);
        let rel_err = relative_error(ana[idx], num);
        max_error = max_error.max(rel_err);
        total_checks += 1;

        if gradient_check_passes(ana[idx], num, max_rel) {
            passed_checks += 1;
        } else {
            println!(
                "  FAIL param[{}]: ana={:.6}, num={:.6}, rel_err={:.6}",
                idx, ana[idx], num, rel_err
            );
        }
    }

    println!(
        "Gradient check: {}/{} passed, max_error={:.6}",
        passed_checks, total_checks, max_error
    );

    let pass_rate = passed_checks as f32 / total_checks as f32;
    assert!(
        pass_rate >= MIN_PASS_RATE,
        "Gradient check failed for {}: {}/{} checks passed ({:.1}%), min required: {:.0}%",
        test_name,
        passed_checks,
        total_checks,
        pass_rate * 100.0,
        MIN_PASS_RATE * 100.0
    );
}

/// One identity dense layer: the loss is exactly quadratic per parameter,
/// so central differences are exact up to f32 rounding.
#[test]
fn test_gradient_check_identity_dense() {
    let chain = Chain::with_input(
        Shape::d1(3),
        vec![Layer::dense(2, Activation::Identity)],
    )
    .unwrap()
    .add_loss(LossSpec::squared_error(vec![1.0, -0.5, 0.25, 2.0]))
    .unwrap();

    let params = [0.4, -0.2, 0.7, 0.1, 0.9, -0.6, 0.05, -0.15];
    let data = [0.5f32, -1.0, 0.25, 1.5, 0.75, -0.5];
    let batch = Batch::new(&data, Shape::d1(3)).unwrap();

    run_gradient_check(&chain, &params, &batch, 0.1, 1e-4, "identity dense");
}

/// Two stacked identity layers. Each single parameter still enters the loss
/// quadratically, so the tight tolerance holds through the composition.
#[test]
fn test_gradient_check_two_identity_layers() {
    let chain = Chain::with_input(
        Shape::d1(2),
        vec![
            Layer::dense(3, Activation::Identity),
            Layer::dense(1, Activation::Identity),
        ],
    )
    .unwrap()
    .add_loss(LossSpec::squared_error(vec![2.0, -1.0]))
    .unwrap();

    // 3*(2+1) + 1*(3+1) = 13 parameters
    let params = [
        0.5, -0.3, 0.2, 0.8, -0.1, 0.4, 0.6, 0.35, -0.45, 0.7, -0.2, 0.9, 0.1,
    ];
    let data = [1.0f32, -0.5, 0.25, 0.75];
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();

    run_gradient_check(&chain, &params, &batch, 0.1, 1e-4, "two identity layers");
}

/// ReLU with every pre-activation at least 0.3 from zero; ε = 0.05 cannot
/// flip a sign, so the check stays on one linear piece.
#[test]
fn test_gradient_check_relu_with_margin() {
    let chain = Chain::with_input(
        Shape::d1(2),
        vec![
            Layer::dense(2, Activation::Relu),
            Layer::dense(1, Activation::Identity),
        ],
    )
    .unwrap()
    .add_loss(LossSpec::squared_error(vec![1.0, -1.0]))
    .unwrap();

    // hidden pre-activations: ex0 -> (1.7, -1.05), ex1 -> (0.7, 0.7)
    let params = [
        1.0, 1.0, // w row 0
        -1.0, 0.5, // w row 1
        0.2, -0.3, // b
        0.8, -0.6, // second layer w
        0.1, // second layer b
    ];
    let data = [1.0f32, 0.5, -0.5, 1.0];
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();

    run_gradient_check(&chain, &params, &batch, 0.05, 1e-4, "relu with margin");
}

/// Smooth tanh chain with Glorot-initialized parameters and random data.
#[test]
fn test_gradient_check_tanh_random() {
    let chain = Chain::with_input(
        Shape::d1(3),
        vec![
            Layer::dense(4, Activation::Tanh),
            Layer::dense(2, Activation::Identity),
        ],
    )
    .unwrap()
    .add_loss(LossSpec::squared_error(vec![
        0.5, -0.5, 1.0, 0.0, -1.0, 0.25, 0.75, -0.25,
    ]))
    .unwrap();

    let mut rng = SmallRng::seed_from_u64(42);
    let params = chain.init_params(&mut rng).unwrap();
    let data: Vec<f32> = (0..4 * 3).map(|_| rng.gen_range(-0.9..0.9)).collect();
    let batch = Batch::new(&data, Shape::d1(3)).unwrap();

    run_gradient_check(&chain, params.as_slice(), &batch, 1e-2, 1e-2, "tanh random");
}

/// Softmax cross-entropy seed against central differences.
#[test]
fn test_gradient_check_cross_entropy() {
    let chain = Chain::with_input(
        Shape::d1(2),
        vec![Layer::dense(3, Activation::Identity)],
    )
    .unwrap()
    .add_loss(LossSpec::logit_cross_entropy(vec![0, 2]))
    .unwrap();

    let mut rng = SmallRng::seed_from_u64(7);
    let params = chain.init_params(&mut rng).unwrap();
    let data: Vec<f32> = (0..2 * 2).map(|_| rng.gen_range(-0.9..0.9)).collect();
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();

    run_gradient_check(
        &chain,
        params.as_slice(),
        &batch,
        1e-2,
        1e-2,
        "cross-entropy",
    );
}

/// Convolution into max-pooling. The input is an ascending grid and the
/// kernels are strictly positive, so every pooling window has a clear
/// argmax that ε = 0.01 cannot move.
#[test]
fn test_gradient_check_conv_pool() {
    let chain = Chain::with_input(
        Shape::d3(4, 4, 1),
        vec![
            Layer::conv((2, 2), 2, Activation::Identity),
            Layer::max_pool(2, 2),
            Layer::flatten(0),
            Layer::dense(1, Activation::Identity),
        ],
    )
    .unwrap()
    .add_loss(LossSpec::squared_error(vec![3.0]))
    .unwrap();

    // conv: 2*2*1*2 weights + 2 biases; dense: 1*(2+1)
    let params = [
        0.3, 0.1, // tap (0,0): channel 0, channel 1
        0.2, 0.1, // tap (0,1)
        0.1, 0.2, // tap (1,0)
        0.4, 0.1, // tap (1,1)
        0.05, -0.1, // conv biases
        0.7, -0.4, // dense w
        0.1, // dense b
    ];
    let data: Vec<f32> = (0..16).map(|i| i as f32 * 0.5).collect();
    let batch = Batch::new(&data, Shape::d3(4, 4, 1)).unwrap();

    run_gradient_check(&chain, &params, &batch, 0.01, 1e-4, "conv + pool");
}

/// Gradients vanish when the targets equal the forward output.
#[test]
fn test_gradient_zero_at_optimum() {
    let layers = vec![Layer::dense(2, Activation::Identity)];
    let params = [0.5f32, -0.25, 0.75, 0.4, 0.1, -0.2];
    let data = [1.0f32, 0.5, -0.5, 0.25];
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();

    // forward once to capture the outputs as targets
    let plain = Chain::with_input(Shape::d1(2), layers.clone()).unwrap();
    let mut out = [0.0f32; 4];
    let mut scratch = Scratch::new();
    linnet::predict(&plain, &params, &batch, &mut out, &mut scratch).unwrap();

    let chain = Chain::with_input(Shape::d1(2), layers)
        .unwrap()
        .add_loss(LossSpec::squared_error(out.to_vec()))
        .unwrap();

    let grad = analytic_gradient(&chain, &params, &batch);
    let loss = loss_at(&chain, &params, &batch);

    assert!(loss < 1e-10, "loss should be ~0 at the optimum, got {}", loss);
    for (i, g) in grad.iter().enumerate() {
        assert!(
            g.abs() < 1e-5,
            "grad[{}] should vanish at the optimum, got {}",
            i,
            g
        );
    }
}

/// A small step along the negative gradient must decrease the loss.
#[test]
fn test_gradient_descent_direction() {
    let chain = Chain::with_input(
        Shape::d1(4),
        vec![
            Layer::dense(4, Activation::Tanh),
            Layer::dense(2, Activation::Identity),
        ],
    )
    .unwrap()
    .add_loss(LossSpec::squared_error(vec![
        1.0, -1.0, 0.5, 0.25, -0.75, 0.0, 0.3, -0.6, 0.9, 0.1, -0.2, 0.8, 0.4, -0.4, 0.6, -0.9,
    ]))
    .unwrap();

    let mut rng = SmallRng::seed_from_u64(999);
    let params = chain.init_params(&mut rng).unwrap();
    let data: Vec<f32> = (0..8 * 4).map(|_| rng.gen_range(-0.9..0.9)).collect();
    let batch = Batch::new(&data, Shape::d1(4)).unwrap();

    let loss_before = loss_at(&chain, params.as_slice(), &batch);
    let grad = analytic_gradient(&chain, params.as_slice(), &batch);

    let stepped: Vec<f32> = params
        .as_slice()
        .iter()
        .zip(grad.iter())
        .map(|(p, g)| p - 1e-3 * g)
        .collect();
    let loss_after = loss_at(&chain, &stepped, &batch);

    println!(
        "Loss before: {:.6}, after: {:.6}, diff: {:.6}",
        loss_before,
        loss_after,
        loss_before - loss_after
    );

    assert!(
        loss_after < loss_before,
        "Loss should decrease after gradient step: {} -> {}",
        loss_before,
        loss_after
    );
}
