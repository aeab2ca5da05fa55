//! Tests for forward pass numerical correctness.
//!
//! These tests verify:
//! - Hand-computed outputs per layer kind (not just NaN checks)
//! - Example-major output ordering across a batch
//! - Inference-mode dropout scaling
//! - The predict surface's size and shape checks

use linnet::{
    predict, Activation, Batch, Chain, Layer, LinnetError, LossSpec, Scratch, Shape,
};

fn run_predict(chain: &Chain, params: &[f32], data: &[f32], shape: Shape, out_len: usize) -> Vec<f32> {
    let batch = Batch::new(data, shape).unwrap();
    let mut out = vec![0.0f32; out_len];
    let mut scratch = Scratch::new();
    predict(chain, params, &batch, &mut out, &mut scratch).unwrap();
    out
}

// =============================================================================
// Hand-computed layer outputs
// =============================================================================

/// Dense layer against y = Wx + b worked by hand.
#[test]
fn test_dense_identity_hand_values() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(2, Activation::Identity)])
        .unwrap();
    // W = [[1, 2], [3, 4]], b = [0.5, -0.5]
    let params = [1.0, 2.0, 3.0, 4.0, 0.5, -0.5];
    let out = run_predict(&chain, &params, &[1.0, 2.0], Shape::d1(2), 2);

    assert_eq!(out, vec![5.5, 10.5]);
}

#[test]
fn test_dense_relu_clips_negative() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(2, Activation::Relu)]).unwrap();
    let params = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
    let out = run_predict(&chain, &params, &[0.25, -0.75], Shape::d1(2), 2);

    assert_eq!(out, vec![0.25, 0.0]);
}

#[test]
fn test_dense_tanh_matches_std() {
    let chain = Chain::with_input(Shape::d1(1), vec![Layer::dense(1, Activation::Tanh)]).unwrap();
    let params = [1.0, 0.0];
    let out = run_predict(&chain, &params, &[0.5], Shape::d1(1), 1);

    assert_eq!(out[0], 0.5f32.tanh());
}

/// Valid convolution over a 3x3 ascending grid with a uniform 2x2 kernel.
#[test]
fn test_conv_hand_values() {
    let chain = Chain::with_input(
        Shape::d3(3, 3, 1),
        vec![Layer::conv((2, 2), 1, Activation::Identity)],
    )
    .unwrap();
    // four taps of 0.5 plus bias 0.5: window sums 12, 16, 24, 28
    let params = [0.5, 0.5, 0.5, 0.5, 0.5];
    let data: Vec<f32> = (1..=9).map(|i| i as f32).collect();
    let out = run_predict(&chain, &params, &data, Shape::d3(3, 3, 1), 4);

    assert_eq!(out, vec![6.5, 8.5, 12.5, 14.5]);
}

/// Max pooling keeps the window maximum per channel.
#[test]
fn test_max_pool_hand_values() {
    let chain =
        Chain::with_input(Shape::d3(4, 4, 1), vec![Layer::max_pool(2, 2)]).unwrap();
    let data: Vec<f32> = (1..=16).map(|i| i as f32).collect();
    let out = run_predict(&chain, &[], &data, Shape::d3(4, 4, 1), 4);

    assert_eq!(out, vec![6.0, 8.0, 14.0, 16.0]);
}

/// Pooling truncates: a 2x2 window over 3x3 uses only the covered 2x2 block.
#[test]
fn test_max_pool_truncates_ragged_edge() {
    let chain =
        Chain::with_input(Shape::d3(3, 3, 1), vec![Layer::max_pool(2, 2)]).unwrap();
    // bottom row and right column (values 30, 60, 70, 80, 90) are outside
    let data = [1.0, 2.0, 30.0, 4.0, 5.0, 60.0, 70.0, 80.0, 90.0];
    let out = run_predict(&chain, &[], &data, Shape::d3(3, 3, 1), 1);

    assert_eq!(out, vec![5.0]);
}

/// Flatten reinterprets without reordering.
#[test]
fn test_flatten_is_passthrough() {
    let chain = Chain::with_input(
        Shape::d3(2, 2, 1),
        vec![Layer::flatten(0), Layer::dense(4, Activation::Identity)],
    )
    .unwrap();
    // dense with identity weights and zero bias
    let mut params = [0.0f32; 20];
    for i in 0..4 {
        params[i * 4 + i] = 1.0;
    }
    let data = [1.5, -2.5, 3.5, -4.5];
    let out = run_predict(&chain, &params, &data, Shape::d3(2, 2, 1), 4);

    assert_eq!(out, vec![1.5, -2.5, 3.5, -4.5]);
}

/// Inference-mode dropout multiplies every element by exactly (1 - rate).
#[test]
fn test_dropout_inference_scales_exactly() {
    let chain = Chain::with_input(Shape::d1(4), vec![Layer::dropout(0.4)]).unwrap();
    let data = [1.0f32, 2.0, 3.0, 4.0];
    let out = run_predict(&chain, &[], &data, Shape::d1(4), 4);

    let keep = 1.0f32 - 0.4;
    for (o, x) in out.iter().zip(data.iter()) {
        assert_eq!(*o, x * keep);
    }
}

// =============================================================================
// Batch semantics
// =============================================================================

/// Outputs are example-major in batch order.
#[test]
fn test_batch_output_ordering() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(1, Activation::Identity)])
        .unwrap();
    // y = x0 + x1
    let params = [1.0, 1.0, 0.0];
    let data = [1.0f32, 2.0, 10.0, 20.0, -4.0, 1.0];
    let out = run_predict(&chain, &params, &data, Shape::d1(2), 3);

    assert_eq!(out, vec![3.0, 30.0, -3.0]);
}

/// A chain built without a static shape plans itself from the batch.
#[test]
fn test_dynamic_chain_plans_from_batch() {
    let chain = Chain::new(vec![Layer::dense(1, Activation::Identity)]).unwrap();
    let params = [2.0, 0.5, 1.0];
    let out = run_predict(&chain, &params, &[3.0, 4.0], Shape::d1(2), 1);

    assert_eq!(out, vec![9.0]);
}

/// The loss layer carries targets but does not change predictions.
#[test]
fn test_loss_layer_is_skipped_by_predict() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(1, Activation::Identity)])
        .unwrap()
        .add_loss(LossSpec::squared_error(vec![100.0]))
        .unwrap();
    let params = [1.0, 1.0, 0.0];
    let out = run_predict(&chain, &params, &[1.0, 2.0], Shape::d1(2), 1);

    assert_eq!(out, vec![3.0]);
}

// =============================================================================
// Surface checks
// =============================================================================

#[test]
fn test_predict_rejects_wrong_output_len() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(2, Activation::Identity)])
        .unwrap();
    let params = [0.0f32; 6];
    let data = [1.0f32, 2.0];
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();
    let mut out = [0.0f32; 3];
    let mut scratch = Scratch::new();

    let err = predict(&chain, &params, &batch, &mut out, &mut scratch).unwrap_err();
    assert!(matches!(
        err,
        LinnetError::OutputSize { expected: 2, got: 3 }
    ));
}

#[test]
fn test_predict_rejects_wrong_param_len() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(2, Activation::Identity)])
        .unwrap();
    let params = [0.0f32; 5];
    let data = [1.0f32, 2.0];
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();
    let mut out = [0.0f32; 2];
    let mut scratch = Scratch::new();

    let err = predict(&chain, &params, &batch, &mut out, &mut scratch).unwrap_err();
    assert!(matches!(
        err,
        LinnetError::ParameterSize { expected: 6, got: 5 }
    ));
}

#[test]
fn test_predict_rejects_shape_mismatch() {
    let chain = Chain::with_input(Shape::d1(3), vec![Layer::dense(1, Activation::Identity)])
        .unwrap();
    let params = [0.0f32; 4];
    let data = [1.0f32, 2.0];
    let batch = Batch::new(&data, Shape::d1(2)).unwrap();
    let mut out = [0.0f32; 1];
    let mut scratch = Scratch::new();

    let err = predict(&chain, &params, &batch, &mut out, &mut scratch).unwrap_err();
    assert!(matches!(err, LinnetError::InputShape { .. }));
}

#[test]
fn test_predict_rejects_empty_batch() {
    let chain = Chain::with_input(Shape::d1(2), vec![Layer::dense(1, Activation::Identity)])
        .unwrap();
    let params = [0.0f32; 3];
    let batch = Batch::new(&[], Shape::d1(2)).unwrap();
    let mut out = [0.0f32; 0];
    let mut scratch = Scratch::new();

    let err = predict(&chain, &params, &batch, &mut out, &mut scratch).unwrap_err();
    assert!(matches!(err, LinnetError::EmptyBatch));
}
