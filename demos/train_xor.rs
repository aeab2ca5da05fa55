//! XOR training example for linnet.
//!
//! Trains a small dense chain on the XOR truth table with the batched ADAM
//! trainer, then prints per-row predictions.
//!
//! # Features Demonstrated
//!
//! - Chain construction with a terminal loss layer
//! - Glorot parameter initialization
//! - Batched training on an explicit worker pool
//! - Evaluation and forward-only prediction
//!
//! # Run
//!
//! ```bash
//! cargo run --example train_xor
//! ```

use linnet::{
    evaluate, predict, train_batched, worker_pool, Activation, AdamConfig, Batch, Chain,
    GradBuffer, Layer, LinnetResult, LossSpec, Scratch, Shape, TrainConfig,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;

fn main() -> LinnetResult<()> {
    println!("=== linnet XOR Example ===\n");

    // 1. The XOR truth table: 4 examples of 2 features
    let data = [
        0.0f32, 0.0, //
        0.0, 1.0, //
        1.0, 0.0, //
        1.0, 1.0,
    ];
    let targets = vec![0.0f32, 1.0, 1.0, 0.0];
    let batch = Batch::new(&data, Shape::d1(2))?;

    // 2. A 2 -> 8 -> 1 chain; tanh gives the hidden layer the curvature
    //    XOR needs
    let chain = Chain::with_input(
        Shape::d1(2),
        vec![
            Layer::dense(8, Activation::Tanh),
            Layer::dense(1, Activation::Identity),
        ],
    )?
    .add_loss(LossSpec::squared_error(targets.clone()))?;

    println!("Network:");
    println!("  Input:      {}", Shape::d1(2));
    println!("  Output:     {}", chain.output_shape()?);
    println!("  Parameters: {}", chain.param_count()?);

    // 3. Glorot-initialized parameters; a fixed seed replays the run
    let mut rng = SmallRng::seed_from_u64(42);
    let mut params = chain.init_params(&mut rng)?;

    let mut scratch = Scratch::new();
    let before = evaluate(&chain, params.as_slice(), &batch, &mut scratch)?;
    println!("\nMean loss before training: {:.6}", before.loss);

    // 4. Train: full-batch ADAM over two gradient workers
    let adam = AdamConfig::with_lr(0.05);
    let config = TrainConfig::with_epochs(500);
    let mut grad = GradBuffer::for_chain(&chain, 2)?;
    let pool = worker_pool(Some(2))?;

    println!("\n--- Training ---\n");
    println!("Optimizer: ADAM, learning rate {}", adam.lr);
    println!("Epochs:    {}", config.epochs);

    train_batched(
        &mut grad,
        params.as_mut_slice(),
        &chain,
        &batch,
        &adam,
        &config,
        &pool,
    )?;

    let after = evaluate(&chain, params.as_slice(), &batch, &mut scratch)?;
    println!("\nMean loss after training:  {:.6}", after.loss);

    // 5. Per-row predictions
    println!("\n--- Predictions ---\n");
    let mut outputs = [0.0f32; 4];
    predict(&chain, params.as_slice(), &batch, &mut outputs, &mut scratch)?;

    for i in 0..4 {
        println!(
            "  ({}, {}) -> {:+.4}   (target {})",
            data[i * 2],
            data[i * 2 + 1],
            outputs[i],
            targets[i]
        );
    }

    println!("\nTraining complete!");
    Ok(())
}
