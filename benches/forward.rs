//! Inference benchmarks.
//!
//! # Methodology
//!
//! **Fixed parameters per batch size**: Parameters are drawn once from a
//! seeded initializer so every batch size runs the same weights. Weight
//! values affect computation time (e.g., denormalized floats), so this keeps
//! the comparison fair.
//!
//! **Scratch reuse**: The scratch arena is created once per batch size and
//! reused across all iterations. After the first iteration the arena has
//! grown to its final size and all subsequent calls are zero-allocation,
//! measuring true steady-state performance.
//!
//! **Throughput metric**: `Elements` = `batch_size * input_len`, representing
//! total floating-point inputs processed, not samples.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use linnet::{predict, Activation, Batch, Chain, Layer, Scratch, Shape};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn make_inputs(len: usize, batch: usize, seed: u64) -> Vec<f32> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..batch * len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn mlp_chain() -> Chain {
    Chain::with_input(
        Shape::d1(128),
        vec![
            Layer::dense(64, Activation::Relu),
            Layer::dense(64, Activation::Relu),
            Layer::dense(10, Activation::Identity),
        ],
    )
    .unwrap()
}

fn lenet_chain() -> Chain {
    Chain::with_input(
        Shape::d3(28, 28, 1),
        vec![
            Layer::conv((5, 5), 6, Activation::Relu),
            Layer::max_pool(2, 2),
            Layer::conv((5, 5), 16, Activation::Relu),
            Layer::max_pool(2, 2),
            Layer::flatten(0),
            Layer::dense(120, Activation::Relu),
            Layer::dense(84, Activation::Relu),
            Layer::dense(10, Activation::Identity),
        ],
    )
    .unwrap()
}

fn bench_dense_forward(c: &mut Criterion) {
    let chain = mlp_chain();
    let input_len = 128;
    let out_len = 10;
    let mut rng = SmallRng::seed_from_u64(42);
    let params = chain.init_params(&mut rng).unwrap();

    let batch_sizes = [1_usize, 8, 16, 64, 256];
    let mut group = c.benchmark_group("dense_forward");

    for &batch_size in &batch_sizes {
        let inputs = make_inputs(input_len, batch_size, 42);
        let batch = Batch::new(&inputs, Shape::d1(input_len)).unwrap();
        let mut outputs = vec![0.0f32; batch_size * out_len];
        // Scratch created once, reused across all iterations (zero-alloc
        // after the first).
        let mut scratch = Scratch::new();

        group.throughput(Throughput::Elements((batch_size * input_len) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &_batch_size| {
                b.iter(|| {
                    predict(
                        &chain,
                        black_box(params.as_slice()),
                        &batch,
                        black_box(&mut outputs),
                        &mut scratch,
                    )
                    .unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_conv_forward(c: &mut Criterion) {
    let chain = lenet_chain();
    let input_len = 28 * 28;
    let out_len = 10;
    let mut rng = SmallRng::seed_from_u64(42);
    let params = chain.init_params(&mut rng).unwrap();

    let batch_sizes = [1_usize, 8, 64];
    let mut group = c.benchmark_group("conv_forward");

    for &batch_size in &batch_sizes {
        let inputs = make_inputs(input_len, batch_size, 7);
        let batch = Batch::new(&inputs, Shape::d3(28, 28, 1)).unwrap();
        let mut outputs = vec![0.0f32; batch_size * out_len];
        let mut scratch = Scratch::new();

        group.throughput(Throughput::Elements((batch_size * input_len) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &_batch_size| {
                b.iter(|| {
                    predict(
                        &chain,
                        black_box(params.as_slice()),
                        &batch,
                        black_box(&mut outputs),
                        &mut scratch,
                    )
                    .unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dense_forward, bench_conv_forward);
criterion_main!(benches);
