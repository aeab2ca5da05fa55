//! Minibatch trainer and evaluator.
//!
//! Training is synchronous fork-join: each minibatch is split into
//! contiguous example groups, one per gradient column, and the engine runs
//! over every group in parallel on an explicit [`rayon::ThreadPool`].
//! Columns are disjoint, parameters are frozen while workers run, and the
//! ADAM step is applied single-threaded after the columns are reduced. A
//! worker error abandons the minibatch before the optimizer step runs.
//!
//! Randomness is reproducible: shuffling and dropout draw from `SmallRng`
//! streams derived from [`TrainConfig::seed`] with the epoch, minibatch and
//! worker position mixed in, so a fixed seed replays a run exactly under a
//! fixed group count.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::batch::Batch;
use crate::buffer::{AlignedBuf, Scratch};
use crate::chain::Chain;
use crate::config::{ConfigError, TrainConfig, EVAL_CHUNK};
use crate::error::{LinnetError, LinnetResult};
use crate::kernel;
use crate::optimizer::{AdamConfig, AdamState};
use crate::penalty::{ChainPenalty, NoPenalty};
use crate::valgrad::{self, EngineInput};

/// Mean loss and classification accuracy over an evaluated batch.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Evaluation {
    /// Per-example mean of the chain's loss.
    pub loss: f32,
    /// Fraction of examples whose arg-max output matches the target class.
    pub accuracy: f32,
}

/// Per-worker gradient columns, one contiguous column per worker group.
///
/// The buffer is caller-owned so repeated training calls reuse one
/// allocation. Column count bounds the number of worker groups a minibatch
/// is split into; the thread count of the pool the trainer runs on is
/// independent of it.
#[derive(Debug, Clone)]
pub struct GradBuffer {
    buf: AlignedBuf,
    n_params: usize,
    workers: usize,
}

impl GradBuffer {
    /// Allocates `workers` zeroed columns of `n_params` elements each.
    pub fn new(n_params: usize, workers: usize) -> LinnetResult<Self> {
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers.into());
        }
        Ok(GradBuffer {
            buf: AlignedBuf::zeroed(n_params * workers),
            n_params,
            workers,
        })
    }

    /// Allocates columns sized for `chain`'s parameter count.
    pub fn for_chain(chain: &Chain, workers: usize) -> LinnetResult<Self> {
        GradBuffer::new(chain.param_count()?, workers)
    }

    /// Parameters per column.
    #[inline]
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    /// Number of columns.
    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub(crate) fn zero(&mut self) {
        self.buf.zero();
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [f32] {
        self.buf.as_mut_slice()
    }

    /// Sums the first `used` columns into column 0 and returns it.
    pub(crate) fn reduce(&mut self, used: usize) -> &mut [f32] {
        debug_assert!(0 < used && used <= self.workers);
        let n = self.n_params;
        let (first, rest) = self.buf.as_mut_slice().split_at_mut(n);
        if n > 0 {
            for col in rest[..(used - 1) * n].chunks_exact(n) {
                kernel::add_assign(first, col);
            }
        }
        first
    }
}

/// Builds a rayon pool with `workers` threads, or a best-effort platform
/// default when `None`.
pub fn worker_pool(workers: Option<usize>) -> LinnetResult<ThreadPool> {
    let threads = match workers {
        Some(0) => return Err(ConfigError::ZeroWorkers.into()),
        Some(w) => w,
        None => std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1),
    };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()?;
    Ok(pool)
}

/// Stream seed for one (epoch, minibatch, worker) task. splitmix64-style
/// finalizer over the user seed.
fn mix(seed: u64, epoch: usize, minibatch: usize, worker: usize) -> u64 {
    let mut z = seed
        .wrapping_add((epoch as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15))
        .wrapping_add((minibatch as u64).wrapping_mul(0xbf58_476d_1ce4_e5b9))
        .wrapping_add((worker as u64).wrapping_mul(0x94d0_49bb_1331_11eb));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Trains `params` in place over `batch` with ADAM.
///
/// Each epoch walks the examples in minibatches of [`TrainConfig::batch`]
/// (full batch when `None`, last minibatch allowed short), optionally
/// shuffling the example order per epoch. The minibatch is split into at
/// most `grad.workers()` contiguous groups; every group accumulates into
/// its own gradient column, the columns are summed, and one optimizer step
/// is applied. Optimizer state lives for the duration of the call.
///
/// # Example
///
/// ```rust
/// use linnet::{
///     evaluate, train_batched, worker_pool, Activation, AdamConfig, Batch, Chain, GradBuffer,
///     Layer, LossSpec, Scratch, Shape, TrainConfig,
/// };
///
/// # fn main() -> linnet::LinnetResult<()> {
/// let chain = Chain::with_input(Shape::d1(2), vec![
///     Layer::dense(1, Activation::Identity),
/// ])?
/// .add_loss(LossSpec::squared_error(vec![4.0]))?;
///
/// let data = [1.0f32, 1.0];
/// let batch = Batch::new(&data, Shape::d1(2))?;
/// let mut params = vec![0.0f32; chain.param_count()?];
/// let mut grad = GradBuffer::for_chain(&chain, 1)?;
/// let pool = worker_pool(Some(1))?;
///
/// let adam = AdamConfig::with_lr(0.1);
/// let config = TrainConfig::with_epochs(50);
/// train_batched(&mut grad, &mut params, &chain, &batch, &adam, &config, &pool)?;
///
/// let mut scratch = Scratch::new();
/// let eval = evaluate(&chain, &params, &batch, &mut scratch)?;
/// assert!(eval.loss < 0.1);
/// # Ok(())
/// # }
/// ```
pub fn train_batched(
    grad: &mut GradBuffer,
    params: &mut [f32],
    chain: &Chain,
    batch: &Batch<'_>,
    adam: &AdamConfig,
    config: &TrainConfig,
    pool: &ThreadPool,
) -> LinnetResult<()> {
    train_impl(grad, params, chain, batch, &NoPenalty, adam, config, pool)
}

/// [`train_batched`] with a parameter penalty added to the reduced gradient
/// before each optimizer step.
pub fn train_batched_penalized<P: ChainPenalty>(
    grad: &mut GradBuffer,
    params: &mut [f32],
    chain: &Chain,
    batch: &Batch<'_>,
    penalty: &P,
    adam: &AdamConfig,
    config: &TrainConfig,
    pool: &ThreadPool,
) -> LinnetResult<()> {
    train_impl(grad, params, chain, batch, penalty, adam, config, pool)
}

#[allow(clippy::too_many_arguments)]
fn train_impl<P: ChainPenalty>(
    grad: &mut GradBuffer,
    params: &mut [f32],
    chain: &Chain,
    batch: &Batch<'_>,
    penalty: &P,
    adam: &AdamConfig,
    config: &TrainConfig,
    pool: &ThreadPool,
) -> LinnetResult<()> {
    if batch.is_empty() {
        return Err(LinnetError::EmptyBatch);
    }
    config.validate()?;
    let plan = chain.resolve(Some(batch.shape()))?;
    let n_params = plan.n_params();
    if params.len() != n_params {
        return Err(LinnetError::parameter_size(n_params, params.len()));
    }
    if grad.n_params() != n_params {
        return Err(LinnetError::parameter_size(n_params, grad.n_params()));
    }
    let spec = chain.loss().ok_or(ConfigError::MissingLoss)?;
    spec.validate(plan.output_len(), batch.base() + batch.len())?;
    if n_params == 0 {
        return Ok(());
    }

    let n = batch.len();
    let minibatch = config.batch.unwrap_or(n).min(n);
    let workers = grad.workers();
    let layers = chain.layers();
    let data = batch.data();
    let base = batch.base();

    let mut state = AdamState::new(n_params);
    let mut order: Vec<u32> = (base..base + n).map(|i| i as u32).collect();
    let mut scratches: Vec<Scratch> = (0..workers).map(|_| Scratch::new()).collect();

    for epoch in 0..config.epochs {
        if config.shuffle {
            let mut rng = SmallRng::seed_from_u64(mix(config.seed, epoch, 0, 0));
            order.shuffle(&mut rng);
        }
        for (mb, ids) in order.chunks(minibatch).enumerate() {
            grad.zero();
            let group_len = ids.len().div_ceil(workers);
            let k = ids.len().div_ceil(group_len);

            // parameters are frozen while workers run
            let frozen: &[f32] = params;
            let cols = &mut grad.columns_mut()[..k * n_params];
            let groups = &mut scratches[..k];
            pool.install(|| {
                cols.par_chunks_mut(n_params)
                    .zip(groups.par_iter_mut())
                    .enumerate()
                    .try_for_each(|(wi, (col, scratch))| {
                        let lo = wi * group_len;
                        let hi = (lo + group_len).min(ids.len());
                        let task = EngineInput {
                            plan: &plan,
                            layers,
                            params: frozen,
                            data,
                            ids: Some(&ids[lo..hi]),
                            base,
                            n: hi - lo,
                        };
                        let mut rng =
                            SmallRng::seed_from_u64(mix(config.seed, epoch, mb, wi + 1));
                        valgrad::train_pass(&task, col, scratch, &mut rng)
                            .map(|_| ())
                            .map_err(LinnetError::worker)
                    })
            })?;

            let reduced = grad.reduce(k);
            penalty.accumulate(&plan, reduced, frozen);
            state.step(adam, params, reduced);
        }
    }
    Ok(())
}

/// Forward-only evaluation: mean loss and arg-max accuracy over `batch`.
///
/// The chain must carry a terminal loss layer; its targets are read by
/// absolute example position. Parameters and batch data are untouched.
/// Large batches are walked in fixed-size chunks so scratch memory stays
/// bounded by [`EVAL_CHUNK`] examples.
pub fn evaluate(
    chain: &Chain,
    params: &[f32],
    batch: &Batch<'_>,
    scratch: &mut Scratch,
) -> LinnetResult<Evaluation> {
    if batch.is_empty() {
        return Err(LinnetError::EmptyBatch);
    }
    let plan = chain.resolve(Some(batch.shape()))?;
    if params.len() != plan.n_params() {
        return Err(LinnetError::parameter_size(plan.n_params(), params.len()));
    }
    let spec = chain.loss().ok_or(ConfigError::MissingLoss)?;
    spec.validate(plan.output_len(), batch.base() + batch.len())?;

    let n = batch.len();
    let mut loss = 0.0f64;
    let mut correct = 0usize;
    let mut start = 0;
    while start < n {
        let end = (start + EVAL_CHUNK).min(n);
        let chunk = batch.slice(start, end);
        let input = EngineInput {
            plan: &plan,
            layers: chain.layers(),
            params,
            data: chunk.data(),
            ids: None,
            base: chunk.base(),
            n: chunk.len(),
        };
        let (chunk_loss, chunk_correct) = valgrad::eval_pass(&input, scratch)?;
        loss += chunk_loss;
        correct += chunk_correct;
        start = end;
    }

    Ok(Evaluation {
        loss: (loss / n as f64) as f32,
        accuracy: correct as f32 / n as f32,
    })
}
