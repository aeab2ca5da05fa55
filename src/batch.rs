//! Borrowed views over flat example batches.
//!
//! A [`Batch`] pairs a flat `&[f32]` with the per-example [`Shape`] and the
//! absolute position of its first example. Examples are stored back to back
//! in row-major order; the engine gathers them into scratch memory by index,
//! so the caller's data is never mutated.
//!
//! # Example
//!
//! ```rust
//! use linnet::{Batch, Shape};
//!
//! let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let batch = Batch::new(&data, Shape::d1(2)).unwrap();
//! assert_eq!(batch.len(), 3);
//! assert_eq!(batch.example(1), &[3.0, 4.0]);
//! ```

use crate::error::{LinnetError, LinnetResult};
use crate::shape::Shape;

/// Read-only batch of examples sharing one shape.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    data: &'a [f32],
    shape: Shape,
    n: usize,
    base: usize,
}

impl<'a> Batch<'a> {
    /// Wraps `data` as a batch of `data.len() / shape.len()` examples.
    ///
    /// Fails when the shape has a zero dimension or the data length is not
    /// an exact multiple of the example length. Empty data is accepted; the
    /// trainer and evaluator reject zero-example batches at call time.
    pub fn new(data: &'a [f32], shape: Shape) -> LinnetResult<Self> {
        if shape.is_empty() {
            return Err(crate::config::ConfigError::ZeroDim.into());
        }
        let example_len = shape.len();
        if data.len() % example_len != 0 {
            return Err(LinnetError::data_size(example_len, data.len()));
        }
        Ok(Batch {
            data,
            shape,
            n: data.len() / example_len,
            base: 0,
        })
    }

    /// The underlying flat data.
    #[inline]
    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// Per-example shape.
    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Number of examples in this view.
    #[inline]
    pub fn len(&self) -> usize {
        self.n
    }

    /// True when the view holds no examples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Element count of one example.
    #[inline]
    pub fn example_len(&self) -> usize {
        self.shape.len()
    }

    /// Absolute position of the first example. Loss targets are indexed by
    /// absolute position, so a sub-view keeps addressing the same targets
    /// as the batch it came from.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// The `i`-th example of this view as a flat slice.
    #[inline]
    pub fn example(&self, i: usize) -> &'a [f32] {
        let el = self.example_len();
        &self.data[i * el..(i + 1) * el]
    }

    /// Sub-view over examples `start..end`, preserving absolute positions.
    pub(crate) fn slice(&self, start: usize, end: usize) -> Batch<'a> {
        debug_assert!(start <= end && end <= self.n);
        let el = self.example_len();
        Batch {
            data: &self.data[start * el..end * el],
            shape: self.shape,
            n: end - start,
            base: self.base + start,
        }
    }
}
