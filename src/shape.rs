//! Static example shapes.
//!
//! A [`Shape`] describes one example as an ordered tuple of up to three
//! dimensions. Rank-1 shapes feed dense stacks, rank-3 shapes `(height,
//! width, channels)` feed convolution and pooling layers. Shapes are plain
//! value types; all propagation through a chain happens in the planner.
//!
//! # Example
//!
//! ```rust
//! use linnet::Shape;
//!
//! let image = Shape::d3(28, 28, 1);
//! assert_eq!(image.len(), 784);
//! assert_eq!(image.dims(), &[28, 28, 1]);
//! assert_eq!(image.flatten_from(0), Some(Shape::d1(784)));
//! ```

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::fmt;

/// Maximum supported shape rank.
pub const MAX_RANK: usize = 3;

/// Per-example shape with rank 1 to 3.
///
/// Unused trailing dimensions are stored as zero so that derived equality
/// and hashing see one canonical form per shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Shape {
    dims: [usize; MAX_RANK],
    rank: usize,
}

impl Shape {
    /// Rank-1 shape of `n` elements.
    pub const fn d1(n: usize) -> Self {
        Shape {
            dims: [n, 0, 0],
            rank: 1,
        }
    }

    /// Rank-2 shape `(rows, cols)`.
    pub const fn d2(rows: usize, cols: usize) -> Self {
        Shape {
            dims: [rows, cols, 0],
            rank: 2,
        }
    }

    /// Rank-3 shape `(height, width, channels)`.
    pub const fn d3(height: usize, width: usize, channels: usize) -> Self {
        Shape {
            dims: [height, width, channels],
            rank: 3,
        }
    }

    /// Builds a shape from a dimension slice of length 1 to [`MAX_RANK`].
    ///
    /// Returns `None` for an empty slice or one longer than [`MAX_RANK`].
    pub fn from_dims(dims: &[usize]) -> Option<Self> {
        if dims.is_empty() || dims.len() > MAX_RANK {
            return None;
        }
        let mut out = [0usize; MAX_RANK];
        out[..dims.len()].copy_from_slice(dims);
        Some(Shape {
            dims: out,
            rank: dims.len(),
        })
    }

    /// Number of dimensions.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The dimensions as a slice of length [`rank`](Shape::rank).
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.rank]
    }

    /// Total element count (product of all dimensions).
    #[inline]
    pub fn len(&self) -> usize {
        let mut n = 1;
        for &d in self.dims() {
            n *= d;
        }
        n
    }

    /// True when any dimension is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims().iter().any(|&d| d == 0)
    }

    /// Height of a rank-3 shape.
    #[inline]
    pub fn height(&self) -> usize {
        self.dims[0]
    }

    /// Width of a rank-3 shape.
    #[inline]
    pub fn width(&self) -> usize {
        self.dims[1]
    }

    /// Channel count of a rank-3 shape.
    #[inline]
    pub fn channels(&self) -> usize {
        self.dims[2]
    }

    /// Collapses dimensions `from..` into one, keeping `0..from` intact.
    ///
    /// `from == 0` yields a rank-1 shape of [`len`](Shape::len) elements.
    /// Returns `None` when `from` is outside `0..rank`.
    pub fn flatten_from(&self, from: usize) -> Option<Shape> {
        if from >= self.rank {
            return None;
        }
        let mut dims = [0usize; MAX_RANK];
        dims[..from].copy_from_slice(&self.dims[..from]);
        let mut tail = 1;
        for &d in &self.dims[from..self.rank] {
            tail *= d;
        }
        dims[from] = tail;
        Some(Shape {
            dims,
            rank: from + 1,
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}
