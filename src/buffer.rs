//! Aligned buffers and reusable scratch memory.
//!
//! This module provides two key types:
//!
//! - [`AlignedBuf`] — 64-byte aligned `f32` storage for SIMD kernels
//! - [`Scratch`] — preallocated working memory for forward/backward passes
//!
//! # Zero-Allocation Pattern
//!
//! The engine never allocates activation storage per call. A [`Scratch`]
//! grows monotonically to the high-water mark of the calls it has served and
//! is then reused:
//!
//! ```rust
//! use linnet::{Batch, Chain, Layer, LossSpec, Scratch, Shape, Activation};
//!
//! let chain = Chain::with_input(Shape::d1(2), vec![
//!     Layer::dense(4, Activation::Relu),
//!     Layer::dense(1, Activation::Identity),
//! ]).unwrap().add_loss(LossSpec::squared_error(vec![0.5])).unwrap();
//!
//! let params = vec![0.1f32; chain.param_count().unwrap()];
//! let data = [0.3f32, -0.7];
//! let batch = Batch::new(&data, Shape::d1(2)).unwrap();
//!
//! // One scratch, reused across calls. All growth happens on first use.
//! let mut scratch = Scratch::new();
//! let mut out = [0.0f32; 1];
//! for _ in 0..1000 {
//!     linnet::predict(&chain, &params, &batch, &mut out, &mut scratch).unwrap();
//! }
//! ```
//!
//! # Memory Alignment
//!
//! [`AlignedBuf`] uses 64-byte alignment ([`CACHE_LINE`]) so vectorized
//! kernels start on cache-line boundaries.

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Cache line size for memory alignment (64 bytes).
pub const CACHE_LINE: usize = 64;

/// 64-byte aligned `f32` buffer.
///
/// Provides a `Vec<f32>`-like grow-only interface with cache-line aligned
/// storage. Parameters, gradients and activation scratch all live in this
/// type.
///
/// # Example
///
/// ```rust
/// use linnet::AlignedBuf;
///
/// let mut buf = AlignedBuf::with_capacity(1024);
/// buf.resize(100);
/// buf.as_mut_slice()[0] = 1.0;
/// assert_eq!(buf[0], 1.0);
/// ```
///
/// # Safety
///
/// The buffer uses raw allocation with explicit alignment. All unsafe
/// operations are encapsulated and the public API is safe.
#[repr(C)]
pub struct AlignedBuf {
    ptr: NonNull<f32>,
    len: usize,
    capacity: usize,
}

// Safety: AlignedBuf owns its data and doesn't share it
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Creates a new empty aligned buffer.
    pub fn new() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
        }
    }

    /// Creates a buffer with the specified capacity (in f32 elements).
    pub fn with_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            return Self::new();
        }

        let layout = Self::layout(capacity);
        // SAFETY: layout is derived from a positive `capacity`, allocation handled via handle_alloc_error
        let ptr = unsafe {
            let raw = alloc_zeroed(layout);
            if raw.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            NonNull::new_unchecked(raw as *mut f32)
        };

        Self {
            ptr,
            len: 0,
            capacity,
        }
    }

    /// Creates a zero-filled buffer of length `len`.
    pub fn zeroed(len: usize) -> Self {
        let mut buf = Self::with_capacity(len);
        buf.len = len;
        buf
    }

    /// Creates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[f32]) -> Self {
        let mut buf = Self::zeroed(data.len());
        buf.as_mut_slice().copy_from_slice(data);
        buf
    }

    /// Ensures capacity is at least `new_cap`.
    /// Does not shrink. Only grows if needed.
    #[inline]
    pub fn reserve(&mut self, new_cap: usize) {
        if new_cap <= self.capacity {
            return;
        }

        let new_layout = Self::layout(new_cap);
        // SAFETY: new_layout is valid for `new_cap`, allocation failure handled
        let new_ptr = unsafe {
            let raw = alloc_zeroed(new_layout);
            if raw.is_null() {
                std::alloc::handle_alloc_error(new_layout);
            }
            NonNull::new_unchecked(raw as *mut f32)
        };

        if self.capacity > 0 && self.len > 0 {
            // SAFETY: source and destination are valid, non-overlapping, len=self.len
            unsafe {
                std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
            }
        }

        if self.capacity > 0 {
            let old_layout = Self::layout(self.capacity);
            // SAFETY: layout matches original allocation
            unsafe {
                dealloc(self.ptr.as_ptr() as *mut u8, old_layout);
            }
        }

        self.ptr = new_ptr;
        self.capacity = new_cap;
    }

    /// Resizes the buffer, filling new elements with zero.
    #[inline]
    pub fn resize(&mut self, new_len: usize) {
        self.reserve(new_len);
        if new_len > self.len {
            // SAFETY: destination is within allocated region; zero the tail
            unsafe {
                std::ptr::write_bytes(self.ptr.as_ptr().add(self.len), 0, new_len - self.len);
            }
        }
        self.len = new_len;
    }

    /// Fills with zeros.
    #[inline]
    pub fn zero(&mut self) {
        if self.len > 0 {
            // SAFETY: buffer is allocated and len > 0
            unsafe {
                std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len);
            }
        }
    }

    /// Current length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Current capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Is empty?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a slice of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: ptr is valid for `len` contiguous elements
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Returns a mutable slice of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        if self.len == 0 {
            &mut []
        } else {
            // SAFETY: ptr uniquely owned, valid for `len` contiguous elements
            unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
        }
    }

    /// Raw pointer (for alignment checks and SIMD).
    #[inline]
    pub fn as_ptr(&self) -> *const f32 {
        self.ptr.as_ptr()
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity * std::mem::size_of::<f32>(), CACHE_LINE)
            .expect("Invalid layout")
    }
}

impl Default for AlignedBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.capacity > 0 {
            let layout = Self::layout(self.capacity);
            // SAFETY: layout matches allocation, ptr is valid
            unsafe {
                dealloc(self.ptr.as_ptr() as *mut u8, layout);
            }
        }
    }
}

impl Clone for AlignedBuf {
    fn clone(&self) -> Self {
        let mut new = Self::with_capacity(self.capacity);
        new.len = self.len;
        if self.len > 0 {
            // SAFETY: source/dest are distinct allocations, len is within both
            unsafe {
                std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), new.ptr.as_ptr(), self.len);
            }
        }
        new
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl std::ops::Index<usize> for AlignedBuf {
    type Output = f32;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        assert!(index < self.len, "Index out of bounds");
        // SAFETY: bounds checked above
        unsafe { &*self.ptr.as_ptr().add(index) }
    }
}

impl std::ops::IndexMut<usize> for AlignedBuf {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        assert!(index < self.len, "Index out of bounds");
        // SAFETY: bounds checked above, unique access
        unsafe { &mut *self.ptr.as_ptr().add(index) }
    }
}

#[cfg(feature = "serde")]
impl Serialize for AlignedBuf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_slice().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for AlignedBuf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let data: Vec<f32> = Vec::<f32>::deserialize(deserializer)?;
        Ok(AlignedBuf::from_slice(&data))
    }
}

/// One layer's scratch offsets, recorded during the forward walk and read
/// back in reverse during the backward walk.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Step {
    /// Offset of the layer's input block in the f32 lane.
    pub(crate) in_off: usize,
    /// Offset of the layer's output block. Equals `in_off` for in-place
    /// layers.
    pub(crate) out_off: usize,
    /// Offset of the layer's derived-value cache in the f32 lane, when it
    /// has one (activation factors, dropout masks, log-sum-exp values).
    pub(crate) cache: Option<usize>,
    /// Offset of the layer's index cache in the u32 lane (pooling argmax).
    pub(crate) idx: Option<usize>,
}

/// Reusable working memory for forward and backward passes.
///
/// A scratch holds two lanes: an aligned `f32` lane for activations, adjoint
/// values and derived-value caches, and a `u32` lane for example indices and
/// pooling argmax positions. The engine bump-allocates blocks out of both
/// lanes on every call; the lanes grow monotonically and are never shrunk,
/// so steady-state calls perform no allocation.
///
/// The input batch is gathered into the front of the f32 lane before the
/// first layer runs. Everything downstream, including the destructive
/// backward walk, mutates only scratch memory; caller data is untouched.
///
/// # Thread Safety
///
/// A scratch is not shared between threads. The trainer keeps one per
/// gradient worker.
#[derive(Debug, Default)]
pub struct Scratch {
    /// Activation and cache storage.
    pub(crate) f: AlignedBuf,
    /// Example ids and pooling argmax positions.
    pub(crate) u: Vec<u32>,
    /// Per-layer offset records from the most recent forward walk.
    pub(crate) steps: Vec<Step>,
    f_used: usize,
    u_used: usize,
}

impl Scratch {
    /// Creates an empty scratch. Lanes grow on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scratch with preallocated lanes.
    pub fn with_capacity(f_elems: usize, u_elems: usize) -> Self {
        let mut scratch = Self::new();
        scratch.ensure(f_elems, u_elems);
        scratch
    }

    /// Grows both lanes to at least the given element counts.
    #[inline]
    pub fn ensure(&mut self, f_elems: usize, u_elems: usize) {
        if self.f.len() < f_elems {
            self.f.resize(f_elems);
        }
        if self.u.len() < u_elems {
            self.u.resize(u_elems, 0);
        }
    }

    /// Both lanes as mutable slices.
    #[inline]
    pub(crate) fn lanes_mut(&mut self) -> (&mut [f32], &mut [u32]) {
        (self.f.as_mut_slice(), &mut self.u)
    }

    /// Records how much of each lane the last walk consumed.
    #[inline]
    pub(crate) fn set_used(&mut self, f_used: usize, u_used: usize) {
        debug_assert!(f_used <= self.f.len());
        debug_assert!(u_used <= self.u.len());
        self.f_used = f_used;
        self.u_used = u_used;
    }

    /// f32 elements consumed by the most recent pass.
    #[inline]
    pub fn f_in_use(&self) -> usize {
        self.f_used
    }

    /// u32 elements consumed by the most recent pass.
    #[inline]
    pub fn u_in_use(&self) -> usize {
        self.u_used
    }

    /// Current f32 lane capacity in elements.
    #[inline]
    pub fn f_capacity(&self) -> usize {
        self.f.len()
    }

    /// Current u32 lane capacity in elements.
    #[inline]
    pub fn u_capacity(&self) -> usize {
        self.u.len()
    }
}
