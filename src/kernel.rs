//! SIMD micro-kernels shared by the engine.
//!
//! Eight-lane `f32x8` bodies with scalar tails. Dense and convolution layers
//! are expressed entirely through [`dot`] and [`axpy`]; gradient reduction
//! and penalties use [`add_assign`] and [`scale`].

use wide::f32x8;

const LANES: usize = 8;

/// Dot product of two equal-length slices.
#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let mut acc = f32x8::splat(0.0);
    let mut ca = a.chunks_exact(LANES);
    let mut cb = b.chunks_exact(LANES);
    for (xa, xb) in (&mut ca).zip(&mut cb) {
        let mut va = [0.0f32; LANES];
        let mut vb = [0.0f32; LANES];
        va.copy_from_slice(xa);
        vb.copy_from_slice(xb);
        acc += f32x8::new(va) * f32x8::new(vb);
    }

    let arr: [f32; LANES] = acc.into();
    let mut sum: f32 = arr.iter().sum();
    for (x, y) in ca.remainder().iter().zip(cb.remainder()) {
        sum = x.mul_add(*y, sum);
    }
    sum
}

/// `y += a * x` over equal-length slices.
#[inline]
pub(crate) fn axpy(a: f32, x: &[f32], y: &mut [f32]) {
    debug_assert_eq!(x.len(), y.len());

    let va = f32x8::splat(a);
    let mut cx = x.chunks_exact(LANES);
    let mut cy = y.chunks_exact_mut(LANES);
    for (xs, ys) in (&mut cx).zip(&mut cy) {
        let mut vx = [0.0f32; LANES];
        let mut vy = [0.0f32; LANES];
        vx.copy_from_slice(xs);
        vy.copy_from_slice(ys);
        let out: [f32; LANES] = (f32x8::new(vy) + va * f32x8::new(vx)).into();
        ys.copy_from_slice(&out);
    }

    for (x, y) in cx.remainder().iter().zip(cy.into_remainder()) {
        *y = a.mul_add(*x, *y);
    }
}

/// `dst += src` elementwise.
#[inline]
pub(crate) fn add_assign(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());

    let mut cs = src.chunks_exact(LANES);
    let mut cd = dst.chunks_exact_mut(LANES);
    for (ss, ds) in (&mut cs).zip(&mut cd) {
        let mut vs = [0.0f32; LANES];
        let mut vd = [0.0f32; LANES];
        vs.copy_from_slice(ss);
        vd.copy_from_slice(ds);
        let out: [f32; LANES] = (f32x8::new(vd) + f32x8::new(vs)).into();
        ds.copy_from_slice(&out);
    }

    for (s, d) in cs.remainder().iter().zip(cd.into_remainder()) {
        *d += s;
    }
}

/// `x *= a` in place.
#[inline]
pub(crate) fn scale(x: &mut [f32], a: f32) {
    let va = f32x8::splat(a);
    let mut cx = x.chunks_exact_mut(LANES);
    for xs in &mut cx {
        let mut vx = [0.0f32; LANES];
        vx.copy_from_slice(xs);
        let out: [f32; LANES] = (va * f32x8::new(vx)).into();
        xs.copy_from_slice(&out);
    }

    for x in cx.into_remainder() {
        *x *= a;
    }
}
