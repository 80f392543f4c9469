#![allow(clippy::needless_range_loop)]
//! Portable fallbacks for the vector primitives.

/// `acc[j] += a * x[j]`
#[inline]
pub fn axpy(acc: &mut [f32], a: f32, x: &[f32]) {
    debug_assert_eq!(acc.len(), x.len());
    for (o, &v) in acc.iter_mut().zip(x) {
        *o += a * v;
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

pub fn sum_squares(x: &[f32]) -> f32 {
    let mut ss = 0.0f32;
    for &v in x {
        ss += v * v;
    }
    ss
}

/// `out[j] = x[j] * inv * w[j]`
pub fn scale_mul(x: &[f32], inv: f32, w: &[f32], out: &mut [f32]) {
    debug_assert!(x.len() == w.len() && x.len() == out.len());
    for j in 0..out.len() {
        out[j] = x[j] * inv * w[j];
    }
}

/// `out[j] = a[j] + b[j]`
pub fn add(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    for j in 0..out.len() {
        out[j] = a[j] + b[j];
    }
}

/// Rotate the pairs `(x[h], y[h])` by the angle whose cosine/sine are given.
pub fn rotate(x: &[f32], y: &[f32], cos: &[f32], sin: &[f32], out_x: &mut [f32], out_y: &mut [f32]) {
    let n = out_x.len();
    debug_assert!(x.len() == n && y.len() == n && out_y.len() == n);
    debug_assert!(cos.len() >= n && sin.len() >= n);
    for h in 0..n {
        out_x[h] = x[h] * cos[h] - y[h] * sin[h];
        out_y[h] = y[h] * cos[h] + x[h] * sin[h];
    }
}
