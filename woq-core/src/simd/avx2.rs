#![allow(clippy::needless_range_loop)]
//! AVX2+FMA versions of the vector primitives. Every function here requires
//! the caller to have verified AVX2 and FMA support.

#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;

#[target_feature(enable = "avx2")]
unsafe fn hsum_avx2(v: __m256) -> f32 {
    let hi128 = _mm256_extractf128_ps(v, 1);
    let lo128 = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(lo128, hi128);
    let hi64 = _mm_movehl_ps(sum128, sum128);
    let sum64 = _mm_add_ps(sum128, hi64);
    let hi32 = _mm_shuffle_ps(sum64, sum64, 0x55);
    let sum32 = _mm_add_ss(sum64, hi32);
    _mm_cvtss_f32(sum32)
}

/// # Safety
/// Caller must verify AVX2+FMA support.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn axpy(acc: &mut [f32], a: f32, x: &[f32]) {
    debug_assert_eq!(acc.len(), x.len());
    let n = acc.len();
    let body = n - n % 8;
    unsafe {
        let av = _mm256_set1_ps(a);
        let mut i = 0;
        while i < body {
            let o = _mm256_loadu_ps(acc.as_ptr().add(i));
            let v = _mm256_loadu_ps(x.as_ptr().add(i));
            _mm256_storeu_ps(acc.as_mut_ptr().add(i), _mm256_fmadd_ps(av, v, o));
            i += 8;
        }
    }
    for j in body..n {
        acc[j] = a.mul_add(x[j], acc[j]);
    }
}

/// # Safety
/// Caller must verify AVX2+FMA support.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let body = n - n % 8;
    let mut sum = unsafe {
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let x = _mm256_loadu_ps(a.as_ptr().add(i));
            let y = _mm256_loadu_ps(b.as_ptr().add(i));
            acc = _mm256_fmadd_ps(x, y, acc);
            i += 8;
        }
        hsum_avx2(acc)
    };
    for j in body..n {
        sum += a[j] * b[j];
    }
    sum
}

/// # Safety
/// Caller must verify AVX2+FMA support.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn sum_squares(x: &[f32]) -> f32 {
    let n = x.len();
    let body = n - n % 8;
    let mut ss = unsafe {
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < body {
            let v = _mm256_loadu_ps(x.as_ptr().add(i));
            acc = _mm256_fmadd_ps(v, v, acc);
            i += 8;
        }
        hsum_avx2(acc)
    };
    for &v in &x[body..] {
        ss += v * v;
    }
    ss
}

/// # Safety
/// Caller must verify AVX2+FMA support.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn scale_mul(x: &[f32], inv: f32, w: &[f32], out: &mut [f32]) {
    debug_assert!(x.len() == w.len() && x.len() == out.len());
    let n = out.len();
    let body = n - n % 8;
    unsafe {
        let iv = _mm256_set1_ps(inv);
        let mut i = 0;
        while i < body {
            let v = _mm256_loadu_ps(x.as_ptr().add(i));
            let g = _mm256_loadu_ps(w.as_ptr().add(i));
            let r = _mm256_mul_ps(_mm256_mul_ps(v, iv), g);
            _mm256_storeu_ps(out.as_mut_ptr().add(i), r);
            i += 8;
        }
    }
    for j in body..n {
        out[j] = x[j] * inv * w[j];
    }
}

/// # Safety
/// Caller must verify AVX2+FMA support.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn add(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert!(a.len() == b.len() && a.len() == out.len());
    let n = out.len();
    let body = n - n % 8;
    unsafe {
        let mut i = 0;
        while i < body {
            let x = _mm256_loadu_ps(a.as_ptr().add(i));
            let y = _mm256_loadu_ps(b.as_ptr().add(i));
            _mm256_storeu_ps(out.as_mut_ptr().add(i), _mm256_add_ps(x, y));
            i += 8;
        }
    }
    for j in body..n {
        out[j] = a[j] + b[j];
    }
}

/// # Safety
/// Caller must verify AVX2+FMA support.
#[target_feature(enable = "avx2,fma")]
pub unsafe fn rotate(
    x: &[f32],
    y: &[f32],
    cos: &[f32],
    sin: &[f32],
    out_x: &mut [f32],
    out_y: &mut [f32],
) {
    let n = out_x.len();
    debug_assert!(x.len() == n && y.len() == n && out_y.len() == n);
    debug_assert!(cos.len() >= n && sin.len() >= n);
    let body = n - n % 8;
    unsafe {
        let mut h = 0;
        while h < body {
            let xv = _mm256_loadu_ps(x.as_ptr().add(h));
            let yv = _mm256_loadu_ps(y.as_ptr().add(h));
            let c = _mm256_loadu_ps(cos.as_ptr().add(h));
            let s = _mm256_loadu_ps(sin.as_ptr().add(h));
            // x*c - y*s and y*c + x*s
            let ox = _mm256_fmsub_ps(xv, c, _mm256_mul_ps(yv, s));
            let oy = _mm256_fmadd_ps(yv, c, _mm256_mul_ps(xv, s));
            _mm256_storeu_ps(out_x.as_mut_ptr().add(h), ox);
            _mm256_storeu_ps(out_y.as_mut_ptr().add(h), oy);
            h += 8;
        }
    }
    for h in body..n {
        out_x[h] = x[h] * cos[h] - y[h] * sin[h];
        out_y[h] = y[h] * cos[h] + x[h] * sin[h];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::scalar;

    fn has_avx2() -> bool {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }

    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    fn random_vec(s: &mut u64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| (xorshift(s) % 1000) as f32 / 500.0 - 1.0)
            .collect()
    }

    #[test]
    fn test_axpy_avx2_vs_scalar() {
        if !has_avx2() {
            return;
        }
        let mut s = 42u64;
        for n in [1usize, 7, 8, 13, 64, 100] {
            let x = random_vec(&mut s, n);
            let base = random_vec(&mut s, n);
            let mut want = base.clone();
            let mut got = base.clone();
            scalar::axpy(&mut want, 0.75, &x);
            unsafe { axpy(&mut got, 0.75, &x) };
            for (w, g) in want.iter().zip(&got) {
                assert!((w - g).abs() < 1e-5, "axpy n={n}: scalar={w} simd={g}");
            }
        }
    }

    #[test]
    fn test_dot_and_sum_squares_avx2_vs_scalar() {
        if !has_avx2() {
            return;
        }
        let mut s = 123u64;
        for _ in 0..1_000 {
            let n = (xorshift(&mut s) % 70) as usize + 1;
            let a = random_vec(&mut s, n);
            let b = random_vec(&mut s, n);
            let want = scalar::dot(&a, &b);
            let got = unsafe { dot(&a, &b) };
            assert!((want - got).abs() < 1e-3, "dot: scalar={want} simd={got}");
            let want = scalar::sum_squares(&a);
            let got = unsafe { sum_squares(&a) };
            assert!((want - got).abs() < 1e-3, "ss: scalar={want} simd={got}");
        }
    }

    #[test]
    fn test_rotate_avx2_vs_scalar() {
        if !has_avx2() {
            return;
        }
        let mut s = 777u64;
        for n in [1usize, 8, 19, 32] {
            let x = random_vec(&mut s, n);
            let y = random_vec(&mut s, n);
            let c = random_vec(&mut s, n);
            let sn = random_vec(&mut s, n);
            let (mut wx, mut wy) = (vec![0.0; n], vec![0.0; n]);
            let (mut gx, mut gy) = (vec![0.0; n], vec![0.0; n]);
            scalar::rotate(&x, &y, &c, &sn, &mut wx, &mut wy);
            unsafe { rotate(&x, &y, &c, &sn, &mut gx, &mut gy) };
            for h in 0..n {
                assert!((wx[h] - gx[h]).abs() < 1e-5);
                assert!((wy[h] - gy[h]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_scale_mul_and_add_avx2_vs_scalar() {
        if !has_avx2() {
            return;
        }
        let mut s = 555u64;
        let n = 37;
        let x = random_vec(&mut s, n);
        let w = random_vec(&mut s, n);
        let (mut want, mut got) = (vec![0.0; n], vec![0.0; n]);
        scalar::scale_mul(&x, 1.7, &w, &mut want);
        unsafe { scale_mul(&x, 1.7, &w, &mut got) };
        assert_eq!(want, got);
        scalar::add(&x, &w, &mut want);
        unsafe { add(&x, &w, &mut got) };
        assert_eq!(want, got);
    }
}
