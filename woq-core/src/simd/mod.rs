pub mod scalar;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod avx2;

use std::sync::atomic::{AtomicU8, Ordering::Relaxed};

static LEVEL: AtomicU8 = AtomicU8::new(0);

const SCALAR: u8 = 1;
const AVX2: u8 = 2;

/// Environment variable consulted once by the capability probe:
/// `scalar` forces the reference paths, `avx2` requests AVX2 (still subject
/// to detection), anything else or unset means auto-detect.
pub const ISA_ENV: &str = "WOQ_ISA";

/// Instruction-set level the kernels run at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Scalar,
    Avx2,
}

impl Level {
    pub fn name(&self) -> &'static str {
        match self {
            Level::Scalar => "scalar",
            Level::Avx2 => "avx2+fma",
        }
    }
}

fn detect() -> u8 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    let detected = if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        AVX2
    } else {
        SCALAR
    };

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    let detected = SCALAR;

    detected
}

fn dispatch_level() -> u8 {
    let l = LEVEL.load(Relaxed);
    if l != 0 {
        return l;
    }

    let detected = detect();
    let chosen = match std::env::var(ISA_ENV).as_deref() {
        Ok("scalar") => SCALAR,
        Ok("avx2") | Ok("auto") | Err(_) => detected,
        Ok(other) => {
            tracing::warn!("{ISA_ENV}={other} not recognised, auto-detecting");
            detected
        }
    };

    tracing::info!(
        level = if chosen == AVX2 { "avx2+fma" } else { "scalar" },
        detected_avx2 = detected == AVX2,
        "cpu capability probed"
    );
    LEVEL.store(chosen, Relaxed);
    chosen
}

/// The process-wide kernel level, probed on first use.
pub fn level() -> Level {
    if dispatch_level() == AVX2 {
        Level::Avx2
    } else {
        Level::Scalar
    }
}

/// Override the probed level, e.g. to benchmark the reference paths.
/// Requests for AVX2 on a CPU without it stay at scalar. Returns the level
/// now in effect.
pub fn force_level(requested: Level) -> Level {
    let value = match requested {
        Level::Avx2 if detect() == AVX2 => AVX2,
        _ => SCALAR,
    };
    LEVEL.store(value, Relaxed);
    tracing::debug!(?requested, effective = value, "kernel level forced");
    level()
}

/// Proof that AVX2+FMA are usable. Only obtainable through [`avx2`], so
/// holding one makes the intrinsics behind its methods sound to call.
#[derive(Debug, Clone, Copy)]
pub struct Avx2Token(());

/// `Some` when the current level is AVX2.
pub fn avx2() -> Option<Avx2Token> {
    (level() == Level::Avx2).then_some(Avx2Token(()))
}

impl Avx2Token {
    /// `acc[j] += a * x[j]`. Panics if the lengths differ.
    #[inline]
    pub fn axpy(self, acc: &mut [f32], a: f32, x: &[f32]) {
        assert_eq!(acc.len(), x.len(), "axpy length mismatch");
        // SAFETY: the token exists only when AVX2+FMA were detected.
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        unsafe {
            avx2::axpy(acc, a, x);
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        scalar::axpy(acc, a, x);
    }
}

// ─── Level-dispatched primitives ─────────────────────────────────────
//
// The AVX2 bodies index by raw pointer, so every length is checked here
// before either path runs.

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "dot length mismatch");
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if dispatch_level() == AVX2 {
        return unsafe { avx2::dot(a, b) };
    }

    scalar::dot(a, b)
}

pub fn sum_squares(x: &[f32]) -> f32 {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if dispatch_level() == AVX2 {
        return unsafe { avx2::sum_squares(x) };
    }

    scalar::sum_squares(x)
}

pub fn scale_mul(x: &[f32], inv: f32, w: &[f32], out: &mut [f32]) {
    assert!(x.len() == out.len() && w.len() == out.len(), "scale_mul length mismatch");
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if dispatch_level() == AVX2 {
        unsafe { avx2::scale_mul(x, inv, w, out) };
        return;
    }

    scalar::scale_mul(x, inv, w, out)
}

pub fn add(a: &[f32], b: &[f32], out: &mut [f32]) {
    assert!(a.len() == out.len() && b.len() == out.len(), "add length mismatch");
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if dispatch_level() == AVX2 {
        unsafe { avx2::add(a, b, out) };
        return;
    }

    scalar::add(a, b, out)
}

/// Rotate `out_x.len()` pairs. `cos` and `sin` may be longer than the rest.
pub fn rotate(x: &[f32], y: &[f32], cos: &[f32], sin: &[f32], out_x: &mut [f32], out_y: &mut [f32]) {
    let n = out_x.len();
    assert!(
        x.len() == n && y.len() == n && out_y.len() == n && cos.len() >= n && sin.len() >= n,
        "rotate length mismatch"
    );
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    if dispatch_level() == AVX2 {
        unsafe { avx2::rotate(x, y, cos, sin, out_x, out_y) };
        return;
    }

    scalar::rotate(x, y, cos, sin, out_x, out_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_is_stable() {
        let first = level();
        assert_eq!(level(), first);
        assert_eq!(avx2().is_some(), first == Level::Avx2);
    }

    #[test]
    fn test_token_axpy() {
        let mut acc = vec![1.0f32; 11];
        let x: Vec<f32> = (0..11).map(|i| i as f32).collect();
        match avx2() {
            Some(t) => t.axpy(&mut acc, 2.0, &x),
            None => scalar::axpy(&mut acc, 2.0, &x),
        }
        for (i, v) in acc.iter().enumerate() {
            assert_eq!(*v, 1.0 + 2.0 * i as f32);
        }
    }

    #[test]
    #[should_panic(expected = "dot length mismatch")]
    fn test_dot_rejects_short_operand() {
        dot(&[1.0; 4096], &[1.0; 8]);
    }

    #[test]
    fn test_mismatched_lengths_panic() {
        use std::panic::catch_unwind;

        let long = [1.0f32; 64];
        let short = [1.0f32; 3];
        assert!(catch_unwind(|| add(&long, &short, &mut [0.0; 64])).is_err());
        assert!(catch_unwind(|| scale_mul(&long, 1.0, &short, &mut [0.0; 64])).is_err());
        assert!(catch_unwind(|| rotate(&long, &long, &short, &long, &mut [0.0; 64], &mut [0.0; 64])).is_err());
        // wider tables are fine
        rotate(&short, &short, &long, &long, &mut [0.0; 3], &mut [0.0; 3]);

        if let Some(t) = avx2() {
            assert!(catch_unwind(|| t.axpy(&mut [0.0; 64], 1.0, &short)).is_err());
        }
    }

    #[test]
    fn test_dispatched_primitives() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let b = [1.0f32; 9];
        assert_eq!(dot(&a, &b), 45.0);
        assert_eq!(sum_squares(&a[..3]), 14.0);
        let mut out = [0.0f32; 9];
        add(&a, &b, &mut out);
        assert_eq!(out[8], 10.0);
        scale_mul(&a, 0.5, &b, &mut out);
        assert_eq!(out[1], 1.0);
    }
}
