//! Bias add and fused post-ops, applied to f32 accumulators before narrowing.

use crate::dtype::FusionKind;
use crate::error::{Result, WoqError};
use crate::tensor::Tensor;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_C: f32 = 0.044_715;

#[inline]
pub fn gelu_tanh(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_C * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

#[inline]
pub fn gelu_erf(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7.
pub fn erf(x: f32) -> f32 {
    const P: f32 = 0.327_591_1;
    const A: [f32; 5] = [0.254_829_6, -0.284_496_74, 1.421_413_8, -1.453_152_1, 1.061_405_4];
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = t * (A[0] + t * (A[1] + t * (A[2] + t * (A[3] + t * A[4]))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Everything that happens to an accumulator row after the K loop.
#[derive(Debug, Clone)]
pub struct Epilogue {
    n: usize,
    bias: Option<Vec<f32>>,
    fusion: FusionKind,
    operands: Vec<Vec<f32>>,
}

impl Epilogue {
    /// Validate bias and fusion operands for an `[M, N]` output. Only the
    /// first (f32) entry of the bias list is read, whatever the compute
    /// precision.
    pub fn new(
        bias: &[Tensor],
        fusion: FusionKind,
        operands: &[Tensor],
        m: usize,
        n: usize,
    ) -> Result<Self> {
        let bias = match bias.first() {
            Some(b) => {
                if !b.dtype().is_float() {
                    return Err(WoqError::DTypeMismatch {
                        name: "bias",
                        got: b.dtype(),
                        expected: "f32, f16, bf16",
                    });
                }
                if b.numel() != n {
                    return Err(WoqError::InvalidShape {
                        name: "bias",
                        reason: format!("{} values for N = {n}", b.numel()),
                    });
                }
                Some(b.to_f32_vec())
            }
            None => None,
        };

        let want = fusion.operand_count();
        if operands.len() != want {
            return Err(WoqError::InvalidCombination(format!(
                "fusion {fusion:?} takes {want} operand(s), got {}",
                operands.len()
            )));
        }
        let mut widened = Vec::with_capacity(want);
        for op in operands {
            if !op.dtype().is_float() {
                return Err(WoqError::DTypeMismatch {
                    name: "fusion operand",
                    got: op.dtype(),
                    expected: "f32, f16, bf16",
                });
            }
            if op.numel() != m * n {
                return Err(WoqError::InvalidShape {
                    name: "fusion operand",
                    reason: format!("shape {:?} does not hold an [{m}, {n}] output", op.shape()),
                });
            }
            widened.push(op.to_f32_vec());
        }

        Ok(Self { n, bias, fusion, operands: widened })
    }

    /// Finish output columns `col0..col0 + vals.len()` of `row`.
    #[inline]
    pub fn apply(&self, row: usize, col0: usize, vals: &mut [f32]) {
        if let Some(bias) = &self.bias {
            for (v, b) in vals.iter_mut().zip(&bias[col0..]) {
                *v += b;
            }
        }
        let base = row * self.n + col0;
        match self.fusion {
            FusionKind::None => {}
            FusionKind::GeluErf => vals.iter_mut().for_each(|v| *v = gelu_erf(*v)),
            FusionKind::GeluTanh => vals.iter_mut().for_each(|v| *v = gelu_tanh(*v)),
            FusionKind::Silu => vals.iter_mut().for_each(|v| *v = silu(*v)),
            FusionKind::Relu => vals.iter_mut().for_each(|v| *v = v.max(0.0)),
            FusionKind::Add => {
                for (v, a) in vals.iter_mut().zip(&self.operands[0][base..]) {
                    *v += a;
                }
            }
            FusionKind::AddAdd => {
                let (a, b) = (&self.operands[0][base..], &self.operands[1][base..]);
                for ((v, x), y) in vals.iter_mut().zip(a).zip(b) {
                    *v += x + y;
                }
            }
            FusionKind::Mul => {
                for (v, a) in vals.iter_mut().zip(&self.operands[0][base..]) {
                    *v *= a;
                }
            }
        }
    }
}
