//! RMS normalization over the last dimension, with an optional fused
//! residual add.
//!
//! `y = x / sqrt(mean(x²) + eps) * weight`, accumulated in f32 and stored in
//! the input's representation.

use crate::dtype::Element;
use crate::error::{Result, WoqError};
use crate::simd;
use crate::tensor::{Tensor, TensorData};

struct Normalized<A> {
    out: Vec<A>,
    sum: Option<Vec<A>>,
}

pub fn rms_norm(input: &Tensor, weight: &Tensor, eps: f32) -> Result<Tensor> {
    let (d, w) = validate(input, weight, eps)?;
    let out = match input.data() {
        TensorData::F32(x) => TensorData::F32(normalize(x, None, &w, d, eps).out),
        TensorData::F16(x) => TensorData::F16(normalize(x, None, &w, d, eps).out),
        TensorData::BF16(x) => TensorData::BF16(normalize(x, None, &w, d, eps).out),
        _ => return Err(float_only("input", input)),
    };
    Tensor::new(input.shape().to_vec(), out)
}

/// Normalize `input + residual`. With `add_back` the sum (rounded to the
/// residual's type) replaces the contents of `residual`; otherwise
/// `residual` is left untouched.
pub fn add_rms_norm(
    input: &Tensor,
    residual: &mut Tensor,
    weight: &Tensor,
    eps: f32,
    add_back: bool,
) -> Result<Tensor> {
    let (out, sum) = add_rms_norm_with_sum(input, residual, weight, eps)?;
    if add_back {
        residual.set_data(sum.into_data())?;
    }
    Ok(out)
}

/// Like [`add_rms_norm`] but returns `(normalized, input + residual)` and
/// mutates nothing.
pub fn add_rms_norm_with_sum(
    input: &Tensor,
    residual: &Tensor,
    weight: &Tensor,
    eps: f32,
) -> Result<(Tensor, Tensor)> {
    if input.shape() != residual.shape() || input.dtype() != residual.dtype() {
        return Err(WoqError::InvalidShape {
            name: "residual",
            reason: format!(
                "{:?} {:?} does not match input {:?} {:?}",
                residual.dtype(),
                residual.shape(),
                input.dtype(),
                input.shape()
            ),
        });
    }
    let (d, w) = validate(input, weight, eps)?;

    let (out, sum) = match (input.data(), residual.data()) {
        (TensorData::F32(x), TensorData::F32(r)) => split(normalize(x, Some(r.as_slice()), &w, d, eps)),
        (TensorData::F16(x), TensorData::F16(r)) => split(normalize(x, Some(r.as_slice()), &w, d, eps)),
        (TensorData::BF16(x), TensorData::BF16(r)) => split(normalize(x, Some(r.as_slice()), &w, d, eps)),
        _ => return Err(float_only("input", input)),
    };
    let shape = input.shape().to_vec();
    Ok((Tensor::new(shape.clone(), out)?, Tensor::new(shape, sum)?))
}

fn split<A: Element>(n: Normalized<A>) -> (TensorData, TensorData) {
    (A::wrap(n.out), A::wrap(n.sum.unwrap_or_default()))
}

fn float_only(name: &'static str, t: &Tensor) -> WoqError {
    WoqError::DTypeMismatch {
        name,
        got: t.dtype(),
        expected: "f32, f16, bf16",
    }
}

/// Returns the normalized length and the widened weight.
fn validate(input: &Tensor, weight: &Tensor, eps: f32) -> Result<(usize, Vec<f32>)> {
    let d = match input.shape().last() {
        Some(&d) if d > 0 => d,
        _ => {
            return Err(WoqError::InvalidShape {
                name: "input",
                reason: format!("cannot normalize over the last dim of {:?}", input.shape()),
            });
        }
    };
    if !weight.dtype().is_float() {
        return Err(float_only("weight", weight));
    }
    if weight.numel() != d {
        return Err(WoqError::InvalidShape {
            name: "weight",
            reason: format!("{} values for a normalized dim of {d}", weight.numel()),
        });
    }
    if !(eps.is_finite() && eps >= 0.0) {
        return Err(WoqError::InvalidArgument {
            arg: "eps",
            reason: format!("{eps} is not a finite non-negative number"),
        });
    }
    Ok((d, weight.to_f32_vec()))
}

fn normalize<A: Element>(x: &[A], residual: Option<&[A]>, w: &[f32], d: usize, eps: f32) -> Normalized<A> {
    let mut out = Vec::with_capacity(x.len());
    let mut sum = residual.map(|_| Vec::with_capacity(x.len()));
    let mut row = vec![0.0f32; d];
    let mut other = vec![0.0f32; d];
    let mut y = vec![0.0f32; d];

    for (i, xs) in x.chunks_exact(d).enumerate() {
        for (r, v) in row.iter_mut().zip(xs) {
            *r = v.to_f32();
        }
        if let (Some(res), Some(sum)) = (residual, sum.as_mut()) {
            for (o, v) in other.iter_mut().zip(&res[i * d..(i + 1) * d]) {
                *o = v.to_f32();
            }
            simd::add(&row, &other, &mut y);
            std::mem::swap(&mut row, &mut y);
            sum.extend(row.iter().map(|&v| A::from_f32(v)));
        }

        let ms = simd::sum_squares(&row) / d as f32;
        let inv = 1.0 / (ms + eps).sqrt();
        simd::scale_mul(&row, inv, w, &mut y);
        out.extend(y.iter().map(|&v| A::from_f32(v)));
    }
    Normalized { out, sum }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_rms_norm_basic() {
        let x = Tensor::from_f32([1, 4], vec![1.0, -1.0, 1.0, -1.0]).unwrap();
        let w = Tensor::from_f32([4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = rms_norm(&x, &w, 0.0).unwrap().to_f32_vec();
        assert_eq!(y, vec![1.0, -2.0, 3.0, -4.0]);
    }

    #[test]
    fn test_rms_norm_rows_independent() {
        let x = Tensor::from_f32([2, 2], vec![3.0, 4.0, 0.0, 0.0]).unwrap();
        let w = Tensor::from_f32([2], vec![1.0, 1.0]).unwrap();
        let y = rms_norm(&x, &w, 1e-6).unwrap().to_f32_vec();
        let rms = (12.5f32 + 1e-6).sqrt();
        assert!((y[0] - 3.0 / rms).abs() < 1e-6);
        assert!((y[1] - 4.0 / rms).abs() < 1e-6);
        assert_eq!(&y[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_rms_norm_f16_keeps_type() {
        let x = Tensor::from_elements([1, 2], vec![f16::from_f32(2.0); 2]).unwrap();
        let w = Tensor::from_f32([2], vec![1.0, 1.0]).unwrap();
        let y = rms_norm(&x, &w, 0.0).unwrap();
        assert_eq!(y.as_slice::<f16>().unwrap(), &[f16::from_f32(1.0); 2]);
    }

    #[test]
    fn test_add_back_writes_sum() {
        let x = Tensor::from_f32([1, 2], vec![1.0, 2.0]).unwrap();
        let mut r = Tensor::from_f32([1, 2], vec![2.0, 2.0]).unwrap();
        let w = Tensor::from_f32([2], vec![1.0, 1.0]).unwrap();
        add_rms_norm(&x, &mut r, &w, 1e-6, true).unwrap();
        assert_eq!(r.to_f32_vec(), vec![3.0, 4.0]);

        let mut r = Tensor::from_f32([1, 2], vec![2.0, 2.0]).unwrap();
        let a = add_rms_norm(&x, &mut r, &w, 1e-6, false).unwrap();
        assert_eq!(r.to_f32_vec(), vec![2.0, 2.0]);
        let b = rms_norm(&Tensor::from_f32([1, 2], vec![3.0, 4.0]).unwrap(), &w, 1e-6).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_with_sum_does_not_mutate() {
        let x = Tensor::from_f32([1, 2], vec![1.0, 2.0]).unwrap();
        let r = Tensor::from_f32([1, 2], vec![0.5, 0.5]).unwrap();
        let w = Tensor::from_f32([2], vec![1.0, 1.0]).unwrap();
        let (_, sum) = add_rms_norm_with_sum(&x, &r, &w, 0.0).unwrap();
        assert_eq!(sum.to_f32_vec(), vec![1.5, 2.5]);
        assert_eq!(r.to_f32_vec(), vec![0.5, 0.5]);
    }

    #[test]
    fn test_validation() {
        let x = Tensor::from_f32([1, 2], vec![1.0, 2.0]).unwrap();
        let w3 = Tensor::from_f32([3], vec![1.0; 3]).unwrap();
        let w2 = Tensor::from_f32([2], vec![1.0; 2]).unwrap();
        assert!(rms_norm(&x, &w3, 1e-6).is_err());
        assert!(rms_norm(&x, &w2, -1.0).is_err());
        assert!(rms_norm(&x, &w2, f32::NAN).is_err());

        let mut r = Tensor::from_f32([2, 1], vec![1.0, 2.0]).unwrap();
        assert!(add_rms_norm(&x, &mut r, &w2, 1e-6, true).is_err());
        assert_eq!(r.to_f32_vec(), vec![1.0, 2.0]);

        let mut r16 = Tensor::from_elements([1, 2], vec![f16::from_f32(1.0); 2]).unwrap();
        assert!(add_rms_norm(&x, &mut r16, &w2, 1e-6, true).is_err());
    }
}
