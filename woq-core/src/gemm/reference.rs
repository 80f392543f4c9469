//! Unvectorized GEMM: dequantize one weight row, dot it with every
//! activation row. Handles both layouts and every mode.

use half::{bf16, f16};

use crate::dequant;
use crate::dtype::FloatType;
use crate::error::Result;
use crate::layout;
use crate::simd::scalar;
use crate::tensor::Tensor;

use super::GemmProblem;

pub fn run(p: &GemmProblem<'_>) -> Result<Tensor> {
    let (m, n, k) = (p.m, p.n, p.k);
    let compute = p.compute;
    let x: Vec<f32> = p.act.to_f32_vec().into_iter().map(|v| compute.round(v)).collect();

    let mut acc = vec![0.0f32; m * n];
    let mut wrow = vec![0.0f32; k];
    for col in 0..n {
        for (kk, w) in wrow.iter_mut().enumerate() {
            let g = p.tables.group(kk);
            let raw = layout::raw_at(p.weight, &p.layout, p.weight_dtype, col, kk);
            let scale = p.tables.scale_row(g)[col];
            let zp = p.tables.zero_row(g).map(|z| z[col]);
            *w = compute.round(dequant::dequant_value(p.weight_dtype, raw, scale, zp));
        }
        for row in 0..m {
            acc[row * n + col] = scalar::dot(&x[row * k..(row + 1) * k], &wrow);
        }
    }

    for (row, vals) in acc.chunks_exact_mut(n).enumerate() {
        p.epilogue.apply(row, 0, vals);
    }

    tracing::trace!(m, n, k, "reference gemm done");
    narrow(p.act_type, p.out_shape.clone(), acc)
}

/// Store f32 results in the activation's representation.
pub fn narrow(ty: FloatType, shape: Vec<usize>, values: Vec<f32>) -> Result<Tensor> {
    match ty {
        FloatType::F32 => Tensor::from_f32(shape, values),
        FloatType::F16 => Tensor::from_elements(shape, values.into_iter().map(f16::from_f32).collect()),
        FloatType::BF16 => Tensor::from_elements(shape, values.into_iter().map(bf16::from_f32).collect()),
    }
}
