//! Rotary position embedding.
//!
//! Each head's feature pairs `(h, h + offset)` for `h < rotary_ndims / 2` are
//! rotated by the angle whose cosine and sine sit in row `position` of the
//! caller's tables:
//!
//! ```text
//! out[h]          = x[h] * cos[p, h] - x[h + offset] * sin[p, h]
//! out[h + offset] = x[h + offset] * cos[p, h] + x[h] * sin[p, h]
//! ```
//!
//! Features the rotation does not write are copied through unchanged.

use crate::dtype::{ElemType, Element};
use crate::error::{Result, WoqError};
use crate::simd;
use crate::tensor::{Tensor, TensorData};

struct RopeShape {
    tokens: usize,
    heads: usize,
    head_size: usize,
    half: usize,
    offset: usize,
    table_width: usize,
}

/// Rotate `x` (`[.., tokens, heads, head_size]`, leading dims flattened into
/// tokens) using one position id per token and f32 `cos`/`sin` tables of
/// shape `[max_positions, >= rotary_ndims / 2]`. Returns a new tensor of the
/// same shape and type.
pub fn rotary_embedding(
    x: &Tensor,
    positions: &[usize],
    cos: &Tensor,
    sin: &Tensor,
    rotary_ndims: usize,
    offset: usize,
) -> Result<Tensor> {
    let shape = validate(x, positions, cos, sin, rotary_ndims, offset)?;
    let (cos_t, sin_t) = match (cos.as_slice::<f32>(), sin.as_slice::<f32>()) {
        (Some(c), Some(s)) => (c, s),
        _ => {
            return Err(WoqError::DTypeMismatch {
                name: "cos/sin",
                got: if cos.dtype() == ElemType::F32 { sin.dtype() } else { cos.dtype() },
                expected: "f32",
            });
        }
    };

    let data = match x.data() {
        TensorData::F32(v) => TensorData::F32(rotate_all(v, positions, cos_t, sin_t, &shape)),
        TensorData::F16(v) => TensorData::F16(rotate_all(v, positions, cos_t, sin_t, &shape)),
        TensorData::BF16(v) => TensorData::BF16(rotate_all(v, positions, cos_t, sin_t, &shape)),
        _ => {
            return Err(WoqError::DTypeMismatch {
                name: "x",
                got: x.dtype(),
                expected: "f32, f16, bf16",
            });
        }
    };
    Tensor::new(x.shape().to_vec(), data)
}

fn validate(
    x: &Tensor,
    positions: &[usize],
    cos: &Tensor,
    sin: &Tensor,
    rotary_ndims: usize,
    offset: usize,
) -> Result<RopeShape> {
    let dims = x.shape();
    if dims.len() < 3 {
        return Err(WoqError::InvalidShape {
            name: "x",
            reason: format!("expected [.., tokens, heads, head_size], got {dims:?}"),
        });
    }
    let head_size = dims[dims.len() - 1];
    let heads = dims[dims.len() - 2];
    let tokens: usize = dims[..dims.len() - 2].iter().product();

    if rotary_ndims % 2 != 0 || rotary_ndims > head_size {
        return Err(WoqError::InvalidArgument {
            arg: "rotary_ndims",
            reason: format!("{rotary_ndims} must be even and at most head_size {head_size}"),
        });
    }
    let half = rotary_ndims / 2;
    if offset == 0 || half + offset > head_size {
        return Err(WoqError::InvalidArgument {
            arg: "offset",
            reason: format!("{offset} places the rotated pair outside a head of {head_size}"),
        });
    }
    if positions.len() != tokens {
        return Err(WoqError::InvalidShape {
            name: "positions",
            reason: format!("{} ids for {tokens} tokens", positions.len()),
        });
    }
    if cos.shape() != sin.shape() || cos.rank() != 2 {
        return Err(WoqError::InvalidShape {
            name: "cos/sin",
            reason: format!("tables must share a 2-D shape, got {:?} and {:?}", cos.shape(), sin.shape()),
        });
    }
    let (rows, table_width) = (cos.shape()[0], cos.shape()[1]);
    if table_width < half {
        return Err(WoqError::InvalidShape {
            name: "cos/sin",
            reason: format!("width {table_width} < rotary_ndims / 2 = {half}"),
        });
    }
    if let Some((t, &p)) = positions.iter().enumerate().find(|&(_, &p)| p >= rows) {
        return Err(WoqError::InvalidArgument {
            arg: "positions",
            reason: format!("position {p} of token {t} is beyond the {rows}-row table"),
        });
    }

    Ok(RopeShape { tokens, heads, head_size, half, offset, table_width })
}

fn rotate_all<A: Element>(x: &[A], positions: &[usize], cos: &[f32], sin: &[f32], s: &RopeShape) -> Vec<A> {
    let mut out = x.to_vec();
    let mut head = vec![0.0f32; s.head_size];
    let mut rx = vec![0.0f32; s.half];
    let mut ry = vec![0.0f32; s.half];

    for t in 0..s.tokens {
        let row = positions[t] * s.table_width;
        let (c, sn) = (&cos[row..row + s.half], &sin[row..row + s.half]);
        for h in 0..s.heads {
            let base = (t * s.heads + h) * s.head_size;
            for (d, v) in head.iter_mut().zip(&x[base..base + s.head_size]) {
                *d = v.to_f32();
            }
            simd::rotate(
                &head[..s.half],
                &head[s.offset..s.offset + s.half],
                c,
                sn,
                &mut rx,
                &mut ry,
            );
            // when offset < half the two halves overlap and the first half wins
            let dst = &mut out[base..base + s.head_size];
            for (o, &v) in dst[s.offset..s.offset + s.half].iter_mut().zip(&ry) {
                *o = A::from_f32(v);
            }
            for (o, &v) in dst[..s.half].iter_mut().zip(&rx) {
                *o = A::from_f32(v);
            }
        }
    }
    out
}
