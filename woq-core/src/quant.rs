//! Per-call quantization tables.
//!
//! Scale and zero-point tensors arrive in one of three granularities. They are
//! folded here into a single shape the kernels can index without branching:
//! a group-major `[G][N]` table plus a `k -> group` map. Per tensor and per
//! channel both become `G = 1`; per K block uses `G = K / block_k`, or the
//! caller's group index when one is supplied.

use crate::dtype::{ElemType, FloatType, Granularity, QuantMode, WeightDType};
use crate::error::{Result, WoqError};
use crate::tensor::{Tensor, TensorData};

/// Index of the INT8 entry in a zero-point list.
pub const ZERO_POINT_I8_INDEX: usize = 3;

#[derive(Debug, Clone)]
pub struct QuantTables {
    n: usize,
    group_of_k: Vec<u32>,
    scales: Vec<f32>,
    zeros: Option<Vec<f32>>,
}

impl QuantTables {
    /// Validate the scale/zero-point lists against `mode` and build the
    /// tables for an `[N, K]` weight.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        mode: QuantMode,
        dtype: WeightDType,
        compute: FloatType,
        n: usize,
        k: usize,
        scales: &[Tensor],
        zero_points: &[Tensor],
        quant_block_k: i64,
        g_idx: Option<&Tensor>,
    ) -> Result<Self> {
        let scale = pick(scales, compute as usize).ok_or_else(|| WoqError::InvalidShape {
            name: "scales",
            reason: "scale list is empty".into(),
        })?;
        if !scale.dtype().is_float() {
            return Err(WoqError::DTypeMismatch {
                name: "scales",
                got: scale.dtype(),
                expected: "f32, f16, bf16",
            });
        }

        let zero = if mode.is_asymmetric() {
            let preferred = if dtype == WeightDType::Int8 {
                ZERO_POINT_I8_INDEX
            } else {
                compute as usize
            };
            let zp = zero_points
                .get(preferred)
                .or_else(|| pick(zero_points, compute as usize))
                .ok_or(WoqError::MissingZeroPoints { mode: mode.name() })?;
            if !(zp.dtype().is_float() || zp.dtype() == ElemType::I8) {
                return Err(WoqError::DTypeMismatch {
                    name: "zero_points",
                    got: zp.dtype(),
                    expected: "f32, f16, bf16, i8",
                });
            }
            Some(zp)
        } else {
            if !zero_points.is_empty() {
                tracing::debug!(mode = mode.name(), "symmetric mode, zero points ignored");
            }
            None
        };

        if g_idx.is_some() && mode.granularity() != Granularity::PerKBlock {
            return Err(WoqError::InvalidCombination(format!(
                "group index given with {} quantization; only per-K-block modes take one",
                mode.name()
            )));
        }

        let (groups, group_of_k) = match mode.granularity() {
            Granularity::PerTensor | Granularity::PerChannel => (1, vec![0u32; k]),
            Granularity::PerKBlock => match g_idx {
                Some(idx) => group_map_from_index(idx, scale.numel(), n, k)?,
                None => group_map_from_block(quant_block_k, k)?,
            },
        };

        let scales = expand("scales", scale, mode.granularity(), n, groups)?;
        let zeros = match zero {
            Some(zp) => Some(expand("zero_points", zp, mode.granularity(), n, groups)?),
            None => None,
        };

        Ok(Self { n, group_of_k, scales, zeros })
    }

    #[inline(always)]
    pub fn group(&self, k: usize) -> usize {
        self.group_of_k[k] as usize
    }

    /// Scales of group `g` for every output channel.
    #[inline(always)]
    pub fn scale_row(&self, g: usize) -> &[f32] {
        &self.scales[g * self.n..(g + 1) * self.n]
    }

    /// Zero points of group `g`, `None` in symmetric modes.
    #[inline(always)]
    pub fn zero_row(&self, g: usize) -> Option<&[f32]> {
        self.zeros.as_ref().map(|z| &z[g * self.n..(g + 1) * self.n])
    }
}

/// The list entry for representation `idx`, or the only entry supplied.
fn pick(list: &[Tensor], idx: usize) -> Option<&Tensor> {
    list.get(idx).or_else(|| list.first())
}

fn group_map_from_block(quant_block_k: i64, k: usize) -> Result<(usize, Vec<u32>)> {
    let block = quant_block_k.max(0) as usize;
    if block == 0 || block >= k {
        return Ok((1, vec![0u32; k]));
    }
    if k % block != 0 {
        return Err(WoqError::InvalidArgument {
            arg: "quant_block_k",
            reason: format!("block size {block} does not divide K = {k}"),
        });
    }
    let map = (0..k).map(|i| (i / block) as u32).collect();
    Ok((k / block, map))
}

fn group_map_from_index(idx: &Tensor, scale_numel: usize, n: usize, k: usize) -> Result<(usize, Vec<u32>)> {
    let values = match idx.data() {
        TensorData::I32(v) => v,
        _ => {
            return Err(WoqError::DTypeMismatch {
                name: "g_idx",
                got: idx.dtype(),
                expected: "i32",
            });
        }
    };
    if values.len() != k {
        return Err(WoqError::InvalidShape {
            name: "g_idx",
            reason: format!("length {} does not match K = {k}", values.len()),
        });
    }
    if scale_numel % n != 0 {
        return Err(WoqError::InvalidShape {
            name: "scales",
            reason: format!("{scale_numel} scales cannot cover {n} channels"),
        });
    }
    let groups = scale_numel / n;
    let mut map = Vec::with_capacity(k);
    for (i, &g) in values.iter().enumerate() {
        if g < 0 || g as usize >= groups {
            return Err(WoqError::InvalidArgument {
                arg: "g_idx",
                reason: format!("g_idx[{i}] = {g} is outside 0..{groups}"),
            });
        }
        map.push(g as u32);
    }
    Ok((groups, map))
}

/// Widen `t` and lay it out group-major, `[G][N]`.
fn expand(name: &'static str, t: &Tensor, granularity: Granularity, n: usize, groups: usize) -> Result<Vec<f32>> {
    let expected = match granularity {
        Granularity::PerTensor => 1,
        Granularity::PerChannel => n,
        Granularity::PerKBlock => n * groups,
    };
    if t.numel() != expected {
        return Err(WoqError::InvalidShape {
            name,
            reason: format!(
                "{:?} quantization over N = {n}, G = {groups} needs {expected} values, got shape {:?}",
                granularity,
                t.shape()
            ),
        });
    }
    let v = t.to_f32_vec();
    Ok(match granularity {
        Granularity::PerTensor => vec![v[0]; n],
        Granularity::PerChannel => v,
        Granularity::PerKBlock => {
            // stored [N, G], transposed so one group's channels are contiguous
            let mut out = vec![0.0f32; n * groups];
            for c in 0..n {
                for g in 0..groups {
                    out[g * n + c] = v[c * groups + g];
                }
            }
            out
        }
    })
}
