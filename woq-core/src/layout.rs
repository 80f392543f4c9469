//! Packed weight layouts.
//!
//! A quantized weight is logically `[N, K]` and physically one of:
//!
//! ```text
//! plain    [N, K]             INT8, one value per byte
//!          [N, K/2]           4-bit, two K neighbours per byte
//! blocked  [Nc, Kc, Kb, Nb]   INT8
//!          [Nc, Kc, Kb, Nb/2] 4-bit, two N neighbours per byte
//! ```
//!
//! In both 4-bit layouts the low nibble holds the even element. The blocked
//! layout puts `Nb` output channels contiguously for each reduction index, so a
//! `Kb x Nb` tile is a dense slab the GEMM can dequantize row by row.

use crate::dtype::{ElemType, WeightDType};
use crate::error::{Result, WoqError};
use crate::tensor::{Tensor, TensorData};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    Plain { n: usize, k: usize },
    Blocked { nc: usize, kc: usize, kb: usize, nb: usize },
}

impl WeightLayout {
    /// Interpret a stored weight shape. For 4-bit formats the packed
    /// dimension is doubled, so `n`/`k`/`nb` are always logical counts.
    pub fn from_shape(shape: &[usize], dtype: WeightDType) -> Result<Self> {
        if shape.contains(&0) {
            return Err(WoqError::InvalidShape {
                name: "weight",
                reason: format!("zero-sized dimension in {shape:?}"),
            });
        }
        let vpb = dtype.values_per_byte();
        match *shape {
            [n, k_stored] => Ok(WeightLayout::Plain { n, k: k_stored * vpb }),
            [nc, kc, kb, nb_stored] => Ok(WeightLayout::Blocked {
                nc,
                kc,
                kb,
                nb: nb_stored * vpb,
            }),
            _ => Err(WoqError::InvalidShape {
                name: "weight",
                reason: format!(
                    "expected plain [N, K] or blocked [Nc, Kc, Kb, Nb], got rank {}",
                    shape.len()
                ),
            }),
        }
    }

    /// Output channels.
    pub fn n(&self) -> usize {
        match *self {
            WeightLayout::Plain { n, .. } => n,
            WeightLayout::Blocked { nc, nb, .. } => nc * nb,
        }
    }

    /// Reduction length.
    pub fn k(&self) -> usize {
        match *self {
            WeightLayout::Plain { k, .. } => k,
            WeightLayout::Blocked { kc, kb, .. } => kc * kb,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, WeightLayout::Blocked { .. })
    }

    /// Bytes needed to store the whole weight.
    pub fn stored_bytes(&self, dtype: WeightDType) -> usize {
        self.n() * self.k() / dtype.values_per_byte()
    }
}

/// Borrow the packed bytes of a weight tensor. INT8 weights may be stored as
/// `I8` or `U8`; 4-bit weights must be `U8`.
pub fn weight_bytes(weight: &Tensor, dtype: WeightDType) -> Result<&[u8]> {
    let ok = match weight.dtype() {
        ElemType::U8 => true,
        ElemType::I8 => dtype == WeightDType::Int8,
        _ => false,
    };
    match weight.packed_bytes() {
        Some(bytes) if ok => Ok(bytes),
        _ => Err(WoqError::DTypeMismatch {
            name: "weight",
            got: weight.dtype(),
            expected: if dtype.is_4bit() { "u8" } else { "u8, i8" },
        }),
    }
}

/// Raw stored value (byte, or nibble for 4-bit) of logical element `(n, k)`.
#[inline]
pub fn raw_at(bytes: &[u8], layout: &WeightLayout, dtype: WeightDType, n: usize, k: usize) -> u8 {
    let (elem, odd) = match *layout {
        WeightLayout::Plain { k: kk, .. } => (n * kk + k, k & 1 == 1),
        WeightLayout::Blocked { kc, kb, nb, .. } => {
            let (c, ni) = (n / nb, n % nb);
            let (r, ki) = (k / kb, k % kb);
            (((c * kc + r) * kb + ki) * nb + ni, ni & 1 == 1)
        }
    };
    if dtype.is_4bit() {
        let b = bytes[elem / 2];
        if odd { b >> 4 } else { b & 0x0F }
    } else {
        bytes[elem]
    }
}

/// Build a plain-layout weight from one raw value per logical element
/// (`levels` is row-major `[N, K]`). 4-bit values are masked to a nibble.
pub fn pack_plain(levels: &[u8], n: usize, k: usize, dtype: WeightDType) -> Result<Tensor> {
    if levels.len() != n * k {
        return Err(WoqError::InvalidShape {
            name: "weight",
            reason: format!("{} levels for a [{n}, {k}] weight", levels.len()),
        });
    }
    if !dtype.is_4bit() {
        return Tensor::new([n, k], TensorData::U8(levels.to_vec()));
    }
    if k % 2 != 0 {
        return Err(WoqError::InvalidShape {
            name: "weight",
            reason: format!("4-bit plain layout needs an even K, got {k}"),
        });
    }
    let bytes = levels
        .chunks_exact(2)
        .map(|p| (p[0] & 0x0F) | ((p[1] & 0x0F) << 4))
        .collect();
    Tensor::new([n, k / 2], TensorData::U8(bytes))
}

/// Repack a plain weight into the blocked layout with `nb` output channels
/// and `kb` reduction rows per tile.
pub fn pack_blocked(plain: &Tensor, dtype: WeightDType, nb: usize, kb: usize) -> Result<Tensor> {
    let layout = WeightLayout::from_shape(plain.shape(), dtype)?;
    let (n, k) = match layout {
        WeightLayout::Plain { n, k } => (n, k),
        WeightLayout::Blocked { .. } => {
            return Err(WoqError::InvalidArgument {
                arg: "weight",
                reason: "already in blocked layout".into(),
            });
        }
    };
    if nb == 0 || kb == 0 || n % nb != 0 || k % kb != 0 {
        return Err(WoqError::InvalidArgument {
            arg: "tile",
            reason: format!("tile {nb}x{kb} does not divide weight [{n}, {k}]"),
        });
    }
    if dtype.is_4bit() && nb % 2 != 0 {
        return Err(WoqError::InvalidArgument {
            arg: "tile",
            reason: format!("4-bit blocked layout needs an even Nb, got {nb}"),
        });
    }

    let src = weight_bytes(plain, dtype)?;
    let blocked = WeightLayout::Blocked { nc: n / nb, kc: k / kb, kb, nb };
    let vpb = dtype.values_per_byte();
    let mut out = vec![0u8; blocked.stored_bytes(dtype)];

    for ni in 0..n {
        for ki in 0..k {
            let raw = raw_at(src, &layout, dtype, ni, ki);
            let (c, j) = (ni / nb, ni % nb);
            let (r, i) = (ki / kb, ki % kb);
            let elem = ((c * (k / kb) + r) * kb + i) * nb + j;
            if vpb == 2 {
                out[elem / 2] |= if j & 1 == 1 { raw << 4 } else { raw };
            } else {
                out[elem] = raw;
            }
        }
    }

    let shape = [n / nb, k / kb, kb, nb / vpb];
    let data = match plain.data() {
        TensorData::I8(_) => TensorData::I8(bytemuck::pod_collect_to_vec(&out)),
        _ => TensorData::U8(out),
    };
    tracing::debug!(?shape, ?dtype, "weight repacked into blocked layout");
    Tensor::new(shape, data)
}
