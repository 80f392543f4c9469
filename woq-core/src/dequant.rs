#![allow(clippy::needless_range_loop)]
//! Dequantization of packed weight values.
//!
//! Packed weights hold one *level* per logical element: a signed byte for
//! INT8, an unsigned nibble for INT4, or a codebook index for NF4. A level is
//! turned into a real weight with the (group, channel) scale and, in
//! asymmetric modes, the zero point:
//!
//! ```text
//! asymmetric: w = (level - zero_point) * scale
//! symmetric:  w = (level - centre) * scale      centre = 8 for INT4, 0 otherwise
//! ```
//!
//! Row helpers operate on short slices (one tile row) so the blocked GEMM can
//! keep reconstructed weights in a cache-resident scratch tile.

use crate::dtype::{Element, WeightDType};

// ─── NF4 codebook ────────────────────────────────────────────────────

/// The 16-entry normal-float codebook (quantiles of N(0, 1), scaled to [-1, 1]).
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// Centre subtracted from a level in symmetric modes.
pub fn symmetric_centre(dtype: WeightDType) -> f32 {
    match dtype {
        WeightDType::Int4 => 8.0,
        WeightDType::Int8 | WeightDType::Nf4 => 0.0,
    }
}

/// Map one raw stored value (a byte, or a nibble for 4-bit formats) to its level.
#[inline]
pub fn level(dtype: WeightDType, raw: u8) -> f32 {
    match dtype {
        WeightDType::Int8 => raw as i8 as f32,
        WeightDType::Int4 => (raw & 0x0F) as f32,
        WeightDType::Nf4 => NF4_CODEBOOK[(raw & 0x0F) as usize],
    }
}

/// Dequantize a single element. Used by the reference path.
#[inline]
pub fn dequant_value(dtype: WeightDType, raw: u8, scale: f32, zero_point: Option<f32>) -> f32 {
    let l = level(dtype, raw);
    match zero_point {
        Some(z) => (l - z) * scale,
        None => (l - symmetric_centre(dtype)) * scale,
    }
}

// ─── Statically dispatched codecs ────────────────────────────────────

/// A packed weight format known at compile time. Monomorphizing the GEMM
/// over a codec keeps format checks out of the inner loops.
pub trait WeightCodec: Send + Sync + 'static {
    const DTYPE: WeightDType;
    const CENTRE: f32;

    /// Unpack the levels of one stored row: `src` holds
    /// `dst.len() / values_per_byte` bytes.
    fn unpack_row(src: &[u8], dst: &mut [f32]);
}

pub struct Int8Codec;
pub struct Int4Codec;
pub struct Nf4Codec;

impl WeightCodec for Int8Codec {
    const DTYPE: WeightDType = WeightDType::Int8;
    const CENTRE: f32 = 0.0;

    #[inline(always)]
    fn unpack_row(src: &[u8], dst: &mut [f32]) {
        debug_assert_eq!(src.len(), dst.len());
        for (d, &b) in dst.iter_mut().zip(src) {
            *d = b as i8 as f32;
        }
    }
}

/// Low nibble holds the even element, high nibble the odd one.
impl WeightCodec for Int4Codec {
    const DTYPE: WeightDType = WeightDType::Int4;
    const CENTRE: f32 = 8.0;

    #[inline(always)]
    fn unpack_row(src: &[u8], dst: &mut [f32]) {
        debug_assert_eq!(src.len() * 2, dst.len());
        for (pair, &b) in dst.chunks_exact_mut(2).zip(src) {
            pair[0] = (b & 0x0F) as f32;
            pair[1] = (b >> 4) as f32;
        }
    }
}

impl WeightCodec for Nf4Codec {
    const DTYPE: WeightDType = WeightDType::Nf4;
    const CENTRE: f32 = 0.0;

    #[inline(always)]
    fn unpack_row(src: &[u8], dst: &mut [f32]) {
        debug_assert_eq!(src.len() * 2, dst.len());
        for (pair, &b) in dst.chunks_exact_mut(2).zip(src) {
            pair[0] = NF4_CODEBOOK[(b & 0x0F) as usize];
            pair[1] = NF4_CODEBOOK[(b >> 4) as usize];
        }
    }
}

// ─── Row dequantization ──────────────────────────────────────────────

/// `out[j] = round_C((levels[j] - centre) * scales[j])`
#[inline(always)]
pub fn dequant_row_sym<C: Element>(levels: &[f32], scales: &[f32], centre: f32, out: &mut [f32]) {
    debug_assert!(levels.len() == out.len() && scales.len() == out.len());
    for j in 0..out.len() {
        out[j] = C::from_f32((levels[j] - centre) * scales[j]).to_f32();
    }
}

/// `out[j] = round_C((levels[j] - zeros[j]) * scales[j])`
#[inline(always)]
pub fn dequant_row_asym<C: Element>(
    levels: &[f32],
    scales: &[f32],
    zeros: &[f32],
    out: &mut [f32],
) {
    debug_assert!(levels.len() == out.len() && scales.len() == out.len());
    debug_assert_eq!(zeros.len(), out.len());
    for j in 0..out.len() {
        out[j] = C::from_f32((levels[j] - zeros[j]) * scales[j]).to_f32();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_nf4_codebook_shape() {
        assert_eq!(NF4_CODEBOOK[0], -1.0);
        assert_eq!(NF4_CODEBOOK[7], 0.0);
        assert_eq!(NF4_CODEBOOK[15], 1.0);
        for w in NF4_CODEBOOK.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_level_per_format() {
        assert_eq!(level(WeightDType::Int8, 0xFF), -1.0);
        assert_eq!(level(WeightDType::Int8, 0x7F), 127.0);
        assert_eq!(level(WeightDType::Int4, 0x0F), 15.0);
        assert_eq!(level(WeightDType::Nf4, 0x00), -1.0);
    }

    #[test]
    fn test_dequant_value_sym_and_asym() {
        // INT4 symmetric: (3 - 8) * 0.5
        assert_eq!(dequant_value(WeightDType::Int4, 3, 0.5, None), -2.5);
        // INT4 asymmetric: (3 - 2) * 0.5
        assert_eq!(dequant_value(WeightDType::Int4, 3, 0.5, Some(2.0)), 0.5);
        // INT8 asymmetric with a negative zero point
        assert_eq!(dequant_value(WeightDType::Int8, 0xFE, 2.0, Some(-4.0)), 4.0);
        assert_eq!(dequant_value(WeightDType::Nf4, 15, 3.0, None), 3.0);
    }

    #[test]
    fn test_int4_unpack_order() {
        let mut out = [0.0f32; 4];
        Int4Codec::unpack_row(&[0xF0, 0x21], &mut out);
        assert_eq!(out, [0.0, 15.0, 1.0, 2.0]);
    }

    #[test]
    fn test_nf4_unpack() {
        let mut out = [0.0f32; 2];
        Nf4Codec::unpack_row(&[0xF7], &mut out);
        assert_eq!(out, [0.0, 1.0]);
    }

    #[test]
    fn test_int8_unpack() {
        let mut out = [0.0f32; 3];
        Int8Codec::unpack_row(&[0x80, 0x00, 0x05], &mut out);
        assert_eq!(out, [-128.0, 0.0, 5.0]);
    }

    #[test]
    fn test_codecs_match_scalar_level() {
        let mut s = 0x9E37_79B9u32;
        for _ in 0..256 {
            s ^= s << 13;
            s ^= s >> 17;
            s ^= s << 5;
            let b = (s & 0xFF) as u8;
            let mut pair = [0.0f32; 2];
            Int4Codec::unpack_row(&[b], &mut pair);
            assert_eq!(pair[0], level(WeightDType::Int4, b & 0x0F));
            assert_eq!(pair[1], level(WeightDType::Int4, b >> 4));
            Nf4Codec::unpack_row(&[b], &mut pair);
            assert_eq!(pair[1], level(WeightDType::Nf4, b >> 4));
        }
    }

    #[test]
    fn test_dequant_row_rounds_to_compute_type() {
        let levels = [1.0f32, 2.0];
        let scales = [1.0 + 1.0 / 512.0, 1.0];
        let mut out = [0.0f32; 2];
        dequant_row_sym::<bf16>(&levels, &scales, 0.0, &mut out);
        assert_eq!(out, [1.0, 2.0]);

        dequant_row_asym::<f32>(&levels, &[2.0, 2.0], &[1.0, 1.0], &mut out);
        assert_eq!(out, [0.0, 2.0]);
    }
}
