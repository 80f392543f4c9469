//! Specialized GEMM over the blocked `[Nc, Kc, Kb, Nb]` layout.
//!
//! For each `Nb`-wide column tile the engine walks the `Kc` reduction tiles,
//! dequantizes one `Kb x Nb` slab into `wtile` (compute precision, stored as
//! f32) and folds it into the f32 accumulators of every activation row with
//! an AVX2 axpy. The full weight never exists in floating point. After the
//! last K tile the epilogue runs and results are narrowed into the output.

use crate::dequant::{WeightCodec, dequant_row_asym, dequant_row_sym};
use crate::dtype::Element;
use crate::error::{Result, WoqError};
use crate::layout::WeightLayout;
use crate::simd::Avx2Token;
use crate::tensor::Tensor;

use super::GemmProblem;

/// One monomorphized kernel: activation type `A`, compute precision `C`,
/// weight codec `W`, asymmetric zero points when `ASYM`.
pub fn run<A: Element, C: Element, W: WeightCodec, const ASYM: bool>(
    p: &GemmProblem<'_>,
    tok: Avx2Token,
) -> Result<Tensor> {
    let WeightLayout::Blocked { nc, kc, kb, nb } = p.layout else {
        return Err(WoqError::InvalidArgument {
            arg: "weight",
            reason: "blocked kernel called with a plain layout".into(),
        });
    };
    let (m, n, k) = (p.m, p.n, p.k);
    let x = p.activations::<A, C>()?;

    let stored_row = nb / W::DTYPE.values_per_byte();
    let tile_bytes = kb * stored_row;

    let mut out = vec![A::default(); m * n];
    let mut acc = vec![0.0f32; m * nb];
    let mut levels = vec![0.0f32; nb];
    let mut wtile = vec![0.0f32; kb * nb];

    for c in 0..nc {
        let cols = c * nb..(c + 1) * nb;
        acc.fill(0.0);

        for r in 0..kc {
            let tile = &p.weight[(c * kc + r) * tile_bytes..][..tile_bytes];

            for (i, dst) in wtile.chunks_exact_mut(nb).enumerate() {
                let g = p.tables.group(r * kb + i);
                let scales = &p.tables.scale_row(g)[cols.clone()];
                W::unpack_row(&tile[i * stored_row..(i + 1) * stored_row], &mut levels);
                if ASYM {
                    let zeros = p.tables.zero_row(g).ok_or(WoqError::MissingZeroPoints {
                        mode: "asymmetric",
                    })?;
                    dequant_row_asym::<C>(&levels, scales, &zeros[cols.clone()], dst);
                } else {
                    dequant_row_sym::<C>(&levels, scales, W::CENTRE, dst);
                }
            }

            for (row, a) in acc.chunks_exact_mut(nb).enumerate() {
                let xs = &x[row * k + r * kb..][..kb];
                for (&xv, w) in xs.iter().zip(wtile.chunks_exact(nb)) {
                    tok.axpy(a, xv, w);
                }
            }
        }

        for (row, a) in acc.chunks_exact_mut(nb).enumerate() {
            p.epilogue.apply(row, cols.start, a);
            for (o, &v) in out[row * n + cols.start..][..nb].iter_mut().zip(a.iter()) {
                *o = A::from_f32(v);
            }
        }
    }

    Tensor::from_elements(p.out_shape.clone(), out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dequant::{Int4Codec, Int8Codec, Nf4Codec};
    use crate::dtype::{QuantMode, WeightDType};
    use crate::gemm::{WoqParams, prepare, reference};
    use crate::layout::{pack_blocked, pack_plain};
    use crate::simd;
    use half::{bf16, f16};

    fn xorshift(state: &mut u64) -> u64 {
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        *state
    }

    #[test]
    fn test_blocked_matches_reference_int4_asym() {
        let Some(tok) = simd::avx2() else { return };
        let (m, n, k) = (3, 16, 32);
        let mut s = 0xDEAD_BEEFu64;
        let levels: Vec<u8> = (0..n * k).map(|_| (xorshift(&mut s) % 16) as u8).collect();
        let plain = pack_plain(&levels, n, k, WeightDType::Int4).unwrap();
        let w = pack_blocked(&plain, WeightDType::Int4, 8, 8).unwrap();
        let scales = [Tensor::from_f32(
            [n, 4],
            (0..n * 4).map(|i| 0.01 + (i % 7) as f32 * 0.003).collect(),
        )
        .unwrap()];
        let zps = [Tensor::from_f32([n, 4], (0..n * 4).map(|i| (i % 16) as f32).collect()).unwrap()];
        let act = Tensor::from_f32(
            [m, k],
            (0..m * k).map(|_| (xorshift(&mut s) % 1000) as f32 / 500.0 - 1.0).collect(),
        )
        .unwrap();
        let params = WoqParams::new(WeightDType::Int4, QuantMode::PerKBlock, &scales)
            .zero_points(&zps)
            .quant_block_k(8);
        let (_, p) = prepare(&act, &w, &params).unwrap();

        let got = run::<f32, f32, Int4Codec, true>(&p, tok).unwrap().to_f32_vec();
        let want = reference::run(&p).unwrap().to_f32_vec();
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() < 1e-4, "blocked={g} reference={w}");
        }
    }

    #[test]
    fn test_blocked_int8_f16_activation() {
        let Some(tok) = simd::avx2() else { return };
        let (n, k) = (8, 4);
        let levels: Vec<u8> = (0..n * k).map(|i| (i as i8 - 16) as u8).collect();
        let w = pack_blocked(&pack_plain(&levels, n, k, WeightDType::Int8).unwrap(), WeightDType::Int8, 8, 2).unwrap();
        let scales = [Tensor::from_f32([1], vec![0.5]).unwrap()];
        let act = Tensor::from_elements([1, k], vec![f16::from_f32(1.0); k]).unwrap();
        let params = WoqParams::new(WeightDType::Int8, QuantMode::PerTensorSym, &scales);
        let (_, p) = prepare(&act, &w, &params).unwrap();
        let got = run::<f16, f32, Int8Codec, false>(&p, tok).unwrap();
        let want = reference::run(&p).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn test_blocked_nf4_bf16_compute() {
        let Some(tok) = simd::avx2() else { return };
        let (n, k) = (4, 4);
        let levels: Vec<u8> = (0..n * k).map(|i| i as u8).collect();
        let w = pack_blocked(&pack_plain(&levels, n, k, WeightDType::Nf4).unwrap(), WeightDType::Nf4, 2, 2).unwrap();
        let scales = [Tensor::from_f32([n], vec![0.3; n]).unwrap()];
        let act = Tensor::from_elements([2, k], vec![bf16::from_f32(0.7); 2 * k]).unwrap();
        let params = WoqParams::new(WeightDType::Nf4, QuantMode::PerChannelSym, &scales)
            .compute(crate::dtype::FloatType::BF16);
        let (_, p) = prepare(&act, &w, &params).unwrap();
        let got = run::<bf16, bf16, Nf4Codec, false>(&p, tok).unwrap().to_f32_vec();
        let want = reference::run(&p).unwrap().to_f32_vec();
        for (g, w) in got.iter().zip(&want) {
            assert!((g - w).abs() <= 0.01 * w.abs().max(1.0), "blocked={g} reference={w}");
        }
    }

    #[test]
    fn test_plain_layout_rejected() {
        let Some(tok) = simd::avx2() else { return };
        let w = pack_plain(&[0; 4], 2, 2, WeightDType::Int8).unwrap();
        let scales = [Tensor::from_f32([1], vec![1.0]).unwrap()];
        let act = Tensor::from_f32([1, 2], vec![1.0; 2]).unwrap();
        let params = WoqParams::new(WeightDType::Int8, QuantMode::PerTensorSym, &scales);
        let (_, p) = prepare(&act, &w, &params).unwrap();
        assert!(run::<f32, f32, Int8Codec, false>(&p, tok).is_err());
    }
}
