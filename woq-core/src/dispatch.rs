//! Kernel selection.
//!
//! A call's tags resolve once into a [`DispatchKey`]. The key picks one of
//! the monomorphized blocked kernels through an exhaustive match, so adding a
//! type or weight path without a kernel fails to compile rather than falling
//! through at runtime. Fusion is resolved by the epilogue once per output
//! tile and is not part of the kernel's type.

use half::{bf16, f16};

use crate::dequant::{Int4Codec, Int8Codec, Nf4Codec};
use crate::dtype::{FloatType, FusionKind, QuantMode, WeightDType};
use crate::error::{Result, WoqError};
use crate::gemm::{GemmProblem, blocked};
use crate::layout::WeightLayout;
use crate::simd::{self, Avx2Token};
use crate::tensor::Tensor;

/// Weight format folded with zero-point handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightPath {
    Int8Sym,
    Int8Asym,
    Int4Sym,
    Int4Asym,
    Nf4,
}

impl WeightPath {
    pub const ALL: [WeightPath; 5] = [
        WeightPath::Int8Sym,
        WeightPath::Int8Asym,
        WeightPath::Int4Sym,
        WeightPath::Int4Asym,
        WeightPath::Nf4,
    ];

    pub fn resolve(dtype: WeightDType, mode: QuantMode) -> Result<Self> {
        let asym = mode.is_asymmetric();
        if asym && !dtype.supports_asymmetric() {
            return Err(WoqError::InvalidCombination(format!(
                "{dtype:?} weights are symmetric only, got mode {}",
                mode.name()
            )));
        }
        Ok(match (dtype, asym) {
            (WeightDType::Int8, false) => WeightPath::Int8Sym,
            (WeightDType::Int8, true) => WeightPath::Int8Asym,
            (WeightDType::Int4, false) => WeightPath::Int4Sym,
            (WeightDType::Int4, true) => WeightPath::Int4Asym,
            (WeightDType::Nf4, _) => WeightPath::Nf4,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub act: FloatType,
    pub compute: FloatType,
    pub mode: QuantMode,
    pub path: WeightPath,
    pub fusion: FusionKind,
}

impl DispatchKey {
    pub fn resolve(
        act: FloatType,
        compute: FloatType,
        dtype: WeightDType,
        mode: QuantMode,
        fusion: FusionKind,
    ) -> Result<Self> {
        let path = WeightPath::resolve(dtype, mode)?;
        Ok(Self { act, compute, mode, path, fusion })
    }
}

pub type GemmKernel = fn(&GemmProblem<'_>, Avx2Token) -> Result<Tensor>;

#[derive(Debug, Clone, Copy)]
pub enum Kernel {
    Specialized(GemmKernel, Avx2Token),
    Reference,
}

/// Number of monomorphized kernels: activation × compute × weight path.
pub const SPECIALIZED_KERNELS: usize = FloatType::ALL.len() * FloatType::ALL.len() * WeightPath::ALL.len();

macro_rules! path_kernel {
    ($a:ty, $c:ty, $path:expr) => {
        match $path {
            WeightPath::Int8Sym => blocked::run::<$a, $c, Int8Codec, false> as GemmKernel,
            WeightPath::Int8Asym => blocked::run::<$a, $c, Int8Codec, true> as GemmKernel,
            WeightPath::Int4Sym => blocked::run::<$a, $c, Int4Codec, false> as GemmKernel,
            WeightPath::Int4Asym => blocked::run::<$a, $c, Int4Codec, true> as GemmKernel,
            WeightPath::Nf4 => blocked::run::<$a, $c, Nf4Codec, false> as GemmKernel,
        }
    };
}

macro_rules! compute_kernel {
    ($a:ty, $compute:expr, $path:expr) => {
        match $compute {
            FloatType::F32 => path_kernel!($a, f32, $path),
            FloatType::F16 => path_kernel!($a, f16, $path),
            FloatType::BF16 => path_kernel!($a, bf16, $path),
        }
    };
}

/// The blocked kernel for an (activation, compute, weight path) triple.
pub fn specialized(act: FloatType, compute: FloatType, path: WeightPath) -> GemmKernel {
    match act {
        FloatType::F32 => compute_kernel!(f32, compute, path),
        FloatType::F16 => compute_kernel!(f16, compute, path),
        FloatType::BF16 => compute_kernel!(bf16, compute, path),
    }
}

/// Pick the kernel for a resolved key. The blocked kernels need the blocked
/// layout and AVX2; anything else runs on the reference path.
pub fn select(key: &DispatchKey, layout: &WeightLayout) -> Kernel {
    if !layout.is_blocked() {
        tracing::debug!(?key, "plain weight layout, using reference gemm");
        return Kernel::Reference;
    }
    match simd::avx2() {
        Some(tok) => {
            tracing::debug!(?key, "specialized gemm");
            Kernel::Specialized(specialized(key.act, key.compute, key.path), tok)
        }
        None => {
            tracing::debug!(?key, level = simd::level().name(), "no avx2, using reference gemm");
            Kernel::Reference
        }
    }
}
