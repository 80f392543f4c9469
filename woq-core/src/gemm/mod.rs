//! Weight-only-quantized GEMM.
//!
//! `Y[M, N] = post_op(X[M, K] · dequant(W[N, K])ᵀ + bias)`
//!
//! Every call is validated up front by [`prepare`]: tags are resolved into a
//! [`DispatchKey`], the weight layout is decoded, scales and zero points are
//! folded into [`QuantTables`] and bias/fusion operands into an
//! [`Epilogue`]. Only then does a kernel run, so a configuration error never
//! leaves partial output behind.

pub mod blocked;
pub mod epilogue;
pub mod reference;

use crate::dispatch::{self, DispatchKey, Kernel};
use crate::dtype::{Element, FloatType, FusionKind, QuantMode, WeightDType};
use crate::error::{Result, WoqError};
use crate::layout::{self, WeightLayout};
use crate::quant::QuantTables;
use crate::tensor::Tensor;

use epilogue::Epilogue;

/// Quantization metadata and optional extras for one GEMM call.
///
/// The scale, zero-point and bias lists carry at most one tensor per
/// representation, indexed `f32 = 0, f16 = 1, bf16 = 2` (and `i8 = 3` for
/// zero points). For scales and zero points the entry matching the compute
/// precision is used, falling back to the first one. The bias is always read
/// from the first (f32) entry.
#[derive(Debug, Clone, Copy)]
pub struct WoqParams<'a> {
    pub weight_dtype: WeightDType,
    pub mode: QuantMode,
    pub compute: FloatType,
    pub quant_block_k: i64,
    pub fusion: FusionKind,
    pub scales: &'a [Tensor],
    pub zero_points: &'a [Tensor],
    pub bias: &'a [Tensor],
    pub fusion_operands: &'a [Tensor],
    pub g_idx: Option<&'a Tensor>,
}

impl<'a> WoqParams<'a> {
    pub fn new(weight_dtype: WeightDType, mode: QuantMode, scales: &'a [Tensor]) -> Self {
        Self {
            weight_dtype,
            mode,
            compute: FloatType::F32,
            quant_block_k: 0,
            fusion: FusionKind::None,
            scales,
            zero_points: &[],
            bias: &[],
            fusion_operands: &[],
            g_idx: None,
        }
    }

    /// Build from the raw integer tags used at an FFI or graph boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn from_tags(
        weight_dtype: i64,
        mode: i64,
        fusion: i64,
        compute: i64,
        quant_block_k: i64,
        scales: &'a [Tensor],
        zero_points: &'a [Tensor],
        bias: &'a [Tensor],
        fusion_operands: &'a [Tensor],
        g_idx: Option<&'a Tensor>,
    ) -> Result<Self> {
        Ok(Self {
            weight_dtype: WeightDType::try_from(weight_dtype)?,
            mode: QuantMode::try_from(mode)?,
            compute: FloatType::try_from(compute)?,
            quant_block_k,
            fusion: FusionKind::try_from(fusion)?,
            scales,
            zero_points,
            bias,
            fusion_operands,
            g_idx,
        })
    }

    pub fn zero_points(mut self, zero_points: &'a [Tensor]) -> Self {
        self.zero_points = zero_points;
        self
    }

    pub fn bias(mut self, bias: &'a [Tensor]) -> Self {
        self.bias = bias;
        self
    }

    pub fn fusion(mut self, fusion: FusionKind, operands: &'a [Tensor]) -> Self {
        self.fusion = fusion;
        self.fusion_operands = operands;
        self
    }

    pub fn compute(mut self, compute: FloatType) -> Self {
        self.compute = compute;
        self
    }

    pub fn quant_block_k(mut self, block: i64) -> Self {
        self.quant_block_k = block;
        self
    }

    pub fn g_idx(mut self, g_idx: &'a Tensor) -> Self {
        self.g_idx = Some(g_idx);
        self
    }
}

/// A validated call, ready for either GEMM path.
#[derive(Debug)]
pub struct GemmProblem<'a> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub act: &'a Tensor,
    pub weight: &'a [u8],
    pub layout: WeightLayout,
    pub weight_dtype: WeightDType,
    pub compute: FloatType,
    pub act_type: FloatType,
    pub tables: QuantTables,
    pub epilogue: Epilogue,
    pub out_shape: Vec<usize>,
}

impl GemmProblem<'_> {
    /// Activations widened to f32 and rounded to the compute precision.
    pub fn activations<A: Element, C: Element>(&self) -> Result<Vec<f32>> {
        let x = self.act.as_slice::<A>().ok_or(WoqError::DTypeMismatch {
            name: "activation",
            got: self.act.dtype(),
            expected: "the dispatched activation type",
        })?;
        Ok(x.iter().map(|v| C::from_f32(v.to_f32()).to_f32()).collect())
    }
}

/// Validate a call and resolve its dispatch key. Nothing is computed.
pub fn prepare<'a>(act: &'a Tensor, weight: &'a Tensor, params: &WoqParams<'_>) -> Result<(DispatchKey, GemmProblem<'a>)> {
    if act.rank() < 2 {
        return Err(WoqError::InvalidShape {
            name: "activation",
            reason: format!("rank {} < 2", act.rank()),
        });
    }
    let act_type = FloatType::from_elem(act.dtype()).ok_or(WoqError::DTypeMismatch {
        name: "activation",
        got: act.dtype(),
        expected: "f32, f16, bf16",
    })?;

    let key = DispatchKey::resolve(act_type, params.compute, params.weight_dtype, params.mode, params.fusion)?;

    let layout = WeightLayout::from_shape(weight.shape(), params.weight_dtype)?;
    let bytes = layout::weight_bytes(weight, params.weight_dtype)?;
    let (n, k) = (layout.n(), layout.k());

    let act_k = act.shape()[act.rank() - 1];
    if act_k != k {
        return Err(WoqError::InvalidShape {
            name: "activation",
            reason: format!("last dim {act_k} does not match weight K = {k}"),
        });
    }
    let m = act.numel() / k;

    let tables = QuantTables::build(
        params.mode,
        params.weight_dtype,
        params.compute,
        n,
        k,
        params.scales,
        params.zero_points,
        params.quant_block_k,
        params.g_idx,
    )?;
    let epilogue = Epilogue::new(params.bias, params.fusion, params.fusion_operands, m, n)?;

    let mut out_shape = act.shape().to_vec();
    if let Some(last) = out_shape.last_mut() {
        *last = n;
    }

    let problem = GemmProblem {
        m,
        n,
        k,
        act,
        weight: bytes,
        layout,
        weight_dtype: params.weight_dtype,
        compute: params.compute,
        act_type,
        tables,
        epilogue,
        out_shape,
    };
    Ok((key, problem))
}

/// Quantized matmul. Runs the specialized blocked kernel when the weight is
/// blocked and the CPU supports it, the reference path otherwise.
pub fn woq_gemm(act: &Tensor, weight: &Tensor, params: &WoqParams<'_>) -> Result<Tensor> {
    let (key, problem) = prepare(act, weight, params)?;
    match dispatch::select(&key, &problem.layout) {
        Kernel::Specialized(kernel, token) => kernel(&problem, token),
        Kernel::Reference => reference::run(&problem),
    }
}

/// Quantized matmul forced onto the reference path.
pub fn woq_gemm_reference(act: &Tensor, weight: &Tensor, params: &WoqParams<'_>) -> Result<Tensor> {
    let (_, problem) = prepare(act, weight, params)?;
    reference::run(&problem)
}
