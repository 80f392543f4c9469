use std::str::FromStr;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::WoqError;
use crate::tensor::TensorData;

/// Storage element types a [`crate::tensor::Tensor`] can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemType {
    F32,
    F16,
    BF16,
    I8,
    U8,
    I32,
}

impl ElemType {
    pub fn size_of(&self) -> usize {
        match self {
            ElemType::F32 | ElemType::I32 => 4,
            ElemType::F16 | ElemType::BF16 => 2,
            ElemType::I8 | ElemType::U8 => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElemType::F32 | ElemType::F16 | ElemType::BF16)
    }
}

/// Floating representations used for activations, scales and compute precision.
///
/// The discriminant doubles as the index into scale/zero-point/bias lists
/// that carry one tensor per representation (`fp32 = 0, fp16 = 1, bf16 = 2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum FloatType {
    F32 = 0,
    F16 = 1,
    BF16 = 2,
}

impl FloatType {
    pub const ALL: [FloatType; 3] = [FloatType::F32, FloatType::F16, FloatType::BF16];

    pub fn from_elem(elem: ElemType) -> Option<FloatType> {
        match elem {
            ElemType::F32 => Some(FloatType::F32),
            ElemType::F16 => Some(FloatType::F16),
            ElemType::BF16 => Some(FloatType::BF16),
            _ => None,
        }
    }

    /// Round an f32 to the nearest value representable in this type.
    #[inline]
    pub fn round(&self, v: f32) -> f32 {
        match self {
            FloatType::F32 => v,
            FloatType::F16 => f16::from_f32(v).to_f32(),
            FloatType::BF16 => bf16::from_f32(v).to_f32(),
        }
    }
}

impl TryFrom<i64> for FloatType {
    type Error = WoqError;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(FloatType::F32),
            1 => Ok(FloatType::F16),
            2 => Ok(FloatType::BF16),
            _ => Err(WoqError::UnsupportedTag {
                kind: "compute precision",
                value: tag,
            }),
        }
    }
}

/// Packed weight formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum WeightDType {
    Int8 = 1, // signed 8-bit, one value per byte
    Int4 = 2, // unsigned 4-bit, two values per byte, symmetric centre 8
    Nf4 = 3,  // 4-bit index into the normal-float codebook, symmetric only
}

impl WeightDType {
    pub fn bits(&self) -> u32 {
        match self {
            WeightDType::Int8 => 8,
            WeightDType::Int4 | WeightDType::Nf4 => 4,
        }
    }

    pub fn is_4bit(&self) -> bool {
        self.bits() == 4
    }

    /// Logical values held by one stored byte.
    pub fn values_per_byte(&self) -> usize {
        if self.is_4bit() { 2 } else { 1 }
    }

    /// NF4 codes index a fixed codebook and take no zero point.
    pub fn supports_asymmetric(&self) -> bool {
        !matches!(self, WeightDType::Nf4)
    }
}

impl TryFrom<i64> for WeightDType {
    type Error = WoqError;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(WeightDType::Int8),
            2 => Ok(WeightDType::Int4),
            3 => Ok(WeightDType::Nf4),
            _ => Err(WoqError::UnsupportedTag {
                kind: "weight dtype",
                value: tag,
            }),
        }
    }
}

/// Which slice of the weight one scale (and zero point) covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    PerTensor,
    PerChannel,
    PerKBlock,
}

/// Weight quantization mode: granularity plus symmetric/asymmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum QuantMode {
    PerChannel = 0,
    PerKBlock = 1,
    PerChannelSym = 2,
    PerKBlockSym = 3,
    PerTensor = 4,
    PerTensorSym = 5,
}

impl QuantMode {
    pub const ALL: [QuantMode; 6] = [
        QuantMode::PerChannel,
        QuantMode::PerKBlock,
        QuantMode::PerChannelSym,
        QuantMode::PerKBlockSym,
        QuantMode::PerTensor,
        QuantMode::PerTensorSym,
    ];

    pub fn is_asymmetric(&self) -> bool {
        matches!(
            self,
            QuantMode::PerChannel | QuantMode::PerKBlock | QuantMode::PerTensor
        )
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            QuantMode::PerTensor | QuantMode::PerTensorSym => Granularity::PerTensor,
            QuantMode::PerChannel | QuantMode::PerChannelSym => Granularity::PerChannel,
            QuantMode::PerKBlock | QuantMode::PerKBlockSym => Granularity::PerKBlock,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QuantMode::PerChannel => "per_channel",
            QuantMode::PerKBlock => "per_k_block",
            QuantMode::PerChannelSym => "per_channel_sym",
            QuantMode::PerKBlockSym => "per_k_block_sym",
            QuantMode::PerTensor => "per_tensor",
            QuantMode::PerTensorSym => "per_tensor_sym",
        }
    }
}

impl TryFrom<i64> for QuantMode {
    type Error = WoqError;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(QuantMode::PerChannel),
            1 => Ok(QuantMode::PerKBlock),
            2 => Ok(QuantMode::PerChannelSym),
            3 => Ok(QuantMode::PerKBlockSym),
            4 => Ok(QuantMode::PerTensor),
            5 => Ok(QuantMode::PerTensorSym),
            _ => Err(WoqError::UnsupportedTag {
                kind: "quantization mode",
                value: tag,
            }),
        }
    }
}

/// Post-op fused after the matmul and bias add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FusionKind {
    #[default]
    None = 0x00,
    GeluErf = 0x01,
    GeluTanh = 0x02,
    Silu = 0x03,
    Relu = 0x04,
    Add = 0x10,
    AddAdd = 0x20,
    Mul = 0x30,
}

impl FusionKind {
    pub const ALL: [FusionKind; 8] = [
        FusionKind::None,
        FusionKind::GeluErf,
        FusionKind::GeluTanh,
        FusionKind::Silu,
        FusionKind::Relu,
        FusionKind::Add,
        FusionKind::AddAdd,
        FusionKind::Mul,
    ];

    /// Number of extra [M, N] operands the post-op consumes.
    pub fn operand_count(&self) -> usize {
        match self {
            FusionKind::Add | FusionKind::Mul => 1,
            FusionKind::AddAdd => 2,
            _ => 0,
        }
    }
}

impl TryFrom<i64> for FusionKind {
    type Error = WoqError;

    fn try_from(tag: i64) -> Result<Self, Self::Error> {
        match tag {
            0x00 => Ok(FusionKind::None),
            0x01 => Ok(FusionKind::GeluErf),
            0x02 => Ok(FusionKind::GeluTanh),
            0x03 => Ok(FusionKind::Silu),
            0x04 => Ok(FusionKind::Relu),
            0x10 => Ok(FusionKind::Add),
            0x20 => Ok(FusionKind::AddAdd),
            0x30 => Ok(FusionKind::Mul),
            _ => Err(WoqError::UnsupportedTag {
                kind: "fusion",
                value: tag,
            }),
        }
    }
}

// Names match the serde spelling used by `WoqConfig`.

impl FromStr for FloatType {
    type Err = WoqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "f32" => Ok(FloatType::F32),
            "f16" => Ok(FloatType::F16),
            "bf16" => Ok(FloatType::BF16),
            _ => Err(WoqError::Config(format!("unknown float type '{s}', expected f32, f16 or bf16"))),
        }
    }
}

impl FromStr for WeightDType {
    type Err = WoqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int8" => Ok(WeightDType::Int8),
            "int4" => Ok(WeightDType::Int4),
            "nf4" => Ok(WeightDType::Nf4),
            _ => Err(WoqError::Config(format!("unknown weight type '{s}', expected int8, int4 or nf4"))),
        }
    }
}

impl FromStr for QuantMode {
    type Err = WoqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuantMode::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| WoqError::Config(format!("unknown quantization mode '{s}'")))
    }
}

/// A floating element type kernels can be monomorphized over.
pub trait Element: Copy + Default + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
    fn slice(data: &TensorData) -> Option<&[Self]>;
    fn wrap(values: Vec<Self>) -> TensorData;
}

impl Element for f32 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::F32(values)
    }
}

impl Element for f16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F16(v) => Some(v),
            _ => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::F16(values)
    }
}

impl Element for bf16 {
    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        bf16::from_f32(v)
    }

    fn slice(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::BF16(v) => Some(v),
            _ => None,
        }
    }

    fn wrap(values: Vec<Self>) -> TensorData {
        TensorData::BF16(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for mode in QuantMode::ALL {
            assert_eq!(QuantMode::try_from(mode as i64).unwrap(), mode);
        }
        for kind in FusionKind::ALL {
            assert_eq!(FusionKind::try_from(kind as i64).unwrap(), kind);
        }
        assert_eq!(WeightDType::try_from(2).unwrap(), WeightDType::Int4);
        assert_eq!(FloatType::try_from(2).unwrap(), FloatType::BF16);
    }

    #[test]
    fn test_unknown_tags_rejected() {
        assert!(matches!(
            WeightDType::try_from(0),
            Err(WoqError::UnsupportedTag { kind: "weight dtype", value: 0 })
        ));
        assert!(QuantMode::try_from(6).is_err());
        assert!(QuantMode::try_from(-1).is_err());
        assert!(FusionKind::try_from(0x05).is_err());
        assert!(FloatType::try_from(3).is_err());
    }

    #[test]
    fn test_mode_properties() {
        assert!(QuantMode::PerKBlock.is_asymmetric());
        assert!(!QuantMode::PerKBlockSym.is_asymmetric());
        assert_eq!(QuantMode::PerTensorSym.granularity(), Granularity::PerTensor);
        assert_eq!(QuantMode::PerChannel.granularity(), Granularity::PerChannel);
    }

    #[test]
    fn test_weight_dtype_properties() {
        assert_eq!(WeightDType::Int8.values_per_byte(), 1);
        assert_eq!(WeightDType::Nf4.values_per_byte(), 2);
        assert!(!WeightDType::Nf4.supports_asymmetric());
        assert!(WeightDType::Int4.supports_asymmetric());
    }

    #[test]
    fn test_names_parse() {
        assert_eq!("bf16".parse::<FloatType>().unwrap(), FloatType::BF16);
        assert_eq!("nf4".parse::<WeightDType>().unwrap(), WeightDType::Nf4);
        for mode in QuantMode::ALL {
            assert_eq!(mode.name().parse::<QuantMode>().unwrap(), mode);
        }
        assert!(matches!("int2".parse::<WeightDType>(), Err(WoqError::Config(_))));
        assert!("per_row".parse::<QuantMode>().is_err());
        assert!("F32".parse::<FloatType>().is_err());
    }

    #[test]
    fn test_float_round() {
        assert_eq!(FloatType::F32.round(1.0 + 1e-7), 1.0 + 1e-7);
        // bf16 has 7 explicit mantissa bits, so 1 + 2^-9 rounds back to 1
        assert_eq!(FloatType::BF16.round(1.0 + 1.0 / 512.0), 1.0);
        assert_eq!(FloatType::F16.round(0.5), 0.5);
    }

    #[test]
    fn test_fusion_operands() {
        assert_eq!(FusionKind::None.operand_count(), 0);
        assert_eq!(FusionKind::AddAdd.operand_count(), 2);
        assert_eq!(FusionKind::Mul.operand_count(), 1);
    }
}
