use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatch::WeightPath;
use crate::dtype::{FloatType, FusionKind, QuantMode, WeightDType};
use crate::error::{Result, WoqError};
use crate::gemm::WoqParams;
use crate::tensor::Tensor;

/// Quantization settings that stay fixed for a layer, as stored alongside a
/// quantized checkpoint.
///
/// ```json
/// { "weight_dtype": "int4", "mode": "per_k_block", "quant_block_k": 128,
///   "fusion": "gelu_tanh", "compute": "bf16" }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WoqConfig {
    pub weight_dtype: WeightDType,
    pub mode: QuantMode,
    pub quant_block_k: i64,
    pub fusion: FusionKind,
    pub compute: FloatType,
}

impl Default for WoqConfig {
    fn default() -> Self {
        Self {
            weight_dtype: WeightDType::Int4,
            mode: QuantMode::PerKBlockSym,
            quant_block_k: 128,
            fusion: FusionKind::None,
            compute: FloatType::F32,
        }
    }
}

impl WoqConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "loading woq config");
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject settings no call could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.quant_block_k < 0 {
            return Err(WoqError::Config(format!(
                "quant_block_k must be >= 0, got {}",
                self.quant_block_k
            )));
        }
        WeightPath::resolve(self.weight_dtype, self.mode).map_err(|e| WoqError::Config(e.to_string()))?;
        Ok(())
    }

    /// Call parameters for this config. Zero points, bias and fusion
    /// operands are attached with the [`WoqParams`] builder methods.
    pub fn params<'a>(&self, scales: &'a [Tensor]) -> WoqParams<'a> {
        let mut p = WoqParams::new(self.weight_dtype, self.mode, scales)
            .compute(self.compute)
            .quant_block_k(self.quant_block_k);
        p.fusion = self.fusion;
        p
    }
}
