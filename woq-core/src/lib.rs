pub mod config;
pub mod dequant;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod gemm;
pub mod layout;
pub mod quant;
pub mod rmsnorm;
pub mod rope;
pub mod simd;
pub mod tensor;

pub use config::WoqConfig;
pub use dtype::{ElemType, FloatType, FusionKind, QuantMode, WeightDType};
pub use error::{Result, WoqError};
pub use gemm::{WoqParams, woq_gemm, woq_gemm_reference};
pub use rmsnorm::{add_rms_norm, add_rms_norm_with_sum, rms_norm};
pub use rope::rotary_embedding;
pub use tensor::{Tensor, TensorData};
