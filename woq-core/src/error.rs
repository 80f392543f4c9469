use thiserror::Error;

use crate::dtype::ElemType;

#[derive(Error, Debug)]
pub enum WoqError {
    #[error("unsupported {kind} tag: {value}")]
    UnsupportedTag { kind: &'static str, value: i64 },

    #[error("invalid combination: {0}")]
    InvalidCombination(String),

    #[error("tensor '{name}' has invalid shape: {reason}")]
    InvalidShape { name: &'static str, reason: String },

    #[error("asymmetric quantization mode {mode} requires zero points, but none were given")]
    MissingZeroPoints { mode: &'static str },

    #[error("tensor '{name}' has dtype {got:?}, expected one of {expected}")]
    DTypeMismatch {
        name: &'static str,
        got: ElemType,
        expected: &'static str,
    },

    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument { arg: &'static str, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WoqError {
    /// Every error except I/O is raised while validating a call, before any
    /// compute starts.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, WoqError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, WoqError>;
