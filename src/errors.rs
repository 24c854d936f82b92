// src/errors.rs
use thiserror::Error;

/// Failure to parse the canonical text form of a state key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateKeyParseError {
    #[error("expected 7 fields, found {0}")]
    FieldCount(usize),
    #[error("expected field `{expected}`, found `{found}`")]
    UnexpectedField { expected: &'static str, found: String },
    #[error("bucket `{0}` is not a valid index")]
    Bucket(String),
    #[error("unknown label `{0}`")]
    Label(String),
}

/// Model persistence errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported model version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("invalid state key: {0}")]
    InvalidStateKey(#[from] StateKeyParseError),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
