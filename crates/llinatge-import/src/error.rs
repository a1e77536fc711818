//! Error types for the llinatge-import codec.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unsupported template version {0}")]
  UnsupportedVersion(u32),

  #[error("unsupported template kind {0:?}")]
  UnsupportedKind(String),

  #[error("invalid target {0:?}")]
  InvalidTarget(String),

  #[error("unknown transform {0:?}")]
  UnknownTransform(String),

  #[error("invalid condition {0:?}")]
  InvalidCondition(String),

  #[error("CSV is empty")]
  EmptyInput,

  #[error("unterminated quoted field starting on line {0}")]
  UnterminatedQuote(usize),

  #[error("required column {0:?} is missing from the header")]
  MissingColumn(String),

  #[error("required column {0:?} is empty")]
  RequiredValue(String),

  #[error("invalid value {value:?} for {target}")]
  InvalidValue { target: String, value: String },

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
