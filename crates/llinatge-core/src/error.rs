//! Error types for `llinatge-core`.
//!
//! Every error maps onto one [`ErrorKind`]; the HTTP façade translates kinds
//! into status codes. Engine-specific codes never appear here.

use thiserror::Error;

/// The coarse classification callers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
  NotFound,
  Forbidden,
  InvalidRequest,
  Conflict,
  ModerationRejected,
  Integrity,
  Transient,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("{object_type} {id} not found")]
  NotFound { object_type: String, id: i64 },

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// A token bucket ran dry. Same kind as `InvalidRequest`, surfaced as 429.
  #[error("too many requests: {0}")]
  RateLimited(String),

  #[error("invalid configuration value for {key}: {value:?}")]
  InvalidConfig { key: String, value: String },

  #[error("version conflict: expected {expected}, found {actual}")]
  Conflict { expected: i64, actual: i64 },

  #[error("change {0} has been rejected")]
  ModerationRejected(i64),

  #[error("integrity violation: {0}")]
  Integrity(String),

  #[error("transient failure: {0}")]
  Transient(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn not_found(object_type: impl Into<String>, id: i64) -> Self {
    Self::NotFound { object_type: object_type.into(), id }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::NotFound { .. } => ErrorKind::NotFound,
      Self::Forbidden(_) => ErrorKind::Forbidden,
      Self::InvalidRequest(_)
      | Self::RateLimited(_)
      | Self::InvalidConfig { .. }
      | Self::Serialization(_) => ErrorKind::InvalidRequest,
      Self::Conflict { .. } => ErrorKind::Conflict,
      Self::ModerationRejected(_) => ErrorKind::ModerationRejected,
      Self::Integrity(_) => ErrorKind::Integrity,
      Self::Transient(_) => ErrorKind::Transient,
    }
  }

  /// Whether the façade should answer 429 rather than 400.
  pub fn is_rate_limited(&self) -> bool { matches!(self, Self::RateLimited(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
