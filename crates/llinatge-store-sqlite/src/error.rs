//! Error type for `llinatge-store-sqlite`.
//!
//! Engine errors never reach callers as SQLite result codes; [`Error::kind`]
//! folds them into the catalogue's error taxonomy.

use llinatge_core::ErrorKind;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] llinatge_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("import error: {0}")]
  Import(#[from] llinatge_import::Error),

  #[error("cannot decode stored value: {0}")]
  Decode(String),

  #[error("password hashing failed: {0}")]
  Password(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn sqlite_kind(e: &rusqlite::Error) -> ErrorKind {
  match e {
    rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
    rusqlite::Error::SqliteFailure(f, _) => match f.code {
      ErrorCode::ConstraintViolation => ErrorKind::Integrity,
      ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorKind::Transient,
      _ => ErrorKind::Integrity,
    },
    _ => ErrorKind::Integrity,
  }
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Core(e) => e.kind(),
      Self::Sqlite(e) => sqlite_kind(e),
      Self::Database(tokio_rusqlite::Error::Rusqlite(e)) => sqlite_kind(e),
      Self::Database(_) => ErrorKind::Transient,
      Self::Json(_) | Self::Import(_) => ErrorKind::InvalidRequest,
      Self::Decode(_) | Self::Password(_) => ErrorKind::Integrity,
    }
  }

  pub fn is_rate_limited(&self) -> bool {
    matches!(self, Self::Core(e) if e.is_rate_limited())
  }
}

impl From<argon2::password_hash::Error> for Error {
  fn from(e: argon2::password_hash::Error) -> Self { Self::Password(e.to_string()) }
}

/// Shorthand for the core error variants the store raises itself.
pub(crate) fn not_found(object_type: impl Into<String>, id: i64) -> Error {
  llinatge_core::Error::not_found(object_type, id).into()
}

pub(crate) fn invalid(msg: impl Into<String>) -> Error {
  llinatge_core::Error::InvalidRequest(msg.into()).into()
}

pub(crate) fn forbidden(msg: impl Into<String>) -> Error {
  llinatge_core::Error::Forbidden(msg.into()).into()
}
