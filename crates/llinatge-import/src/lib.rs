//! CSV template ingestion for Llinatge.
//!
//! The pure half of the import pipeline: reading CSV, compiling templates
//! and staging each row into an unsaved [`Transcripcio`]. Persisting the
//! staged rows (book resolution, dedup against earlier jobs, merging into
//! indexed books) is done by a backend implementing [`Ingestion`].
//!
//! ```text
//! bytes ──csv::parse──▶ CsvTable ──Binding::stage──▶ StagedRecord ──store──▶ rows
//! ```
//!
//! [`Transcripcio`]: llinatge_core::entity::Transcripcio

#![allow(async_fn_in_trait)]

pub mod condition;
pub mod csv;
pub mod error;
pub mod mapping;
pub mod merge;
pub mod report;
pub mod template;
pub mod transform;

use std::{future::Future, io::Read};

use chrono::{DateTime, Utc};
pub use error::{Error, Result};
use llinatge_core::store::Backend;
pub use mapping::{Binding, BookRef, StagedRecord};
pub use report::{ImportReport, RowError};
pub use template::Template;

/// Who runs an import and until when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportJob {
  pub user_id:  i64,
  /// Rows are no longer started once this instant has passed.
  pub deadline: Option<DateTime<Utc>>,
}

impl ImportJob {
  pub fn new(user_id: i64) -> Self { Self { user_id, deadline: None } }

  pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn expired(&self, now: DateTime<Utc>) -> bool {
    self.deadline.is_some_and(|d| now >= d)
  }
}

/// Read all of `reader` as UTF-8 and parse it as CSV.
pub fn read_table<R: Read>(mut reader: R) -> Result<csv::CsvTable> {
  let mut buf = String::new();
  reader.read_to_string(&mut buf)?;
  csv::parse(&buf)
}

pub trait Ingestion: Backend {
  /// Import every row of `reader` under `template`. Each row commits on its
  /// own; per-row failures are collected in the report. Template, header
  /// and I/O problems fail the whole job.
  fn run_import<'a, R: Read + Send + 'a>(
    &'a self,
    job: ImportJob,
    template: &'a Template,
    reader: R,
  ) -> impl Future<Output = Result<ImportReport, Self::Error>> + Send + 'a;
}
