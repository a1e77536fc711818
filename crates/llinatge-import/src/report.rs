//! The outcome of one import job.

use serde::{Deserialize, Serialize};

/// A row that did not make it into the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
  /// 1-based line of the CSV record.
  pub row:     usize,
  pub message: String,
}

/// Counts for an import job. Duplicates are also counted in `failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
  pub imported:   usize,
  pub merged:     usize,
  pub failed:     usize,
  pub duplicates: usize,
  pub errors:     Vec<RowError>,
  /// Set when the deadline passed before every row was processed.
  pub aborted:    bool,
}

impl ImportReport {
  pub fn fail(&mut self, row: usize, message: impl Into<String>) {
    self.failed += 1;
    self.errors.push(RowError { row, message: message.into() });
  }

  pub fn duplicate(&mut self, row: usize) {
    self.duplicates += 1;
    self.fail(row, "duplicate row");
  }

  /// Redirect parameters for the import result page.
  pub fn query_string(&self) -> String {
    let mut q = format!(
      "imported={}&failed={}&duplicates={}",
      self.imported, self.failed, self.duplicates
    );
    if self.merged > 0 {
      q.push_str(&format!("&merged={}", self.merged));
    }
    if self.aborted {
      q.push_str("&aborted=1");
    }
    q
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn duplicates_count_as_failures() {
    let mut r = ImportReport { imported: 1, ..Default::default() };
    r.duplicate(3);
    assert_eq!(r.failed, 1);
    assert_eq!(r.duplicates, 1);
    assert_eq!(r.errors, vec![RowError { row: 3, message: "duplicate row".into() }]);
    assert_eq!(r.query_string(), "imported=1&failed=1&duplicates=1");
  }

  #[test]
  fn query_string_mentions_merges_and_aborts() {
    let r = ImportReport { imported: 2, merged: 1, aborted: true, ..Default::default() };
    assert_eq!(r.query_string(), "imported=2&failed=0&duplicates=0&merged=1&aborted=1");
  }
}
