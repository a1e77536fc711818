//! Rollup arithmetic for demographic and name-frequency aggregates.
//!
//! The store feeds [`RollupFacts`] snapshots taken before and after a
//! transition; [`RollupDelta::between`] yields the signed adjustments. A full
//! rebuild runs [`aggregate`] over the same snapshots, so both paths count
//! with the one predicate in [`counted_key`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::entity::{ModerationState, TipusActe};

/// Earliest year the statistics accept.
pub const MIN_YEAR: i32 = 1200;

/// A name pair drawn from a clearly-legible person occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameKey {
  /// Normalised given name.
  pub nom:    String,
  /// Normalised first surname.
  pub cognom: String,
}

/// What the rollups need to know about one transcription at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupFacts {
  pub municipi_id: Option<i64>,
  pub tipus_acte:  String,
  pub any_doc:     Option<i32>,
  pub state:       ModerationState,
  pub names:       Vec<NameKey>,
}

/// The demografia cell a transcription contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DemografiaKey {
  pub municipi_id: i64,
  pub tipus:       TipusActe,
  pub any:         i32,
}

/// `Some(key)` when the record counts: published, a known act kind, a
/// municipality, and a year in `[MIN_YEAR, current_year]`.
pub fn counted_key(facts: &RollupFacts, current_year: i32) -> Option<DemografiaKey> {
  if facts.state != ModerationState::Published {
    return None;
  }
  let any = facts.any_doc.filter(|y| (MIN_YEAR..=current_year).contains(y))?;
  let tipus = TipusActe::parse(&facts.tipus_acte)?;
  Some(DemografiaKey { municipi_id: facts.municipi_id?, tipus, any })
}

/// A `(term, municipi, any)` frequency cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FreqKey {
  pub clau:        String,
  pub municipi_id: i64,
  pub any:         i32,
}

/// Signed adjustments to every aggregate touched by one transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupDelta {
  pub demografia: BTreeMap<DemografiaKey, i64>,
  pub noms:       BTreeMap<FreqKey, i64>,
  pub cognoms:    BTreeMap<FreqKey, i64>,
}

impl RollupDelta {
  /// The delta moving aggregates from `old` to `new`. Either side may be
  /// absent (insert, delete). Cancelling contributions are dropped.
  pub fn between(
    old: Option<&RollupFacts>,
    new: Option<&RollupFacts>,
    current_year: i32,
  ) -> Self {
    let mut delta = Self::default();
    if let Some(old) = old {
      delta.add(old, -1, current_year);
    }
    if let Some(new) = new {
      delta.add(new, 1, current_year);
    }
    delta.demografia.retain(|_, v| *v != 0);
    delta.noms.retain(|_, v| *v != 0);
    delta.cognoms.retain(|_, v| *v != 0);
    delta
  }

  fn add(&mut self, facts: &RollupFacts, sign: i64, current_year: i32) {
    let Some(key) = counted_key(facts, current_year) else {
      return;
    };
    *self.demografia.entry(key).or_default() += sign;
    for name in &facts.names {
      let cell = |clau: &str| FreqKey {
        clau:        clau.to_owned(),
        municipi_id: key.municipi_id,
        any:         key.any,
      };
      *self.noms.entry(cell(&name.nom)).or_default() += sign;
      *self.cognoms.entry(cell(&name.cognom)).or_default() += sign;
    }
  }

  pub fn is_empty(&self) -> bool {
    self.demografia.is_empty() && self.noms.is_empty() && self.cognoms.is_empty()
  }

  /// Fold `other` into `self`, dropping cells that cancel out.
  pub fn absorb(&mut self, other: &RollupDelta) {
    for (k, v) in &other.demografia {
      *self.demografia.entry(*k).or_default() += v;
    }
    for (k, v) in &other.noms {
      *self.noms.entry(k.clone()).or_default() += v;
    }
    for (k, v) in &other.cognoms {
      *self.cognoms.entry(k.clone()).or_default() += v;
    }
    self.demografia.retain(|_, v| *v != 0);
    self.noms.retain(|_, v| *v != 0);
    self.cognoms.retain(|_, v| *v != 0);
  }

  /// The same delta with every sign flipped.
  pub fn inverse(&self) -> Self {
    let flip = |m: &BTreeMap<FreqKey, i64>| -> BTreeMap<FreqKey, i64> {
      m.iter().map(|(k, v)| (k.clone(), -v)).collect()
    };
    Self {
      demografia: self.demografia.iter().map(|(k, v)| (*k, -v)).collect(),
      noms:       flip(&self.noms),
      cognoms:    flip(&self.cognoms),
    }
  }
}

// ─── Aggregate rows ──────────────────────────────────────────────────────────

/// Per-(territory, any) counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemografiaRow {
  pub any:        i32,
  pub natalitat:  i64,
  pub matrimonis: i64,
  pub defuncions: i64,
}

impl DemografiaRow {
  pub fn bump(&mut self, tipus: TipusActe, by: i64) {
    match tipus {
      TipusActe::Baptisme => self.natalitat += by,
      TipusActe::Matrimoni => self.matrimonis += by,
      TipusActe::Obit => self.defuncions += by,
    }
  }

  pub fn is_zero(&self) -> bool {
    self.natalitat == 0 && self.matrimonis == 0 && self.defuncions == 0
  }
}

/// Totals and year range for one territory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemografiaMeta {
  pub any_min:          Option<i32>,
  pub any_max:          Option<i32>,
  pub total_natalitat:  i64,
  pub total_matrimonis: i64,
  pub total_defuncions: i64,
}

impl DemografiaMeta {
  /// Derive the meta row from the yearly rows.
  pub fn from_rows(rows: &[DemografiaRow]) -> Self {
    let live = rows.iter().filter(|r| !r.is_zero());
    let mut meta = Self::default();
    for r in live {
      meta.total_natalitat += r.natalitat;
      meta.total_matrimonis += r.matrimonis;
      meta.total_defuncions += r.defuncions;
      meta.any_min = Some(meta.any_min.map_or(r.any, |m| m.min(r.any)));
      meta.any_max = Some(meta.any_max.map_or(r.any, |m| m.max(r.any)));
    }
    meta
  }
}

/// Replay `facts` from scratch into yearly rows for `municipi_id`.
pub fn aggregate<'a>(
  municipi_id: i64,
  facts: impl IntoIterator<Item = &'a RollupFacts>,
  current_year: i32,
) -> Vec<DemografiaRow> {
  let mut by_year: BTreeMap<i32, DemografiaRow> = BTreeMap::new();
  for f in facts {
    let Some(key) = counted_key(f, current_year) else {
      continue;
    };
    if key.municipi_id != municipi_id {
      continue;
    }
    by_year
      .entry(key.any)
      .or_insert_with(|| DemografiaRow { any: key.any, ..Default::default() })
      .bump(key.tipus, 1);
  }
  by_year.into_values().collect()
}

/// A ranked name or surname with its frequency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameFrequency {
  pub id:    i64,
  pub forma: String,
  pub total: i64,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn baptism(any: i32, state: ModerationState) -> RollupFacts {
    RollupFacts {
      municipi_id: Some(4),
      tipus_acte:  "baptisme".into(),
      any_doc:     Some(any),
      state,
      names:       vec![NameKey { nom: "joan".into(), cognom: "moia".into() }],
    }
  }

  #[test]
  fn approval_adds_and_rejection_subtracts() {
    let pending = baptism(1890, ModerationState::Pending);
    let published = baptism(1890, ModerationState::Published);
    let rejected = baptism(1890, ModerationState::Rejected);

    let up = RollupDelta::between(Some(&pending), Some(&published), 2024);
    assert_eq!(up.demografia.values().sum::<i64>(), 1);
    assert_eq!(up.noms.len(), 1);

    let down = RollupDelta::between(Some(&published), Some(&rejected), 2024);
    assert_eq!(down, up.inverse());
  }

  #[test]
  fn unchanged_counted_record_has_empty_delta() {
    let a = baptism(1890, ModerationState::Published);
    assert!(RollupDelta::between(Some(&a), Some(&a), 2024).is_empty());
  }

  #[test]
  fn out_of_range_years_and_unknown_kinds_are_ignored() {
    assert!(counted_key(&baptism(1199, ModerationState::Published), 2024).is_none());
    assert!(counted_key(&baptism(2025, ModerationState::Published), 2024).is_none());
    let mut other = baptism(1890, ModerationState::Published);
    other.tipus_acte = "confirmacio".into();
    assert!(counted_key(&other, 2024).is_none());
  }

  #[test]
  fn moving_year_shifts_counts() {
    let old = baptism(1890, ModerationState::Published);
    let new = baptism(1891, ModerationState::Published);
    let d = RollupDelta::between(Some(&old), Some(&new), 2024);
    assert_eq!(d.demografia.len(), 2);
    assert_eq!(d.demografia.values().sum::<i64>(), 0);
  }

  #[test]
  fn aggregate_matches_sum_of_deltas() {
    let facts = vec![
      baptism(1890, ModerationState::Published),
      baptism(1890, ModerationState::Published),
      baptism(1900, ModerationState::Pending),
      baptism(1910, ModerationState::Published),
    ];
    let rows = aggregate(4, &facts, 2024);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], DemografiaRow { any: 1890, natalitat: 2, ..Default::default() });

    let meta = DemografiaMeta::from_rows(&rows);
    assert_eq!(meta.total_natalitat, 3);
    assert_eq!((meta.any_min, meta.any_max), (Some(1890), Some(1910)));
  }

  #[test]
  fn absorbing_an_inverse_cancels_everything() {
    let published = baptism(1890, ModerationState::Published);
    let mut d = RollupDelta::between(None, Some(&published), 2024);
    let inverse = d.inverse();
    d.absorb(&inverse);
    assert!(d.is_empty());
  }
}
