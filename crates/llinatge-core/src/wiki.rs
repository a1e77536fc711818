//! Wiki changes: the serialised mutations that moderation approves or
//! rejects.
//!
//! A change targets its entity through an `(object_type, object_id)` pair and
//! carries a [`ChangeDiff`] in its `metadata` column. Approval replays
//! `diff.after` against the canonical row; rejection leaves the row alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  entity::{Fields, ModerationState, ObjectType},
};

/// `field_key` value used when a change touches more than one field.
pub const BULK_FIELD_KEY: &str = "bulk";

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeType {
  Form,
  Revert,
  Create,
}

/// The before/after snapshot serialised into `metadata`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeDiff {
  /// Current values of the touched fields; `None` for inserts.
  pub before:           Option<Fields>,
  pub after:            Fields,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_change_id: Option<i64>,
}

impl ChangeDiff {
  /// Build a diff restricted to the fields whose value actually changes.
  ///
  /// Fields absent from `current` are treated as `null`.
  pub fn between(current: &Fields, proposed: &Fields) -> Self {
    let mut before = Fields::new();
    let mut after = Fields::new();
    for (key, new_value) in proposed {
      let old_value = current.get(key).cloned().unwrap_or_default();
      if &old_value != new_value {
        before.insert(key.clone(), old_value);
        after.insert(key.clone(), new_value.clone());
      }
    }
    Self { before: Some(before), after, source_change_id: None }
  }

  pub fn is_empty(&self) -> bool { self.after.is_empty() }

  /// The dotted path of the single touched field, or [`BULK_FIELD_KEY`].
  pub fn field_key(&self) -> String {
    match self.after.keys().next() {
      Some(key) if self.after.len() == 1 => key.clone(),
      _ => BULK_FIELD_KEY.to_owned(),
    }
  }

  /// `(old_value, new_value)` rendered as text for single-field changes.
  pub fn single_values(&self) -> (Option<String>, Option<String>) {
    if self.after.len() != 1 {
      return (None, None);
    }
    let Some((key, new_value)) = self.after.iter().next() else {
      return (None, None);
    };
    let old_value = self.before.as_ref().and_then(|b| b.get(key));
    (old_value.map(render_value), Some(render_value(new_value)))
  }

  pub fn to_metadata(&self) -> Result<String> { Ok(serde_json::to_string(self)?) }

  pub fn from_metadata(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(Error::from)
  }
}

fn render_value(v: &serde_json::Value) -> String {
  match v {
    serde_json::Value::String(s) => s.clone(),
    serde_json::Value::Null => String::new(),
    other => other.to_string(),
  }
}

/// A persisted wiki change row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiChange {
  pub id:                i64,
  pub object_type:       ObjectType,
  /// Zero for create-type changes whose row does not exist yet.
  pub object_id:         i64,
  pub change_type:       ChangeType,
  pub field_key:         String,
  pub old_value:         Option<String>,
  pub new_value:         Option<String>,
  pub diff:              ChangeDiff,
  pub state:             ModerationState,
  pub changed_by:        i64,
  pub changed_at:        DateTime<Utc>,
  pub moderated_by:      Option<i64>,
  pub moderated_at:      Option<DateTime<Utc>>,
  pub moderation_reason: Option<String>,
}

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// Who is acting, and whether they may skip the review queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
  pub user_id: i64,
  /// Holder of the moderation bypass capability.
  pub bypass:  bool,
}

impl Actor {
  pub fn editor(user_id: i64) -> Self { Self { user_id, bypass: false } }

  pub fn moderator(user_id: i64) -> Self { Self { user_id, bypass: true } }
}

/// What a revert proposal reinstates from its source change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertTarget {
  /// Bring back the state the source change produced (its `after`).
  #[default]
  RestoreVersion,
  /// Undo the source change (its `before`).
  Undo,
}

/// The result of proposing an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
  /// The edit touched a draft and was written straight through.
  Applied { object_id: i64 },
  /// The edit was queued for review.
  Queued { change_id: i64 },
  /// A bypass actor edited a published row; the audit change is already
  /// approved.
  Overridden { change_id: i64 },
}

impl SubmitOutcome {
  pub fn change_id(&self) -> Option<i64> {
    match self {
      Self::Applied { .. } => None,
      Self::Queued { change_id } | Self::Overridden { change_id } => {
        Some(*change_id)
      }
    }
  }
}

/// A moderator's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
  Approve,
  Reject { reason: Option<String> },
}

impl Decision {
  pub fn target_state(&self) -> ModerationState {
    match self {
      Self::Approve => ModerationState::Published,
      Self::Reject { .. } => ModerationState::Rejected,
    }
  }

  pub fn reason(&self) -> Option<&str> {
    match self {
      Self::Approve => None,
      Self::Reject { reason } => reason.as_deref(),
    }
  }
}

/// Filter for the moderation queue.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
  pub object_type: Option<ObjectType>,
  pub object_id:   Option<i64>,
  pub changed_by:  Option<i64>,
  pub state:       Option<ModerationState>,
  pub limit:       Option<usize>,
}

/// A per-user follow flag on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiMark {
  pub object_type: ObjectType,
  pub object_id:   i64,
  pub user_id:     i64,
  pub public:      bool,
  pub created_at:  DateTime<Utc>,
}

/// Guardrails applied on submission.
#[derive(Debug, Clone, Copy)]
pub struct Guardrails {
  pub meta_max_bytes:     usize,
  pub pending_per_user:   usize,
  pub pending_per_object: usize,
}

impl Guardrails {
  /// Validate a diff and the current queue depth for its target.
  pub fn check(
    &self,
    metadata_len: usize,
    user_pending: usize,
    object_pending: usize,
  ) -> Result<()> {
    if metadata_len > self.meta_max_bytes {
      return Err(Error::InvalidRequest(format!(
        "change metadata is {metadata_len} bytes, limit is {}",
        self.meta_max_bytes
      )));
    }
    if user_pending >= self.pending_per_user {
      return Err(Error::InvalidRequest(
        "you already have a pending change on this object".into(),
      ));
    }
    if object_pending >= self.pending_per_object {
      return Err(Error::InvalidRequest(
        "this object has too many pending changes".into(),
      ));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn fields(v: serde_json::Value) -> Fields {
    v.as_object().cloned().unwrap_or_default()
  }

  #[test]
  fn diff_keeps_only_changed_fields() {
    let current = fields(json!({ "nom": "Joan", "ofici": "" }));
    let proposed = fields(json!({ "nom": "Joan", "ofici": "Fuster" }));
    let diff = ChangeDiff::between(&current, &proposed);
    assert_eq!(diff.after.len(), 1);
    assert_eq!(diff.field_key(), "ofici");
    assert_eq!(
      diff.single_values(),
      (Some(String::new()), Some("Fuster".to_owned()))
    );
  }

  #[test]
  fn multi_field_diff_is_bulk() {
    let current = fields(json!({}));
    let proposed = fields(json!({ "nom": "Anna", "cognom1": "Puig" }));
    let diff = ChangeDiff::between(&current, &proposed);
    assert_eq!(diff.field_key(), BULK_FIELD_KEY);
    assert_eq!(diff.single_values(), (None, None));
    assert_eq!(
      diff.before.as_ref().and_then(|b| b.get("nom")),
      Some(&serde_json::Value::Null)
    );
  }

  #[test]
  fn metadata_round_trip_keeps_source() {
    let mut diff = ChangeDiff::between(
      &fields(json!({ "ofici": "a" })),
      &fields(json!({ "ofici": "b" })),
    );
    diff.source_change_id = Some(9);
    let raw = diff.to_metadata().unwrap();
    assert_eq!(ChangeDiff::from_metadata(&raw).unwrap(), diff);
  }

  #[test]
  fn guardrails_reject_oversized_and_crowded_queues() {
    let g = Guardrails {
      meta_max_bytes:     10,
      pending_per_user:   1,
      pending_per_object: 2,
    };
    assert!(g.check(5, 0, 0).is_ok());
    assert!(g.check(11, 0, 0).is_err());
    assert!(g.check(5, 1, 0).is_err());
    assert!(g.check(5, 0, 2).is_err());
  }
}
