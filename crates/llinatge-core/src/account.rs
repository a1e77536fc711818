//! Users, sessions, policies and the activity/points ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::ObjectType;

/// How long an activation token stays valid.
pub const ACTIVATION_TTL_HOURS: i64 = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
  pub id:                  i64,
  pub usuari:              String,
  pub email:               String,
  pub actiu:               bool,
  /// Bumped whenever the user's effective grants may have changed.
  pub permissions_version: i64,
  pub created_at:          DateTime<Utc>,
}

/// Returned once at registration; the token is never readable again.
#[derive(Debug, Clone)]
pub struct NewUser {
  pub user:             User,
  pub activation_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
  pub user_id:    i64,
  pub expires_at: DateTime<Utc>,
  pub revoked:    bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
  pub id:  i64,
  pub nom: String,
}

// ─── Activity ────────────────────────────────────────────────────────────────

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
pub enum ActivityState {
  Pendent,
  Validat,
  Rebutjat,
}

/// An append-only record of something a user did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
  pub id:          i64,
  pub user_id:     i64,
  /// `<object_type>_<verb>`, e.g. `persona_approve`.
  pub action:      String,
  pub object_type: Option<ObjectType>,
  pub object_id:   Option<i64>,
  pub state:       ActivityState,
  pub points:      i64,
  pub created_at:  DateTime<Utc>,
}

/// Points credited for an action once moderation approves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsRule {
  pub action: String,
  pub points: i64,
  pub actiu:  bool,
}

/// The action name recorded when a change or record of `object_type` is
/// approved.
pub fn approve_action(object_type: ObjectType) -> String {
  format!("{object_type}_approve")
}

pub fn reject_action(object_type: ObjectType) -> String {
  format!("{object_type}_reject")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn action_names_follow_type_names() {
    assert_eq!(approve_action(ObjectType::Persona), "persona_approve");
    assert_eq!(reject_action(ObjectType::NivellAdmin), "nivell_admin_reject");
  }
}
