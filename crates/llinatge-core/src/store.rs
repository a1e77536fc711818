//! Store traits: the API surface the HTTP façade and batch tools consume.
//!
//! Traits are implemented by storage backends (e.g. `llinatge-store-sqlite`).
//! Each component gets its own trait; they share one error type through
//! [`Backend`]. All methods return `Send` futures so a backend can be used
//! from a multi-threaded runtime.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
  account::{ActivityEvent, NewUser, Policy, User},
  entity::{
    ClosureRow, Cognom, Fields, Llibre, MapVersion, ModerationState, Municipi,
    ObjectType, Persona, Transcripcio,
  },
  permission::{Grant, PermissionTarget},
  rollup::{DemografiaMeta, DemografiaRow, NameFrequency, RollupDelta},
  search::{SearchDoc, SearchPage, SearchQuery},
  wiki::{
    Actor, ChangeFilter, Decision, RevertTarget, SubmitOutcome, WikiChange,
    WikiMark,
  },
};

/// The error type shared by every component trait of one backend.
pub trait Backend: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;
}

/// The editable fields of an entity together with its moderation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
  pub object_type:      ObjectType,
  pub id:               i64,
  pub fields:           Fields,
  pub moderation_state: ModerationState,
  pub created_by:       Option<i64>,
}

/// Outcome of a bulk moderation request; one failure does not stop the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReport {
  pub succeeded: Vec<i64>,
  pub failed:    Vec<(i64, String)>,
}

// ─── Catalogue ───────────────────────────────────────────────────────────────

pub trait Catalog: Backend {
  /// Insert a new entity in draft state owned by `actor`.
  fn create_draft(
    &self,
    actor: Actor,
    object_type: ObjectType,
    fields: Fields,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Move an owned draft (or rejected row) to pending and record a `create`
  /// change for the moderation queue. Returns the change id.
  fn submit_for_review(
    &self,
    actor: Actor,
    object_type: ObjectType,
    id: i64,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Current editable fields. `None` if the row does not exist.
  fn snapshot(
    &self,
    object_type: ObjectType,
    id: i64,
  ) -> impl Future<Output = Result<Option<EntitySnapshot>, Self::Error>> + Send + '_;

  fn get_persona(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Persona>, Self::Error>> + Send + '_;

  fn get_municipi(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Municipi>, Self::Error>> + Send + '_;

  fn get_llibre(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Llibre>, Self::Error>> + Send + '_;

  fn get_cognom(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Cognom>, Self::Error>> + Send + '_;

  /// Look a surname up by any spelling, following at most one redirect.
  fn resolve_cognom(
    &self,
    forma: String,
  ) -> impl Future<Output = Result<Option<Cognom>, Self::Error>> + Send + '_;

  /// Register an orthographic variant of a canonical surname.
  fn add_cognom_variant(
    &self,
    cognom_id: i64,
    variant: String,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// A transcription with its people and attributes.
  fn get_transcripcio(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<Transcripcio>, Self::Error>> + Send + '_;

  fn closure_for(
    &self,
    municipi_id: i64,
  ) -> impl Future<Output = Result<Vec<ClosureRow>, Self::Error>> + Send + '_;
}

// ─── Moderation ──────────────────────────────────────────────────────────────

pub trait Moderation: Backend {
  /// Propose new values for an entity.
  ///
  /// Drafts owned by the actor are written through; published rows are
  /// queued as a wiki change (or approved on the spot for bypass actors).
  fn submit(
    &self,
    actor: Actor,
    object_type: ObjectType,
    object_id: i64,
    fields: Fields,
  ) -> impl Future<Output = Result<SubmitOutcome, Self::Error>> + Send + '_;

  /// Queue a change that inserts a brand new published row on approval.
  fn propose_create(
    &self,
    actor: Actor,
    object_type: ObjectType,
    fields: Fields,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  /// Queue a revert of an approved change.
  fn propose_revert(
    &self,
    actor: Actor,
    source_change_id: i64,
    target: RevertTarget,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  fn approve(
    &self,
    moderator: i64,
    change_id: i64,
  ) -> impl Future<Output = Result<WikiChange, Self::Error>> + Send + '_;

  fn reject(
    &self,
    moderator: i64,
    change_id: i64,
    reason: Option<String>,
  ) -> impl Future<Output = Result<WikiChange, Self::Error>> + Send + '_;

  /// Decide on an entity's own moderation state (pending rows, or withdrawal
  /// of a published transcription).
  fn moderate_entity(
    &self,
    moderator: i64,
    object_type: ObjectType,
    id: i64,
    decision: Decision,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn moderate_bulk(
    &self,
    moderator: i64,
    object_type: ObjectType,
    ids: Vec<i64>,
    decision: Decision,
  ) -> impl Future<Output = Result<BulkReport, Self::Error>> + Send + '_;

  fn get_change(
    &self,
    change_id: i64,
  ) -> impl Future<Output = Result<Option<WikiChange>, Self::Error>> + Send + '_;

  /// The moderation queue (or any other slice of changes), oldest first.
  fn list_changes(
    &self,
    filter: ChangeFilter,
  ) -> impl Future<Output = Result<Vec<WikiChange>, Self::Error>> + Send + '_;

  /// Toggle the actor's follow mark; returns whether the object is now marked.
  fn toggle_mark(
    &self,
    user_id: i64,
    object_type: ObjectType,
    object_id: i64,
    public: bool,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  fn marks_for(
    &self,
    user_id: i64,
  ) -> impl Future<Output = Result<Vec<WikiMark>, Self::Error>> + Send + '_;
}

// ─── Permissions ─────────────────────────────────────────────────────────────

pub trait Permissions: Backend {
  /// Fail-closed capability check: any error resolves to `false`.
  fn has_permission<'a>(
    &'a self,
    user_id: i64,
    perm_key: &'a str,
    target: &'a PermissionTarget,
  ) -> impl Future<Output = bool> + Send + 'a;

  fn create_policy(
    &self,
    nom: String,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  fn policy_by_name(
    &self,
    nom: String,
  ) -> impl Future<Output = Result<Option<Policy>, Self::Error>> + Send + '_;

  fn add_grant(
    &self,
    policy_id: i64,
    grant: Grant,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  fn remove_grant(
    &self,
    grant_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn assign_policy_to_user(
    &self,
    policy_id: i64,
    user_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn revoke_policy_from_user(
    &self,
    policy_id: i64,
    user_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn assign_policy_to_group(
    &self,
    policy_id: i64,
    group_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn create_group(
    &self,
    nom: String,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  fn add_group_member(
    &self,
    group_id: i64,
    user_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn remove_group_member(
    &self,
    group_id: i64,
    user_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

// ─── Search ──────────────────────────────────────────────────────────────────

pub trait Search: Backend {
  fn search<'a>(
    &'a self,
    query: &'a SearchQuery,
  ) -> impl Future<Output = Result<SearchPage, Self::Error>> + Send + 'a;

  fn search_doc(
    &self,
    object_type: ObjectType,
    id: i64,
  ) -> impl Future<Output = Result<Option<SearchDoc>, Self::Error>> + Send + '_;

  /// Recompute one document from its entity.
  fn reindex(
    &self,
    object_type: ObjectType,
    id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Recompute every document; returns how many were written.
  fn reindex_all(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;
}

// ─── Rollups ─────────────────────────────────────────────────────────────────

pub trait Rollups: Backend {
  fn apply_delta(
    &self,
    delta: RollupDelta,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Replay one municipality's aggregates from the raw tables.
  fn rebuild(
    &self,
    municipi_id: i64,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn rebuild_all(&self) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn demografia(
    &self,
    municipi_id: i64,
  ) -> impl Future<Output = Result<Vec<DemografiaRow>, Self::Error>> + Send + '_;

  fn demografia_meta(
    &self,
    municipi_id: i64,
  ) -> impl Future<Output = Result<DemografiaMeta, Self::Error>> + Send + '_;

  fn nivell_demografia(
    &self,
    nivell_id: i64,
  ) -> impl Future<Output = Result<Vec<DemografiaRow>, Self::Error>> + Send + '_;

  fn top_noms(
    &self,
    municipi_id: i64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<NameFrequency>, Self::Error>> + Send + '_;

  fn top_cognoms(
    &self,
    municipi_id: i64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<NameFrequency>, Self::Error>> + Send + '_;
}

// ─── Accounts ────────────────────────────────────────────────────────────────

pub trait Accounts: Backend {
  fn create_user(
    &self,
    usuari: String,
    email: String,
    password: String,
  ) -> impl Future<Output = Result<NewUser, Self::Error>> + Send + '_;

  /// Expired tokens fail with an invalid-request error.
  fn activate_user(
    &self,
    token: String,
  ) -> impl Future<Output = Result<User, Self::Error>> + Send + '_;

  fn get_user(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<User>, Self::Error>> + Send + '_;

  /// Returns the user id when the credentials match an active account.
  fn verify_password(
    &self,
    login: String,
    password: String,
  ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send + '_;

  /// Returns the opaque session token.
  fn create_session(
    &self,
    user_id: i64,
    ttl: chrono::Duration,
  ) -> impl Future<Output = Result<String, Self::Error>> + Send + '_;

  fn resolve_session(
    &self,
    token: String,
  ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send + '_;

  fn revoke_session(
    &self,
    token: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn user_points(
    &self,
    user_id: i64,
  ) -> impl Future<Output = Result<i64, Self::Error>> + Send + '_;

  fn activity_for(
    &self,
    user_id: i64,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<ActivityEvent>, Self::Error>> + Send + '_;
}

// ─── Maps ────────────────────────────────────────────────────────────────────

pub trait Maps: Backend {
  fn create_map_version(
    &self,
    user_id: i64,
    municipi_id: i64,
    data: serde_json::Value,
  ) -> impl Future<Output = Result<MapVersion, Self::Error>> + Send + '_;

  fn get_map_version(
    &self,
    id: i64,
  ) -> impl Future<Output = Result<Option<MapVersion>, Self::Error>> + Send + '_;

  /// Save only if nobody advanced `lock_version` since the caller read it.
  fn save_map_version(
    &self,
    user_id: i64,
    id: i64,
    expected_lock_version: i64,
    data: serde_json::Value,
  ) -> impl Future<Output = Result<MapVersion, Self::Error>> + Send + '_;
}
