//! The wiki-moderation engine.
//!
//! Every mutation of a published entity becomes a `wiki_canvis` row. Approval
//! replays `diff.after` onto the canonical row and refreshes the rollups,
//! the search document and the activity ledger in the same transaction.
//! Notification mail goes out after commit and never fails the call.

use llinatge_core::{
  Error as CoreError,
  account::{ActivityState, approve_action, reject_action},
  entity::{Fields, ModerationState, ObjectType},
  permission::{MODERATION_BYPASS, MODERATION_DECIDE},
  store::{BulkReport, Moderation},
  wiki::{
    Actor, ChangeDiff, ChangeFilter, ChangeType, Decision, Guardrails, RevertTarget,
    SubmitOutcome, WikiChange, WikiMark,
  },
};
use rusqlite::{Connection, OptionalExtension as _, types::Value};

use crate::{
  Result, SqliteStore,
  db::Ctx,
  encode::{CHANGE_COLUMNS, RawChange, decode_dt, decode_enum, encode_enum},
  error::{forbidden, invalid, not_found},
  hooks, registry, search,
};

// ─── Change rows ─────────────────────────────────────────────────────────────

pub(crate) fn load_change(conn: &Connection, id: i64) -> Result<Option<WikiChange>> {
  let raw = conn
    .query_row(
      &format!("SELECT {CHANGE_COLUMNS} FROM wiki_canvis WHERE id = ?1"),
      [id],
      RawChange::from_row,
    )
    .optional()?;
  raw.map(RawChange::into_change).transpose()
}

fn require_change(conn: &Connection, id: i64) -> Result<WikiChange> {
  load_change(conn, id)?.ok_or_else(|| not_found("wiki change", id))
}

pub(crate) struct NewChange<'a> {
  pub object_type:  ObjectType,
  pub object_id:    i64,
  pub change_type:  ChangeType,
  pub diff:         &'a ChangeDiff,
  pub metadata:     &'a str,
  pub state:        ModerationState,
  pub changed_by:   i64,
  pub moderated_by: Option<i64>,
}

pub(crate) fn insert_change(conn: &Connection, ctx: &Ctx, c: NewChange<'_>) -> Result<i64> {
  let (old_value, new_value) = c.diff.single_values();
  let moderated_at = c.moderated_by.map(|_| ctx.stamp());
  let id = conn.query_row(
    "INSERT INTO wiki_canvis
       (object_type, object_id, change_type, field_key, old_value, new_value, metadata,
        moderation_state, changed_by, changed_at, moderated_by, moderated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
     RETURNING id",
    rusqlite::params![
      encode_enum(c.object_type),
      c.object_id,
      encode_enum(c.change_type),
      c.diff.field_key(),
      old_value,
      new_value,
      c.metadata,
      encode_enum(c.state),
      c.changed_by,
      ctx.stamp(),
      c.moderated_by,
      moderated_at,
    ],
    |r| r.get(0),
  )?;
  tracing::debug!(change_id = id, object_type = %c.object_type, object_id = c.object_id, state = %c.state, "wiki change recorded");
  Ok(id)
}

fn close_change(
  conn: &Connection,
  ctx: &Ctx,
  change_id: i64,
  object_id: i64,
  state: ModerationState,
  moderator: i64,
  reason: Option<&str>,
) -> Result<()> {
  conn.execute(
    "UPDATE wiki_canvis
        SET moderation_state = ?1, object_id = ?2, moderated_by = ?3, moderated_at = ?4,
            moderation_reason = ?5
      WHERE id = ?6",
    rusqlite::params![encode_enum(state), object_id, moderator, ctx.stamp(), reason, change_id],
  )?;
  Ok(())
}

/// `(pending by this user, pending overall)` on one object.
fn pending_counts(
  conn: &Connection,
  object_type: ObjectType,
  object_id: i64,
  user_id: i64,
) -> Result<(usize, usize)> {
  let (mine, all): (i64, i64) = conn.query_row(
    "SELECT COALESCE(SUM(changed_by = ?3), 0), COUNT(*) FROM wiki_canvis
      WHERE object_type = ?1 AND object_id = ?2 AND moderation_state = 'pendent'",
    rusqlite::params![encode_enum(object_type), object_id, user_id],
    |r| Ok((r.get(0)?, r.get(1)?)),
  )?;
  Ok((usize::try_from(mine).unwrap_or(0), usize::try_from(all).unwrap_or(0)))
}

// ─── Activity and points ─────────────────────────────────────────────────────

fn record_activity(
  conn: &Connection,
  ctx: &Ctx,
  user_id: i64,
  action: &str,
  object: (ObjectType, i64),
  state: ActivityState,
  points: i64,
) -> Result<()> {
  conn.execute(
    "INSERT INTO activitat (user_id, action, object_type, object_id, state, points, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    rusqlite::params![
      user_id,
      action,
      encode_enum(object.0),
      object.1,
      encode_enum(state),
      points,
      ctx.stamp()
    ],
  )?;
  Ok(())
}

/// Record an approval for `user_id` and credit the matching points rule.
fn credit(conn: &Connection, ctx: &Ctx, user_id: i64, object: (ObjectType, i64)) -> Result<i64> {
  let action = approve_action(object.0);
  let points: i64 = conn
    .query_row(
      "SELECT points FROM punts_regles WHERE action = ?1 AND actiu = 1",
      [&action],
      |r| r.get(0),
    )
    .optional()?
    .unwrap_or(0);
  record_activity(conn, ctx, user_id, &action, object, ActivityState::Validat, points)?;
  if points != 0 {
    conn.execute(
      "INSERT INTO punts_usuari (user_id, punts) VALUES (?1, ?2)
       ON CONFLICT (user_id) DO UPDATE SET punts = punts + excluded.punts",
      [user_id, points],
    )?;
  }
  Ok(points)
}

fn refuse(conn: &Connection, ctx: &Ctx, user_id: i64, object: (ObjectType, i64)) -> Result<()> {
  let action = reject_action(object.0);
  record_activity(conn, ctx, user_id, &action, object, ActivityState::Rebutjat, 0)
}

fn email_of(conn: &Connection, user_id: i64) -> Result<Option<String>> {
  Ok(
    conn
      .query_row("SELECT email FROM usuaris WHERE id = ?1", [user_id], |r| r.get(0))
      .optional()?,
  )
}

// ─── Transactions ────────────────────────────────────────────────────────────

fn submit_in(
  conn: &Connection,
  ctx: &Ctx,
  actor: Actor,
  guard: Guardrails,
  object_type: ObjectType,
  object_id: i64,
  fields: &Fields,
) -> Result<SubmitOutcome> {
  let snap = registry::require(conn, ctx, object_type, object_id)?;
  let fields = registry::normalize_fields(object_type, fields)?;

  if !snap.moderation_state.is_published() {
    let owned = snap.created_by == Some(actor.user_id) && snap.moderation_state.is_editable_draft();
    if !owned && !actor.bypass {
      return Err(forbidden(format!("{object_type} {object_id} is not yours to edit")));
    }
    hooks::around(conn, ctx, object_type, object_id, || {
      registry::update(conn, ctx, object_type, object_id, &fields, actor.user_id)
    })?;
    return Ok(SubmitOutcome::Applied { object_id });
  }

  let diff = ChangeDiff::between(&snap.fields, &fields);
  if diff.is_empty() {
    return Err(invalid("the proposal does not change anything"));
  }
  let metadata = diff.to_metadata()?;

  if actor.bypass {
    guard.check(metadata.len(), 0, 0)?;
    hooks::around(conn, ctx, object_type, object_id, || {
      registry::update(conn, ctx, object_type, object_id, &diff.after, actor.user_id)
    })?;
    let change_id = insert_change(conn, ctx, NewChange {
      object_type,
      object_id,
      change_type: ChangeType::Form,
      diff: &diff,
      metadata: &metadata,
      state: ModerationState::Published,
      changed_by: actor.user_id,
      moderated_by: Some(actor.user_id),
    })?;
    credit(conn, ctx, actor.user_id, (object_type, object_id))?;
    return Ok(SubmitOutcome::Overridden { change_id });
  }

  let (mine, all) = pending_counts(conn, object_type, object_id, actor.user_id)?;
  guard.check(metadata.len(), mine, all)?;
  let change_id = insert_change(conn, ctx, NewChange {
    object_type,
    object_id,
    change_type: ChangeType::Form,
    diff: &diff,
    metadata: &metadata,
    state: ModerationState::Pending,
    changed_by: actor.user_id,
    moderated_by: None,
  })?;
  Ok(SubmitOutcome::Queued { change_id })
}

fn revert_in(
  conn: &Connection,
  ctx: &Ctx,
  actor: Actor,
  guard: Guardrails,
  source_change_id: i64,
  target: RevertTarget,
) -> Result<i64> {
  let source = require_change(conn, source_change_id)?;
  if source.state != ModerationState::Published {
    return Err(invalid(format!("change {source_change_id} was never applied")));
  }
  let values = match target {
    RevertTarget::RestoreVersion => source.diff.after.clone(),
    RevertTarget::Undo => source
      .diff
      .before
      .clone()
      .ok_or_else(|| invalid("a creation cannot be undone by a revert"))?,
  };
  let snap = registry::require(conn, ctx, source.object_type, source.object_id)?;
  let mut diff = ChangeDiff::between(&snap.fields, &values);
  if diff.is_empty() {
    return Err(invalid("the entity already holds those values"));
  }
  diff.source_change_id = Some(source_change_id);
  let metadata = diff.to_metadata()?;
  let (mine, all) = pending_counts(conn, source.object_type, source.object_id, actor.user_id)?;
  guard.check(metadata.len(), mine, all)?;
  insert_change(conn, ctx, NewChange {
    object_type:  source.object_type,
    object_id:    source.object_id,
    change_type:  ChangeType::Revert,
    diff:         &diff,
    metadata:     &metadata,
    state:        ModerationState::Pending,
    changed_by:   actor.user_id,
    moderated_by: None,
  })
}

/// A change may only be decided while pending.
fn ensure_pending(change: &WikiChange) -> Result<()> {
  match change.state {
    ModerationState::Pending => Ok(()),
    ModerationState::Rejected => Err(CoreError::ModerationRejected(change.id).into()),
    state => Err(invalid(format!("change {} is {state}, not pending", change.id))),
  }
}

/// Write the change onto its entity; returns the entity id.
fn apply_change(conn: &Connection, ctx: &Ctx, change: &WikiChange) -> Result<i64> {
  let t = change.object_type;
  match change.change_type {
    ChangeType::Create if change.object_id == 0 => {
      let id = registry::insert(
        conn,
        ctx,
        t,
        &change.diff.after,
        ModerationState::Published,
        Some(change.changed_by),
      )?;
      hooks::inserted(conn, ctx, t, id)?;
      Ok(id)
    }
    ChangeType::Create => {
      hooks::around(conn, ctx, t, change.object_id, || {
        registry::set_state(conn, ctx, t, change.object_id, ModerationState::Published)
      })?;
      Ok(change.object_id)
    }
    ChangeType::Form | ChangeType::Revert => {
      hooks::around(conn, ctx, t, change.object_id, || {
        registry::update(conn, ctx, t, change.object_id, &change.diff.after, change.changed_by)
      })?;
      Ok(change.object_id)
    }
  }
}

fn approve_in(
  conn: &Connection,
  ctx: &Ctx,
  moderator: i64,
  change_id: i64,
) -> Result<(WikiChange, Option<String>)> {
  let change = require_change(conn, change_id)?;
  ensure_pending(&change)?;
  let object_id = apply_change(conn, ctx, &change)?;
  credit(conn, ctx, change.changed_by, (change.object_type, object_id))?;
  close_change(conn, ctx, change_id, object_id, ModerationState::Published, moderator, None)?;
  Ok((require_change(conn, change_id)?, email_of(conn, change.changed_by)?))
}

fn reject_in(
  conn: &Connection,
  ctx: &Ctx,
  moderator: i64,
  change_id: i64,
  reason: Option<&str>,
) -> Result<(WikiChange, Option<String>)> {
  let change = require_change(conn, change_id)?;
  ensure_pending(&change)?;
  let t = change.object_type;
  if change.change_type == ChangeType::Create && change.object_id != 0 {
    hooks::around(conn, ctx, t, change.object_id, || {
      registry::set_state(conn, ctx, t, change.object_id, ModerationState::Rejected)
    })?;
    search::delete_doc(conn, t, change.object_id)?;
  }
  refuse(conn, ctx, change.changed_by, (t, change.object_id))?;
  close_change(
    conn,
    ctx,
    change_id,
    change.object_id,
    ModerationState::Rejected,
    moderator,
    reason,
  )?;
  Ok((require_change(conn, change_id)?, email_of(conn, change.changed_by)?))
}

/// Decide on a row's own state. Returns the author's address for notice.
fn moderate_entity_in(
  conn: &Connection,
  ctx: &Ctx,
  moderator: i64,
  t: ObjectType,
  id: i64,
  decision: &Decision,
) -> Result<Option<String>> {
  let snap = registry::require(conn, ctx, t, id)?;
  let target = decision.target_state();
  match snap.moderation_state {
    ModerationState::Pending => {}
    ModerationState::Published
      if t == ObjectType::Transcripcio && target == ModerationState::Rejected => {}
    state => {
      return Err(invalid(format!("{t} {id} is {state}; cannot move it to {target}")));
    }
  }
  hooks::around(conn, ctx, t, id, || registry::set_state(conn, ctx, t, id, target))?;

  conn.execute(
    "UPDATE wiki_canvis
        SET moderation_state = ?1, moderated_by = ?2, moderated_at = ?3, moderation_reason = ?4
      WHERE object_type = ?5 AND object_id = ?6 AND change_type = 'create'
        AND moderation_state = 'pendent'",
    rusqlite::params![
      encode_enum(target),
      moderator,
      ctx.stamp(),
      decision.reason(),
      encode_enum(t),
      id
    ],
  )?;
  let Some(author) = snap.created_by else {
    return Ok(None);
  };
  match decision {
    Decision::Approve => {
      credit(conn, ctx, author, (t, id))?;
    }
    Decision::Reject { .. } => refuse(conn, ctx, author, (t, id))?,
  }
  email_of(conn, author)
}

fn list_in(conn: &Connection, ctx: &Ctx, filter: &ChangeFilter) -> Result<Vec<WikiChange>> {
  let mut clauses = Vec::new();
  let mut params = Vec::new();
  if let Some(t) = filter.object_type {
    clauses.push("object_type = ?");
    params.push(Value::Text(encode_enum(t)));
  }
  if let Some(id) = filter.object_id {
    clauses.push("object_id = ?");
    params.push(Value::Integer(id));
  }
  if let Some(user) = filter.changed_by {
    clauses.push("changed_by = ?");
    params.push(Value::Integer(user));
  }
  if let Some(state) = filter.state {
    clauses.push("moderation_state = ?");
    params.push(Value::Text(encode_enum(state)));
  }
  let mut sql = format!("SELECT {CHANGE_COLUMNS} FROM wiki_canvis");
  if !clauses.is_empty() {
    sql.push_str(" WHERE ");
    sql.push_str(&clauses.join(" AND "));
  }
  sql.push_str(" ORDER BY id ASC");
  if let Some(limit) = filter.limit {
    sql.push_str(" LIMIT ?");
    params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
  }
  let sql = ctx.dialect.rewrite_placeholders(&sql);
  let raw = conn
    .prepare(&sql)?
    .query_map(rusqlite::params_from_iter(params.iter()), RawChange::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.into_iter().map(RawChange::into_change).collect()
}

fn toggle_mark_in(
  conn: &Connection,
  ctx: &Ctx,
  user_id: i64,
  t: ObjectType,
  object_id: i64,
  public: bool,
) -> Result<bool> {
  registry::require(conn, ctx, t, object_id)?;
  let removed = conn.execute(
    "DELETE FROM wiki_marques WHERE object_type = ?1 AND object_id = ?2 AND user_id = ?3",
    rusqlite::params![encode_enum(t), object_id, user_id],
  )?;
  if removed > 0 {
    return Ok(false);
  }
  conn.execute(
    "INSERT INTO wiki_marques (object_type, object_id, user_id, public, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    rusqlite::params![encode_enum(t), object_id, user_id, public, ctx.stamp()],
  )?;
  Ok(true)
}

fn marks_in(conn: &Connection, user_id: i64) -> Result<Vec<WikiMark>> {
  let raw: Vec<(String, i64, bool, String)> = conn
    .prepare(
      "SELECT object_type, object_id, public, created_at FROM wiki_marques
        WHERE user_id = ?1 ORDER BY id",
    )?
    .query_map([user_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
    .collect::<rusqlite::Result<_>>()?;
  raw
    .into_iter()
    .map(|(t, object_id, public, created_at)| {
      Ok(WikiMark {
        object_type: decode_enum(&t, "object type")?,
        object_id,
        user_id,
        public,
        created_at: decode_dt(&created_at)?,
      })
    })
    .collect()
}

// ─── Trait impl ──────────────────────────────────────────────────────────────

impl SqliteStore {
  fn take_change_token(&self, user_id: i64) -> Result<()> {
    Ok(self.services.change_limiter.try_acquire(user_id, self.services.now())?)
  }

  /// `bypass` on an [`Actor`] is a request; only holders of the capability
  /// keep it.
  async fn effective(&self, actor: Actor, t: ObjectType, id: i64) -> Result<Actor> {
    if !actor.bypass {
      return Ok(actor);
    }
    let bypass = self.holds(actor.user_id, MODERATION_BYPASS, t, id).await?;
    Ok(Actor { bypass, ..actor })
  }

  fn notify_decision(&self, email: Option<String>, change: &WikiChange) {
    let Some(to) = email else { return };
    let subject = format!("Canvi {} {}", change.id, change.state);
    let body = format!(
      "El teu canvi a {} {} ha quedat {}.",
      change.object_type, change.object_id, change.state
    );
    self.services.notify(&to, &subject, &body);
  }
}

impl Moderation for SqliteStore {
  async fn submit(
    &self,
    actor: Actor,
    object_type: ObjectType,
    object_id: i64,
    fields: Fields,
  ) -> Result<SubmitOutcome> {
    self.take_change_token(actor.user_id)?;
    let actor = self.effective(actor, object_type, object_id).await?;
    let guard = self.services.settings.guardrails();
    let outcome = self
      .write(move |conn, ctx| submit_in(conn, ctx, actor, guard, object_type, object_id, &fields))
      .await?;
    tracing::debug!(user_id = actor.user_id, %object_type, object_id, ?outcome, "edit submitted");
    Ok(outcome)
  }

  async fn propose_create(
    &self,
    actor: Actor,
    object_type: ObjectType,
    fields: Fields,
  ) -> Result<i64> {
    self.take_change_token(actor.user_id)?;
    let fields = registry::normalize_fields(object_type, &fields)?;
    for required in registry::def(object_type).required {
      if fields.get(*required).is_none_or(serde_json::Value::is_null) {
        return Err(invalid(format!("field {required} is required")));
      }
    }
    let diff = ChangeDiff { before: None, after: fields, source_change_id: None };
    let metadata = diff.to_metadata()?;
    self.services.settings.guardrails().check(metadata.len(), 0, 0)?;
    self
      .write(move |conn, ctx| {
        insert_change(conn, ctx, NewChange {
          object_type,
          object_id: 0,
          change_type: ChangeType::Create,
          diff: &diff,
          metadata: &metadata,
          state: ModerationState::Pending,
          changed_by: actor.user_id,
          moderated_by: None,
        })
      })
      .await
  }

  async fn propose_revert(
    &self,
    actor: Actor,
    source_change_id: i64,
    target: RevertTarget,
  ) -> Result<i64> {
    self.take_change_token(actor.user_id)?;
    let guard = self.services.settings.guardrails();
    self
      .write(move |conn, ctx| revert_in(conn, ctx, actor, guard, source_change_id, target))
      .await
  }

  async fn approve(&self, moderator: i64, change_id: i64) -> Result<WikiChange> {
    let change = self.get_change(change_id).await?.ok_or_else(|| not_found("wiki change", change_id))?;
    self
      .require_permission(moderator, MODERATION_DECIDE, change.object_type, change.object_id)
      .await?;
    let (change, email) =
      self.write(move |conn, ctx| approve_in(conn, ctx, moderator, change_id)).await?;
    tracing::info!(
      change_id,
      moderator,
      object_type = %change.object_type,
      object_id = change.object_id,
      "change approved"
    );
    self.notify_decision(email, &change);
    Ok(change)
  }

  async fn reject(
    &self,
    moderator: i64,
    change_id: i64,
    reason: Option<String>,
  ) -> Result<WikiChange> {
    let change = self.get_change(change_id).await?.ok_or_else(|| not_found("wiki change", change_id))?;
    self
      .require_permission(moderator, MODERATION_DECIDE, change.object_type, change.object_id)
      .await?;
    let (change, email) = self
      .write(move |conn, ctx| reject_in(conn, ctx, moderator, change_id, reason.as_deref()))
      .await?;
    tracing::info!(change_id, moderator, reason = ?change.moderation_reason, "change rejected");
    self.notify_decision(email, &change);
    Ok(change)
  }

  async fn moderate_entity(
    &self,
    moderator: i64,
    object_type: ObjectType,
    id: i64,
    decision: Decision,
  ) -> Result<()> {
    self.require_permission(moderator, MODERATION_DECIDE, object_type, id).await?;
    let target = decision.target_state();
    let email = self
      .write(move |conn, ctx| moderate_entity_in(conn, ctx, moderator, object_type, id, &decision))
      .await?;
    tracing::info!(moderator, %object_type, id, state = %target, "entity moderated");
    if let Some(to) = email {
      self.services.notify(
        &to,
        &format!("{object_type} {id} {target}"),
        &format!("El registre {object_type} {id} ha quedat {target}."),
      );
    }
    Ok(())
  }

  async fn moderate_bulk(
    &self,
    moderator: i64,
    object_type: ObjectType,
    ids: Vec<i64>,
    decision: Decision,
  ) -> Result<BulkReport> {
    let mut report = BulkReport::default();
    for id in ids {
      match self.moderate_entity(moderator, object_type, id, decision.clone()).await {
        Ok(()) => report.succeeded.push(id),
        Err(e) => {
          tracing::debug!(%object_type, id, error = %e, "bulk moderation skipped a row");
          report.failed.push((id, e.to_string()));
        }
      }
    }
    Ok(report)
  }

  async fn get_change(&self, change_id: i64) -> Result<Option<WikiChange>> {
    self.read(move |conn, _| load_change(conn, change_id)).await
  }

  async fn list_changes(&self, filter: ChangeFilter) -> Result<Vec<WikiChange>> {
    self.read(move |conn, ctx| list_in(conn, ctx, &filter)).await
  }

  async fn toggle_mark(
    &self,
    user_id: i64,
    object_type: ObjectType,
    object_id: i64,
    public: bool,
  ) -> Result<bool> {
    self.services.mark_limiter.try_acquire(user_id, self.services.now())?;
    self
      .write(move |conn, ctx| toggle_mark_in(conn, ctx, user_id, object_type, object_id, public))
      .await
  }

  async fn marks_for(&self, user_id: i64) -> Result<Vec<WikiMark>> {
    self.read(move |conn, _| marks_in(conn, user_id)).await
  }
}
