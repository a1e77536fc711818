//! Derived state refreshed in the same transaction as an entity write.
//!
//! Callers take a [`Before`] snapshot, mutate the row, then call [`after`].
//! Rollup deltas are computed from the two snapshots; the admin closure and
//! search documents are simply recomputed.

use std::collections::BTreeSet;

use llinatge_core::{
  entity::ObjectType,
  rollup::{RollupDelta, RollupFacts},
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{Result, db::Ctx, rollups, search};

/// What a write may invalidate, captured before it happens.
#[derive(Debug, Default)]
pub(crate) struct Before {
  /// Rollup facts of every transcription the write can move.
  facts:   Vec<(i64, Option<RollupFacts>)>,
  /// The surname key a cognom row had.
  clau:    Option<String>,
  /// The nivells a municipality was counted under.
  nivells: Vec<i64>,
}

/// Transcriptions whose effective municipality follows their book.
fn transcripcions_of_llibre(conn: &Connection, llibre_id: i64) -> Result<Vec<i64>> {
  Ok(
    conn
      .prepare_cached("SELECT id FROM transcripcions_raw WHERE llibre_id = ?1 ORDER BY id")?
      .query_map([llibre_id], |r| r.get(0))?
      .collect::<rusqlite::Result<_>>()?,
  )
}

/// The surname key of cognom `id` and of every variant registered on it.
pub(crate) fn surname_keys(conn: &Connection, id: i64) -> Result<Vec<String>> {
  Ok(
    conn
      .prepare_cached(
        "SELECT clau FROM cognoms WHERE id = ?1
         UNION SELECT clau FROM cognom_variants WHERE cognom_id = ?1
         UNION SELECT clau FROM cognoms WHERE redirect_to_id = ?1",
      )?
      .query_map([id], |r| r.get(0))?
      .collect::<rusqlite::Result<_>>()?,
  )
}

pub(crate) fn before(conn: &Connection, object_type: ObjectType, id: i64) -> Result<Before> {
  let mut out = Before::default();
  match object_type {
    ObjectType::Transcripcio => out.facts.push((id, rollups::facts(conn, id)?)),
    ObjectType::Llibre => {
      for tx in transcripcions_of_llibre(conn, id)? {
        out.facts.push((tx, rollups::facts(conn, tx)?));
      }
    }
    ObjectType::Municipi => out.nivells = rollups::nivells_of(conn, id)?,
    ObjectType::Cognom => {
      out.clau = conn
        .query_row("SELECT clau FROM cognoms WHERE id = ?1", [id], |r| r.get(0))
        .optional()?;
    }
    _ => {}
  }
  Ok(out)
}

/// Refresh everything derived from `(object_type, id)`.
pub(crate) fn after(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
  before: Before,
) -> Result<()> {
  match object_type {
    ObjectType::Municipi => {
      search::refresh_closure(conn, id)?;
      let now: BTreeSet<i64> = rollups::nivells_of(conn, id)?.into_iter().collect();
      let was: BTreeSet<i64> = before.nivells.iter().copied().collect();
      if now != was {
        for &nivell_id in now.union(&was) {
          rollups::recount_nivell(conn, nivell_id)?;
        }
        tracing::debug!(municipi_id = id, "municipality moved between nivells");
      }
    }
    ObjectType::NivellAdmin => search::refresh_closure_under_nivell(conn, id)?,
    _ => {}
  }

  for (tx, old) in &before.facts {
    let new = rollups::facts(conn, *tx)?;
    let delta = RollupDelta::between(old.as_ref(), new.as_ref(), ctx.year);
    rollups::apply(conn, &delta)?;
    if object_type == ObjectType::Llibre {
      search::reindex_one(conn, ctx, ObjectType::Transcripcio, *tx)?;
    }
  }

  if object_type == ObjectType::Cognom {
    let mut keys: Vec<String> = before.clau.into_iter().collect();
    keys.extend(surname_keys(conn, id)?);
    keys.sort();
    keys.dedup();
    for clau in &keys {
      search::reindex_carriers(conn, ctx, clau)?;
    }
    for m in rollups::municipis_with_surnames(conn, &keys)? {
      rollups::rebuild(conn, ctx, m)?;
    }
  }

  search::reindex_one(conn, ctx, object_type, id)
}

/// Refresh derived state for a row that did not exist before this
/// transaction.
pub(crate) fn inserted(conn: &Connection, ctx: &Ctx, object_type: ObjectType, id: i64) -> Result<()> {
  let mut before = Before::default();
  if object_type == ObjectType::Transcripcio {
    before.facts.push((id, None));
  }
  after(conn, ctx, object_type, id, before)
}

/// Snapshot, run `write`, refresh. The common shape of every entity mutation.
pub(crate) fn around<T>(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
  write: impl FnOnce() -> Result<T>,
) -> Result<T> {
  let snapshot = before(conn, object_type, id)?;
  let out = write()?;
  after(conn, ctx, object_type, id, snapshot)?;
  Ok(out)
}
