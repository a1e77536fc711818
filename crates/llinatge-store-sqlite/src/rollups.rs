//! Demografia and name-frequency aggregates.
//!
//! Writers call [`facts`] before and after touching a transcription and feed
//! the difference to [`apply`]. [`rebuild`] recomputes the expected cells from
//! the raw tables and applies only the correction, so it goes through the
//! same code path as the incremental writers.

use std::collections::BTreeSet;

use llinatge_core::{
  entity::{ModerationState, Qualitat, TipusActe},
  rollup::{
    DemografiaKey, DemografiaMeta, DemografiaRow, FreqKey, NameFrequency, NameKey,
    RollupDelta, RollupFacts,
  },
  search::normalize,
  store::Rollups,
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{Result, SqliteStore, db::Ctx, encode::decode_enum, search::canonical_clau};

/// The effective municipality of a transcription: its own, else its book's.
const EFFECTIVE_MUNICIPI: &str = "COALESCE(t.municipi_id, l.municipi_id)";

// ─── Facts ───────────────────────────────────────────────────────────────────

/// Snapshot a transcription as the rollups see it. `None` if it is gone.
pub(crate) fn facts(conn: &Connection, id: i64) -> Result<Option<RollupFacts>> {
  let sql = format!(
    "SELECT {EFFECTIVE_MUNICIPI}, t.tipus_acte, t.any_doc, t.moderation_state
       FROM transcripcions_raw t LEFT JOIN llibres l ON l.id = t.llibre_id
      WHERE t.id = ?1"
  );
  let head: Option<(Option<i64>, String, Option<i32>, String)> = conn
    .query_row(&sql, [id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
    .optional()?;
  let Some((municipi_id, tipus_acte, any_doc, state)) = head else {
    return Ok(None);
  };
  let state: ModerationState = decode_enum(&state, "moderation state")?;

  let people: Vec<(Option<String>, Option<String>, String)> = conn
    .prepare_cached(
      "SELECT nom, cognom1, qualitat FROM transcripcions_persona_raw
        WHERE transcripcio_id = ?1 ORDER BY id",
    )?
    .query_map([id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
    .collect::<rusqlite::Result<_>>()?;

  let mut names = Vec::new();
  for (nom, cognom1, qualitat) in people {
    let legible = decode_enum::<Qualitat>(&qualitat, "qualitat")? == Qualitat::Clar;
    let (Some(nom), Some(cognom1)) = (nom, cognom1) else { continue };
    let nom = normalize(&nom);
    if !legible || nom.is_empty() {
      continue;
    }
    if let Some(cognom) = canonical_clau(conn, &cognom1)? {
      names.push(NameKey { nom, cognom });
    }
  }

  Ok(Some(RollupFacts { municipi_id, tipus_acte, any_doc, state, names }))
}

// ─── Applying deltas ─────────────────────────────────────────────────────────

/// The two demografia table families share one shape.
struct Territory {
  rows:   &'static str,
  meta:   &'static str,
  id_col: &'static str,
}

const MUNICIPI: Territory = Territory {
  rows:   "municipi_demografia",
  meta:   "municipi_demografia_meta",
  id_col: "municipi_id",
};

const NIVELL: Territory = Territory {
  rows:   "nivell_demografia",
  meta:   "nivell_demografia_meta",
  id_col: "nivell_id",
};

fn bump_demografia(
  conn: &Connection,
  t: &Territory,
  id: i64,
  any: i32,
  tipus: TipusActe,
  by: i64,
) -> Result<()> {
  let col = tipus.counter_column();
  let (rows, id_col) = (t.rows, t.id_col);
  conn.execute(
    &format!(
      "INSERT INTO {rows} ({id_col}, any, {col}) VALUES (?1, ?2, MAX(0, ?3))
       ON CONFLICT ({id_col}, any) DO UPDATE SET {col} = MAX(0, {col} + ?3)"
    ),
    rusqlite::params![id, any, by],
  )?;
  conn.execute(
    &format!(
      "DELETE FROM {rows} WHERE {id_col} = ?1 AND any = ?2
         AND natalitat = 0 AND matrimonis = 0 AND defuncions = 0"
    ),
    rusqlite::params![id, any],
  )?;
  Ok(())
}

fn demografia_rows(conn: &Connection, t: &Territory, id: i64) -> Result<Vec<DemografiaRow>> {
  let sql = format!(
    "SELECT any, natalitat, matrimonis, defuncions FROM {} WHERE {} = ?1 ORDER BY any",
    t.rows, t.id_col
  );
  let rows = conn
    .prepare(&sql)?
    .query_map([id], |r| {
      Ok(DemografiaRow {
        any:        r.get(0)?,
        natalitat:  r.get(1)?,
        matrimonis: r.get(2)?,
        defuncions: r.get(3)?,
      })
    })?
    .collect::<rusqlite::Result<_>>()?;
  Ok(rows)
}

/// Recompute a territory's meta row from its yearly rows and advance its
/// `lock_version`. The row is kept even when every total is zero.
fn refresh_meta(conn: &Connection, t: &Territory, id: i64) -> Result<()> {
  let meta = DemografiaMeta::from_rows(&demografia_rows(conn, t, id)?);
  let (table, id_col) = (t.meta, t.id_col);
  conn.execute(
    &format!(
      "INSERT INTO {table} ({id_col}, any_min, any_max, total_natalitat, total_matrimonis,
                            total_defuncions, lock_version)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
       ON CONFLICT ({id_col}) DO UPDATE SET
         any_min = excluded.any_min,
         any_max = excluded.any_max,
         total_natalitat = excluded.total_natalitat,
         total_matrimonis = excluded.total_matrimonis,
         total_defuncions = excluded.total_defuncions,
         lock_version = lock_version + 1"
    ),
    rusqlite::params![
      id,
      meta.any_min,
      meta.any_max,
      meta.total_natalitat,
      meta.total_matrimonis,
      meta.total_defuncions
    ],
  )?;
  Ok(())
}

pub(crate) fn nivells_of(conn: &Connection, municipi_id: i64) -> Result<Vec<i64>> {
  let ids = conn
    .prepare_cached(
      "SELECT ancestor_id FROM admin_closure
        WHERE municipi_id = ?1 AND ancestor_type = 'nivell_admin'",
    )?
    .query_map([municipi_id], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;
  Ok(ids)
}

fn title_case(clau: &str) -> String {
  clau
    .split(' ')
    .map(|w| {
      let mut c = w.chars();
      match c.next() {
        Some(first) => first.to_uppercase().chain(c).collect(),
        None => String::new(),
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}

fn bump_freq(
  conn: &Connection,
  freq: &str,
  total: &str,
  key: &FreqKey,
  by: i64,
) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT INTO {freq} (clau, municipi_id, any, freq) VALUES (?1, ?2, ?3, MAX(0, ?4))
       ON CONFLICT (clau, municipi_id, any) DO UPDATE SET freq = MAX(0, freq + ?4)"
    ),
    rusqlite::params![key.clau, key.municipi_id, key.any, by],
  )?;
  conn.execute(
    &format!("DELETE FROM {freq} WHERE clau = ?1 AND municipi_id = ?2 AND any = ?3 AND freq <= 0"),
    rusqlite::params![key.clau, key.municipi_id, key.any],
  )?;
  conn.execute(
    &format!(
      "INSERT INTO {total} (clau, municipi_id, total) VALUES (?1, ?2, MAX(0, ?3))
       ON CONFLICT (clau, municipi_id) DO UPDATE SET total = MAX(0, total + ?3)"
    ),
    rusqlite::params![key.clau, key.municipi_id, by],
  )?;
  conn.execute(
    &format!("DELETE FROM {total} WHERE clau = ?1 AND municipi_id = ?2 AND total <= 0"),
    rusqlite::params![key.clau, key.municipi_id],
  )?;
  Ok(())
}

/// Apply a signed delta to every aggregate it touches.
pub(crate) fn apply(conn: &Connection, delta: &RollupDelta) -> Result<()> {
  if delta.is_empty() {
    return Ok(());
  }
  let mut municipis = BTreeSet::new();
  let mut nivells = BTreeSet::new();
  for (key, by) in &delta.demografia {
    bump_demografia(conn, &MUNICIPI, key.municipi_id, key.any, key.tipus, *by)?;
    municipis.insert(key.municipi_id);
    for nivell in nivells_of(conn, key.municipi_id)? {
      bump_demografia(conn, &NIVELL, nivell, key.any, key.tipus, *by)?;
      nivells.insert(nivell);
    }
  }
  for id in municipis {
    refresh_meta(conn, &MUNICIPI, id)?;
  }
  for id in nivells {
    refresh_meta(conn, &NIVELL, id)?;
  }

  for (key, by) in &delta.noms {
    if *by > 0 {
      conn.execute(
        "INSERT OR IGNORE INTO noms (forma, clau) VALUES (?1, ?2)",
        rusqlite::params![title_case(&key.clau), key.clau],
      )?;
    }
    bump_freq(conn, "nom_freq", "nom_freq_total", key, *by)?;
  }
  for (key, by) in &delta.cognoms {
    if *by > 0 {
      conn.execute(
        "INSERT OR IGNORE INTO cognoms (forma, clau, moderation_state) VALUES (?1, ?2, 'publicat')",
        rusqlite::params![title_case(&key.clau), key.clau],
      )?;
    }
    bump_freq(conn, "cognom_freq", "cognom_freq_total", key, *by)?;
  }
  tracing::debug!(
    demografia = delta.demografia.len(),
    noms = delta.noms.len(),
    cognoms = delta.cognoms.len(),
    "rollup delta applied"
  );
  Ok(())
}

// ─── Rebuild ─────────────────────────────────────────────────────────────────

/// What the aggregate tables currently hold for one municipality, as a delta
/// from empty.
fn stored(conn: &Connection, municipi_id: i64) -> Result<RollupDelta> {
  let mut delta = RollupDelta::default();
  for row in demografia_rows(conn, &MUNICIPI, municipi_id)? {
    for (tipus, n) in [
      (TipusActe::Baptisme, row.natalitat),
      (TipusActe::Matrimoni, row.matrimonis),
      (TipusActe::Obit, row.defuncions),
    ] {
      if n != 0 {
        delta.demografia.insert(DemografiaKey { municipi_id, tipus, any: row.any }, n);
      }
    }
  }
  for (table, target) in [("nom_freq", &mut delta.noms), ("cognom_freq", &mut delta.cognoms)] {
    let sql = format!("SELECT clau, any, freq FROM {table} WHERE municipi_id = ?1");
    let rows: Vec<(String, i32, i64)> = conn
      .prepare(&sql)?
      .query_map([municipi_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
      .collect::<rusqlite::Result<_>>()?;
    for (clau, any, freq) in rows {
      target.insert(FreqKey { clau, municipi_id, any }, freq);
    }
  }
  Ok(delta)
}

/// Replay one municipality from the raw tables and correct the aggregates,
/// then recount the nivells it currently sits under.
///
/// Runs inside the caller's IMMEDIATE transaction, which holds the database
/// write lock; no incremental writer can interleave with it.
pub(crate) fn rebuild(conn: &Connection, ctx: &Ctx, municipi_id: i64) -> Result<()> {
  let sql = format!(
    "SELECT t.id FROM transcripcions_raw t LEFT JOIN llibres l ON l.id = t.llibre_id
      WHERE {EFFECTIVE_MUNICIPI} = ?1 ORDER BY t.id"
  );
  let ids: Vec<i64> = conn
    .prepare(&sql)?
    .query_map([municipi_id], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;

  let mut correction = RollupDelta::default();
  for id in ids {
    if let Some(f) = facts(conn, id)? {
      correction.absorb(&RollupDelta::between(None, Some(&f), ctx.year));
    }
  }
  correction.absorb(&stored(conn, municipi_id)?.inverse());

  apply(conn, &correction)?;
  refresh_meta(conn, &MUNICIPI, municipi_id)?;
  for nivell_id in nivells_of(conn, municipi_id)? {
    recount_nivell(conn, nivell_id)?;
  }
  tracing::debug!(municipi_id, cells = correction.demografia.len(), "municipi rebuilt");
  Ok(())
}

/// Replace a nivell's yearly rows with the sum of the municipalities the
/// closure currently places under it.
pub(crate) fn recount_nivell(conn: &Connection, nivell_id: i64) -> Result<()> {
  conn.execute("DELETE FROM nivell_demografia WHERE nivell_id = ?1", [nivell_id])?;
  conn.execute(
    "INSERT INTO nivell_demografia (nivell_id, any, natalitat, matrimonis, defuncions)
     SELECT ?1, d.any, SUM(d.natalitat), SUM(d.matrimonis), SUM(d.defuncions)
       FROM municipi_demografia d
       JOIN admin_closure c ON c.municipi_id = d.municipi_id
      WHERE c.ancestor_type = 'nivell_admin' AND c.ancestor_id = ?1
      GROUP BY d.any",
    [nivell_id],
  )?;
  refresh_meta(conn, &NIVELL, nivell_id)
}

/// Every nivell that has, or could have, aggregates.
pub(crate) fn nivell_targets(conn: &Connection) -> Result<Vec<i64>> {
  let ids = conn
    .prepare(
      "SELECT id FROM nivells_administratius
       UNION SELECT nivell_id FROM nivell_demografia
       ORDER BY 1",
    )?
    .query_map([], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;
  Ok(ids)
}

/// Every municipality that has, or could have, aggregates.
pub(crate) fn rebuild_targets(conn: &Connection) -> Result<Vec<i64>> {
  let sql = format!(
    "SELECT id FROM municipis
     UNION SELECT municipi_id FROM municipi_demografia
     UNION SELECT {EFFECTIVE_MUNICIPI} FROM transcripcions_raw t
             LEFT JOIN llibres l ON l.id = t.llibre_id
            WHERE {EFFECTIVE_MUNICIPI} IS NOT NULL
     ORDER BY 1"
  );
  let ids = conn
    .prepare(&sql)?
    .query_map([], |r| r.get(0))?
    .collect::<rusqlite::Result<_>>()?;
  Ok(ids)
}

/// Municipalities with a counted-eligible person whose first surname
/// normalises to one of `claus`. Their cognom cells move when a surname is
/// redirected or gains a variant.
pub(crate) fn municipis_with_surnames(conn: &Connection, claus: &[String]) -> Result<Vec<i64>> {
  if claus.is_empty() {
    return Ok(Vec::new());
  }
  let sql = format!(
    "SELECT DISTINCT {EFFECTIVE_MUNICIPI}, p.cognom1
       FROM transcripcions_persona_raw p
       JOIN transcripcions_raw t ON t.id = p.transcripcio_id
       LEFT JOIN llibres l ON l.id = t.llibre_id
      WHERE p.cognom1 IS NOT NULL AND {EFFECTIVE_MUNICIPI} IS NOT NULL"
  );
  let pairs: Vec<(i64, String)> = conn
    .prepare(&sql)?
    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
    .collect::<rusqlite::Result<_>>()?;
  let hits: BTreeSet<i64> = pairs
    .into_iter()
    .filter(|(_, cognom)| claus.contains(&normalize(cognom)))
    .map(|(m, _)| m)
    .collect();
  Ok(hits.into_iter().collect())
}

// ─── Reads ───────────────────────────────────────────────────────────────────

fn meta(conn: &Connection, municipi_id: i64) -> Result<DemografiaMeta> {
  Ok(
    conn
      .query_row(
        "SELECT any_min, any_max, total_natalitat, total_matrimonis, total_defuncions
           FROM municipi_demografia_meta WHERE municipi_id = ?1",
        [municipi_id],
        |r| {
          Ok(DemografiaMeta {
            any_min:          r.get(0)?,
            any_max:          r.get(1)?,
            total_natalitat:  r.get(2)?,
            total_matrimonis: r.get(3)?,
            total_defuncions: r.get(4)?,
          })
        },
      )
      .optional()?
      .unwrap_or_default(),
  )
}

fn top(
  conn: &Connection,
  names: &str,
  totals: &str,
  municipi_id: i64,
  limit: usize,
) -> Result<Vec<NameFrequency>> {
  let sql = format!(
    "SELECT n.id, n.forma, t.total FROM {totals} t JOIN {names} n ON n.clau = t.clau
      WHERE t.municipi_id = ?1 ORDER BY t.total DESC, n.forma ASC LIMIT ?2"
  );
  let limit = i64::try_from(limit).unwrap_or(i64::MAX);
  let rows = conn
    .prepare(&sql)?
    .query_map(rusqlite::params![municipi_id, limit], |r| {
      Ok(NameFrequency { id: r.get(0)?, forma: r.get(1)?, total: r.get(2)? })
    })?
    .collect::<rusqlite::Result<_>>()?;
  Ok(rows)
}

// ─── Trait impl ──────────────────────────────────────────────────────────────

impl Rollups for SqliteStore {
  async fn apply_delta(&self, delta: RollupDelta) -> Result<()> {
    self.write(move |conn, _| apply(conn, &delta)).await
  }

  async fn rebuild(&self, municipi_id: i64) -> Result<()> {
    self.write(move |conn, ctx| rebuild(conn, ctx, municipi_id)).await
  }

  async fn rebuild_all(&self) -> Result<usize> {
    let targets = self.read(|conn, _| rebuild_targets(conn)).await?;
    for &id in &targets {
      self.write(move |conn, ctx| rebuild(conn, ctx, id)).await?;
    }
    // Nivells left without municipalities are not reached from any target.
    self
      .write(|conn, _| {
        for nivell_id in nivell_targets(conn)? {
          recount_nivell(conn, nivell_id)?;
        }
        Ok(())
      })
      .await?;
    tracing::info!(municipis = targets.len(), "rollups rebuilt");
    Ok(targets.len())
  }

  async fn demografia(&self, municipi_id: i64) -> Result<Vec<DemografiaRow>> {
    self.read(move |conn, _| demografia_rows(conn, &MUNICIPI, municipi_id)).await
  }

  async fn demografia_meta(&self, municipi_id: i64) -> Result<DemografiaMeta> {
    self.read(move |conn, _| meta(conn, municipi_id)).await
  }

  async fn nivell_demografia(&self, nivell_id: i64) -> Result<Vec<DemografiaRow>> {
    self.read(move |conn, _| demografia_rows(conn, &NIVELL, nivell_id)).await
  }

  async fn top_noms(&self, municipi_id: i64, limit: usize) -> Result<Vec<NameFrequency>> {
    self.read(move |conn, _| top(conn, "noms", "nom_freq_total", municipi_id, limit)).await
  }

  async fn top_cognoms(&self, municipi_id: i64, limit: usize) -> Result<Vec<NameFrequency>> {
    self
      .read(move |conn, _| top(conn, "cognoms", "cognom_freq_total", municipi_id, limit))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::title_case;

  #[test]
  fn generated_forms_are_title_cased() {
    assert_eq!(title_case("joan maria"), "Joan Maria");
    assert_eq!(title_case("puig"), "Puig");
  }
}
