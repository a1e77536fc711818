//! CSV template ingestion against the catalogue.
//!
//! Staging is done by `llinatge-import`; this module resolves books, checks
//! dedup keys against earlier jobs and either merges into an indexed book or
//! inserts. Every row is its own transaction.

use std::{collections::HashSet, io::Read};

use llinatge_core::entity::{ModerationState, ObjectType, Transcripcio};
use llinatge_import::{
  BookRef, ImportJob, ImportReport, Ingestion, StagedRecord, Template, merge,
  template::MergePolicy,
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  Result, SqliteStore,
  db::Ctx,
  encode::{encode_date, encode_enum},
  error::not_found,
  hooks,
  store::{insert_attrs, insert_people, insert_transcripcio, load_transcripcio},
};

/// What happened to one staged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Imported(i64),
  Merged(i64),
  Duplicate,
}

/// `(llibre id, indexacio_completa)` for a book reference.
fn resolve_book(conn: &Connection, book: &BookRef) -> Result<(i64, bool)> {
  let row: Option<(i64, bool)> = match book {
    BookRef::Id(id) => conn
      .query_row("SELECT id, indexacio_completa FROM llibres WHERE id = ?1", [id], |r| {
        Ok((r.get(0)?, r.get(1)?))
      })
      .optional()?,
    BookRef::Lookup(key) => conn
      .query_row(
        "SELECT id, indexacio_completa FROM llibres
          WHERE codi = ?1 OR titol = ?1 ORDER BY (codi = ?1) DESC, id LIMIT 1",
        [key.trim()],
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?,
  };
  row.ok_or_else(|| match book {
    BookRef::Id(id) => not_found("llibre", *id),
    BookRef::Lookup(key) => not_found(format!("llibre {key:?}"), 0),
  })
}

fn already_imported(conn: &Connection, import_key: &str) -> Result<bool> {
  Ok(conn.query_row(
    "SELECT EXISTS (SELECT 1 FROM transcripcions_raw WHERE import_key = ?1)",
    [import_key],
    |r| r.get(0),
  )?)
}

/// The first live transcription of the same book and act that `merge`
/// accepts as the same record.
fn merge_candidate(
  conn: &Connection,
  incoming: &Transcripcio,
  policy: &MergePolicy,
) -> Result<Option<Transcripcio>> {
  let ids: Vec<i64> = conn
    .prepare_cached(
      "SELECT id FROM transcripcions_raw
        WHERE llibre_id = ?1 AND lower(tipus_acte) = lower(?2) AND moderation_state != ?3
        ORDER BY id",
    )?
    .query_map(
      rusqlite::params![
        incoming.llibre_id,
        incoming.tipus_acte,
        encode_enum(ModerationState::Rejected)
      ],
      |r| r.get(0),
    )?
    .collect::<rusqlite::Result<_>>()?;
  for id in ids {
    if let Some(existing) = load_transcripcio(conn, id)?
      && merge::matches(&existing, incoming, policy)
    {
      return Ok(Some(existing));
    }
  }
  Ok(None)
}

fn merge_into(
  conn: &Connection,
  ctx: &Ctx,
  existing: &Transcripcio,
  incoming: &Transcripcio,
  policy: &MergePolicy,
  import_key: Option<&str>,
  author: i64,
) -> Result<i64> {
  let merged = merge::merge(existing, incoming, policy);
  let id = existing.id;
  hooks::around(conn, ctx, ObjectType::Transcripcio, id, || {
    let t = &merged.transcripcio;
    if merged.changed {
      conn.execute(
        "UPDATE transcripcions_raw
            SET pagina_id = ?1, data_acte_text = ?2, data_acte_iso = ?3, any_doc = ?4,
                municipi_id = ?5, notes = ?6, updated_by = ?7, updated_at = ?8
          WHERE id = ?9",
        rusqlite::params![
          t.pagina_id,
          t.data_acte_text,
          t.data_acte_iso.map(encode_date),
          t.any_doc,
          t.municipi_id,
          t.notes,
          author,
          ctx.stamp(),
          id,
        ],
      )?;
      insert_people(conn, id, &merged.new_people)?;
      insert_attrs(conn, id, &merged.new_attrs)?;
    }
    if let Some(key) = import_key {
      conn.execute(
        "UPDATE transcripcions_raw SET import_key = ?1 WHERE id = ?2 AND import_key IS NULL",
        rusqlite::params![key, id],
      )?;
    }
    Ok(())
  })?;
  Ok(id)
}

fn store_row(
  conn: &Connection,
  ctx: &Ctx,
  mut staged: StagedRecord,
  merge_policy: Option<&MergePolicy>,
  author: i64,
) -> Result<Outcome> {
  let (llibre_id, indexed) = resolve_book(conn, &staged.book)?;
  staged.transcripcio.llibre_id = llibre_id;
  let import_key = staged.import_key();

  if let Some(key) = &import_key
    && already_imported(conn, key)?
  {
    return Ok(Outcome::Duplicate);
  }

  if indexed
    && let Some(policy) = merge_policy
    && let Some(existing) = merge_candidate(conn, &staged.transcripcio, policy)?
  {
    let id = merge_into(
      conn,
      ctx,
      &existing,
      &staged.transcripcio,
      policy,
      import_key.as_deref(),
      author,
    )?;
    return Ok(Outcome::Merged(id));
  }

  let id = insert_transcripcio(conn, ctx, &staged.transcripcio, import_key.as_deref(), Some(author))?;
  hooks::inserted(conn, ctx, ObjectType::Transcripcio, id)?;
  Ok(Outcome::Imported(id))
}

impl Ingestion for SqliteStore {
  async fn run_import<'a, R: Read + Send + 'a>(
    &'a self,
    job: ImportJob,
    template: &'a Template,
    reader: R,
  ) -> Result<ImportReport> {
    let table = llinatge_import::read_table(reader)?;
    let binding = llinatge_import::Binding::new(template, &table)?;
    let within_file = template.dedup().is_some_and(|d| d.within_file);
    let merge_policy = template.merge_policy().cloned();

    let mut report = ImportReport::default();
    let mut seen = HashSet::new();
    for row in &table.rows {
      if job.expired(self.services.now()) {
        tracing::warn!(user_id = job.user_id, line = row.line, "import deadline passed");
        report.aborted = true;
        break;
      }
      let staged = match binding.stage(row) {
        Ok(staged) => staged,
        Err(e) => {
          report.fail(row.line, e.to_string());
          continue;
        }
      };
      if within_file
        && let Some(key) = &staged.dedup_key
        && !seen.insert(key.clone())
      {
        report.duplicate(row.line);
        continue;
      }

      let policy = merge_policy.clone();
      let outcome = self
        .write(move |conn, ctx| store_row(conn, ctx, staged, policy.as_ref(), job.user_id))
        .await;
      match outcome {
        Ok(Outcome::Imported(_)) => report.imported += 1,
        Ok(Outcome::Merged(id)) => {
          tracing::debug!(line = row.line, id, "row merged into existing transcription");
          report.merged += 1;
        }
        Ok(Outcome::Duplicate) => report.duplicate(row.line),
        Err(e) => report.fail(row.line, e.to_string()),
      }
    }

    tracing::info!(
      user_id = job.user_id,
      imported = report.imported,
      merged = report.merged,
      failed = report.failed,
      duplicates = report.duplicates,
      aborted = report.aborted,
      "import finished"
    );
    Ok(report)
  }
}
