//! [`SqliteStore`]: the SQLite implementation of the catalogue traits.

use std::{path::Path, sync::Arc};

use llinatge_core::{
  config::Dialect,
  entity::{
    ClosureRow, Cognom, Fields, Llibre, ModerationState, Municipi, ObjectType, Persona,
    Transcripcio, TranscripcioAtribut, TranscripcioPersona,
  },
  search::normalize,
  services::Services,
  store::{Backend, Catalog, EntitySnapshot},
  wiki::{Actor, ChangeDiff, ChangeType},
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  Error, Result,
  db::Ctx,
  encode::{
    COGNOM_COLUMNS, LLIBRE_COLUMNS, MUNICIPI_COLUMNS, PERSONA_COLUMNS, PERSONA_RAW_COLUMNS,
    RawAtribut, RawPersona, RawTranscripcio, TRANSCRIPCIO_COLUMNS, cognom_from_row, decode_enum,
    encode_atribut, encode_date, encode_enum, finish_cognom, finish_llibre, finish_municipi,
    finish_persona_raw, llibre_from_row, municipi_from_row, persona_raw_from_row,
  },
  error::{forbidden, invalid, not_found},
  hooks,
  moderation::{self, NewChange},
  registry,
  schema::{DROP_ALL, SCHEMA, SEED},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Llinatge catalogue backed by a single SQLite file.
///
/// Cloning is cheap; the connection and the services are reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn:     tokio_rusqlite::Connection,
  pub(crate) services: Arc<Services>,
  pub(crate) dialect:  Dialect,
}

impl SqliteStore {
  /// Open (or create) a store at `path` with default services.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with(path, Services::default()).await
  }

  /// Open an in-memory store, mostly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    Self::open_in_memory_with(Services::default()).await
  }

  pub async fn open_in_memory_with(services: Services) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, services).await
  }

  /// Open `path` with explicit services. Honours `RECREADB`.
  pub async fn open_with(path: impl AsRef<Path>, services: Services) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, services).await
  }

  async fn init(conn: tokio_rusqlite::Connection, services: Services) -> Result<Self> {
    let dialect = services.settings.db_engine;
    if dialect != Dialect::Sqlite {
      return Err(invalid(format!("DB_ENGINE={dialect} is not supported by this build")));
    }
    let recreate = services.settings.recreate_db;
    let store = Self { conn, services: Arc::new(services), dialect };
    store
      .conn
      .call(move |conn| {
        if recreate {
          conn.execute_batch(DROP_ALL)?;
        }
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch(SEED)?;
        Ok(())
      })
      .await?;
    if recreate {
      tracing::warn!("RECREADB set; every table was dropped and recreated");
    }
    Ok(store)
  }

  pub fn services(&self) -> &Services { &self.services }
}

impl Backend for SqliteStore {
  type Error = Error;
}

// ─── Transcriptions ──────────────────────────────────────────────────────────

pub(crate) fn load_transcripcio(conn: &Connection, id: i64) -> Result<Option<Transcripcio>> {
  let head = conn
    .query_row(
      &format!("SELECT {TRANSCRIPCIO_COLUMNS} FROM transcripcions_raw WHERE id = ?1"),
      [id],
      RawTranscripcio::from_row,
    )
    .optional()?;
  let Some(head) = head else { return Ok(None) };

  let persones = conn
    .prepare_cached(&format!(
      "SELECT {PERSONA_RAW_COLUMNS} FROM transcripcions_persona_raw
        WHERE transcripcio_id = ?1 ORDER BY id"
    ))?
    .query_map([id], persona_raw_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(finish_persona_raw)
    .collect::<Result<Vec<_>>>()?;

  let atributs = conn
    .prepare_cached(
      "SELECT clau, tipus, valor_text, valor_num, valor_date FROM transcripcions_atributs_raw
        WHERE transcripcio_id = ?1 ORDER BY id",
    )?
    .query_map([id], |r| {
      Ok(RawAtribut {
        clau:       r.get(0)?,
        tipus:      r.get(1)?,
        valor_text: r.get(2)?,
        valor_num:  r.get(3)?,
        valor_date: r.get(4)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .map(RawAtribut::into_atribut)
    .collect::<Result<Vec<_>>>()?;

  head.into_transcripcio(persones, atributs).map(Some)
}

pub(crate) fn insert_people(
  conn: &Connection,
  transcripcio_id: i64,
  people: &[TranscripcioPersona],
) -> Result<()> {
  let mut stmt = conn.prepare_cached(
    "INSERT INTO transcripcions_persona_raw
       (transcripcio_id, rol, nom, cognom1, cognom2, sexe, edat, ofici, qualitat, persona_id)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
  )?;
  for p in people {
    stmt.execute(rusqlite::params![
      transcripcio_id,
      p.rol,
      p.nom,
      p.cognom1,
      p.cognom2,
      p.sexe,
      p.edat,
      p.ofici,
      encode_enum(p.qualitat),
      p.persona_id,
    ])?;
  }
  Ok(())
}

pub(crate) fn insert_attrs(
  conn: &Connection,
  transcripcio_id: i64,
  attrs: &[TranscripcioAtribut],
) -> Result<()> {
  let mut stmt = conn.prepare_cached(
    "INSERT INTO transcripcions_atributs_raw
       (transcripcio_id, clau, tipus, valor_text, valor_num, valor_date)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
  )?;
  for a in attrs {
    let (tipus, text, num, date) = encode_atribut(&a.value);
    stmt.execute(rusqlite::params![transcripcio_id, a.clau, tipus, text, num, date])?;
  }
  Ok(())
}

/// Insert a transcription with its people and attributes. Derived state is
/// left to the caller.
pub(crate) fn insert_transcripcio(
  conn: &Connection,
  ctx: &Ctx,
  t: &Transcripcio,
  import_key: Option<&str>,
  author: Option<i64>,
) -> Result<i64> {
  let id: i64 = conn.query_row(
    "INSERT INTO transcripcions_raw
       (llibre_id, pagina_id, tipus_acte, data_acte_text, data_acte_iso, any_doc, municipi_id,
        notes, import_key, moderation_state, created_by, updated_by, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, ?12)
     RETURNING id",
    rusqlite::params![
      t.llibre_id,
      t.pagina_id,
      t.tipus_acte,
      t.data_acte_text,
      t.data_acte_iso.map(encode_date),
      t.any_doc,
      t.municipi_id,
      t.notes,
      import_key,
      encode_enum(t.moderation_state),
      author,
      ctx.stamp(),
    ],
    |r| r.get(0),
  )?;
  insert_people(conn, id, &t.persones)?;
  insert_attrs(conn, id, &t.atributs)?;
  Ok(id)
}

// ─── Catalogue ───────────────────────────────────────────────────────────────

fn submit_for_review_in(
  conn: &Connection,
  ctx: &Ctx,
  actor: Actor,
  object_type: ObjectType,
  id: i64,
) -> Result<i64> {
  let snap = registry::require(conn, ctx, object_type, id)?;
  if snap.created_by != Some(actor.user_id) {
    return Err(forbidden(format!("{object_type} {id} belongs to someone else")));
  }
  if !matches!(snap.moderation_state, ModerationState::Draft | ModerationState::Rejected) {
    return Err(invalid(format!("{object_type} {id} is {}", snap.moderation_state)));
  }
  hooks::around(conn, ctx, object_type, id, || {
    registry::set_state(conn, ctx, object_type, id, ModerationState::Pending)
  })?;

  let diff = ChangeDiff { before: None, after: snap.fields, source_change_id: None };
  let metadata = diff.to_metadata()?;
  moderation::insert_change(conn, ctx, NewChange {
    object_type,
    object_id: id,
    change_type: ChangeType::Create,
    diff: &diff,
    metadata: &metadata,
    state: ModerationState::Pending,
    changed_by: actor.user_id,
    moderated_by: None,
  })
}

fn resolve_cognom_in(conn: &Connection, forma: &str) -> Result<Option<Cognom>> {
  let clau = normalize(forma);
  if clau.is_empty() {
    return Ok(None);
  }
  let by_clau = |sql: &str| -> Result<Option<Cognom>> {
    conn
      .query_row(sql, [&clau], cognom_from_row)
      .optional()?
      .map(finish_cognom)
      .transpose()
  };
  let found = match by_clau(&format!("SELECT {COGNOM_COLUMNS} FROM cognoms WHERE clau = ?1"))? {
    Some(c) => Some(c),
    None => by_clau(&format!(
      "SELECT {COGNOM_COLUMNS} FROM cognoms
        WHERE id = (SELECT cognom_id FROM cognom_variants WHERE clau = ?1 ORDER BY id LIMIT 1)"
    ))?,
  };
  let Some(found) = found else { return Ok(None) };
  match found.redirect_to_id {
    Some(target) => get_cognom_in(conn, target),
    None => Ok(Some(found)),
  }
}

fn get_cognom_in(conn: &Connection, id: i64) -> Result<Option<Cognom>> {
  conn
    .query_row(
      &format!("SELECT {COGNOM_COLUMNS} FROM cognoms WHERE id = ?1"),
      [id],
      cognom_from_row,
    )
    .optional()?
    .map(finish_cognom)
    .transpose()
}

impl Catalog for SqliteStore {
  async fn create_draft(
    &self,
    actor: Actor,
    object_type: ObjectType,
    fields: Fields,
  ) -> Result<i64> {
    let fields = registry::normalize_fields(object_type, &fields)?;
    let id = self
      .write(move |conn, ctx| {
        let id = registry::insert(
          conn,
          ctx,
          object_type,
          &fields,
          ModerationState::Draft,
          Some(actor.user_id),
        )?;
        hooks::inserted(conn, ctx, object_type, id)?;
        Ok(id)
      })
      .await?;
    tracing::debug!(user_id = actor.user_id, %object_type, id, "draft created");
    Ok(id)
  }

  async fn submit_for_review(&self, actor: Actor, object_type: ObjectType, id: i64) -> Result<i64> {
    self.write(move |conn, ctx| submit_for_review_in(conn, ctx, actor, object_type, id)).await
  }

  async fn snapshot(&self, object_type: ObjectType, id: i64) -> Result<Option<EntitySnapshot>> {
    self.read(move |conn, ctx| registry::load(conn, ctx, object_type, id)).await
  }

  async fn get_persona(&self, id: i64) -> Result<Option<Persona>> {
    self
      .read(move |conn, _| {
        conn
          .query_row(
            &format!("SELECT {PERSONA_COLUMNS} FROM persones WHERE id = ?1"),
            [id],
            RawPersona::from_row,
          )
          .optional()?
          .map(RawPersona::into_persona)
          .transpose()
      })
      .await
  }

  async fn get_municipi(&self, id: i64) -> Result<Option<Municipi>> {
    self
      .read(move |conn, _| {
        conn
          .query_row(
            &format!("SELECT {MUNICIPI_COLUMNS} FROM municipis WHERE id = ?1"),
            [id],
            municipi_from_row,
          )
          .optional()?
          .map(finish_municipi)
          .transpose()
      })
      .await
  }

  async fn get_llibre(&self, id: i64) -> Result<Option<Llibre>> {
    self
      .read(move |conn, _| {
        conn
          .query_row(
            &format!("SELECT {LLIBRE_COLUMNS} FROM llibres WHERE id = ?1"),
            [id],
            llibre_from_row,
          )
          .optional()?
          .map(finish_llibre)
          .transpose()
      })
      .await
  }

  async fn get_cognom(&self, id: i64) -> Result<Option<Cognom>> {
    self.read(move |conn, _| get_cognom_in(conn, id)).await
  }

  async fn resolve_cognom(&self, forma: String) -> Result<Option<Cognom>> {
    self.read(move |conn, _| resolve_cognom_in(conn, &forma)).await
  }

  async fn add_cognom_variant(&self, cognom_id: i64, variant: String) -> Result<i64> {
    let clau = normalize(&variant);
    if clau.is_empty() {
      return Err(invalid("empty surname variant"));
    }
    self
      .write(move |conn, ctx| {
        get_cognom_in(conn, cognom_id)?.ok_or_else(|| not_found("cognom", cognom_id))?;
        let id: i64 = conn.query_row(
          "INSERT INTO cognom_variants (cognom_id, variant, clau) VALUES (?1, ?2, ?3)
           ON CONFLICT (cognom_id, clau) DO UPDATE SET variant = excluded.variant
           RETURNING id",
          rusqlite::params![cognom_id, variant.trim(), clau],
          |r| r.get(0),
        )?;
        hooks::around(conn, ctx, ObjectType::Cognom, cognom_id, || Ok(()))?;
        Ok(id)
      })
      .await
  }

  async fn get_transcripcio(&self, id: i64) -> Result<Option<Transcripcio>> {
    self.read(move |conn, _| load_transcripcio(conn, id)).await
  }

  async fn closure_for(&self, municipi_id: i64) -> Result<Vec<ClosureRow>> {
    self
      .read(move |conn, _| {
        let raw: Vec<(String, i64)> = conn
          .prepare(
            "SELECT ancestor_type, ancestor_id FROM admin_closure
              WHERE municipi_id = ?1 ORDER BY rowid",
          )?
          .query_map([municipi_id], |r| Ok((r.get(0)?, r.get(1)?)))?
          .collect::<rusqlite::Result<_>>()?;
        raw
          .into_iter()
          .map(|(level, ancestor_id)| {
            Ok(ClosureRow {
              municipi_id,
              ancestor_type: decode_enum(&level, "closure level")?,
              ancestor_id,
            })
          })
          .collect()
      })
      .await
  }
}
