//! Object-type registry: which table backs each [`ObjectType`], which columns
//! are editable, and how JSON field values map onto SQLite values.
//!
//! Moderation, drafts and reverts all go through [`load`], [`insert`] and
//! [`update`], so every entity shares one loader and one applier.

use llinatge_core::{
  entity::{Fields, ModerationState, ObjectType},
  search::normalize,
  store::EntitySnapshot,
};
use rusqlite::{Connection, OptionalExtension as _, types::Value};
use serde_json::Value as Json;

use crate::{
  Result, coerce,
  db::{self, Ctx, Row},
  encode::{decode_enum, encode_enum},
  error::{invalid, not_found},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
  Text,
  Int,
  Bool,
  /// `YYYY-MM-DD`.
  Date,
}

pub(crate) struct EntityDef {
  pub object_type: ObjectType,
  pub table:       &'static str,
  pub columns:     &'static [(&'static str, Kind)],
  /// Columns that may never be null.
  pub required:    &'static [&'static str],
}

use Kind::{Bool, Date, Int, Text};

const PERSONA: EntityDef = EntityDef {
  object_type: ObjectType::Persona,
  table:       "persones",
  columns:     &[
    ("nom", Text),
    ("cognom1", Text),
    ("cognom2", Text),
    ("municipi_id", Int),
    ("ofici", Text),
    ("data_naixement", Date),
    ("data_defuncio", Date),
  ],
  required:    &["nom"],
};

const PAIS: EntityDef = EntityDef {
  object_type: ObjectType::Pais,
  table:       "paisos",
  columns:     &[("nom", Text), ("codi_iso", Text)],
  required:    &["nom"],
};

const NIVELL_ADMIN: EntityDef = EntityDef {
  object_type: ObjectType::NivellAdmin,
  table:       "nivells_administratius",
  columns:     &[("nom", Text), ("pais_id", Int), ("nivell", Int), ("parent_id", Int)],
  required:    &["nom"],
};

const MUNICIPI: EntityDef = EntityDef {
  object_type: ObjectType::Municipi,
  table:       "municipis",
  columns:     &[
    ("nom", Text),
    ("pais_id", Int),
    ("nivell_admin_id", Int),
    ("comarca_id", Int),
  ],
  required:    &["nom"],
};

const ENTITAT_ECLESIASTICA: EntityDef = EntityDef {
  object_type: ObjectType::EntitatEclesiastica,
  table:       "entitats_eclesiastiques",
  columns:     &[("nom", Text), ("tipus", Text), ("parent_id", Int)],
  required:    &["nom"],
};

const ARXIU: EntityDef = EntityDef {
  object_type: ObjectType::Arxiu,
  table:       "arxius",
  columns:     &[("nom", Text), ("municipi_id", Int), ("entitat_eclesiastica_id", Int)],
  required:    &["nom"],
};

const LLIBRE: EntityDef = EntityDef {
  object_type: ObjectType::Llibre,
  table:       "llibres",
  columns:     &[
    ("arxiu_id", Int),
    ("titol", Text),
    ("codi", Text),
    ("municipi_id", Int),
    ("entitat_eclesiastica_id", Int),
    ("indexacio_completa", Bool),
  ],
  required:    &["titol"],
};

const PAGINA: EntityDef = EntityDef {
  object_type: ObjectType::Pagina,
  table:       "pagines",
  columns:     &[("llibre_id", Int), ("numero", Text)],
  required:    &["llibre_id"],
};

const COGNOM: EntityDef = EntityDef {
  object_type: ObjectType::Cognom,
  table:       "cognoms",
  columns:     &[("forma", Text), ("redirect_to_id", Int)],
  required:    &["forma"],
};

const TRANSCRIPCIO: EntityDef = EntityDef {
  object_type: ObjectType::Transcripcio,
  table:       "transcripcions_raw",
  columns:     &[
    ("llibre_id", Int),
    ("pagina_id", Int),
    ("tipus_acte", Text),
    ("data_acte_text", Text),
    ("data_acte_iso", Date),
    ("any_doc", Int),
    ("municipi_id", Int),
    ("notes", Text),
  ],
  required:    &["llibre_id", "tipus_acte"],
};

const ESDEVENIMENT: EntityDef = EntityDef {
  object_type: ObjectType::Esdeveniment,
  table:       "esdeveniments",
  columns:     &[
    ("titol", Text),
    ("descripcio", Text),
    ("data", Date),
    ("any_esdeveniment", Int),
    ("municipi_id", Int),
  ],
  required:    &["titol"],
};

pub(crate) fn def(object_type: ObjectType) -> &'static EntityDef {
  match object_type {
    ObjectType::Persona => &PERSONA,
    ObjectType::Pais => &PAIS,
    ObjectType::NivellAdmin => &NIVELL_ADMIN,
    ObjectType::Municipi => &MUNICIPI,
    ObjectType::EntitatEclesiastica => &ENTITAT_ECLESIASTICA,
    ObjectType::Arxiu => &ARXIU,
    ObjectType::Llibre => &LLIBRE,
    ObjectType::Pagina => &PAGINA,
    ObjectType::Cognom => &COGNOM,
    ObjectType::Transcripcio => &TRANSCRIPCIO,
    ObjectType::Esdeveniment => &ESDEVENIMENT,
  }
}

impl EntityDef {
  fn kind_of(&self, column: &str) -> Option<Kind> {
    self.columns.iter().find(|(c, _)| *c == column).map(|(_, k)| *k)
  }

  fn column_list(&self) -> String {
    self.columns.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", ")
  }
}

// ─── Value mapping ───────────────────────────────────────────────────────────

fn to_sql(kind: Kind, key: &str, v: &Json) -> Result<Value> {
  let bad = || invalid(format!("field {key}: unexpected value {v}"));
  Ok(match (kind, v) {
    (_, Json::Null) => Value::Null,
    (Text, Json::String(s)) => Value::Text(s.clone()),
    (Text, Json::Number(n)) => Value::Text(n.to_string()),
    (Int, Json::Number(n)) => Value::Integer(n.as_i64().ok_or_else(bad)?),
    (Int, Json::String(s)) if s.trim().is_empty() => Value::Null,
    (Int, Json::String(s)) => Value::Integer(s.trim().parse().map_err(|_| bad())?),
    (Bool, v) => Value::Integer(i64::from(coerce::json_bool(v).ok_or_else(bad)?)),
    (Date, Json::String(s)) if s.trim().is_empty() => Value::Null,
    (Date, Json::String(s)) => {
      let d = coerce::to_date(s.trim()).map_err(|_| bad())?;
      Value::Text(d.format("%Y-%m-%d").to_string())
    }
    _ => return Err(bad()),
  })
}

fn to_json(kind: Kind, v: &Value) -> Json {
  match (kind, v) {
    (_, Value::Null) => Json::Null,
    (Bool, v) => Json::Bool(coerce::to_bool(v.into()).unwrap_or(false)),
    (Int, Value::Integer(i)) => Json::from(*i),
    (Int, Value::Real(f)) => Json::from(*f as i64),
    (_, Value::Integer(i)) => Json::String(i.to_string()),
    (_, Value::Real(f)) => Json::String(f.to_string()),
    (_, Value::Text(s)) => Json::String(s.clone()),
    (_, Value::Blob(b)) => Json::String(String::from_utf8_lossy(b).into_owned()),
  }
}

/// Validate field names and coerce values into the canonical JSON the loader
/// produces, so diffs compare like with like.
pub(crate) fn normalize_fields(object_type: ObjectType, fields: &Fields) -> Result<Fields> {
  let def = def(object_type);
  let mut out = Fields::new();
  for (key, value) in fields {
    let kind = def
      .kind_of(key)
      .ok_or_else(|| invalid(format!("{object_type} has no editable field {key}")))?;
    let sql = to_sql(kind, key, value)?;
    if sql == Value::Null && def.required.contains(&key.as_str()) {
      return Err(invalid(format!("field {key} is required")));
    }
    out.insert(key.clone(), to_json(kind, &sql));
  }
  Ok(out)
}

// ─── Loading ─────────────────────────────────────────────────────────────────

fn snapshot_from_row(def: &EntityDef, row: &Row) -> Result<EntitySnapshot> {
  let mut fields = Fields::new();
  for (column, kind) in def.columns {
    let value = row.get(*column).cloned().unwrap_or(Value::Null);
    fields.insert((*column).to_owned(), to_json(*kind, &value));
  }
  let state = db::text(row, "moderation_state").unwrap_or_default();
  Ok(EntitySnapshot {
    object_type: def.object_type,
    id: db::int(row, "id").unwrap_or_default(),
    fields,
    moderation_state: decode_enum(&state, "moderation state")?,
    created_by: db::int(row, "created_by"),
  })
}

pub(crate) fn load(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
) -> Result<Option<EntitySnapshot>> {
  let def = def(object_type);
  let sql = format!(
    "SELECT id, {}, moderation_state, created_by FROM {} WHERE id = ?",
    def.column_list(),
    def.table
  );
  let rows = db::query_rows(conn, ctx, &sql, &[Value::Integer(id)])?;
  rows.first().map(|row| snapshot_from_row(def, row)).transpose()
}

/// Like [`load`] but a missing row is an error.
pub(crate) fn require(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
) -> Result<EntitySnapshot> {
  load(conn, ctx, object_type, id)?.ok_or_else(|| not_found(object_type.to_string(), id))
}

pub(crate) fn all_ids(conn: &Connection, object_type: ObjectType) -> Result<Vec<i64>> {
  let sql = format!("SELECT id FROM {} ORDER BY id", def(object_type).table);
  let mut stmt = conn.prepare(&sql)?;
  let ids = stmt
    .query_map([], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<i64>>>()?;
  Ok(ids)
}

// ─── Writing ─────────────────────────────────────────────────────────────────

/// Insert a row from already-normalised `fields`. Returns the new id.
pub(crate) fn insert(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  fields: &Fields,
  state: ModerationState,
  author: Option<i64>,
) -> Result<i64> {
  let def = def(object_type);
  for required in def.required {
    if fields.get(*required).is_none_or(Json::is_null) {
      return Err(invalid(format!("field {required} is required")));
    }
  }
  if object_type == ObjectType::Cognom {
    check_redirect(conn, None, fields)?;
  }

  let mut columns = Vec::new();
  let mut params = Vec::new();
  for (key, value) in fields {
    let Some(kind) = def.kind_of(key) else { continue };
    columns.push(key.clone());
    params.push(to_sql(kind, key, value)?);
  }
  if object_type == ObjectType::Cognom
    && let Some(Json::String(forma)) = fields.get("forma")
  {
    columns.push("clau".into());
    params.push(Value::Text(normalize(forma)));
  }
  columns.extend(["moderation_state", "created_by", "updated_by", "updated_at"].map(String::from));
  params.extend([
    Value::Text(encode_enum(state)),
    db::opt_int(author),
    db::opt_int(author),
    Value::Text(ctx.stamp()),
  ]);

  let placeholders = vec!["?"; columns.len()].join(", ");
  let sql = format!(
    "INSERT INTO {} ({}) VALUES ({placeholders}) RETURNING id",
    def.table,
    columns.join(", ")
  );
  let id = db::insert_returning_id(conn, ctx, &sql, &params)?;
  tracing::debug!(%object_type, id, %state, "row inserted");
  Ok(id)
}

/// Write `fields` onto an existing row and stamp the audit columns.
pub(crate) fn update(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
  fields: &Fields,
  author: i64,
) -> Result<()> {
  let def = def(object_type);
  if object_type == ObjectType::Cognom {
    check_redirect(conn, Some(id), fields)?;
  }

  let mut sets = Vec::new();
  let mut params = Vec::new();
  for (key, value) in fields {
    let Some(kind) = def.kind_of(key) else { continue };
    let sql = to_sql(kind, key, value)?;
    if sql == Value::Null && def.required.contains(&key.as_str()) {
      return Err(invalid(format!("field {key} is required")));
    }
    sets.push(format!("{key} = ?"));
    params.push(sql);
  }
  if object_type == ObjectType::Cognom
    && let Some(Json::String(forma)) = fields.get("forma")
  {
    sets.push("clau = ?".into());
    params.push(Value::Text(normalize(forma)));
  }
  sets.push("updated_by = ?".into());
  sets.push("updated_at = ?".into());
  params.extend([Value::Integer(author), Value::Text(ctx.stamp()), Value::Integer(id)]);

  let sql = format!("UPDATE {} SET {} WHERE id = ?", def.table, sets.join(", "));
  if db::exec(conn, ctx, &sql, &params)? == 0 {
    return Err(not_found(object_type.to_string(), id));
  }

  if object_type == ObjectType::Cognom
    && let Some(Json::Number(target)) = fields.get("redirect_to_id")
  {
    // Aliases of this row follow it to the new canonical.
    conn.execute(
      "UPDATE cognoms SET redirect_to_id = ?1 WHERE redirect_to_id = ?2",
      rusqlite::params![target.as_i64(), id],
    )?;
  }
  Ok(())
}

pub(crate) fn set_state(
  conn: &Connection,
  ctx: &Ctx,
  object_type: ObjectType,
  id: i64,
  state: ModerationState,
) -> Result<()> {
  let sql = format!(
    "UPDATE {} SET moderation_state = ?1, updated_at = ?2 WHERE id = ?3",
    def(object_type).table
  );
  let changed = conn.execute(&sql, rusqlite::params![encode_enum(state), ctx.stamp(), id])?;
  if changed == 0 {
    return Err(not_found(object_type.to_string(), id));
  }
  Ok(())
}

/// A redirect must point at an existing canonical surname other than itself.
fn check_redirect(conn: &Connection, id: Option<i64>, fields: &Fields) -> Result<()> {
  let Some(target) = fields.get("redirect_to_id").and_then(Json::as_i64) else {
    return Ok(());
  };
  if Some(target) == id {
    return Err(invalid("a surname cannot redirect to itself"));
  }
  let hop: Option<Option<i64>> = conn
    .query_row(
      "SELECT redirect_to_id FROM cognoms WHERE id = ?1",
      [target],
      |r| r.get(0),
    )
    .optional()?;
  match hop {
    None => Err(not_found("cognom", target)),
    Some(Some(_)) => Err(invalid(format!(
      "cognom {target} is itself a redirect; point at its canonical instead"
    ))),
    Some(None) => Ok(()),
  }
}
