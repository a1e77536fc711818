//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are written as RFC 3339 and read back through
//! [`crate::coerce`]. Enums are stored by their `Display` form (Catalan
//! moderation vocabulary, snake_case discriminants).

use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use llinatge_core::{
  account::{ActivityEvent, ActivityState, User},
  entity::{
    AtributValue, Cognom, Llibre, MapVersion, ModerationState, Municipi, ObjectType, Persona,
    Qualitat, Transcripcio, TranscripcioAtribut, TranscripcioPersona,
  },
  wiki::{ChangeDiff, ChangeType, WikiChange},
};

use crate::{Error, Result, coerce};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> { coerce::to_datetime(s) }

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: Option<String>) -> Result<Option<NaiveDate>> {
  s.filter(|s| !s.trim().is_empty()).map(|s| coerce::to_date(&s)).transpose()
}

pub fn decode_enum<T>(s: &str, what: &str) -> Result<T>
where
  T: FromStr,
{
  s.parse().map_err(|_| Error::Decode(format!("unknown {what}: {s:?}")))
}

pub fn encode_enum(v: impl Display) -> String { v.to_string() }

// ─── Raw rows ────────────────────────────────────────────────────────────────

pub struct RawChange {
  pub id:                i64,
  pub object_type:       String,
  pub object_id:         i64,
  pub change_type:       String,
  pub field_key:         String,
  pub old_value:         Option<String>,
  pub new_value:         Option<String>,
  pub metadata:          String,
  pub state:             String,
  pub changed_by:        i64,
  pub changed_at:        String,
  pub moderated_by:      Option<i64>,
  pub moderated_at:      Option<String>,
  pub moderation_reason: Option<String>,
}

pub const CHANGE_COLUMNS: &str = "id, object_type, object_id, change_type, field_key, \
  old_value, new_value, metadata, moderation_state, changed_by, changed_at, \
  moderated_by, moderated_at, moderation_reason";

impl RawChange {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                row.get(0)?,
      object_type:       row.get(1)?,
      object_id:         row.get(2)?,
      change_type:       row.get(3)?,
      field_key:         row.get(4)?,
      old_value:         row.get(5)?,
      new_value:         row.get(6)?,
      metadata:          row.get(7)?,
      state:             row.get(8)?,
      changed_by:        row.get(9)?,
      changed_at:        row.get(10)?,
      moderated_by:      row.get(11)?,
      moderated_at:      row.get(12)?,
      moderation_reason: row.get(13)?,
    })
  }

  pub fn into_change(self) -> Result<WikiChange> {
    Ok(WikiChange {
      id:                self.id,
      object_type:       decode_enum::<ObjectType>(&self.object_type, "object type")?,
      object_id:         self.object_id,
      change_type:       decode_enum::<ChangeType>(&self.change_type, "change type")?,
      field_key:         self.field_key,
      old_value:         self.old_value,
      new_value:         self.new_value,
      diff:              ChangeDiff::from_metadata(&self.metadata)?,
      state:             decode_enum::<ModerationState>(&self.state, "moderation state")?,
      changed_by:        self.changed_by,
      changed_at:        decode_dt(&self.changed_at)?,
      moderated_by:      self.moderated_by,
      moderated_at:      self.moderated_at.as_deref().map(decode_dt).transpose()?,
      moderation_reason: self.moderation_reason,
    })
  }
}

pub struct RawUser {
  pub id:                  i64,
  pub usuari:              String,
  pub email:               String,
  pub actiu:               bool,
  pub permissions_version: i64,
  pub created_at:          String,
}

pub const USER_COLUMNS: &str = "id, usuari, email, actiu, permissions_version, created_at";

impl RawUser {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:                  row.get(0)?,
      usuari:              row.get(1)?,
      email:               row.get(2)?,
      actiu:               row.get(3)?,
      permissions_version: row.get(4)?,
      created_at:          row.get(5)?,
    })
  }

  pub fn into_user(self) -> Result<User> {
    Ok(User {
      id:                  self.id,
      usuari:              self.usuari,
      email:               self.email,
      actiu:               self.actiu,
      permissions_version: self.permissions_version,
      created_at:          decode_dt(&self.created_at)?,
    })
  }
}

pub struct RawActivity {
  pub id:          i64,
  pub user_id:     i64,
  pub action:      String,
  pub object_type: Option<String>,
  pub object_id:   Option<i64>,
  pub state:       String,
  pub points:      i64,
  pub created_at:  String,
}

impl RawActivity {
  pub fn into_event(self) -> Result<ActivityEvent> {
    Ok(ActivityEvent {
      id:          self.id,
      user_id:     self.user_id,
      action:      self.action,
      object_type: self
        .object_type
        .as_deref()
        .map(|t| decode_enum::<ObjectType>(t, "object type"))
        .transpose()?,
      object_id:   self.object_id,
      state:       decode_enum::<ActivityState>(&self.state, "activity state")?,
      points:      self.points,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

pub struct RawPersona {
  pub id:               i64,
  pub nom:              String,
  pub cognom1:          Option<String>,
  pub cognom2:          Option<String>,
  pub municipi_id:      Option<i64>,
  pub ofici:            Option<String>,
  pub data_naixement:   Option<String>,
  pub data_defuncio:    Option<String>,
  pub moderation_state: String,
  pub created_by:       Option<i64>,
  pub updated_by:       Option<i64>,
  pub updated_at:       Option<String>,
}

pub const PERSONA_COLUMNS: &str = "id, nom, cognom1, cognom2, municipi_id, ofici, \
  data_naixement, data_defuncio, moderation_state, created_by, updated_by, updated_at";

impl RawPersona {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:               row.get(0)?,
      nom:              row.get(1)?,
      cognom1:          row.get(2)?,
      cognom2:          row.get(3)?,
      municipi_id:      row.get(4)?,
      ofici:            row.get(5)?,
      data_naixement:   row.get(6)?,
      data_defuncio:    row.get(7)?,
      moderation_state: row.get(8)?,
      created_by:       row.get(9)?,
      updated_by:       row.get(10)?,
      updated_at:       row.get(11)?,
    })
  }

  pub fn into_persona(self) -> Result<Persona> {
    Ok(Persona {
      id:               self.id,
      nom:              self.nom,
      cognom1:          self.cognom1,
      cognom2:          self.cognom2,
      municipi_id:      self.municipi_id,
      ofici:            self.ofici,
      data_naixement:   decode_date(self.data_naixement)?,
      data_defuncio:    decode_date(self.data_defuncio)?,
      moderation_state: decode_enum(&self.moderation_state, "moderation state")?,
      created_by:       self.created_by,
      updated_by:       self.updated_by,
      updated_at:       self.updated_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

pub const MUNICIPI_COLUMNS: &str =
  "id, nom, pais_id, nivell_admin_id, comarca_id, moderation_state, created_by";

pub fn municipi_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Municipi, String)> {
  let state: String = row.get(5)?;
  Ok((
    Municipi {
      id:               row.get(0)?,
      nom:              row.get(1)?,
      pais_id:          row.get(2)?,
      nivell_admin_id:  row.get(3)?,
      comarca_id:       row.get(4)?,
      moderation_state: ModerationState::default(),
      created_by:       row.get(6)?,
    },
    state,
  ))
}

pub fn finish_municipi((mut m, state): (Municipi, String)) -> Result<Municipi> {
  m.moderation_state = decode_enum(&state, "moderation state")?;
  Ok(m)
}

pub const LLIBRE_COLUMNS: &str = "id, arxiu_id, titol, codi, municipi_id, \
  entitat_eclesiastica_id, indexacio_completa, moderation_state";

pub fn llibre_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Llibre, String)> {
  let indexacio = coerce::to_bool(row.get_ref(6)?).unwrap_or(false);
  Ok((
    Llibre {
      id:                      row.get(0)?,
      arxiu_id:                row.get(1)?,
      titol:                   row.get(2)?,
      codi:                    row.get(3)?,
      municipi_id:             row.get(4)?,
      entitat_eclesiastica_id: row.get(5)?,
      indexacio_completa:      indexacio,
      moderation_state:        ModerationState::default(),
    },
    row.get(7)?,
  ))
}

pub fn finish_llibre((mut l, state): (Llibre, String)) -> Result<Llibre> {
  l.moderation_state = decode_enum(&state, "moderation state")?;
  Ok(l)
}

pub const COGNOM_COLUMNS: &str = "id, forma, clau, redirect_to_id, moderation_state";

pub fn cognom_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Cognom, String)> {
  Ok((
    Cognom {
      id:               row.get(0)?,
      forma:            row.get(1)?,
      clau:             row.get(2)?,
      redirect_to_id:   row.get(3)?,
      moderation_state: ModerationState::default(),
    },
    row.get(4)?,
  ))
}

pub fn finish_cognom((mut c, state): (Cognom, String)) -> Result<Cognom> {
  c.moderation_state = decode_enum(&state, "moderation state")?;
  Ok(c)
}

// ─── Transcriptions ──────────────────────────────────────────────────────────

pub struct RawTranscripcio {
  pub id:               i64,
  pub llibre_id:        i64,
  pub pagina_id:        Option<i64>,
  pub tipus_acte:       String,
  pub data_acte_text:   Option<String>,
  pub data_acte_iso:    Option<String>,
  pub any_doc:          Option<i32>,
  pub municipi_id:      Option<i64>,
  pub notes:            Option<String>,
  pub moderation_state: String,
  pub created_by:       Option<i64>,
}

pub const TRANSCRIPCIO_COLUMNS: &str = "id, llibre_id, pagina_id, tipus_acte, data_acte_text, \
  data_acte_iso, any_doc, municipi_id, notes, moderation_state, created_by";

impl RawTranscripcio {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:               row.get(0)?,
      llibre_id:        row.get(1)?,
      pagina_id:        row.get(2)?,
      tipus_acte:       row.get(3)?,
      data_acte_text:   row.get(4)?,
      data_acte_iso:    row.get(5)?,
      any_doc:          row.get(6)?,
      municipi_id:      row.get(7)?,
      notes:            row.get(8)?,
      moderation_state: row.get(9)?,
      created_by:       row.get(10)?,
    })
  }

  pub fn into_transcripcio(
    self,
    persones: Vec<TranscripcioPersona>,
    atributs: Vec<TranscripcioAtribut>,
  ) -> Result<Transcripcio> {
    Ok(Transcripcio {
      id: self.id,
      llibre_id: self.llibre_id,
      pagina_id: self.pagina_id,
      tipus_acte: self.tipus_acte,
      data_acte_text: self.data_acte_text,
      data_acte_iso: decode_date(self.data_acte_iso)?,
      any_doc: self.any_doc,
      municipi_id: self.municipi_id,
      notes: self.notes,
      moderation_state: decode_enum(&self.moderation_state, "moderation state")?,
      created_by: self.created_by,
      persones,
      atributs,
    })
  }
}

pub const PERSONA_RAW_COLUMNS: &str =
  "id, rol, nom, cognom1, cognom2, sexe, edat, ofici, qualitat, persona_id";

pub fn persona_raw_from_row(
  row: &rusqlite::Row<'_>,
) -> rusqlite::Result<(TranscripcioPersona, String)> {
  Ok((
    TranscripcioPersona {
      id:         row.get(0)?,
      rol:        row.get(1)?,
      nom:        row.get(2)?,
      cognom1:    row.get(3)?,
      cognom2:    row.get(4)?,
      sexe:       row.get(5)?,
      edat:       row.get(6)?,
      ofici:      row.get(7)?,
      qualitat:   Qualitat::default(),
      persona_id: row.get(9)?,
    },
    row.get(8)?,
  ))
}

pub fn finish_persona_raw((mut p, q): (TranscripcioPersona, String)) -> Result<TranscripcioPersona> {
  p.qualitat = decode_enum(&q, "qualitat")?;
  Ok(p)
}

pub struct RawAtribut {
  pub clau:       String,
  pub tipus:      String,
  pub valor_text: Option<String>,
  pub valor_num:  Option<f64>,
  pub valor_date: Option<String>,
}

impl RawAtribut {
  pub fn into_atribut(self) -> Result<TranscripcioAtribut> {
    let bad = || Error::Decode(format!("attribute {} has no {} value", self.clau, self.tipus));
    let value = match self.tipus.as_str() {
      "text" => AtributValue::Text(self.valor_text.clone().ok_or_else(bad)?),
      "num" => AtributValue::Num(self.valor_num.ok_or_else(bad)?),
      "date" => AtributValue::Date(decode_date(self.valor_date.clone())?.ok_or_else(bad)?),
      other => return Err(Error::Decode(format!("unknown attribute kind: {other:?}"))),
    };
    Ok(TranscripcioAtribut { clau: self.clau, value })
  }
}

/// `(tipus, valor_text, valor_num, valor_date)` for an attribute row.
pub fn encode_atribut(
  v: &AtributValue,
) -> (&'static str, Option<String>, Option<f64>, Option<String>) {
  match v {
    AtributValue::Text(s) => ("text", Some(s.clone()), None, None),
    AtributValue::Num(n) => ("num", None, Some(*n), None),
    AtributValue::Date(d) => ("date", None, None, Some(encode_date(*d))),
  }
}

// ─── Maps ────────────────────────────────────────────────────────────────────

pub struct RawMapVersion {
  pub id:           i64,
  pub municipi_id:  i64,
  pub data:         String,
  pub lock_version: i64,
  pub updated_by:   Option<i64>,
  pub updated_at:   String,
}

impl RawMapVersion {
  pub fn into_map_version(self) -> Result<MapVersion> {
    Ok(MapVersion {
      id:           self.id,
      municipi_id:  self.municipi_id,
      data:         serde_json::from_str(&self.data)?,
      lock_version: self.lock_version,
      updated_by:   self.updated_by,
      updated_at:   decode_dt(&self.updated_at)?,
    })
  }
}
