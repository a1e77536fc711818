//! Catalogue entities: the territorial, archival and personal records that
//! moderation publishes.
//!
//! Every publishable row carries a [`ModerationState`]. Once a row reaches
//! [`ModerationState::Published`] it only changes through an approved wiki
//! change (see [`crate::wiki`]).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Field assignments keyed by column name; the unit every diff is made of.
pub type Fields = serde_json::Map<String, serde_json::Value>;

// ─── Discriminants ───────────────────────────────────────────────────────────

/// The polymorphic target of a wiki change, mark or search document.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
  strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ObjectType {
  Persona,
  Pais,
  NivellAdmin,
  Municipi,
  EntitatEclesiastica,
  Arxiu,
  Llibre,
  Pagina,
  Cognom,
  Transcripcio,
  Esdeveniment,
}

/// Moderation state shared by entities and wiki changes.
///
/// Stored with the catalogue's Catalan vocabulary; the English names are
/// accepted on input.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
pub enum ModerationState {
  #[default]
  #[serde(rename = "esborrany", alias = "draft")]
  #[strum(to_string = "esborrany", serialize = "draft")]
  Draft,
  #[serde(rename = "pendent", alias = "pending")]
  #[strum(to_string = "pendent", serialize = "pending")]
  Pending,
  #[serde(rename = "publicat", alias = "published")]
  #[strum(to_string = "publicat", serialize = "published")]
  Published,
  #[serde(rename = "rebutjat", alias = "rejected")]
  #[strum(to_string = "rebutjat", serialize = "rejected")]
  Rejected,
}

impl ModerationState {
  pub fn is_published(self) -> bool { self == Self::Published }

  /// Draft, pending and rejected rows may still be edited in place by their
  /// owner.
  pub fn is_editable_draft(self) -> bool {
    matches!(self, Self::Draft | Self::Pending | Self::Rejected)
  }

  /// `Published` and `Rejected` are final for wiki changes.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Published | Self::Rejected)
  }
}

/// The kinds of archival act the statistics engine counts.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum TipusActe {
  #[strum(to_string = "baptisme", serialize = "bateig", serialize = "naixement")]
  Baptisme,
  #[strum(to_string = "matrimoni", serialize = "casament")]
  Matrimoni,
  #[strum(to_string = "obit", serialize = "defuncio", serialize = "enterrament")]
  Obit,
}

impl TipusActe {
  /// Parse a free-text `tipus_acte`; unknown kinds are simply not counted.
  pub fn parse(raw: &str) -> Option<Self> {
    raw.trim().to_lowercase().parse().ok()
  }

  /// The demografia counter this kind feeds.
  pub fn counter_column(self) -> &'static str {
    match self {
      Self::Baptisme => "natalitat",
      Self::Matrimoni => "matrimonis",
      Self::Obit => "defuncions",
    }
  }
}

// ─── Territory ───────────────────────────────────────────────────────────────

/// A municipality. `nivell_admin_id` and `pais_id` feed the admin closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Municipi {
  pub id:               i64,
  pub nom:              String,
  pub pais_id:          Option<i64>,
  pub nivell_admin_id:  Option<i64>,
  pub comarca_id:       Option<i64>,
  pub moderation_state: ModerationState,
  pub created_by:       Option<i64>,
}

/// One row of the municipality ancestor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureRow {
  pub municipi_id:   i64,
  pub ancestor_type: ScopeLevel,
  pub ancestor_id:   i64,
}

/// The three levels materialised in the admin closure.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScopeLevel {
  Municipi,
  NivellAdmin,
  Pais,
}

/// The three closure rows a municipality must own, in insertion order.
/// Missing parents simply contribute no row.
pub fn closure_rows(municipi: &Municipi) -> Vec<ClosureRow> {
  let mut rows = vec![ClosureRow {
    municipi_id:   municipi.id,
    ancestor_type: ScopeLevel::Municipi,
    ancestor_id:   municipi.id,
  }];
  if let Some(nivell) = municipi.nivell_admin_id {
    rows.push(ClosureRow {
      municipi_id:   municipi.id,
      ancestor_type: ScopeLevel::NivellAdmin,
      ancestor_id:   nivell,
    });
  }
  if let Some(pais) = municipi.pais_id {
    rows.push(ClosureRow {
      municipi_id:   municipi.id,
      ancestor_type: ScopeLevel::Pais,
      ancestor_id:   pais,
    });
  }
  rows
}

// ─── Archive ─────────────────────────────────────────────────────────────────

/// A bound book of acts held by an arxiu.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Llibre {
  pub id:                      i64,
  pub arxiu_id:                Option<i64>,
  pub titol:                   String,
  pub codi:                    Option<String>,
  pub municipi_id:             Option<i64>,
  pub entitat_eclesiastica_id: Option<i64>,
  /// Books flagged as fully indexed accept merge-into-existing imports.
  pub indexacio_completa:      bool,
  pub moderation_state:        ModerationState,
}

// ─── People ──────────────────────────────────────────────────────────────────

/// A reconstructed person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
  pub id:               i64,
  pub nom:              String,
  pub cognom1:          Option<String>,
  pub cognom2:          Option<String>,
  pub municipi_id:      Option<i64>,
  pub ofici:            Option<String>,
  pub data_naixement:   Option<NaiveDate>,
  pub data_defuncio:    Option<NaiveDate>,
  pub moderation_state: ModerationState,
  pub created_by:       Option<i64>,
  pub updated_by:       Option<i64>,
  pub updated_at:       Option<DateTime<Utc>>,
}

/// A canonical surname. `redirect_to_id` marks a merged alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cognom {
  pub id:               i64,
  pub forma:            String,
  /// Normalised lookup key (see [`crate::search::normalize`]).
  pub clau:             String,
  pub redirect_to_id:   Option<i64>,
  pub moderation_state: ModerationState,
}

/// An orthographic variant pointing at its canonical surname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CognomVariant {
  pub id:        i64,
  pub cognom_id: i64,
  pub variant:   String,
  pub clau:      String,
}

// ─── Transcriptions ──────────────────────────────────────────────────────────

/// A single archival act as transcribed from a page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcripcio {
  pub id:               i64,
  pub llibre_id:        i64,
  pub pagina_id:        Option<i64>,
  pub tipus_acte:       String,
  pub data_acte_text:   Option<String>,
  pub data_acte_iso:    Option<NaiveDate>,
  pub any_doc:          Option<i32>,
  pub municipi_id:      Option<i64>,
  pub notes:            Option<String>,
  pub moderation_state: ModerationState,
  pub created_by:       Option<i64>,
  pub persones:         Vec<TranscripcioPersona>,
  pub atributs:         Vec<TranscripcioAtribut>,
}

/// How legible a transcribed name is. Only `Clar` feeds the name rollups.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Qualitat {
  #[default]
  Clar,
  Dubtos,
  Illegible,
}

/// A named person occurrence inside a transcription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscripcioPersona {
  pub id:         i64,
  pub rol:        String,
  pub nom:        Option<String>,
  pub cognom1:    Option<String>,
  pub cognom2:    Option<String>,
  pub sexe:       Option<String>,
  pub edat:       Option<String>,
  pub ofici:      Option<String>,
  pub qualitat:   Qualitat,
  /// Set once the occurrence has been identified with a canonical persona.
  pub persona_id: Option<i64>,
}

/// The typed value of a transcription attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipus", content = "valor", rename_all = "snake_case")]
pub enum AtributValue {
  Text(String),
  Num(f64),
  Date(NaiveDate),
}

impl AtributValue {
  pub fn discriminant(&self) -> &'static str {
    match self {
      Self::Text(_) => "text",
      Self::Num(_) => "num",
      Self::Date(_) => "date",
    }
  }
}

/// An arbitrary `(clau, valor)` pair attached to a transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscripcioAtribut {
  pub clau:  String,
  pub value: AtributValue,
}

// ─── Maps ────────────────────────────────────────────────────────────────────

/// An editable municipality map, guarded by optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapVersion {
  pub id:           i64,
  pub municipi_id:  i64,
  pub data:         serde_json::Value,
  pub lock_version: i64,
  pub updated_by:   Option<i64>,
  pub updated_at:   DateTime<Utc>,
}
