//! Import templates (format version 1).
//!
//! A template is a JSON document that maps CSV columns onto the fields of a
//! raw transcription, its person occurrences and its attributes.
//! [`Template::parse`] deserialises the document and compiles every target,
//! transform and condition up front so a bad template fails before the
//! first row is read.

use std::str::FromStr;

use llinatge_core::entity::ModerationState;
use serde::{Deserialize, Serialize};

use crate::{
  condition::Condition,
  error::{Error, Result},
  transform::Transform,
};

pub const TEMPLATE_VERSION: u32 = 1;
pub const KIND_TRANSCRIPCIONS: &str = "transcripcions_raw";

// ─── Document ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDoc {
  pub version:          u32,
  pub kind:             String,
  pub book_resolution:  BookResolution,
  pub mapping:          MappingDoc,
  #[serde(default)]
  pub policies:         Policies,
  /// State given to freshly inserted rows. Defaults to pending.
  #[serde(default)]
  pub moderation_state: Option<ModerationState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookMode {
  /// The column holds a numeric llibre id.
  LlibreId,
  /// The column holds a llibre `codi` or `titol`.
  Lookup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookResolution {
  pub mode:   BookMode,
  pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDoc {
  pub columns: Vec<ColumnDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDoc {
  pub header:    String,
  #[serde(default)]
  pub key:       Option<String>,
  #[serde(default)]
  pub required:  bool,
  #[serde(default)]
  pub map_to:    Vec<MapToDoc>,
  #[serde(default)]
  pub condition: Option<ConditionDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapToDoc {
  pub target:    String,
  #[serde(default)]
  pub transform: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDoc {
  pub expr:      String,
  #[serde(default)]
  pub then:      Vec<MapToDoc>,
  #[serde(default, rename = "else")]
  pub otherwise: Vec<MapToDoc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policies {
  #[serde(default)]
  pub dedup:          Option<DedupPolicy>,
  #[serde(default)]
  pub merge_existing: Option<MergePolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupPolicy {
  #[serde(default)]
  pub within_file: bool,
  pub key_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
  ByPrincipalPersonIfBookIndexed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePolicy {
  pub mode:                MergeMode,
  pub principal_roles:     Vec<String>,
  #[serde(default = "yes")]
  pub update_missing_only: bool,
  #[serde(default)]
  pub add_missing_people:  bool,
  #[serde(default)]
  pub add_missing_attrs:   bool,
}

fn yes() -> bool { true }

// ─── Targets ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BaseField {
  LlibreId,
  PaginaId,
  TipusActe,
  DataActeText,
  DataActeIso,
  AnyDoc,
  MunicipiId,
  Notes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PersonField {
  Nom,
  Cognom1,
  Cognom2,
  Sexe,
  Edat,
  Ofici,
  Qualitat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AttrKind {
  Text,
  Num,
  Date,
}

/// Where a mapped value lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
  Base(BaseField),
  /// `person.<role>` opens a new occurrence; `person.<role>.<field>` fills
  /// a field of the latest occurrence with that role.
  Person { rol: String, field: Option<PersonField> },
  Attr { clau: String, kind: AttrKind },
}

impl FromStr for Target {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let invalid = || Error::InvalidTarget(s.to_owned());
    let parts: Vec<&str> = s.trim().split('.').collect();
    match parts.as_slice() {
      ["base", field] => field.parse().map(Self::Base).map_err(|_| invalid()),
      ["person", rol] if !rol.is_empty() => {
        Ok(Self::Person { rol: (*rol).to_owned(), field: None })
      }
      ["person", rol, field] if !rol.is_empty() => Ok(Self::Person {
        rol:   (*rol).to_owned(),
        field: Some(field.parse().map_err(|_| invalid())?),
      }),
      ["attr", clau, kind] if !clau.is_empty() => Ok(Self::Attr {
        clau: (*clau).to_owned(),
        kind: kind.parse().map_err(|_| invalid())?,
      }),
      _ => Err(invalid()),
    }
  }
}

// ─── Compiled template ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTo {
  pub target:     Target,
  pub transforms: Vec<Transform>,
}

#[derive(Debug, Clone)]
pub struct Column {
  pub header:    String,
  pub key:       String,
  pub required:  bool,
  pub map_to:    Vec<MapTo>,
  pub condition: Option<(Condition, Vec<MapTo>, Vec<MapTo>)>,
}

impl Column {
  /// The mappings to run for `cell`, after evaluating the condition.
  pub fn mappings_for(&self, cell: &str) -> &[MapTo] {
    match &self.condition {
      Some((cond, then, _)) if cond.eval(cell) => then,
      Some((_, _, otherwise)) => otherwise,
      None => &self.map_to,
    }
  }
}

/// A validated, ready-to-run template.
#[derive(Debug, Clone)]
pub struct Template {
  pub doc:     TemplateDoc,
  pub columns: Vec<Column>,
}

fn compile_map_to(docs: &[MapToDoc]) -> Result<Vec<MapTo>> {
  docs
    .iter()
    .map(|m| {
      Ok(MapTo {
        target:     m.target.parse()?,
        transforms: m.transform.iter().map(|t| t.parse()).collect::<Result<_>>()?,
      })
    })
    .collect()
}

impl Template {
  pub fn parse(json: &str) -> Result<Self> {
    Self::compile(serde_json::from_str(json)?)
  }

  pub fn compile(doc: TemplateDoc) -> Result<Self> {
    if doc.version != TEMPLATE_VERSION {
      return Err(Error::UnsupportedVersion(doc.version));
    }
    if doc.kind != KIND_TRANSCRIPCIONS {
      return Err(Error::UnsupportedKind(doc.kind));
    }

    let columns = doc
      .mapping
      .columns
      .iter()
      .map(|c| {
        let condition = match &c.condition {
          Some(cd) => Some((
            Condition::parse(&cd.expr)?,
            compile_map_to(&cd.then)?,
            compile_map_to(&cd.otherwise)?,
          )),
          None => None,
        };
        Ok(Column {
          header: c.header.trim().to_owned(),
          key: c.key.clone().unwrap_or_else(|| c.header.trim().to_owned()),
          required: c.required,
          map_to: compile_map_to(&c.map_to)?,
          condition,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { doc, columns })
  }

  pub fn initial_state(&self) -> ModerationState {
    self.doc.moderation_state.unwrap_or(ModerationState::Pending)
  }

  pub fn dedup(&self) -> Option<&DedupPolicy> { self.doc.policies.dedup.as_ref() }

  pub fn merge_policy(&self) -> Option<&MergePolicy> {
    self.doc.policies.merge_existing.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DOC: &str = r#"{
    "version": 1,
    "kind": "transcripcions_raw",
    "book_resolution": { "mode": "llibre_id", "column": "llibre_id" },
    "mapping": { "columns": [
      { "header": "llibre_id", "required": true, "map_to": [{ "target": "base.llibre_id" }] },
      { "header": "Tipus", "key": "tipus", "map_to": [{ "target": "base.tipus_acte", "transform": ["trim", "lower"] }] },
      { "header": "Batejat", "map_to": [{ "target": "person.batejat", "transform": ["parse_person_from_nom"] }] },
      { "header": "Sexe", "condition": { "expr": "value != ''",
          "then": [{ "target": "person.batejat.sexe", "transform": ["sexe"] }] } },
      { "header": "Foli", "map_to": [{ "target": "attr.foli.num" }] }
    ]},
    "policies": { "dedup": { "within_file": true, "key_columns": ["llibre_id", "tipus_acte"] } }
  }"#;

  #[test]
  fn parses_and_compiles() {
    let t = Template::parse(DOC).unwrap();
    assert_eq!(t.columns.len(), 5);
    assert_eq!(t.columns[1].key, "tipus");
    assert_eq!(t.columns[2].key, "Batejat");
    assert_eq!(t.columns[1].map_to[0].transforms, vec![Transform::Trim, Transform::Lower]);
    assert_eq!(t.initial_state(), ModerationState::Pending);
    assert!(t.dedup().unwrap().within_file);
    assert!(t.merge_policy().is_none());

    let sexe = &t.columns[3];
    assert!(sexe.mappings_for("").is_empty());
    assert_eq!(sexe.mappings_for("H")[0].target, Target::Person {
      rol:   "batejat".into(),
      field: Some(PersonField::Sexe),
    });
  }

  #[test]
  fn target_grammar() {
    assert_eq!("base.any_doc".parse::<Target>().unwrap(), Target::Base(BaseField::AnyDoc));
    assert_eq!("attr.foli.date".parse::<Target>().unwrap(), Target::Attr {
      clau: "foli".into(),
      kind: AttrKind::Date,
    });
    for bad in ["base.unknown", "person", "person.pare.alçada", "attr.foli", "x.y"] {
      assert!(bad.parse::<Target>().is_err(), "{bad}");
    }
  }

  #[test]
  fn rejects_other_versions_and_kinds() {
    let v2 = DOC.replacen("\"version\": 1", "\"version\": 2", 1);
    assert!(matches!(Template::parse(&v2), Err(Error::UnsupportedVersion(2))));
    let kind = DOC.replacen("transcripcions_raw", "persones", 1);
    assert!(matches!(Template::parse(&kind), Err(Error::UnsupportedKind(_))));
    let bad = DOC.replacen("\"lower\"", "\"shout\"", 1);
    assert!(matches!(Template::parse(&bad), Err(Error::UnknownTransform(_))));
  }
}
