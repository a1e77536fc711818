//! Row staging: one CSV record in, one unsaved transcription out.

use std::collections::HashMap;

use llinatge_core::entity::{
  AtributValue, Qualitat, Transcripcio, TranscripcioAtribut, TranscripcioPersona,
};
use sha2::{Digest, Sha256};

use crate::{
  csv::{CsvRow, CsvTable},
  error::{Error, Result},
  template::{AttrKind, BaseField, BookMode, PersonField, Target, Template},
  transform::{FlexDate, Value, apply_all, parse_date, year_of},
};

/// How the row names its llibre before the store resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookRef {
  Id(i64),
  /// A llibre `codi` or `titol`.
  Lookup(String),
}

/// A transcription built from one CSV row, not yet persisted.
///
/// `transcripcio.llibre_id` is only meaningful once the store has resolved
/// [`StagedRecord::book`].
#[derive(Debug, Clone)]
pub struct StagedRecord {
  pub line:         usize,
  pub book:         BookRef,
  pub transcripcio: Transcripcio,
  pub dedup_key:    Option<Vec<String>>,
}

impl StagedRecord {
  /// Stable digest of the dedup key, stored with imported rows so that a
  /// later job can recognise them.
  pub fn import_key(&self) -> Option<String> {
    let key = self.dedup_key.as_ref()?;
    let mut hasher = Sha256::new();
    for part in key {
      hasher.update(part.as_bytes());
      hasher.update([0x1f]);
    }
    Some(hex::encode(hasher.finalize()))
  }
}

/// A template bound to the header of one CSV file.
pub struct Binding<'a> {
  template:  &'a Template,
  positions: Vec<Option<usize>>,
  book:      Option<usize>,
  by_key:    HashMap<String, usize>,
}

impl<'a> Binding<'a> {
  /// Locate every template column in `table`. A missing required column
  /// fails the whole job.
  pub fn new(template: &'a Template, table: &CsvTable) -> Result<Self> {
    let mut positions = Vec::with_capacity(template.columns.len());
    let mut by_key = HashMap::new();
    for col in &template.columns {
      let pos = table.column(&col.header);
      if pos.is_none() && col.required {
        return Err(Error::MissingColumn(col.header.clone()));
      }
      if let Some(p) = pos {
        by_key.insert(col.key.clone(), p);
        by_key.insert(col.header.clone(), p);
      }
      positions.push(pos);
    }
    let book_column = &template.doc.book_resolution.column;
    let book = table.column(book_column).or_else(|| by_key.get(book_column).copied());
    if book.is_none() {
      return Err(Error::MissingColumn(book_column.clone()));
    }
    Ok(Self { template, positions, book, by_key })
  }

  /// Build the staged record for `row`.
  pub fn stage(&self, row: &CsvRow) -> Result<StagedRecord> {
    let cell = |p: Option<usize>| p.and_then(|i| row.cells.get(i)).map(String::as_str);

    let mut t = Transcripcio {
      moderation_state: self.template.initial_state(),
      ..Transcripcio::default()
    };

    for (col, pos) in self.template.columns.iter().zip(&self.positions) {
      let raw = cell(*pos).unwrap_or("");
      if col.required && raw.trim().is_empty() {
        return Err(Error::RequiredValue(col.key.clone()));
      }
      for m in col.mappings_for(raw) {
        let value = apply_all(&m.transforms, Value::from_cell(raw));
        assign(&mut t, &m.target, value)?;
      }
    }

    let book_raw = cell(self.book).unwrap_or("").trim();
    if book_raw.is_empty() {
      return Err(Error::RequiredValue(self.template.doc.book_resolution.column.clone()));
    }
    let book = match self.template.doc.book_resolution.mode {
      BookMode::LlibreId => BookRef::Id(book_raw.parse().map_err(|_| Error::InvalidValue {
        target: "llibre_id".into(),
        value:  book_raw.to_owned(),
      })?),
      BookMode::Lookup => BookRef::Lookup(book_raw.to_owned()),
    };
    if let BookRef::Id(id) = book {
      t.llibre_id = id;
    }

    if t.tipus_acte.is_empty() {
      return Err(Error::RequiredValue("tipus_acte".into()));
    }
    if t.any_doc.is_none() {
      t.any_doc = t
        .data_acte_iso
        .map(|d| chrono::Datelike::year(&d))
        .or_else(|| t.data_acte_text.as_deref().and_then(year_of));
    }

    let dedup_key = self
      .template
      .dedup()
      .filter(|p| !p.key_columns.is_empty())
      .map(|p| p.key_columns.iter().map(|name| self.key_part(&t, row, name)).collect());

    Ok(StagedRecord { line: row.line, book, transcripcio: t, dedup_key })
  }

  /// A key part comes from the staged base field of that name, falling back
  /// to the raw cell of the column with that key or header.
  fn key_part(&self, t: &Transcripcio, row: &CsvRow, name: &str) -> String {
    let staged = match name.parse::<BaseField>() {
      Ok(BaseField::LlibreId) if t.llibre_id != 0 => Some(t.llibre_id.to_string()),
      Ok(BaseField::PaginaId) => t.pagina_id.map(|v| v.to_string()),
      Ok(BaseField::TipusActe) => Some(t.tipus_acte.clone()),
      Ok(BaseField::DataActeText) => t.data_acte_text.clone(),
      Ok(BaseField::DataActeIso) => t.data_acte_iso.map(|d| d.to_string()),
      Ok(BaseField::AnyDoc) => t.any_doc.map(|v| v.to_string()),
      Ok(BaseField::MunicipiId) => t.municipi_id.map(|v| v.to_string()),
      Ok(BaseField::Notes) => t.notes.clone(),
      _ => None,
    };
    staged
      .or_else(|| {
        self.by_key.get(name).and_then(|i| row.cells.get(*i)).map(|c| c.trim().to_owned())
      })
      .unwrap_or_default()
  }
}

fn invalid(target: &Target, value: &str) -> Error {
  let target = match target {
    Target::Base(f) => format!("base.{f}"),
    Target::Person { rol, field: Some(f) } => format!("person.{rol}.{f}"),
    Target::Person { rol, field: None } => format!("person.{rol}"),
    Target::Attr { clau, kind } => format!("attr.{clau}.{kind}"),
  };
  Error::InvalidValue { target, value: value.to_owned() }
}

fn parse_id(target: &Target, value: &Value) -> Result<Option<i64>> {
  match value.non_empty() {
    Some(s) => s.parse().map(Some).map_err(|_| invalid(target, &s)),
    None => Ok(None),
  }
}

fn assign(t: &mut Transcripcio, target: &Target, value: Value) -> Result<()> {
  match target {
    Target::Base(field) => assign_base(t, target, *field, value),
    Target::Person { rol, field } => assign_person(t, target, rol, *field, value),
    Target::Attr { clau, kind } => {
      let Some(text) = value.non_empty() else { return Ok(()) };
      let value = match kind {
        AttrKind::Text => AtributValue::Text(text),
        AttrKind::Num => AtributValue::Num(
          text.replace(',', ".").parse().map_err(|_| invalid(target, &text))?,
        ),
        AttrKind::Date => match parse_date(&text) {
          Some(FlexDate::Full(d)) => AtributValue::Date(d),
          _ => return Err(invalid(target, &text)),
        },
      };
      t.atributs.retain(|a| a.clau != *clau);
      t.atributs.push(TranscripcioAtribut { clau: clau.clone(), value });
      Ok(())
    }
  }
}

fn assign_base(t: &mut Transcripcio, target: &Target, field: BaseField, value: Value) -> Result<()> {
  match field {
    BaseField::LlibreId => {
      if let Some(id) = parse_id(target, &value)? {
        t.llibre_id = id;
      }
    }
    BaseField::PaginaId => t.pagina_id = parse_id(target, &value)?.or(t.pagina_id),
    BaseField::MunicipiId => t.municipi_id = parse_id(target, &value)?.or(t.municipi_id),
    BaseField::TipusActe => {
      if let Some(s) = value.non_empty() {
        t.tipus_acte = s;
      }
    }
    BaseField::DataActeText => t.data_acte_text = value.non_empty().or(t.data_acte_text.take()),
    BaseField::Notes => t.notes = value.non_empty().or(t.notes.take()),
    BaseField::DataActeIso => {
      if let Some(s) = value.non_empty() {
        match parse_date(&s) {
          Some(FlexDate::Full(d)) => t.data_acte_iso = Some(d),
          Some(FlexDate::Year(y)) => t.any_doc = t.any_doc.or(Some(y)),
          None => return Err(invalid(target, &s)),
        }
      }
    }
    BaseField::AnyDoc => {
      if let Some(s) = value.non_empty() {
        t.any_doc = Some(year_of(&s).ok_or_else(|| invalid(target, &s))?);
      }
    }
  }
  Ok(())
}

fn assign_person(
  t: &mut Transcripcio,
  target: &Target,
  rol: &str,
  field: Option<PersonField>,
  value: Value,
) -> Result<()> {
  if matches!(value, Value::Null) || (value.as_text().is_some() && value.non_empty().is_none()) {
    return Ok(());
  }

  let idx = match field {
    None => None,
    Some(_) => t.persones.iter().rposition(|p| p.rol == rol),
  };
  let idx = match idx {
    Some(i) => i,
    None => {
      t.persones.push(TranscripcioPersona { rol: rol.to_owned(), ..Default::default() });
      t.persones.len() - 1
    }
  };
  let p = &mut t.persones[idx];

  if let Value::Person(name) = value {
    p.nom = name.nom.or(p.nom.take());
    p.cognom1 = name.cognom1.or(p.cognom1.take());
    p.cognom2 = name.cognom2.or(p.cognom2.take());
    return Ok(());
  }
  let text = value.non_empty();
  match field {
    None | Some(PersonField::Nom) => p.nom = text,
    Some(PersonField::Cognom1) => p.cognom1 = text,
    Some(PersonField::Cognom2) => p.cognom2 = text,
    Some(PersonField::Sexe) => p.sexe = text,
    Some(PersonField::Edat) => p.edat = text,
    Some(PersonField::Ofici) => p.ofici = text,
    Some(PersonField::Qualitat) => {
      if let Some(s) = text {
        p.qualitat = s.to_lowercase().parse::<Qualitat>().map_err(|_| invalid(target, &s))?;
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::csv;

  fn template(extra_policies: &str) -> Template {
    Template::parse(&format!(
      r#"{{
      "version": 1,
      "kind": "transcripcions_raw",
      "book_resolution": {{ "mode": "llibre_id", "column": "llibre_id" }},
      "mapping": {{ "columns": [
        {{ "header": "llibre_id", "required": true, "map_to": [] }},
        {{ "header": "tipus_acte", "map_to": [{{ "target": "base.tipus_acte", "transform": ["trim", "lower"] }}] }},
        {{ "header": "data", "map_to": [
            {{ "target": "base.data_acte_text" }},
            {{ "target": "base.data_acte_iso", "transform": ["parse_date_flexible"] }} ] }},
        {{ "header": "batejat", "map_to": [{{ "target": "person.batejat", "transform": ["parse_person_from_nom"] }}] }},
        {{ "header": "sexe", "condition": {{ "expr": "value in [H, D]",
            "then": [{{ "target": "person.batejat.sexe" }}],
            "else": [{{ "target": "attr.sexe_original.text" }}] }} }},
        {{ "header": "pare", "map_to": [{{ "target": "person.pare", "transform": ["parse_person_from_nom"] }}] }},
        {{ "header": "foli", "map_to": [{{ "target": "attr.foli.num" }}] }}
      ]}}
      {extra_policies}
    }}"#
    ))
    .unwrap()
  }

  const CSV: &str = "llibre_id,tipus_acte,data,batejat,sexe,pare,foli\n\
                     3, Baptisme ,04/03/1850,Joan Garcia i Puig,H,Pere Garcia,\"12,5\"\n\
                     3,obit,1851,Anna Roca,?,,\n\
                     ,baptisme,,,,,\n";

  #[test]
  fn stages_base_people_and_attributes() {
    let t = template("");
    let table = csv::parse(CSV).unwrap();
    let b = Binding::new(&t, &table).unwrap();

    let r = b.stage(&table.rows[0]).unwrap();
    assert_eq!(r.book, BookRef::Id(3));
    let tx = &r.transcripcio;
    assert_eq!(tx.llibre_id, 3);
    assert_eq!(tx.tipus_acte, "baptisme");
    assert_eq!(tx.data_acte_text.as_deref(), Some("04/03/1850"));
    assert_eq!(tx.any_doc, Some(1850));
    assert_eq!(tx.persones.len(), 2);
    assert_eq!(tx.persones[0].rol, "batejat");
    assert_eq!(tx.persones[0].cognom2.as_deref(), Some("Puig"));
    assert_eq!(tx.persones[0].sexe.as_deref(), Some("H"));
    assert_eq!(tx.atributs, vec![TranscripcioAtribut {
      clau:  "foli".into(),
      value: AtributValue::Num(12.5),
    }]);
    assert!(r.dedup_key.is_none());
    assert!(r.import_key().is_none());
  }

  #[test]
  fn else_branch_and_year_only_dates() {
    let t = template("");
    let table = csv::parse(CSV).unwrap();
    let b = Binding::new(&t, &table).unwrap();

    let r = b.stage(&table.rows[1]).unwrap();
    assert_eq!(r.transcripcio.data_acte_iso, None);
    assert_eq!(r.transcripcio.any_doc, Some(1851));
    assert_eq!(r.transcripcio.persones.len(), 1);
    assert_eq!(r.transcripcio.atributs[0].value, AtributValue::Text("?".into()));
  }

  #[test]
  fn missing_book_fails_the_row() {
    let t = template("");
    let table = csv::parse(CSV).unwrap();
    let b = Binding::new(&t, &table).unwrap();
    assert!(matches!(b.stage(&table.rows[2]), Err(Error::RequiredValue(_))));
  }

  #[test]
  fn missing_required_column_fails_the_job() {
    let t = template("");
    let table = csv::parse("tipus_acte\nbaptisme\n").unwrap();
    assert!(matches!(Binding::new(&t, &table), Err(Error::MissingColumn(c)) if c == "llibre_id"));
  }

  #[test]
  fn dedup_key_uses_staged_values() {
    let t = template(
      r#", "policies": { "dedup": { "within_file": true, "key_columns": ["llibre_id", "tipus_acte"] } }"#,
    );
    let table = csv::parse("llibre_id,tipus_acte\n3,Baptisme\n3, baptisme\n3,obit\n").unwrap();
    let b = Binding::new(&t, &table).unwrap();
    let keys: Vec<_> = table.rows.iter().map(|r| b.stage(r).unwrap().import_key()).collect();
    assert!(keys[0].is_some());
    assert_eq!(keys[0], keys[1]);
    assert_ne!(keys[0], keys[2]);
    assert_eq!(
      b.stage(&table.rows[0]).unwrap().dedup_key,
      Some(vec!["3".to_owned(), "baptisme".to_owned()])
    );
  }
}
