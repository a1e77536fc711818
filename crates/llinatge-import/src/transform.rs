//! Cell transforms applied left-to-right to each `map_to` value.

use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::error::{Error, Result};

/// A person name split into its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonName {
  pub nom:     Option<String>,
  pub cognom1: Option<String>,
  pub cognom2: Option<String>,
}

/// The value flowing through a transform chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
  Null,
  Text(String),
  Person(PersonName),
}

impl Value {
  pub fn from_cell(cell: &str) -> Self { Self::Text(cell.to_owned()) }

  /// The text content, or `None` for nulls and structured values.
  pub fn as_text(&self) -> Option<&str> {
    match self {
      Self::Text(s) => Some(s),
      _ => None,
    }
  }

  /// Text with surrounding whitespace removed; blank text counts as absent.
  pub fn non_empty(&self) -> Option<String> {
    self.as_text().map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
  }

  fn map_text(self, f: impl FnOnce(String) -> Value) -> Value {
    match self {
      Self::Text(s) => f(s),
      other => other,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
  Trim,
  Lower,
  Upper,
  NullIfEmpty,
  ParsePersonFromNom,
  ParseDateFlexible,
  YearFromDate,
  StripDiacritics,
  Sexe,
  Default(String),
}

impl FromStr for Transform {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    if let Some(v) = s.strip_prefix("default:") {
      return Ok(Self::Default(v.to_owned()));
    }
    Ok(match s {
      "trim" => Self::Trim,
      "lower" => Self::Lower,
      "upper" => Self::Upper,
      "null_if_empty" => Self::NullIfEmpty,
      "parse_person_from_nom" => Self::ParsePersonFromNom,
      "parse_date_flexible" => Self::ParseDateFlexible,
      "year_from_date" => Self::YearFromDate,
      "strip_diacritics" => Self::StripDiacritics,
      "sexe" => Self::Sexe,
      other => return Err(Error::UnknownTransform(other.to_owned())),
    })
  }
}

impl Transform {
  pub fn apply(&self, value: Value) -> Value {
    match self {
      Self::Trim => value.map_text(|s| Value::Text(s.trim().to_owned())),
      Self::Lower => value.map_text(|s| Value::Text(s.to_lowercase())),
      Self::Upper => value.map_text(|s| Value::Text(s.to_uppercase())),
      Self::NullIfEmpty => value.map_text(|s| {
        if s.trim().is_empty() { Value::Null } else { Value::Text(s) }
      }),
      Self::ParsePersonFromNom => value.map_text(|s| match parse_person(&s) {
        Some(p) => Value::Person(p),
        None => Value::Null,
      }),
      Self::ParseDateFlexible => value.map_text(|s| match parse_date(&s) {
        Some(FlexDate::Full(d)) => Value::Text(d.format("%Y-%m-%d").to_string()),
        Some(FlexDate::Year(y)) => Value::Text(y.to_string()),
        None => Value::Null,
      }),
      Self::YearFromDate => value.map_text(|s| match year_of(&s) {
        Some(y) => Value::Text(y.to_string()),
        None => Value::Null,
      }),
      Self::StripDiacritics => value.map_text(|s| Value::Text(strip_diacritics(&s))),
      Self::Sexe => value.map_text(|s| match normalize_sexe(&s) {
        Some(v) => Value::Text(v.to_owned()),
        None => Value::Null,
      }),
      Self::Default(d) => match value {
        Value::Null => Value::Text(d.clone()),
        Value::Text(s) if s.trim().is_empty() => Value::Text(d.clone()),
        other => other,
      },
    }
  }
}

/// Run a chain of transforms over `value`.
pub fn apply_all(transforms: &[Transform], value: Value) -> Value {
  transforms.iter().fold(value, |v, t| t.apply(v))
}

// ─── Dates ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlexDate {
  Full(NaiveDate),
  Year(i32),
}

impl FlexDate {
  pub fn year(self) -> i32 {
    match self {
      Self::Full(d) => d.year(),
      Self::Year(y) => y,
    }
  }
}

/// Accepts `DD/MM/YYYY` (also `-` or `.` separated), `YYYY-MM-DD` and `YYYY`.
pub fn parse_date(raw: &str) -> Option<FlexDate> {
  let s = raw.trim();
  if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
    return s.parse().ok().map(FlexDate::Year);
  }
  for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"] {
    if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
      return Some(FlexDate::Full(d));
    }
  }
  None
}

/// The year of a flexible date, or the first four-digit run in free text.
pub fn year_of(raw: &str) -> Option<i32> {
  if let Some(d) = parse_date(raw) {
    return Some(d.year());
  }
  let bytes = raw.as_bytes();
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i].is_ascii_digit() {
      let start = i;
      while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
      }
      if i - start == 4 {
        return raw[start..i].parse().ok();
      }
    } else {
      i += 1;
    }
  }
  None
}

// ─── Text ────────────────────────────────────────────────────────────────────

/// Remove accents while keeping case and punctuation.
pub fn strip_diacritics(raw: &str) -> String {
  use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};
  raw.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

/// `H` for men and `D` for women; anything else is unknown.
pub fn normalize_sexe(raw: &str) -> Option<&'static str> {
  match strip_diacritics(raw.trim()).to_lowercase().as_str() {
    "h" | "home" | "m" | "masculi" | "male" | "hombre" | "v" | "varo" => Some("H"),
    "d" | "dona" | "f" | "femeni" | "female" | "mujer" => Some("D"),
    _ => None,
  }
}

// ─── Names ───────────────────────────────────────────────────────────────────

const PARTICLES: &[&str] =
  &["de", "del", "dels", "la", "les", "el", "els", "sa", "ses", "des", "van", "von", "y"];

fn is_particle(word: &str) -> bool {
  PARTICLES.contains(&word.to_lowercase().as_str())
}

/// Group surname words so that particles stick to the word that follows
/// them (`de la Serra`).
fn surname_units(words: &[&str]) -> Vec<String> {
  let mut units = Vec::new();
  let mut prefix: Vec<&str> = Vec::new();
  for w in words {
    if is_particle(w) {
      prefix.push(w);
      continue;
    }
    prefix.push(w);
    units.push(prefix.join(" "));
    prefix.clear();
  }
  if !prefix.is_empty() {
    match units.last_mut() {
      Some(last) => {
        last.push(' ');
        last.push_str(&prefix.join(" "));
      }
      None => units.push(prefix.join(" ")),
    }
  }
  units
}

fn split_surnames(words: &[&str]) -> (Option<String>, Option<String>) {
  let join = |ws: &[&str]| {
    let s = surname_units(ws).join(" ");
    if s.is_empty() { None } else { Some(s) }
  };
  if let Some(pos) = words.iter().position(|w| *w == "i") {
    if pos > 0 && pos + 1 < words.len() {
      return (join(&words[..pos]), join(&words[pos + 1..]));
    }
  }
  let units = surname_units(words);
  let mut it = units.into_iter();
  let first = it.next();
  let rest: Vec<String> = it.collect();
  (first, if rest.is_empty() { None } else { Some(rest.join(" ")) })
}

/// Split a free-text name into `nom`, `cognom1` and `cognom2`.
///
/// Accepts `Nom Cognom1 Cognom2`, `Nom Cognom1 i Cognom2` and the inverted
/// `Cognom1 Cognom2, Nom` form. The first word is taken as the given name.
pub fn parse_person(raw: &str) -> Option<PersonName> {
  let raw = raw.trim();
  if raw.is_empty() {
    return None;
  }

  if let Some((surnames, given)) = raw.split_once(',') {
    let words: Vec<&str> = surnames.split_whitespace().collect();
    let (cognom1, cognom2) = split_surnames(&words);
    let nom = Some(given.trim().to_owned()).filter(|s| !s.is_empty());
    return Some(PersonName { nom, cognom1, cognom2 });
  }

  let words: Vec<&str> = raw.split_whitespace().collect();
  let (nom, rest) = match words.split_first() {
    Some((first, rest)) => (Some((*first).to_owned()), rest),
    None => return None,
  };
  let (cognom1, cognom2) = split_surnames(rest);
  Some(PersonName { nom, cognom1, cognom2 })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn name(n: &str, c1: Option<&str>, c2: Option<&str>) -> PersonName {
    PersonName {
      nom:     Some(n.to_owned()),
      cognom1: c1.map(str::to_owned),
      cognom2: c2.map(str::to_owned),
    }
  }

  #[test]
  fn splits_simple_names() {
    assert_eq!(parse_person("Joan Garcia"), Some(name("Joan", Some("Garcia"), None)));
    assert_eq!(
      parse_person("  Maria  Puig Serra "),
      Some(name("Maria", Some("Puig"), Some("Serra")))
    );
    assert_eq!(parse_person("Pere"), Some(name("Pere", None, None)));
    assert_eq!(parse_person("   "), None);
  }

  #[test]
  fn keeps_particles_with_their_surname() {
    assert_eq!(
      parse_person("Joan de la Serra Puig"),
      Some(name("Joan", Some("de la Serra"), Some("Puig")))
    );
    assert_eq!(
      parse_person("Anna Roca i Vila"),
      Some(name("Anna", Some("Roca"), Some("Vila")))
    );
  }

  #[test]
  fn accepts_inverted_form() {
    assert_eq!(
      parse_person("Garcia Puig, Joan"),
      Some(name("Joan", Some("Garcia"), Some("Puig")))
    );
  }

  #[test]
  fn flexible_dates() {
    let d = NaiveDate::from_ymd_opt(1850, 3, 4).unwrap();
    assert_eq!(parse_date("04/03/1850"), Some(FlexDate::Full(d)));
    assert_eq!(parse_date("1850-03-04"), Some(FlexDate::Full(d)));
    assert_eq!(parse_date("1850"), Some(FlexDate::Year(1850)));
    assert_eq!(parse_date("març de 1850"), None);
    assert_eq!(year_of("4 de març de 1850"), Some(1850));
  }

  #[test]
  fn failed_date_parse_yields_null() {
    let t: Transform = "parse_date_flexible".parse().unwrap();
    assert_eq!(t.apply(Value::from_cell("no se sap")), Value::Null);
    assert_eq!(t.apply(Value::from_cell("4/3/1850")), Value::Text("1850-03-04".into()));
  }

  #[test]
  fn chains_apply_left_to_right() {
    let chain: Vec<Transform> = ["trim", "null_if_empty", "default:baptisme"]
      .iter()
      .map(|s| s.parse().unwrap())
      .collect();
    assert_eq!(apply_all(&chain, Value::from_cell("   ")), Value::Text("baptisme".into()));
    assert_eq!(apply_all(&chain, Value::from_cell(" obit ")), Value::Text("obit".into()));
  }

  #[test]
  fn text_transforms() {
    let strip: Transform = "strip_diacritics".parse().unwrap();
    assert_eq!(strip.apply(Value::from_cell("Garcés Ferrà")), Value::Text("Garces Ferra".into()));
    let sexe: Transform = "sexe".parse().unwrap();
    assert_eq!(sexe.apply(Value::from_cell("Dona")), Value::Text("D".into()));
    assert_eq!(sexe.apply(Value::from_cell("masculí")), Value::Text("H".into()));
    assert_eq!(sexe.apply(Value::from_cell("?")), Value::Null);
  }

  #[test]
  fn unknown_transform_is_rejected() {
    assert!(matches!("soundex".parse::<Transform>(), Err(Error::UnknownTransform(_))));
  }
}
