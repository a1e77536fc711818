//! Typed view over the flat `KEY → value` configuration map.
//!
//! Every tunable is read from strings with an explicit default. Keys are
//! matched case-insensitively; keys this module does not know are preserved in
//! [`Settings::extra`] for collaborators outside the core.

use std::{
  borrow::Cow,
  collections::BTreeMap,
  net::IpAddr,
  path::PathBuf,
  str::FromStr,
  time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, wiki::Guardrails};

/// The relational engine behind the store.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Dialect {
  #[default]
  Sqlite,
  #[strum(to_string = "postgres", serialize = "postgresql")]
  Postgres,
  Mysql,
}

impl Dialect {
  /// Rewrite `?` / `?N` placeholders into `$N` for PostgreSQL. Other engines
  /// get the statement back untouched. Quoted literals are left alone.
  pub fn rewrite_placeholders(self, sql: &str) -> Cow<'_, str> {
    if self != Self::Postgres || !sql.contains('?') {
      return Cow::Borrowed(sql);
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut next = 1usize;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
      match (quote, c) {
        (Some(q), c) if c == q => {
          quote = None;
          out.push(c);
        }
        (Some(_), c) => out.push(c),
        (None, '\'' | '"') => {
          quote = Some(c);
          out.push(c);
        }
        (None, '?') => {
          let mut digits = String::new();
          while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(d);
            chars.next();
          }
          out.push('$');
          if digits.is_empty() {
            out.push_str(&next.to_string());
            next += 1;
          } else {
            out.push_str(&digits);
          }
        }
        (None, c) => out.push(c),
      }
    }
    Cow::Owned(out)
  }
}

/// `LOG_LEVEL` values.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
  Debug,
  #[default]
  Info,
  Error,
  Silent,
}

impl LogLevel {
  /// The `tracing` filter directive for this level.
  pub fn directive(self) -> &'static str {
    match self {
      Self::Debug => "debug",
      Self::Info => "info",
      Self::Error => "error",
      Self::Silent => "off",
    }
  }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Settings {
  pub db_engine:               Dialect,
  pub db_path:                 PathBuf,
  pub db_host:                 Option<String>,
  pub db_port:                 Option<u16>,
  pub db_user:                 Option<String>,
  pub db_pass:                 Option<String>,
  pub db_name:                 Option<String>,
  /// `RECREADB`: drop and recreate every table on startup.
  pub recreate_db:             bool,
  pub log_level:               LogLevel,
  pub wiki_meta_max_bytes:     usize,
  pub wiki_pending_per_user:   usize,
  pub wiki_pending_per_object: usize,
  /// Tokens per second.
  pub wiki_change_rate:        f64,
  pub wiki_change_burst:       u32,
  pub wiki_mark_rate:          f64,
  pub wiki_mark_burst:         u32,
  pub mail_enabled:            bool,
  pub gedcom_root:             Option<PathBuf>,
  pub gedcom_max_upload_mb:    u64,
  pub esp_gramps_secret:       Option<String>,
  pub esp_gramps_http_timeout: Duration,
  pub blocked_ips:             Vec<IpAddr>,
  pub extra:                   BTreeMap<String, String>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      db_engine:               Dialect::Sqlite,
      db_path:                 PathBuf::from("llinatge.db"),
      db_host:                 None,
      db_port:                 None,
      db_user:                 None,
      db_pass:                 None,
      db_name:                 None,
      recreate_db:             false,
      log_level:               LogLevel::Info,
      wiki_meta_max_bytes:     50_000,
      wiki_pending_per_user:   1,
      wiki_pending_per_object: 20,
      wiki_change_rate:        0.5,
      wiki_change_burst:       10,
      wiki_mark_rate:          1.0,
      wiki_mark_burst:         20,
      mail_enabled:            false,
      gedcom_root:             None,
      gedcom_max_upload_mb:    50,
      esp_gramps_secret:       None,
      esp_gramps_http_timeout: Duration::from_secs(2),
      blocked_ips:             Vec::new(),
      extra:                   BTreeMap::new(),
    }
  }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
  value.trim().parse().map_err(|_| Error::InvalidConfig {
    key:   key.to_owned(),
    value: value.to_owned(),
  })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" | "t" => Ok(true),
    "0" | "false" | "no" | "off" | "f" | "" => Ok(false),
    _ => Err(Error::InvalidConfig { key: key.to_owned(), value: value.to_owned() }),
  }
}

fn non_empty(value: &str) -> Option<String> {
  let v = value.trim();
  (!v.is_empty()).then(|| v.to_owned())
}

impl Settings {
  /// Build settings from a flat string map, validating known keys.
  pub fn from_map<I, K, V>(map: I) -> Result<Self>
  where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let mut s = Self::default();
    for (key, value) in map {
      let key = key.as_ref().trim().to_ascii_uppercase();
      let value = value.as_ref();
      match key.as_str() {
        "DB_ENGINE" => s.db_engine = parse(&key, value)?,
        "DB_PATH" => s.db_path = PathBuf::from(value.trim()),
        "DB_HOST" => s.db_host = non_empty(value),
        "DB_PORT" => s.db_port = Some(parse(&key, value)?),
        "DB_USR" => s.db_user = non_empty(value),
        "DB_PASS" => s.db_pass = non_empty(value),
        "DB_NAME" => s.db_name = non_empty(value),
        "RECREADB" => s.recreate_db = parse_bool(&key, value)?,
        "LOG_LEVEL" => s.log_level = parse(&key, value)?,
        "WIKI_META_MAX_BYTES" => s.wiki_meta_max_bytes = parse(&key, value)?,
        "WIKI_PENDING_PER_USER" => s.wiki_pending_per_user = parse(&key, value)?,
        "WIKI_PENDING_PER_OBJECT" => {
          s.wiki_pending_per_object = parse(&key, value)?
        }
        "WIKI_CHANGE_RATE" => s.wiki_change_rate = parse(&key, value)?,
        "WIKI_CHANGE_BURST" => s.wiki_change_burst = parse(&key, value)?,
        "WIKI_MARK_RATE" => s.wiki_mark_rate = parse(&key, value)?,
        "WIKI_MARK_BURST" => s.wiki_mark_burst = parse(&key, value)?,
        "MAIL_ENABLED" => s.mail_enabled = parse_bool(&key, value)?,
        "GEDCOM_ROOT" => s.gedcom_root = non_empty(value).map(PathBuf::from),
        "GEDCOM_MAX_UPLOAD_MB" => s.gedcom_max_upload_mb = parse(&key, value)?,
        "ESP_GRAMPS_SECRET" => s.esp_gramps_secret = non_empty(value),
        "ESP_GRAMPS_HTTP_TIMEOUT_SECONDS" => {
          s.esp_gramps_http_timeout = Duration::from_secs(parse(&key, value)?)
        }
        "BLOCKED_IPS" => {
          s.blocked_ips = value
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(|ip| parse(&key, ip))
            .collect::<Result<_>>()?
        }
        _ => {
          s.extra.insert(key, value.to_owned());
        }
      }
    }
    if s.wiki_change_rate < 0.0 || s.wiki_mark_rate < 0.0 {
      return Err(Error::InvalidConfig {
        key:   "WIKI_*_RATE".into(),
        value: "negative".into(),
      });
    }
    Ok(s)
  }

  pub fn guardrails(&self) -> Guardrails {
    Guardrails {
      meta_max_bytes:     self.wiki_meta_max_bytes,
      pending_per_user:   self.wiki_pending_per_user,
      pending_per_object: self.wiki_pending_per_object,
    }
  }

  pub fn is_blocked(&self, ip: IpAddr) -> bool { self.blocked_ips.contains(&ip) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_apply_for_missing_keys() {
    let s = Settings::from_map(Vec::<(String, String)>::new()).unwrap();
    assert_eq!(s.wiki_meta_max_bytes, 50_000);
    assert_eq!(s.db_engine, Dialect::Sqlite);
    assert_eq!(s.esp_gramps_http_timeout, Duration::from_secs(2));
    assert!(!s.recreate_db);
  }

  #[test]
  fn keys_are_case_insensitive_and_unknown_keys_pass_through() {
    let s = Settings::from_map([
      ("db_engine", "PostgreSQL"),
      ("recreadb", "true"),
      ("log_level", "silent"),
      ("CUSTOM_THING", "42"),
    ])
    .unwrap();
    assert_eq!(s.db_engine, Dialect::Postgres);
    assert!(s.recreate_db);
    assert_eq!(s.log_level.directive(), "off");
    assert_eq!(s.extra.get("CUSTOM_THING").map(String::as_str), Some("42"));
  }

  #[test]
  fn malformed_values_name_their_key() {
    let err = Settings::from_map([("WIKI_PENDING_PER_USER", "many")]).unwrap_err();
    assert!(err.to_string().contains("WIKI_PENDING_PER_USER"));
  }

  #[test]
  fn postgres_placeholders_are_numbered_outside_literals() {
    let sql = "SELECT * FROM t WHERE a = ? AND b = '?' AND c = ?3 AND d = ?";
    assert_eq!(
      Dialect::Postgres.rewrite_placeholders(sql),
      "SELECT * FROM t WHERE a = $1 AND b = '?' AND c = $3 AND d = $2"
    );
    assert_eq!(Dialect::Sqlite.rewrite_placeholders(sql), sql);
  }

  #[test]
  fn blocked_ips_parse() {
    let s = Settings::from_map([("BLOCKED_IPS", "10.0.0.1, ::1,")]).unwrap();
    assert!(s.is_blocked("10.0.0.1".parse().unwrap()));
    assert!(s.is_blocked("::1".parse().unwrap()));
    assert!(!s.is_blocked("10.0.0.2".parse().unwrap()));
  }
}
