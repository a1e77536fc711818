//! Wire-level value coercions.
//!
//! Engines disagree on how booleans and timestamps come back: integers,
//! `t`/`f` strings, byte slices, RFC 3339 or space-separated datetimes. These
//! helpers accept all of them and normalise on read.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::types::ValueRef;

use crate::{Error, Result};

fn bool_from_str(s: &str) -> Option<bool> {
  match s.trim().to_ascii_lowercase().as_str() {
    "1" | "t" | "true" | "y" | "yes" | "on" => Some(true),
    "0" | "f" | "false" | "n" | "no" | "off" | "" => Some(false),
    _ => None,
  }
}

pub(crate) fn to_bool(v: ValueRef<'_>) -> Result<bool> {
  match v {
    ValueRef::Null => Ok(false),
    ValueRef::Integer(i) => Ok(i != 0),
    ValueRef::Real(f) => Ok(f != 0.0),
    ValueRef::Text(b) | ValueRef::Blob(b) => {
      let s = String::from_utf8_lossy(b);
      bool_from_str(&s).ok_or_else(|| Error::Decode(format!("not a boolean: {s:?}")))
    }
  }
}

/// Boolean from a JSON value supplied by a caller.
pub(crate) fn json_bool(v: &serde_json::Value) -> Option<bool> {
  match v {
    serde_json::Value::Bool(b) => Some(*b),
    serde_json::Value::Number(n) => n.as_i64().map(|i| i != 0),
    serde_json::Value::String(s) => bool_from_str(s),
    _ => None,
  }
}

pub(crate) fn to_datetime(raw: &str) -> Result<DateTime<Utc>> {
  let s = raw.trim();
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Ok(dt.with_timezone(&Utc));
  }
  for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
      return Ok(ndt.and_utc());
    }
  }
  if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
    if let Some(ndt) = d.and_hms_opt(0, 0, 0) {
      return Ok(ndt.and_utc());
    }
  }
  Err(Error::Decode(format!("not a datetime: {s:?}")))
}

/// A calendar date, accepting a full datetime as well.
pub(crate) fn to_date(raw: &str) -> Result<NaiveDate> {
  if let Ok(d) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
    return Ok(d);
  }
  to_datetime(raw)
    .map(|dt| dt.date_naive())
    .map_err(|_| Error::Decode(format!("not a date: {raw:?}")))
}

#[cfg(test)]
mod tests {
  use chrono::{Datelike, Timelike};

  use super::*;

  #[test]
  fn booleans_in_every_wire_form() {
    assert!(to_bool(ValueRef::Integer(1)).unwrap());
    assert!(!to_bool(ValueRef::Integer(0)).unwrap());
    assert!(to_bool(ValueRef::Text(b"t")).unwrap());
    assert!(!to_bool(ValueRef::Text(b"f")).unwrap());
    assert!(to_bool(ValueRef::Blob(b"true")).unwrap());
    assert!(!to_bool(ValueRef::Null).unwrap());
    assert!(to_bool(ValueRef::Text(b"maybe")).is_err());
    assert_eq!(json_bool(&serde_json::json!("yes")), Some(true));
    assert_eq!(json_bool(&serde_json::json!(0)), Some(false));
  }

  #[test]
  fn datetimes_in_every_wire_form() {
    for raw in [
      "2024-05-06T07:08:09Z",
      "2024-05-06T09:08:09+02:00",
      "2024-05-06 07:08:09",
      "2024-05-06T07:08:09",
    ] {
      let dt = to_datetime(raw).unwrap();
      assert_eq!((dt.hour(), dt.minute(), dt.second()), (7, 8, 9), "{raw}");
    }
    assert_eq!(to_datetime("2024-05-06").unwrap().day(), 6);
    assert!(to_datetime("yesterday").is_err());
    assert_eq!(to_date("2024-05-06 07:08:09").unwrap().month(), 5);
  }
}
