//! The column condition DSL.
//!
//! ```text
//! value == 'A'
//! value != ''
//! value in [a, 'b c']
//! value not in [x]
//! ```
//!
//! Comparison is against the trimmed raw cell and is case-sensitive.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
  Eq(String),
  Ne(String),
  In(Vec<String>),
  NotIn(Vec<String>),
}

/// Strip matching single or double quotes from a literal.
fn literal(raw: &str) -> String {
  let s = raw.trim();
  for q in ['\'', '"'] {
    if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
      return s[1..s.len() - 1].to_owned();
    }
  }
  s.to_owned()
}

/// Split a list body on commas that are not inside quotes.
fn list(body: &str) -> Vec<String> {
  let mut items = Vec::new();
  let mut current = String::new();
  let mut quote: Option<char> = None;
  for c in body.chars() {
    match (quote, c) {
      (None, '\'' | '"') => {
        quote = Some(c);
        current.push(c);
      }
      (Some(q), c) if c == q => {
        quote = None;
        current.push(c);
      }
      (None, ',') => items.push(literal(&std::mem::take(&mut current))),
      _ => current.push(c),
    }
  }
  if !current.trim().is_empty() || !items.is_empty() {
    items.push(literal(&current));
  }
  items
}

impl Condition {
  pub fn parse(expr: &str) -> Result<Self> {
    let invalid = || Error::InvalidCondition(expr.to_owned());
    let rest = expr.trim().strip_prefix("value").ok_or_else(invalid)?.trim_start();

    if let Some(rhs) = rest.strip_prefix("==") {
      return Ok(Self::Eq(literal(rhs)));
    }
    if let Some(rhs) = rest.strip_prefix("!=") {
      return Ok(Self::Ne(literal(rhs)));
    }
    let (negated, rhs) = if let Some(rhs) = rest.strip_prefix("not in") {
      (true, rhs)
    } else if let Some(rhs) = rest.strip_prefix("in") {
      (false, rhs)
    } else {
      return Err(invalid());
    };
    let body = rhs
      .trim()
      .strip_prefix('[')
      .and_then(|s| s.strip_suffix(']'))
      .ok_or_else(invalid)?;
    let items = list(body);
    Ok(if negated { Self::NotIn(items) } else { Self::In(items) })
  }

  pub fn eval(&self, cell: &str) -> bool {
    let v = cell.trim();
    match self {
      Self::Eq(x) => v == x,
      Self::Ne(x) => v != x,
      Self::In(xs) => xs.iter().any(|x| x == v),
      Self::NotIn(xs) => !xs.iter().any(|x| x == v),
    }
  }
}
