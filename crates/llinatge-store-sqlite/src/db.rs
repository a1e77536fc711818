//! Thin helpers over `rusqlite` shared by every component module.
//!
//! Component code is written as plain synchronous functions over a
//! [`rusqlite::Connection`] (a [`rusqlite::Transaction`] derefs to one) so a
//! whole operation can run inside a single `tokio_rusqlite` call. The async
//! trait impls only marshal arguments into [`SqliteStore::write`] or
//! [`SqliteStore::read`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use llinatge_core::config::Dialect;
use rusqlite::{Connection, TransactionBehavior, types::Value};

use crate::{Error, Result, SqliteStore, encode::encode_dt};

/// Per-call context copied into the connection thread.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ctx {
  pub dialect: Dialect,
  pub now:     DateTime<Utc>,
  /// Upper bound for counted years.
  pub year:    i32,
}

impl Ctx {
  pub fn stamp(&self) -> String { encode_dt(self.now) }
}

/// A generic result row keyed by column name.
pub(crate) type Row = BTreeMap<String, Value>;

/// Run `sql` with positional `params` and collect every row by column name.
///
/// Placeholders are written `?`; the dialect rewrites them where needed.
pub(crate) fn query_rows(
  conn: &Connection,
  ctx: &Ctx,
  sql: &str,
  params: &[Value],
) -> Result<Vec<Row>> {
  let sql = ctx.dialect.rewrite_placeholders(sql);
  let mut stmt = conn.prepare(&sql)?;
  let names: Vec<String> =
    stmt.column_names().into_iter().map(str::to_owned).collect();
  let rows = stmt
    .query_map(rusqlite::params_from_iter(params.iter()), |r| {
      let mut row = Row::new();
      for (i, name) in names.iter().enumerate() {
        row.insert(name.clone(), r.get::<_, Value>(i)?);
      }
      Ok(row)
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

/// Execute a statement built at runtime; returns the affected row count.
pub(crate) fn exec(
  conn: &Connection,
  ctx: &Ctx,
  sql: &str,
  params: &[Value],
) -> Result<usize> {
  let sql = ctx.dialect.rewrite_placeholders(sql);
  Ok(conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?)
}

/// Execute an `INSERT ... RETURNING id` and hand back the new id.
pub(crate) fn insert_returning_id(
  conn: &Connection,
  ctx: &Ctx,
  sql: &str,
  params: &[Value],
) -> Result<i64> {
  let sql = ctx.dialect.rewrite_placeholders(sql);
  Ok(conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |r| {
    r.get(0)
  })?)
}

pub(crate) fn int(row: &Row, col: &str) -> Option<i64> {
  match row.get(col) {
    Some(Value::Integer(i)) => Some(*i),
    Some(Value::Real(f)) => Some(*f as i64),
    Some(Value::Text(s)) => s.trim().parse().ok(),
    _ => None,
  }
}

pub(crate) fn text(row: &Row, col: &str) -> Option<String> {
  match row.get(col) {
    Some(Value::Text(s)) => Some(s.clone()),
    Some(Value::Integer(i)) => Some(i.to_string()),
    Some(Value::Real(f)) => Some(f.to_string()),
    _ => None,
  }
}

pub(crate) fn opt_int(v: Option<i64>) -> Value { v.map_or(Value::Null, Value::Integer) }

// ─── Transactions ────────────────────────────────────────────────────────────

impl SqliteStore {
  pub(crate) fn ctx(&self) -> Ctx {
    let now = self.services.now();
    Ctx {
      dialect: self.dialect,
      now,
      year: self.services.clock.current_year(),
    }
  }

  /// Run `f` inside one immediate transaction; commit on `Ok`, roll back on
  /// `Err`.
  pub(crate) async fn write<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Connection, &Ctx) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let ctx = self.ctx();
    self
      .conn
      .call(move |conn| {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
          Ok(tx) => tx,
          Err(e) => return Ok(Err(Error::from(e))),
        };
        let out = f(&*tx, &ctx);
        Ok(match out {
          Ok(v) => tx.commit().map(|()| v).map_err(Error::from),
          Err(e) => Err(e),
        })
      })
      .await?
  }

  /// Run `f` against the connection without opening a transaction.
  pub(crate) async fn read<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Connection, &Ctx) -> Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let ctx = self.ctx();
    self.conn.call(move |conn| Ok(f(conn, &ctx))).await?
  }
}
