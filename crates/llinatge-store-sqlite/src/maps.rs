//! Municipality map versions with optimistic locking.

use llinatge_core::{Error as CoreError, entity::MapVersion, store::Maps};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  Result, SqliteStore,
  encode::RawMapVersion,
  error::{invalid, not_found},
};

fn load(conn: &Connection, id: i64) -> Result<Option<MapVersion>> {
  conn
    .query_row(
      "SELECT id, municipi_id, data, lock_version, updated_by, updated_at
         FROM municipi_mapa_versions WHERE id = ?1",
      [id],
      |r| {
        Ok(RawMapVersion {
          id:           r.get(0)?,
          municipi_id:  r.get(1)?,
          data:         r.get(2)?,
          lock_version: r.get(3)?,
          updated_by:   r.get(4)?,
          updated_at:   r.get(5)?,
        })
      },
    )
    .optional()?
    .map(RawMapVersion::into_map_version)
    .transpose()
}

fn encode_data(data: &serde_json::Value) -> Result<String> {
  if !data.is_object() {
    return Err(invalid("map data must be a JSON object"));
  }
  Ok(serde_json::to_string(data)?)
}

impl Maps for SqliteStore {
  async fn create_map_version(
    &self,
    user_id: i64,
    municipi_id: i64,
    data: serde_json::Value,
  ) -> Result<MapVersion> {
    let data = encode_data(&data)?;
    self
      .write(move |conn, ctx| {
        let exists: bool = conn.query_row(
          "SELECT EXISTS (SELECT 1 FROM municipis WHERE id = ?1)",
          [municipi_id],
          |r| r.get(0),
        )?;
        if !exists {
          return Err(not_found("municipi", municipi_id));
        }
        let id: i64 = conn.query_row(
          "INSERT INTO municipi_mapa_versions (municipi_id, data, lock_version, updated_by, updated_at)
           VALUES (?1, ?2, 0, ?3, ?4) RETURNING id",
          rusqlite::params![municipi_id, data, user_id, ctx.stamp()],
          |r| r.get(0),
        )?;
        load(conn, id)?.ok_or_else(|| not_found("mapa", id))
      })
      .await
  }

  async fn get_map_version(&self, id: i64) -> Result<Option<MapVersion>> {
    self.read(move |conn, _| load(conn, id)).await
  }

  async fn save_map_version(
    &self,
    user_id: i64,
    id: i64,
    expected_lock_version: i64,
    data: serde_json::Value,
  ) -> Result<MapVersion> {
    let data = encode_data(&data)?;
    self
      .write(move |conn, ctx| {
        let updated = conn.execute(
          "UPDATE municipi_mapa_versions
              SET data = ?1, lock_version = lock_version + 1, updated_by = ?2, updated_at = ?3
            WHERE id = ?4 AND lock_version = ?5",
          rusqlite::params![data, user_id, ctx.stamp(), id, expected_lock_version],
        )?;
        if updated == 0 {
          let current = load(conn, id)?.ok_or_else(|| not_found("mapa", id))?;
          tracing::debug!(id, expected_lock_version, actual = current.lock_version, "stale map save");
          return Err(
            CoreError::Conflict { expected: expected_lock_version, actual: current.lock_version }
              .into(),
          );
        }
        load(conn, id)?.ok_or_else(|| not_found("mapa", id))
      })
      .await
  }
}
