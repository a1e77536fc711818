//! Users, activation tokens, sessions and the points ledger.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use chrono::Duration;
use llinatge_core::{
  account::{ACTIVATION_TTL_HOURS, ActivityEvent, NewUser, User},
  store::Accounts,
};
use rand_core::{OsRng, RngCore as _};
use rusqlite::{Connection, OptionalExtension as _};
use sha2::{Digest, Sha256};

use crate::{
  Result, SqliteStore,
  encode::{RawActivity, RawUser, USER_COLUMNS, decode_dt, encode_dt},
  error::{invalid, not_found},
};

/// Hash `password` into an argon2 PHC string.
pub fn hash_password(password: &str) -> Result<String> {
  let salt = SaltString::generate(&mut OsRng);
  Ok(Argon2::default().hash_password(password.as_bytes(), &salt)?.to_string())
}

fn password_matches(password: &str, phc: &str) -> bool {
  PasswordHash::new(phc)
    .is_ok_and(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

/// Sessions are looked up by the digest of their token, never the token.
fn token_digest(token: &str) -> String { hex::encode(Sha256::digest(token.as_bytes())) }

fn load_user(conn: &Connection, id: i64) -> Result<Option<User>> {
  conn
    .query_row(
      &format!("SELECT {USER_COLUMNS} FROM usuaris WHERE id = ?1"),
      [id],
      RawUser::from_row,
    )
    .optional()?
    .map(RawUser::into_user)
    .transpose()
}

impl Accounts for SqliteStore {
  async fn create_user(&self, usuari: String, email: String, password: String) -> Result<NewUser> {
    let usuari = usuari.trim().to_owned();
    let email = email.trim().to_lowercase();
    if usuari.is_empty() || !email.contains('@') {
      return Err(invalid("a user needs a handle and an email address"));
    }
    if password.is_empty() {
      return Err(invalid("empty password"));
    }
    let password_hash = hash_password(&password)?;
    let token = uuid::Uuid::new_v4().to_string();
    let activation_token = token.clone();
    let user = self
      .write(move |conn, ctx| {
        let taken: bool = conn.query_row(
          "SELECT EXISTS (SELECT 1 FROM usuaris WHERE usuari = ?1 OR email = ?2)",
          [&usuari, &email],
          |r| r.get(0),
        )?;
        if taken {
          return Err(invalid("that handle or email is already registered"));
        }
        let expires = encode_dt(ctx.now + Duration::hours(ACTIVATION_TTL_HOURS));
        let id: i64 = conn.query_row(
          "INSERT INTO usuaris (usuari, email, password_hash, actiu, token_activacio, token_expira, created_at)
           VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6) RETURNING id",
          rusqlite::params![usuari, email, password_hash, token, expires, ctx.stamp()],
          |r| r.get(0),
        )?;
        load_user(conn, id)?.ok_or_else(|| not_found("usuari", id))
      })
      .await?;
    tracing::info!(user_id = user.id, usuari = %user.usuari, "user registered");
    Ok(NewUser { user, activation_token })
  }

  async fn activate_user(&self, token: String) -> Result<User> {
    self
      .write(move |conn, ctx| {
        let row: Option<(i64, Option<String>)> = conn
          .query_row(
            "SELECT id, token_expira FROM usuaris WHERE token_activacio = ?1",
            [&token],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?;
        let Some((id, expires)) = row else {
          return Err(not_found("activation token", 0));
        };
        if let Some(expires) = expires
          && decode_dt(&expires)? < ctx.now
        {
          return Err(invalid("the activation link has expired"));
        }
        conn.execute(
          "UPDATE usuaris SET actiu = 1, token_activacio = NULL, token_expira = NULL WHERE id = ?1",
          [id],
        )?;
        tracing::info!(user_id = id, "user activated");
        load_user(conn, id)?.ok_or_else(|| not_found("usuari", id))
      })
      .await
  }

  async fn get_user(&self, id: i64) -> Result<Option<User>> {
    self.read(move |conn, _| load_user(conn, id)).await
  }

  async fn verify_password(&self, login: String, password: String) -> Result<Option<i64>> {
    let login = login.trim().to_owned();
    let row: Option<(i64, String)> = self
      .read(move |conn, _| {
        Ok(
          conn
            .query_row(
              "SELECT id, password_hash FROM usuaris
                WHERE (usuari = ?1 OR email = lower(?1)) AND actiu = 1",
              [&login],
              |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;
    Ok(row.and_then(|(id, phc)| password_matches(&password, &phc).then_some(id)))
  }

  async fn create_session(&self, user_id: i64, ttl: Duration) -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let digest = token_digest(&token);
    self
      .write(move |conn, ctx| {
        load_user(conn, user_id)?.ok_or_else(|| not_found("usuari", user_id))?;
        conn.execute(
          "INSERT INTO sessions (token_hash, user_id, expires_at, created_at) VALUES (?1, ?2, ?3, ?4)",
          rusqlite::params![digest, user_id, encode_dt(ctx.now + ttl), ctx.stamp()],
        )?;
        Ok(())
      })
      .await?;
    Ok(token)
  }

  async fn resolve_session(&self, token: String) -> Result<Option<i64>> {
    let digest = token_digest(&token);
    self
      .read(move |conn, ctx| {
        let row: Option<(i64, String, bool)> = conn
          .query_row(
            "SELECT user_id, expires_at, revoked FROM sessions WHERE token_hash = ?1",
            [&digest],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
          )
          .optional()?;
        let Some((user_id, expires, revoked)) = row else {
          return Ok(None);
        };
        Ok((!revoked && decode_dt(&expires)? > ctx.now).then_some(user_id))
      })
      .await
  }

  async fn revoke_session(&self, token: String) -> Result<()> {
    let digest = token_digest(&token);
    self
      .write(move |conn, _| {
        conn.execute("UPDATE sessions SET revoked = 1 WHERE token_hash = ?1", [&digest])?;
        Ok(())
      })
      .await
  }

  async fn user_points(&self, user_id: i64) -> Result<i64> {
    self
      .read(move |conn, _| {
        Ok(
          conn
            .query_row("SELECT punts FROM punts_usuari WHERE user_id = ?1", [user_id], |r| {
              r.get(0)
            })
            .optional()?
            .unwrap_or(0),
        )
      })
      .await
  }

  async fn activity_for(&self, user_id: i64, limit: usize) -> Result<Vec<ActivityEvent>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    self
      .read(move |conn, _| {
        let raw = conn
          .prepare(
            "SELECT id, user_id, action, object_type, object_id, state, points, created_at
               FROM activitat WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
          )?
          .query_map([user_id, limit], |r| {
            Ok(RawActivity {
              id:          r.get(0)?,
              user_id:     r.get(1)?,
              action:      r.get(2)?,
              object_type: r.get(3)?,
              object_id:   r.get(4)?,
              state:       r.get(5)?,
              points:      r.get(6)?,
              created_at:  r.get(7)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawActivity::into_event).collect()
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hashes_verify_and_differ_per_salt() {
    let a = hash_password("secret").unwrap();
    let b = hash_password("secret").unwrap();
    assert_ne!(a, b);
    assert!(password_matches("secret", &a));
    assert!(!password_matches("other", &a));
    assert!(!password_matches("secret", "not a phc string"));
  }

  #[test]
  fn token_digest_is_hex_sha256() {
    let d = token_digest("abc");
    assert_eq!(d.len(), 64);
    assert!(d.starts_with("ba7816bf"));
  }
}
