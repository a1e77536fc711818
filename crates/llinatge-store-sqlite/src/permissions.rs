//! Permission resolver and policy administration.
//!
//! The resolver loads a user's grant set (memoised per
//! `permissions_version`), expands the target's ancestry from the catalogue
//! and defers the matching itself to [`GrantSet::allows`]. Every
//! administrative write bumps the version of each user it can affect, inside
//! the same transaction.

use std::sync::Arc;

use llinatge_core::{
  account::Policy,
  entity::ObjectType,
  permission::{ADMIN_POLICY, Ancestry, Grant, GrantSet, PermissionTarget, ScopeType},
  store::Permissions,
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  Result, SqliteStore,
  encode::{decode_enum, encode_enum},
  error::not_found,
};

/// Policies reachable by a user, directly or through a group.
const USER_POLICIES: &str = "
  SELECT politica_id FROM usuari_politiques WHERE user_id = ?1
  UNION
  SELECT gp.politica_id FROM grup_politiques gp
    JOIN grup_membres m ON m.grup_id = gp.grup_id
   WHERE m.user_id = ?1";

// ─── Loading ─────────────────────────────────────────────────────────────────

fn permissions_version(conn: &Connection, user_id: i64) -> Result<Option<i64>> {
  Ok(
    conn
      .query_row(
        "SELECT permissions_version FROM usuaris WHERE id = ?1",
        [user_id],
        |r| r.get(0),
      )
      .optional()?,
  )
}

fn grant_set(conn: &Connection, user_id: i64) -> Result<GrantSet> {
  let is_admin: bool = conn.query_row(
    &format!(
      "SELECT EXISTS (SELECT 1 FROM politiques WHERE nom = ?2 AND id IN ({USER_POLICIES}))"
    ),
    rusqlite::params![user_id, ADMIN_POLICY],
    |r| r.get(0),
  )?;
  let raw: Vec<(String, String, Option<i64>, bool)> = conn
    .prepare(&format!(
      "SELECT perm_key, scope_type, scope_id, include_children
         FROM politica_grants WHERE politica_id IN ({USER_POLICIES})
        ORDER BY id"
    ))?
    .query_map([user_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
    .collect::<rusqlite::Result<_>>()?;
  let grants = raw
    .into_iter()
    .map(|(perm_key, scope_type, scope_id, include_children)| {
      Ok(Grant {
        perm_key,
        scope_type: decode_enum(&scope_type, "scope type")?,
        scope_id,
        include_children,
      })
    })
    .collect::<Result<Vec<_>>>()?;
  Ok(GrantSet { is_admin, grants })
}

fn push_unique(v: &mut Vec<i64>, id: Option<i64>) {
  if let Some(id) = id
    && !v.contains(&id)
  {
    v.push(id);
  }
}

fn municipi_ancestry(conn: &Connection, municipi_id: i64, out: &mut Ancestry) -> Result<()> {
  let rows: Vec<(String, i64)> = conn
    .prepare_cached(
      "SELECT ancestor_type, ancestor_id FROM admin_closure WHERE municipi_id = ?1",
    )?
    .query_map([municipi_id], |r| Ok((r.get(0)?, r.get(1)?)))?
    .collect::<rusqlite::Result<_>>()?;
  for (level, id) in rows {
    match level.as_str() {
      "nivell_admin" => push_unique(&mut out.nivell_ids, Some(id)),
      "pais" => push_unique(&mut out.pais_ids, Some(id)),
      _ => {}
    }
  }
  let comarca: Option<Option<i64>> = conn
    .query_row("SELECT comarca_id FROM municipis WHERE id = ?1", [municipi_id], |r| r.get(0))
    .optional()?;
  push_unique(&mut out.comarca_ids, comarca.flatten());
  Ok(())
}

/// Walk a nivell's parents (bounded) and collect their países.
fn nivell_ancestry(conn: &Connection, nivell_id: i64, out: &mut Ancestry) -> Result<()> {
  let mut next = Some(nivell_id);
  for _ in 0..16 {
    let Some(id) = next else { break };
    let row: Option<(Option<i64>, Option<i64>)> = conn
      .query_row(
        "SELECT pais_id, parent_id FROM nivells_administratius WHERE id = ?1",
        [id],
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?;
    let Some((pais, parent)) = row else { break };
    push_unique(&mut out.pais_ids, pais);
    if let Some(parent) = parent {
      if out.nivell_ids.contains(&parent) {
        break;
      }
      out.nivell_ids.push(parent);
    }
    next = parent;
  }
  Ok(())
}

/// Expand a target into the ancestors the pure matcher needs.
fn ancestry(conn: &Connection, target: &PermissionTarget) -> Result<Ancestry> {
  let mut out = Ancestry::default();

  let mut llibre = target.llibre_id;
  if let Some(pagina) = target.pagina_id {
    let owner: Option<i64> = conn
      .query_row("SELECT llibre_id FROM pagines WHERE id = ?1", [pagina], |r| r.get(0))
      .optional()?;
    llibre = llibre.or(owner);
  }
  let mut municipis = Vec::new();
  push_unique(&mut municipis, target.municipi_id);
  if let Some(llibre) = llibre {
    let row: Option<(Option<i64>, Option<i64>)> = conn
      .query_row(
        "SELECT arxiu_id, municipi_id FROM llibres WHERE id = ?1",
        [llibre],
        |r| Ok((r.get(0)?, r.get(1)?)),
      )
      .optional()?;
    if let Some((arxiu, municipi)) = row {
      push_unique(&mut out.arxiu_ids, arxiu);
      push_unique(&mut municipis, municipi);
    }
  }
  for m in municipis {
    municipi_ancestry(conn, m, &mut out)?;
  }
  let nivells: Vec<i64> = target.nivell_admin_id.into_iter().chain(out.nivell_ids.clone()).collect();
  for n in nivells {
    nivell_ancestry(conn, n, &mut out)?;
  }
  Ok(out)
}

/// The permission target an entity is checked against.
pub(crate) fn target_of(
  conn: &Connection,
  object_type: ObjectType,
  id: i64,
) -> Result<PermissionTarget> {
  let column = |sql: &str| -> Result<Option<i64>> {
    Ok(conn.query_row(sql, [id], |r| r.get::<_, Option<i64>>(0)).optional()?.flatten())
  };
  let target = match object_type {
    ObjectType::Municipi => PermissionTarget::municipi(id),
    ObjectType::Pais => PermissionTarget { pais_id: Some(id), ..Default::default() },
    ObjectType::NivellAdmin => {
      PermissionTarget { nivell_admin_id: Some(id), ..Default::default() }
    }
    ObjectType::Arxiu => PermissionTarget::arxiu(id),
    ObjectType::Llibre => PermissionTarget::llibre(id),
    ObjectType::Pagina => PermissionTarget { pagina_id: Some(id), ..Default::default() },
    ObjectType::Persona => PermissionTarget {
      municipi_id: column("SELECT municipi_id FROM persones WHERE id = ?1")?,
      ..Default::default()
    },
    ObjectType::Esdeveniment => PermissionTarget {
      municipi_id: column("SELECT municipi_id FROM esdeveniments WHERE id = ?1")?,
      ..Default::default()
    },
    ObjectType::Transcripcio => PermissionTarget {
      llibre_id: column("SELECT llibre_id FROM transcripcions_raw WHERE id = ?1")?,
      pagina_id: column("SELECT pagina_id FROM transcripcions_raw WHERE id = ?1")?,
      municipi_id: column("SELECT municipi_id FROM transcripcions_raw WHERE id = ?1")?,
      ..Default::default()
    },
    ObjectType::Cognom | ObjectType::EntitatEclesiastica => PermissionTarget::global(),
  };
  Ok(target)
}

// ─── Version bumps ───────────────────────────────────────────────────────────

fn bump_user(conn: &Connection, user_id: i64) -> Result<()> {
  conn.execute(
    "UPDATE usuaris SET permissions_version = permissions_version + 1 WHERE id = ?1",
    [user_id],
  )?;
  Ok(())
}

/// Every user holding `policy_id`, directly or through a group.
fn bump_policy_holders(conn: &Connection, policy_id: i64) -> Result<usize> {
  Ok(conn.execute(
    "UPDATE usuaris SET permissions_version = permissions_version + 1
      WHERE id IN (
        SELECT user_id FROM usuari_politiques WHERE politica_id = ?1
        UNION
        SELECT m.user_id FROM grup_membres m
          JOIN grup_politiques gp ON gp.grup_id = m.grup_id
         WHERE gp.politica_id = ?1)",
    [policy_id],
  )?)
}

fn bump_group_members(conn: &Connection, group_id: i64) -> Result<usize> {
  Ok(conn.execute(
    "UPDATE usuaris SET permissions_version = permissions_version + 1
      WHERE id IN (SELECT user_id FROM grup_membres WHERE grup_id = ?1)",
    [group_id],
  )?)
}

fn require_policy(conn: &Connection, policy_id: i64) -> Result<()> {
  let found: Option<i64> = conn
    .query_row("SELECT id FROM politiques WHERE id = ?1", [policy_id], |r| r.get(0))
    .optional()?;
  found.map(|_| ()).ok_or_else(|| not_found("politica", policy_id))
}

// ─── Resolver ────────────────────────────────────────────────────────────────

impl SqliteStore {
  /// The fallible half of [`Permissions::has_permission`].
  pub(crate) async fn check_permission(
    &self,
    user_id: i64,
    perm_key: &str,
    target: &PermissionTarget,
  ) -> Result<bool> {
    let probe = target.clone();
    let (version, ancestry) = self
      .read(move |conn, _| Ok((permissions_version(conn, user_id)?, ancestry(conn, &probe)?)))
      .await?;
    let Some(version) = version else {
      return Ok(false);
    };
    let set = match self.services.grants.get(user_id, version) {
      Some(set) => set,
      None => {
        let set = Arc::new(self.read(move |conn, _| grant_set(conn, user_id)).await?);
        self.services.grants.put(user_id, version, Arc::clone(&set));
        set
      }
    };
    Ok(set.allows(perm_key, target, &ancestry))
  }

  /// Whether `user_id` holds `perm_key` on the entity. Id zero stands for a
  /// row that does not exist yet and is checked against global grants.
  pub(crate) async fn holds(
    &self,
    user_id: i64,
    perm_key: &str,
    object_type: ObjectType,
    id: i64,
  ) -> Result<bool> {
    let target = if id == 0 {
      PermissionTarget::global()
    } else {
      self.read(move |conn, _| target_of(conn, object_type, id)).await?
    };
    Ok(self.has_permission(user_id, perm_key, &target).await)
  }

  /// `Forbidden` unless `user_id` holds `perm_key` on the entity.
  pub(crate) async fn require_permission(
    &self,
    user_id: i64,
    perm_key: &str,
    object_type: ObjectType,
    id: i64,
  ) -> Result<()> {
    if self.holds(user_id, perm_key, object_type, id).await? {
      Ok(())
    } else {
      Err(crate::error::forbidden(format!("{perm_key} on {object_type} {id}")))
    }
  }
}

impl Permissions for SqliteStore {
  async fn has_permission<'a>(
    &'a self,
    user_id: i64,
    perm_key: &'a str,
    target: &'a PermissionTarget,
  ) -> bool {
    match self.check_permission(user_id, perm_key, target).await {
      Ok(allowed) => allowed,
      Err(e) => {
        tracing::warn!(user_id, perm_key, error = %e, "permission check failed; denying");
        false
      }
    }
  }

  async fn create_policy(&self, nom: String) -> Result<i64> {
    self
      .write(move |conn, _| {
        Ok(conn.query_row(
          "INSERT INTO politiques (nom) VALUES (?1) RETURNING id",
          [nom],
          |r| r.get(0),
        )?)
      })
      .await
  }

  async fn policy_by_name(&self, nom: String) -> Result<Option<Policy>> {
    self
      .read(move |conn, _| {
        Ok(
          conn
            .query_row("SELECT id, nom FROM politiques WHERE nom = ?1", [nom], |r| {
              Ok(Policy { id: r.get(0)?, nom: r.get(1)? })
            })
            .optional()?,
        )
      })
      .await
  }

  async fn add_grant(&self, policy_id: i64, grant: Grant) -> Result<i64> {
    if grant.scope_type != ScopeType::Global && grant.scope_id.is_none() {
      return Err(crate::error::invalid("a scoped grant needs a scope id"));
    }
    self
      .write(move |conn, _| {
        require_policy(conn, policy_id)?;
        let id: i64 = conn.query_row(
          "INSERT INTO politica_grants (politica_id, perm_key, scope_type, scope_id, include_children)
           VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
          rusqlite::params![
            policy_id,
            grant.perm_key,
            encode_enum(grant.scope_type),
            grant.scope_id,
            grant.include_children
          ],
          |r| r.get(0),
        )?;
        let users = bump_policy_holders(conn, policy_id)?;
        tracing::info!(policy_id, grant_id = id, users, "grant added");
        Ok(id)
      })
      .await
  }

  async fn remove_grant(&self, grant_id: i64) -> Result<()> {
    self
      .write(move |conn, _| {
        let policy: Option<i64> = conn
          .query_row(
            "DELETE FROM politica_grants WHERE id = ?1 RETURNING politica_id",
            [grant_id],
            |r| r.get(0),
          )
          .optional()?;
        let policy = policy.ok_or_else(|| not_found("grant", grant_id))?;
        bump_policy_holders(conn, policy)?;
        Ok(())
      })
      .await
  }

  async fn assign_policy_to_user(&self, policy_id: i64, user_id: i64) -> Result<()> {
    self
      .write(move |conn, _| {
        require_policy(conn, policy_id)?;
        conn.execute(
          "INSERT OR IGNORE INTO usuari_politiques (user_id, politica_id) VALUES (?1, ?2)",
          [user_id, policy_id],
        )?;
        bump_user(conn, user_id)
      })
      .await
  }

  async fn revoke_policy_from_user(&self, policy_id: i64, user_id: i64) -> Result<()> {
    self
      .write(move |conn, _| {
        conn.execute(
          "DELETE FROM usuari_politiques WHERE user_id = ?1 AND politica_id = ?2",
          [user_id, policy_id],
        )?;
        bump_user(conn, user_id)
      })
      .await
  }

  async fn assign_policy_to_group(&self, policy_id: i64, group_id: i64) -> Result<()> {
    self
      .write(move |conn, _| {
        require_policy(conn, policy_id)?;
        conn.execute(
          "INSERT OR IGNORE INTO grup_politiques (grup_id, politica_id) VALUES (?1, ?2)",
          [group_id, policy_id],
        )?;
        bump_group_members(conn, group_id)?;
        Ok(())
      })
      .await
  }

  async fn create_group(&self, nom: String) -> Result<i64> {
    self
      .write(move |conn, _| {
        Ok(conn.query_row("INSERT INTO grups (nom) VALUES (?1) RETURNING id", [nom], |r| {
          r.get(0)
        })?)
      })
      .await
  }

  async fn add_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
    self
      .write(move |conn, _| {
        conn.execute(
          "INSERT OR IGNORE INTO grup_membres (grup_id, user_id) VALUES (?1, ?2)",
          [group_id, user_id],
        )?;
        bump_user(conn, user_id)
      })
      .await
  }

  async fn remove_group_member(&self, group_id: i64, user_id: i64) -> Result<()> {
    self
      .write(move |conn, _| {
        conn.execute(
          "DELETE FROM grup_membres WHERE grup_id = ?1 AND user_id = ?2",
          [group_id, user_id],
        )?;
        bump_user(conn, user_id)
      })
      .await
  }
}
