//! Policy-based permission matching.
//!
//! Users receive policies directly or through their groups; each policy holds
//! grants of the form `(perm_key, scope_type, scope_id, include_children)`.
//! This module is the pure half of the resolver: the store loads a user's
//! [`GrantSet`] and the target's [`Ancestry`], then asks [`GrantSet::allows`].

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

/// Holders of this policy pass every check.
pub const ADMIN_POLICY: &str = "admin";

/// Capability that lets an actor skip the review queue.
pub const MODERATION_BYPASS: &str = "wiki.bypass";

/// Capability required to approve or reject changes.
pub const MODERATION_DECIDE: &str = "wiki.moderate";

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScopeType {
  Global,
  Arxiu,
  Pais,
  NivellAdmin,
  Comarca,
  Municipi,
}

/// A single capability attached to a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
  pub perm_key:         String,
  pub scope_type:       ScopeType,
  /// `None` only for [`ScopeType::Global`].
  pub scope_id:         Option<i64>,
  pub include_children: bool,
}

impl Grant {
  pub fn global(perm_key: impl Into<String>) -> Self {
    Self {
      perm_key:         perm_key.into(),
      scope_type:       ScopeType::Global,
      scope_id:         None,
      include_children: false,
    }
  }

  pub fn scoped(
    perm_key: impl Into<String>,
    scope_type: ScopeType,
    scope_id: i64,
    include_children: bool,
  ) -> Self {
    Self {
      perm_key: perm_key.into(),
      scope_type,
      scope_id: Some(scope_id),
      include_children,
    }
  }
}

/// What a permission check is about. Any subset of fields may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTarget {
  pub arxiu_id:        Option<i64>,
  pub llibre_id:       Option<i64>,
  pub pagina_id:       Option<i64>,
  pub pais_id:         Option<i64>,
  pub nivell_admin_id: Option<i64>,
  pub comarca_id:      Option<i64>,
  pub municipi_id:     Option<i64>,
  /// Archives the target descends from (book/page targets).
  #[serde(default)]
  pub arxiu_ids:       Vec<i64>,
  #[serde(default)]
  pub comarca_ids:     Vec<i64>,
}

impl PermissionTarget {
  pub fn global() -> Self { Self::default() }

  pub fn municipi(id: i64) -> Self {
    Self { municipi_id: Some(id), ..Self::default() }
  }

  pub fn llibre(id: i64) -> Self {
    Self { llibre_id: Some(id), ..Self::default() }
  }

  pub fn arxiu(id: i64) -> Self {
    Self { arxiu_id: Some(id), ..Self::default() }
  }
}

/// Ancestors discovered for a target by the store (admin closure, book →
/// archive links, nivell → país).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ancestry {
  pub arxiu_ids:   Vec<i64>,
  pub pais_ids:    Vec<i64>,
  pub nivell_ids:  Vec<i64>,
  pub comarca_ids: Vec<i64>,
}

/// Whether `grant` covers `target`. Ignores `perm_key`.
pub fn grant_matches(
  grant: &Grant,
  target: &PermissionTarget,
  ancestry: &Ancestry,
) -> bool {
  let Some(scope_id) = grant.scope_id else {
    return grant.scope_type == ScopeType::Global;
  };
  let children = grant.include_children;
  match grant.scope_type {
    ScopeType::Global => true,
    ScopeType::Arxiu => {
      target.arxiu_id == Some(scope_id)
        || (children
          && (target.arxiu_ids.contains(&scope_id)
            || ancestry.arxiu_ids.contains(&scope_id)))
    }
    ScopeType::Pais => {
      target.pais_id == Some(scope_id)
        || (children && ancestry.pais_ids.contains(&scope_id))
    }
    ScopeType::NivellAdmin => {
      target.nivell_admin_id == Some(scope_id)
        || (children && ancestry.nivell_ids.contains(&scope_id))
    }
    ScopeType::Comarca => {
      target.comarca_id == Some(scope_id)
        || (children
          && (target.comarca_ids.contains(&scope_id)
            || ancestry.comarca_ids.contains(&scope_id)))
    }
    ScopeType::Municipi => target.municipi_id == Some(scope_id),
  }
}

/// Every grant reachable by a user through direct and group policies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantSet {
  pub is_admin: bool,
  pub grants:   Vec<Grant>,
}

impl GrantSet {
  pub fn allows(
    &self,
    perm_key: &str,
    target: &PermissionTarget,
    ancestry: &Ancestry,
  ) -> bool {
    if self.is_admin {
      return true;
    }
    self
      .grants
      .iter()
      .filter(|g| g.perm_key == perm_key)
      .any(|g| grant_matches(g, target, ancestry))
  }
}

/// Memoised grant sets keyed by `(user_id, permissions_version)`.
///
/// A stale entry is never served: the caller passes the version it just read
/// and a mismatch forces a reload.
#[derive(Debug, Default)]
pub struct GrantCache {
  entries: Mutex<HashMap<i64, (i64, Arc<GrantSet>)>>,
}

impl GrantCache {
  pub fn get(&self, user_id: i64, version: i64) -> Option<Arc<GrantSet>> {
    let entries = self.entries.lock().ok()?;
    entries
      .get(&user_id)
      .filter(|(v, _)| *v == version)
      .map(|(_, set)| Arc::clone(set))
  }

  pub fn put(&self, user_id: i64, version: i64, set: Arc<GrantSet>) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.insert(user_id, (version, set));
    }
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}
