//! Integration tests for `SqliteStore` against an in-memory database.

use llinatge_core::{
  config::Settings,
  entity::{Fields, ObjectType},
  services::Services,
  store::{Accounts, Catalog, Moderation, Permissions},
  wiki::{Actor, Decision},
};
use serde_json::json;

use crate::SqliteStore;

mod accounts;
mod moderation;
mod permissions;
mod rollups;
mod search;

/// Default settings with a change bucket large enough for fixture setup.
fn test_settings() -> Settings {
  Settings { wiki_change_burst: 1_000, ..Settings::default() }
}

async fn store() -> SqliteStore { store_with(test_settings()).await }

async fn store_with(settings: Settings) -> SqliteStore {
  store_with_services(Services::new(settings)).await
}

async fn store_with_services(services: Services) -> SqliteStore {
  SqliteStore::open_in_memory_with(services).await.expect("in-memory store")
}

fn fields(v: serde_json::Value) -> Fields { v.as_object().cloned().expect("JSON object") }

/// An activated account.
async fn user(s: &SqliteStore, name: &str) -> i64 {
  let new = s
    .create_user(name.into(), format!("{name}@example.org"), "secret".into())
    .await
    .unwrap();
  s.activate_user(new.activation_token).await.unwrap().id
}

/// An activated account holding the seeded `moderador` policy.
async fn moderator(s: &SqliteStore, name: &str) -> i64 {
  let id = user(s, name).await;
  let policy = s.policy_by_name("moderador".into()).await.unwrap().expect("seeded policy");
  s.assign_policy_to_user(policy.id, id).await.unwrap();
  id
}

/// Draft, submit and approve an entity; returns its id.
async fn publish(
  s: &SqliteStore,
  author: i64,
  moderator: i64,
  object_type: ObjectType,
  v: serde_json::Value,
) -> i64 {
  let id = s.create_draft(Actor::editor(author), object_type, fields(v)).await.unwrap();
  s.submit_for_review(Actor::editor(author), object_type, id).await.unwrap();
  s.moderate_entity(moderator, object_type, id, Decision::Approve).await.unwrap();
  id
}

/// País → nivell → municipi → llibre, all published.
struct Territory {
  pais:     i64,
  nivell:   i64,
  municipi: i64,
  llibre:   i64,
}

async fn territory(s: &SqliteStore, author: i64, moderator: i64, nom: &str) -> Territory {
  let pais = publish(s, author, moderator, ObjectType::Pais, json!({ "nom": "Catalunya" })).await;
  let nivell = publish(
    s,
    author,
    moderator,
    ObjectType::NivellAdmin,
    json!({ "nom": format!("Vegueria de {nom}"), "pais_id": pais, "nivell": 1 }),
  )
  .await;
  let municipi = publish(
    s,
    author,
    moderator,
    ObjectType::Municipi,
    json!({ "nom": nom, "nivell_admin_id": nivell }),
  )
  .await;
  let llibre = publish(
    s,
    author,
    moderator,
    ObjectType::Llibre,
    json!({ "titol": format!("Baptismes de {nom}"), "codi": format!("B-{nom}"), "municipi_id": municipi }),
  )
  .await;
  Territory { pais, nivell, municipi, llibre }
}
