use llinatge_core::{
  ErrorKind,
  entity::{ObjectType, ScopeLevel},
  search::SearchQuery,
  store::{Catalog, Moderation, Search},
  wiki::{Actor, SubmitOutcome},
};
use serde_json::json;

use super::{fields, moderator, publish, store, territory, user};

fn persona_query(q: &str) -> SearchQuery {
  SearchQuery { entity: Some(ObjectType::Persona), ..SearchQuery::text(q) }
}

#[tokio::test]
async fn variants_rank_after_exact_matches() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;

  let moia = publish(&s, author, moderator, ObjectType::Cognom, json!({ "forma": "Moia" })).await;
  let joan = publish(
    &s,
    author,
    moderator,
    ObjectType::Persona,
    json!({ "nom": "Joan", "cognom1": "Moia" }),
  )
  .await;
  s.add_cognom_variant(moia, "Moya".into()).await.unwrap();
  let pere = publish(
    &s,
    author,
    moderator,
    ObjectType::Persona,
    json!({ "nom": "Pere", "cognom1": "Moya" }),
  )
  .await;

  let page = s.search(&persona_query("Moya")).await.unwrap();
  let ids: Vec<i64> = page.items.iter().map(|h| h.entity_id).collect();
  assert_eq!(ids, vec![pere, joan]);
  assert!(page.items[0].score > page.items[1].score);
  assert_eq!(page.items[1].label, "Joan Moia");
  assert_eq!(page.total, 2);
}

#[tokio::test]
async fn ancestor_filter_follows_the_closure() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let girona = territory(&s, author, moderator, "Girona").await;
  let lleida = territory(&s, author, moderator, "Lleida").await;

  let in_girona = publish(
    &s,
    author,
    moderator,
    ObjectType::Persona,
    json!({ "nom": "Rosa", "cognom1": "Vila", "municipi_id": girona.municipi }),
  )
  .await;
  publish(
    &s,
    author,
    moderator,
    ObjectType::Persona,
    json!({ "nom": "Rosa", "cognom1": "Vila", "municipi_id": lleida.municipi }),
  )
  .await;

  let query = SearchQuery {
    ancestor_type: Some(ScopeLevel::NivellAdmin),
    ancestor_id: Some(girona.nivell),
    ..SearchQuery::default()
  };
  let page = s.search(&query).await.unwrap();
  assert!(!page.items.is_empty());
  assert!(page.items.iter().all(|h| h.municipi_id == Some(girona.municipi)));
  assert!(page.items.iter().any(|h| h.entity_type == ObjectType::Llibre && h.entity_id == girona.llibre));
  assert!(page.items.iter().any(|h| h.entity_type == ObjectType::Persona && h.entity_id == in_girona));

  let by_pais = SearchQuery {
    ancestor_type: Some(ScopeLevel::Pais),
    ancestor_id: Some(lleida.pais),
    ..SearchQuery::text("Rosa Vila")
  };
  let page = s.search(&by_pais).await.unwrap();
  assert_eq!(page.items.len(), 1);
  assert_eq!(page.items[0].municipi_id, Some(lleida.municipi));
}

#[tokio::test]
async fn drafts_stay_out_of_results() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let id = s
    .create_draft(
      Actor::editor(author),
      ObjectType::Persona,
      fields(json!({ "nom": "Marià", "cognom1": "Serra" })),
    )
    .await
    .unwrap();

  let doc = s.search_doc(ObjectType::Persona, id).await.unwrap().expect("indexed draft");
  assert!(!doc.published);
  assert!(s.search(&persona_query("Serra")).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn year_bounds_filter_and_bad_bounds_are_ignored() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  for (nom, naixement) in [("Josep", "1850-03-01"), ("Jaume", "1901-07-12")] {
    publish(
      &s,
      author,
      moderator,
      ObjectType::Persona,
      json!({ "nom": nom, "cognom1": "Puig", "data_naixement": naixement }),
    )
    .await;
  }

  let bounded = SearchQuery { from: Some("1900".into()), ..persona_query("Puig") };
  let page = s.search(&bounded).await.unwrap();
  assert_eq!(page.items.len(), 1);
  assert_eq!(page.items[0].any_acte, Some(1901));

  let garbage = SearchQuery { from: Some("fa molt".into()), ..persona_query("Puig") };
  assert_eq!(s.search(&garbage).await.unwrap().total, 2);
}

#[tokio::test]
async fn surnames_resolve_through_variants_and_redirects() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let massana = publish(&s, author, moderator, ObjectType::Cognom, json!({ "forma": "Massana" })).await;
  publish(
    &s,
    author,
    moderator,
    ObjectType::Cognom,
    json!({ "forma": "Masana", "redirect_to_id": massana }),
  )
  .await;
  s.add_cognom_variant(massana, "Maçana".into()).await.unwrap();

  let via_variant = s.resolve_cognom("MAÇANA".into()).await.unwrap().expect("variant");
  assert_eq!(via_variant.id, massana);
  let via_redirect = s.resolve_cognom("Masana".into()).await.unwrap().expect("redirect");
  assert_eq!(via_redirect.id, massana);
  assert!(s.resolve_cognom("Ferrer".into()).await.unwrap().is_none());
  assert!(s.add_cognom_variant(massana, "  ".into()).await.is_err());
}

#[tokio::test]
async fn redirects_stay_one_hop_deep() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let massana = publish(&s, author, moderator, ObjectType::Cognom, json!({ "forma": "Massana" })).await;
  let masana = publish(
    &s,
    author,
    moderator,
    ObjectType::Cognom,
    json!({ "forma": "Masana", "redirect_to_id": massana }),
  )
  .await;

  let err = s
    .submit(
      Actor::moderator(moderator),
      ObjectType::Cognom,
      massana,
      fields(json!({ "redirect_to_id": massana })),
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);
  assert_eq!(s.get_cognom(massana).await.unwrap().unwrap().redirect_to_id, None);

  let err = s
    .create_draft(
      Actor::editor(author),
      ObjectType::Cognom,
      fields(json!({ "forma": "Massanna", "redirect_to_id": masana })),
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);

  let err = s
    .create_draft(
      Actor::editor(author),
      ObjectType::Cognom,
      fields(json!({ "forma": "Massanna", "redirect_to_id": 9999 })),
    )
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn aliases_follow_their_canonical_when_it_redirects() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let massana = publish(&s, author, moderator, ObjectType::Cognom, json!({ "forma": "Massana" })).await;
  let masana = publish(
    &s,
    author,
    moderator,
    ObjectType::Cognom,
    json!({ "forma": "Masana", "redirect_to_id": massana }),
  )
  .await;
  let massanes = publish(&s, author, moderator, ObjectType::Cognom, json!({ "forma": "Massanes" })).await;

  let outcome = s
    .submit(
      Actor::moderator(moderator),
      ObjectType::Cognom,
      massana,
      fields(json!({ "redirect_to_id": massanes })),
    )
    .await
    .unwrap();
  assert!(matches!(outcome, SubmitOutcome::Overridden { .. }));

  assert_eq!(s.get_cognom(massana).await.unwrap().unwrap().redirect_to_id, Some(massanes));
  assert_eq!(s.get_cognom(masana).await.unwrap().unwrap().redirect_to_id, Some(massanes));
  assert_eq!(s.resolve_cognom("Masana".into()).await.unwrap().unwrap().id, massanes);
  assert_eq!(s.resolve_cognom("Massana".into()).await.unwrap().unwrap().id, massanes);
}

#[tokio::test]
async fn reindex_all_rewrites_every_document() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  territory(&s, author, moderator, "Vic").await;
  // Municipi and llibre; país and nivell are not indexed.
  assert_eq!(s.reindex_all().await.unwrap(), 2);
}
