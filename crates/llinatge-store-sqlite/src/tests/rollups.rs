use llinatge_core::{
  entity::{ObjectType, ScopeLevel, TipusActe},
  rollup::{DemografiaKey, DemografiaRow, RollupDelta},
  store::{Catalog, Moderation, Rollups},
  wiki::{Actor, Decision, SubmitOutcome},
};
use llinatge_import::{ImportJob, Ingestion, Template};
use serde_json::json;

use crate::SqliteStore;

use super::{fields, moderator, publish, store, territory, user};

/// A transcription of `tipus` in `llibre` for `any`, submitted for review.
async fn pending_act(s: &SqliteStore, author: i64, llibre: i64, tipus: &str, any: i64) -> i64 {
  let id = s
    .create_draft(
      Actor::editor(author),
      ObjectType::Transcripcio,
      fields(json!({ "llibre_id": llibre, "tipus_acte": tipus, "any_doc": any })),
    )
    .await
    .unwrap();
  s.submit_for_review(Actor::editor(author), ObjectType::Transcripcio, id).await.unwrap();
  id
}

/// A published baptism in `llibre` for `any`.
async fn baptism(s: &SqliteStore, author: i64, moderator: i64, llibre: i64, any: i64) -> i64 {
  let id = pending_act(s, author, llibre, "baptisme", any).await;
  s.moderate_entity(moderator, ObjectType::Transcripcio, id, Decision::Approve).await.unwrap();
  id
}

fn queued(outcome: SubmitOutcome) -> i64 {
  match outcome {
    SubmitOutcome::Queued { change_id } => change_id,
    other => panic!("expected a queued change, got {other:?}"),
  }
}

fn births(any: i32, n: i64) -> Vec<DemografiaRow> {
  vec![DemografiaRow { any, natalitat: n, ..Default::default() }]
}

#[tokio::test]
async fn publishing_and_rejecting_a_baptism_moves_the_counters() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Olot").await;

  let id = baptism(&s, author, moderator, t.llibre, 1890).await;
  let meta = s.demografia_meta(t.municipi).await.unwrap();
  assert_eq!(meta.total_natalitat, 1);
  assert_eq!((meta.any_min, meta.any_max), (Some(1890), Some(1890)));
  assert_eq!(s.demografia(t.municipi).await.unwrap(), vec![DemografiaRow {
    any: 1890,
    natalitat: 1,
    ..Default::default()
  }]);
  assert_eq!(s.nivell_demografia(t.nivell).await.unwrap()[0].natalitat, 1);

  s.moderate_entity(moderator, ObjectType::Transcripcio, id, Decision::Reject { reason: None })
    .await
    .unwrap();
  let meta = s.demografia_meta(t.municipi).await.unwrap();
  assert_eq!(meta.total_natalitat, 0);
  assert!(s.demografia(t.municipi).await.unwrap().is_empty());
  assert!(s.nivell_demografia(t.nivell).await.unwrap().is_empty());
}

#[tokio::test]
async fn drafts_and_implausible_years_are_not_counted() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Ripoll").await;

  s.create_draft(
    Actor::editor(author),
    ObjectType::Transcripcio,
    fields(json!({ "llibre_id": t.llibre, "tipus_acte": "obit", "any_doc": 1790 })),
  )
  .await
  .unwrap();
  baptism(&s, author, moderator, t.llibre, 1100).await;
  baptism(&s, author, moderator, t.llibre, 2999).await;

  assert_eq!(s.demografia_meta(t.municipi).await.unwrap(), Default::default());
  assert!(s.demografia(t.municipi).await.unwrap().is_empty());
}

#[tokio::test]
async fn rebuild_repairs_drifted_counters() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Berga").await;
  baptism(&s, author, moderator, t.llibre, 1890).await;
  baptism(&s, author, moderator, t.llibre, 1891).await;
  let expected = s.demografia(t.municipi).await.unwrap();

  let mut drift = RollupDelta::default();
  drift.demografia.insert(
    DemografiaKey { municipi_id: t.municipi, tipus: TipusActe::Matrimoni, any: 1850 },
    4,
  );
  drift.demografia.insert(
    DemografiaKey { municipi_id: t.municipi, tipus: TipusActe::Baptisme, any: 1890 },
    2,
  );
  s.apply_delta(drift).await.unwrap();
  assert_ne!(s.demografia(t.municipi).await.unwrap(), expected);

  s.rebuild(t.municipi).await.unwrap();
  assert_eq!(s.demografia(t.municipi).await.unwrap(), expected);
  assert_eq!(s.demografia_meta(t.municipi).await.unwrap().total_matrimonis, 0);
  assert_eq!(s.demografia_meta(t.municipi).await.unwrap().total_natalitat, 2);

  assert!(s.rebuild_all().await.unwrap() >= 1);
  assert_eq!(s.demografia(t.municipi).await.unwrap(), expected);
}

#[tokio::test]
async fn approved_year_edit_moves_the_row() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Vic").await;
  let id = baptism(&s, author, moderator, t.llibre, 1890).await;

  let change_id = queued(
    s.submit(Actor::editor(author), ObjectType::Transcripcio, id, fields(json!({ "any_doc": 1891 })))
      .await
      .unwrap(),
  );
  // Nothing moves while the change is pending.
  assert_eq!(s.demografia(t.municipi).await.unwrap(), births(1890, 1));

  s.approve(moderator, change_id).await.unwrap();
  assert_eq!(s.demografia(t.municipi).await.unwrap(), births(1891, 1));
  assert_eq!(s.nivell_demografia(t.nivell).await.unwrap(), births(1891, 1));
  let meta = s.demografia_meta(t.municipi).await.unwrap();
  assert_eq!((meta.any_min, meta.any_max, meta.total_natalitat), (Some(1891), Some(1891), 1));
}

#[tokio::test]
async fn moving_a_municipality_moves_its_nivell_counts() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Olot").await;
  baptism(&s, author, moderator, t.llibre, 1890).await;
  let garrotxa = publish(
    &s,
    author,
    moderator,
    ObjectType::NivellAdmin,
    json!({ "nom": "Garrotxa", "pais_id": t.pais, "nivell": 1 }),
  )
  .await;
  assert!(s.nivell_demografia(garrotxa).await.unwrap().is_empty());

  let outcome = s
    .submit(
      Actor::moderator(moderator),
      ObjectType::Municipi,
      t.municipi,
      fields(json!({ "nivell_admin_id": garrotxa })),
    )
    .await
    .unwrap();
  assert!(matches!(outcome, SubmitOutcome::Overridden { .. }));

  let nivells: Vec<i64> = s
    .closure_for(t.municipi)
    .await
    .unwrap()
    .into_iter()
    .filter(|r| r.ancestor_type == ScopeLevel::NivellAdmin)
    .map(|r| r.ancestor_id)
    .collect();
  assert_eq!(nivells, vec![garrotxa]);

  assert!(s.nivell_demografia(t.nivell).await.unwrap().is_empty());
  assert_eq!(s.nivell_demografia(garrotxa).await.unwrap(), births(1890, 1));

  s.rebuild(t.municipi).await.unwrap();
  assert!(s.nivell_demografia(t.nivell).await.unwrap().is_empty());
  assert_eq!(s.nivell_demografia(garrotxa).await.unwrap(), births(1890, 1));

  s.rebuild_all().await.unwrap();
  assert!(s.nivell_demografia(t.nivell).await.unwrap().is_empty());
  assert_eq!(s.nivell_demografia(garrotxa).await.unwrap(), births(1890, 1));

  // Later records follow the new nivell only.
  baptism(&s, author, moderator, t.llibre, 1890).await;
  assert_eq!(s.nivell_demografia(garrotxa).await.unwrap(), births(1890, 2));
  assert!(s.nivell_demografia(t.nivell).await.unwrap().is_empty());
}

#[tokio::test]
async fn rebuild_agrees_with_incremental_moderation() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Manlleu").await;

  let kept = baptism(&s, author, moderator, t.llibre, 1890).await;
  let dropped = baptism(&s, author, moderator, t.llibre, 1890).await;
  let refused = pending_act(&s, author, t.llibre, "obit", 1891).await;
  s.moderate_entity(moderator, ObjectType::Transcripcio, refused, Decision::Reject { reason: None })
    .await
    .unwrap();
  let wedding = pending_act(&s, author, t.llibre, "matrimoni", 1892).await;
  s.moderate_entity(moderator, ObjectType::Transcripcio, wedding, Decision::Approve)
    .await
    .unwrap();

  let moved = queued(
    s.submit(Actor::editor(author), ObjectType::Transcripcio, kept, fields(json!({ "any_doc": 1893 })))
      .await
      .unwrap(),
  );
  s.approve(moderator, moved).await.unwrap();
  let retyped = queued(
    s.submit(
      Actor::editor(author),
      ObjectType::Transcripcio,
      wedding,
      fields(json!({ "tipus_acte": "obit" })),
    )
    .await
    .unwrap(),
  );
  s.reject(moderator, retyped, Some("és un casament".into())).await.unwrap();
  s.moderate_entity(moderator, ObjectType::Transcripcio, dropped, Decision::Reject { reason: None })
    .await
    .unwrap();

  let municipi = s.demografia(t.municipi).await.unwrap();
  let nivell = s.nivell_demografia(t.nivell).await.unwrap();
  let meta = s.demografia_meta(t.municipi).await.unwrap();
  assert_eq!(municipi, vec![
    DemografiaRow { any: 1892, matrimonis: 1, ..Default::default() },
    DemografiaRow { any: 1893, natalitat: 1, ..Default::default() },
  ]);
  assert_eq!(nivell, municipi);

  s.rebuild(t.municipi).await.unwrap();
  assert_eq!(s.demografia(t.municipi).await.unwrap(), municipi);
  assert_eq!(s.nivell_demografia(t.nivell).await.unwrap(), nivell);
  assert_eq!(s.demografia_meta(t.municipi).await.unwrap(), meta);
}

const PUBLISHED_TEMPLATE: &str = r#"{
  "version": 1,
  "kind": "transcripcions_raw",
  "book_resolution": { "mode": "llibre_id", "column": "llibre_id" },
  "mapping": { "columns": [
    { "header": "llibre_id", "required": true, "map_to": [{ "target": "base.llibre_id" }] },
    { "header": "Tipus", "map_to": [{ "target": "base.tipus_acte", "transform": ["trim", "lower"] }] },
    { "header": "Any", "map_to": [{ "target": "base.any_doc" }] },
    { "header": "Batejat", "map_to": [{ "target": "person.batejat", "transform": ["parse_person_from_nom"] }] }
  ]},
  "moderation_state": "publicat"
}"#;

#[tokio::test]
async fn name_frequencies_follow_published_imports() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let t = territory(&s, author, moderator, "Solsona").await;

  let csv = format!(
    "llibre_id,Tipus,Any,Batejat\n\
     {l},baptisme,1870,Joan Puig\n\
     {l},baptisme,1871,Joan Vila\n\
     {l},baptisme,1872,Pere Puig\n",
    l = t.llibre
  );
  let template = Template::parse(PUBLISHED_TEMPLATE).unwrap();
  let report = s.run_import(ImportJob::new(author), &template, csv.as_bytes()).await.unwrap();
  assert_eq!(report.imported, 3);

  let noms = s.top_noms(t.municipi, 10).await.unwrap();
  assert_eq!(noms[0].forma, "Joan");
  assert_eq!(noms[0].total, 2);
  assert_eq!(noms.len(), 2);

  let cognoms = s.top_cognoms(t.municipi, 1).await.unwrap();
  assert_eq!(cognoms.len(), 1);
  assert_eq!(cognoms[0].forma, "Puig");
  assert_eq!(cognoms[0].total, 2);
  assert_eq!(s.demografia_meta(t.municipi).await.unwrap().total_natalitat, 3);
}
