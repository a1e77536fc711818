use std::sync::Arc;

use llinatge_core::{
  ErrorKind,
  config::Settings,
  entity::{ModerationState, ObjectType},
  services::{RecordingMailer, Services},
  store::{Accounts, Catalog, Moderation, Search},
  wiki::{Actor, ChangeFilter, ChangeType, Decision, RevertTarget, SubmitOutcome},
};
use serde_json::json;

use super::{fields, moderator, publish, store, store_with, store_with_services, test_settings, user};

fn queued(outcome: SubmitOutcome) -> i64 {
  match outcome {
    SubmitOutcome::Queued { change_id } => change_id,
    other => panic!("expected a queued change, got {other:?}"),
  }
}

// ─── Drafts ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn owner_edits_draft_in_place() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let other = user(&s, "pere").await;

  let id = s
    .create_draft(Actor::editor(editor), ObjectType::Persona, fields(json!({ "nom": "Joan" })))
    .await
    .unwrap();
  let outcome = s
    .submit(Actor::editor(editor), ObjectType::Persona, id, fields(json!({ "ofici": "pagès" })))
    .await
    .unwrap();
  assert_eq!(outcome, SubmitOutcome::Applied { object_id: id });
  assert_eq!(s.get_persona(id).await.unwrap().unwrap().ofici.as_deref(), Some("pagès"));

  let err = s
    .submit(Actor::editor(other), ObjectType::Persona, id, fields(json!({ "ofici": "fuster" })))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn submit_for_review_queues_a_create_change() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let id = s
    .create_draft(Actor::editor(editor), ObjectType::Persona, fields(json!({ "nom": "Joan" })))
    .await
    .unwrap();
  let change_id = s.submit_for_review(Actor::editor(editor), ObjectType::Persona, id).await.unwrap();

  let change = s.get_change(change_id).await.unwrap().unwrap();
  assert_eq!(change.change_type, ChangeType::Create);
  assert_eq!(change.object_id, id);
  assert_eq!(change.state, ModerationState::Pending);
  let snap = s.snapshot(ObjectType::Persona, id).await.unwrap().unwrap();
  assert_eq!(snap.moderation_state, ModerationState::Pending);

  let again = s.submit_for_review(Actor::editor(editor), ObjectType::Persona, id).await;
  assert_eq!(again.unwrap_err().kind(), ErrorKind::InvalidRequest);
}

// ─── Review queue ────────────────────────────────────────────────────────────

#[tokio::test]
async fn revert_restores_an_earlier_version() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  let first = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "Fuster 1" })))
      .await
      .unwrap(),
  );
  s.approve(moderator, first).await.unwrap();

  let second = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "Fuster 2" })))
      .await
      .unwrap(),
  );
  s.approve(moderator, second).await.unwrap();
  assert_eq!(s.get_persona(p).await.unwrap().unwrap().ofici.as_deref(), Some("Fuster 2"));

  let revert =
    s.propose_revert(Actor::editor(editor), first, RevertTarget::RestoreVersion).await.unwrap();
  let change = s.approve(moderator, revert).await.unwrap();
  assert_eq!(change.change_type, ChangeType::Revert);
  assert_eq!(change.diff.source_change_id, Some(first));
  assert_eq!(s.get_persona(p).await.unwrap().unwrap().ofici.as_deref(), Some("Fuster 1"));

  let history = s
    .list_changes(ChangeFilter {
      object_type: Some(ObjectType::Persona),
      object_id: Some(p),
      ..ChangeFilter::default()
    })
    .await
    .unwrap();
  let ids: Vec<_> = history.iter().map(|c| c.id).collect();
  assert!(ids.windows(2).all(|w| w[0] < w[1]));
  assert_eq!(history.len(), 4);
}

#[tokio::test]
async fn undo_reinstates_the_previous_value() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  let change = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "teixidor" })))
      .await
      .unwrap(),
  );
  s.approve(moderator, change).await.unwrap();

  let undo = s.propose_revert(Actor::editor(editor), change, RevertTarget::Undo).await.unwrap();
  s.approve(moderator, undo).await.unwrap();
  assert_eq!(s.get_persona(p).await.unwrap().unwrap().ofici, None);
}

#[tokio::test]
async fn approval_credits_points_and_records_activity() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;
  let before = s.user_points(editor).await.unwrap();

  let change = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "cognom1": "Puig" })))
      .await
      .unwrap(),
  );
  let approved = s.approve(moderator, change).await.unwrap();
  assert_eq!(approved.state, ModerationState::Published);
  assert_eq!(approved.moderated_by, Some(moderator));
  assert_eq!(s.user_points(editor).await.unwrap(), before + 5);

  let activity = s.activity_for(editor, 1).await.unwrap();
  assert_eq!(activity[0].action, "persona_approve");
  assert_eq!(activity[0].points, 5);
}

#[tokio::test]
async fn rejected_changes_cannot_be_approved() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  let change = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "nom": "Jaume" })))
      .await
      .unwrap(),
  );
  let rejected = s.reject(moderator, change, Some("sense font".into())).await.unwrap();
  assert_eq!(rejected.state, ModerationState::Rejected);
  assert_eq!(rejected.moderation_reason.as_deref(), Some("sense font"));
  assert_eq!(s.get_persona(p).await.unwrap().unwrap().nom, "Joan");

  let err = s.approve(moderator, change).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::ModerationRejected);
}

#[tokio::test]
async fn deciding_requires_the_moderate_capability() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;
  let change = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "ferrer" })))
      .await
      .unwrap(),
  );

  let err = s.approve(editor, change).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Forbidden);
  let err = s.moderate_entity(editor, ObjectType::Persona, p, Decision::Approve).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn propose_create_inserts_on_approval() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;

  let change_id = s
    .propose_create(
      Actor::editor(editor),
      ObjectType::Persona,
      fields(json!({ "nom": "Pere", "cognom1": "Vila" })),
    )
    .await
    .unwrap();
  let change = s.approve(moderator, change_id).await.unwrap();
  assert_ne!(change.object_id, 0);
  let persona = s.get_persona(change.object_id).await.unwrap().unwrap();
  assert_eq!(persona.nom, "Pere");
  assert_eq!(persona.moderation_state, ModerationState::Published);
  let doc = s.search_doc(ObjectType::Persona, change.object_id).await.unwrap().unwrap();
  assert!(doc.published);

  let missing = s
    .propose_create(Actor::editor(editor), ObjectType::Persona, fields(json!({ "ofici": "x" })))
    .await;
  assert_eq!(missing.unwrap_err().kind(), ErrorKind::InvalidRequest);
}

// ─── Bypass ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn bypass_is_only_honoured_for_holders() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  let outcome = s
    .submit(Actor::moderator(editor), ObjectType::Persona, p, fields(json!({ "ofici": "moliner" })))
    .await
    .unwrap();
  assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
  assert_eq!(s.get_persona(p).await.unwrap().unwrap().ofici, None);

  let outcome = s
    .submit(Actor::moderator(moderator), ObjectType::Persona, p, fields(json!({ "nom": "Joan Baptista" })))
    .await
    .unwrap();
  let SubmitOutcome::Overridden { change_id } = outcome else {
    panic!("expected an override, got {outcome:?}");
  };
  let change = s.get_change(change_id).await.unwrap().unwrap();
  assert_eq!(change.state, ModerationState::Published);
  assert_eq!(change.moderated_by, Some(moderator));
  assert_eq!(s.get_persona(p).await.unwrap().unwrap().nom, "Joan Baptista");
}

// ─── Guardrails ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_pending_change_per_user_and_object() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "a" })))
    .await
    .unwrap();
  let err = s
    .submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "b" })))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn oversized_metadata_is_refused() {
  let s = store_with(Settings { wiki_meta_max_bytes: 64, ..test_settings() }).await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  let err = s
    .submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "x".repeat(200) })))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);
  assert!(!err.is_rate_limited());
}

#[tokio::test]
async fn change_bucket_runs_dry() {
  let s = store_with(Settings {
    wiki_change_rate: 0.001,
    wiki_change_burst: 1,
    wiki_pending_per_user: 10,
    ..Settings::default()
  })
  .await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "a" })))
    .await
    .unwrap();
  let err = s
    .submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "b" })))
    .await
    .unwrap_err();
  assert!(err.is_rate_limited());
}

// ─── Entity moderation ───────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_moderation_reports_each_row() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let mut ids = Vec::new();
  for nom in ["Joan", "Pere"] {
    let id = s
      .create_draft(Actor::editor(editor), ObjectType::Persona, fields(json!({ "nom": nom })))
      .await
      .unwrap();
    s.submit_for_review(Actor::editor(editor), ObjectType::Persona, id).await.unwrap();
    ids.push(id);
  }
  ids.push(9_999);

  let report = s
    .moderate_bulk(moderator, ObjectType::Persona, ids.clone(), Decision::Approve)
    .await
    .unwrap();
  assert_eq!(report.succeeded, ids[..2]);
  assert_eq!(report.failed.len(), 1);
  assert_eq!(report.failed[0].0, 9_999);

  let pending = s
    .list_changes(ChangeFilter { state: Some(ModerationState::Pending), ..ChangeFilter::default() })
    .await
    .unwrap();
  assert!(pending.is_empty());
}

#[tokio::test]
async fn rejecting_a_draft_submission_hides_it() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let id = s
    .create_draft(Actor::editor(editor), ObjectType::Persona, fields(json!({ "nom": "Joan" })))
    .await
    .unwrap();
  let change = s.submit_for_review(Actor::editor(editor), ObjectType::Persona, id).await.unwrap();

  s.reject(moderator, change, None).await.unwrap();
  let snap = s.snapshot(ObjectType::Persona, id).await.unwrap().unwrap();
  assert_eq!(snap.moderation_state, ModerationState::Rejected);
  assert!(s.search_doc(ObjectType::Persona, id).await.unwrap().is_none());

  // A rejected row goes back to its owner and may be resubmitted.
  s.submit_for_review(Actor::editor(editor), ObjectType::Persona, id).await.unwrap();
}

#[tokio::test]
async fn decisions_are_mailed_when_enabled() {
  let mailer = Arc::new(RecordingMailer::default());
  let services =
    Services::new(Settings { mail_enabled: true, ..test_settings() }).with_mailer(mailer.clone());
  let s = store_with_services(services).await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;
  let sent_before = mailer.sent().len();

  let change = queued(
    s.submit(Actor::editor(editor), ObjectType::Persona, p, fields(json!({ "ofici": "sastre" })))
      .await
      .unwrap(),
  );
  s.approve(moderator, change).await.unwrap();

  let sent = mailer.sent();
  assert_eq!(sent.len(), sent_before + 1);
  assert_eq!(sent.last().unwrap().to, "anna@example.org");
}

// ─── Marks ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn marks_toggle() {
  let s = store().await;
  let editor = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let p = publish(&s, editor, moderator, ObjectType::Persona, json!({ "nom": "Joan" })).await;

  assert!(s.toggle_mark(editor, ObjectType::Persona, p, true).await.unwrap());
  let marks = s.marks_for(editor).await.unwrap();
  assert_eq!(marks.len(), 1);
  assert!(marks[0].public);
  assert!(!s.toggle_mark(editor, ObjectType::Persona, p, true).await.unwrap());
  assert!(s.marks_for(editor).await.unwrap().is_empty());

  let err = s.toggle_mark(editor, ObjectType::Persona, 4_242, false).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::NotFound);
}
