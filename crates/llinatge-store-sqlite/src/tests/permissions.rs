use llinatge_core::{
  permission::{Grant, PermissionTarget, ScopeType},
  store::{Accounts, Permissions},
};

use super::{moderator, store, territory, user};

const EDIT_BOOKS: &str = "documentals.llibres.edit";

#[tokio::test]
async fn archive_grant_covers_descendant_books() {
  let s = store().await;
  let u = user(&s, "anna").await;
  let policy = s.create_policy("arxivers".into()).await.unwrap();
  s.add_grant(policy, Grant::scoped(EDIT_BOOKS, ScopeType::Arxiu, 7, true)).await.unwrap();
  s.assign_policy_to_user(policy, u).await.unwrap();

  let inside = PermissionTarget { llibre_id: Some(11), arxiu_ids: vec![7], ..Default::default() };
  let outside = PermissionTarget { llibre_id: Some(11), arxiu_ids: vec![8], ..Default::default() };
  assert!(s.has_permission(u, EDIT_BOOKS, &inside).await);
  assert!(!s.has_permission(u, EDIT_BOOKS, &outside).await);
  assert!(!s.has_permission(u, "documentals.llibres.delete", &inside).await);
}

#[tokio::test]
async fn nivell_grant_reaches_its_municipalities() {
  let s = store().await;
  let author = user(&s, "anna").await;
  let moderator = moderator(&s, "marta").await;
  let girona = territory(&s, author, moderator, "Girona").await;
  let lleida = territory(&s, author, moderator, "Lleida").await;

  let u = user(&s, "pere").await;
  let policy = s.create_policy("vegueria".into()).await.unwrap();
  s.add_grant(policy, Grant::scoped("municipis.edit", ScopeType::NivellAdmin, girona.nivell, true))
    .await
    .unwrap();
  s.assign_policy_to_user(policy, u).await.unwrap();

  assert!(s.has_permission(u, "municipis.edit", &PermissionTarget::municipi(girona.municipi)).await);
  assert!(!s.has_permission(u, "municipis.edit", &PermissionTarget::municipi(lleida.municipi)).await);
  // Without children the grant only matches the nivell itself.
  let narrow = s.create_policy("nivell".into()).await.unwrap();
  s.add_grant(narrow, Grant::scoped("nivells.edit", ScopeType::NivellAdmin, girona.nivell, false))
    .await
    .unwrap();
  s.assign_policy_to_user(narrow, u).await.unwrap();
  assert!(!s.has_permission(u, "nivells.edit", &PermissionTarget::municipi(girona.municipi)).await);
}

#[tokio::test]
async fn global_grants_match_bare_targets() {
  let s = store().await;
  let u = user(&s, "anna").await;
  let policy = s.create_policy("global".into()).await.unwrap();
  s.add_grant(policy, Grant::global("cognoms.edit")).await.unwrap();
  s.add_grant(policy, Grant::scoped("llibres.edit", ScopeType::Arxiu, 3, true)).await.unwrap();
  s.assign_policy_to_user(policy, u).await.unwrap();

  assert!(s.has_permission(u, "cognoms.edit", &PermissionTarget::global()).await);
  assert!(!s.has_permission(u, "llibres.edit", &PermissionTarget::global()).await);
}

#[tokio::test]
async fn admins_pass_every_check() {
  let s = store().await;
  let u = user(&s, "anna").await;
  let admin = s.policy_by_name("admin".into()).await.unwrap().unwrap();
  s.assign_policy_to_user(admin.id, u).await.unwrap();
  assert!(s.has_permission(u, "anything.at.all", &PermissionTarget::municipi(99)).await);
}

#[tokio::test]
async fn unknown_users_are_denied() {
  let s = store().await;
  assert!(!s.has_permission(12_345, "cognoms.edit", &PermissionTarget::global()).await);
}

#[tokio::test]
async fn policy_changes_bump_the_version() {
  let s = store().await;
  let u = user(&s, "anna").await;
  let v0 = s.get_user(u).await.unwrap().unwrap().permissions_version;

  let policy = s.create_policy("editors".into()).await.unwrap();
  s.assign_policy_to_user(policy, u).await.unwrap();
  let v1 = s.get_user(u).await.unwrap().unwrap().permissions_version;
  assert!(v1 > v0);

  // The cached grant set must not survive a new grant.
  assert!(!s.has_permission(u, "cognoms.edit", &PermissionTarget::global()).await);
  let grant = s.add_grant(policy, Grant::global("cognoms.edit")).await.unwrap();
  assert!(s.get_user(u).await.unwrap().unwrap().permissions_version > v1);
  assert!(s.has_permission(u, "cognoms.edit", &PermissionTarget::global()).await);

  s.remove_grant(grant).await.unwrap();
  assert!(!s.has_permission(u, "cognoms.edit", &PermissionTarget::global()).await);
}

#[tokio::test]
async fn group_membership_confers_policies() {
  let s = store().await;
  let u = user(&s, "anna").await;
  let group = s.create_group("voluntaris".into()).await.unwrap();
  let policy = s.create_policy("transcriptors".into()).await.unwrap();
  s.add_grant(policy, Grant::global("transcripcions.edit")).await.unwrap();
  s.assign_policy_to_group(policy, group).await.unwrap();

  let target = PermissionTarget::global();
  assert!(!s.has_permission(u, "transcripcions.edit", &target).await);
  s.add_group_member(group, u).await.unwrap();
  assert!(s.has_permission(u, "transcripcions.edit", &target).await);
  s.remove_group_member(group, u).await.unwrap();
  assert!(!s.has_permission(u, "transcripcions.edit", &target).await);
}

#[tokio::test]
async fn scoped_grants_need_an_id() {
  let s = store().await;
  let policy = s.create_policy("broken".into()).await.unwrap();
  let grant = Grant { scope_id: None, ..Grant::scoped("x", ScopeType::Municipi, 1, false) };
  assert!(s.add_grant(policy, grant).await.is_err());
  assert!(s.add_grant(9_999, Grant::global("x")).await.is_err());
}
