use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use llinatge_core::{
  ErrorKind,
  services::{FixedClock, Services},
  store::Accounts,
};

use super::{store, store_with_services, test_settings, user};

#[tokio::test]
async fn activation_links_expire() {
  let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
  let s = store_with_services(Services::new(test_settings()).with_clock(clock.clone())).await;

  let fresh = s.create_user("anna".into(), "anna@example.org".into(), "secret".into()).await.unwrap();
  let stale = s.create_user("pere".into(), "pere@example.org".into(), "secret".into()).await.unwrap();
  assert!(!fresh.user.actiu);
  assert!(s.activate_user(fresh.activation_token).await.unwrap().actiu);

  clock.advance(Duration::hours(49));
  let err = s.activate_user(stale.activation_token).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::InvalidRequest);
  assert_eq!(
    s.activate_user("no-such-token".into()).await.unwrap_err().kind(),
    ErrorKind::NotFound
  );
}

#[tokio::test]
async fn only_active_accounts_log_in() {
  let s = store().await;
  let new = s.create_user("anna".into(), "Anna@Example.org".into(), "secret".into()).await.unwrap();
  assert_eq!(new.user.email, "anna@example.org");
  assert_eq!(s.verify_password("anna".into(), "secret".into()).await.unwrap(), None);

  s.activate_user(new.activation_token).await.unwrap();
  let id = Some(new.user.id);
  assert_eq!(s.verify_password("anna".into(), "secret".into()).await.unwrap(), id);
  assert_eq!(s.verify_password("ANNA@example.org".into(), "secret".into()).await.unwrap(), id);
  assert_eq!(s.verify_password("anna".into(), "wrong".into()).await.unwrap(), None);
}

#[tokio::test]
async fn handles_and_emails_are_unique() {
  let s = store().await;
  user(&s, "anna").await;
  let dup_email = s.create_user("anna2".into(), "anna@example.org".into(), "x".into()).await;
  assert_eq!(dup_email.unwrap_err().kind(), ErrorKind::InvalidRequest);
  let dup_handle = s.create_user("anna".into(), "other@example.org".into(), "x".into()).await;
  assert_eq!(dup_handle.unwrap_err().kind(), ErrorKind::InvalidRequest);
  assert!(s.create_user("marc".into(), "not-an-email".into(), "x".into()).await.is_err());
  assert!(s.create_user("marc".into(), "marc@example.org".into(), String::new()).await.is_err());
}

#[tokio::test]
async fn sessions_resolve_until_revoked_or_expired() {
  let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()));
  let s = store_with_services(Services::new(test_settings()).with_clock(clock.clone())).await;
  let id = user(&s, "anna").await;

  let token = s.create_session(id, Duration::hours(1)).await.unwrap();
  assert_eq!(s.resolve_session(token.clone()).await.unwrap(), Some(id));
  s.revoke_session(token.clone()).await.unwrap();
  assert_eq!(s.resolve_session(token).await.unwrap(), None);

  let short = s.create_session(id, Duration::minutes(5)).await.unwrap();
  clock.advance(Duration::minutes(6));
  assert_eq!(s.resolve_session(short).await.unwrap(), None);
  assert_eq!(s.resolve_session("bogus".into()).await.unwrap(), None);
  assert!(s.create_session(9_999, Duration::hours(1)).await.is_err());
}

#[tokio::test]
async fn new_accounts_start_without_points() {
  let s = store().await;
  let id = user(&s, "anna").await;
  assert_eq!(s.user_points(id).await.unwrap(), 0);
  assert!(s.activity_for(id, 10).await.unwrap().is_empty());
}
