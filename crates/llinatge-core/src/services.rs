//! Capabilities the engines depend on but do not own: a clock, a mailer, and
//! the in-process state (rate limiters, grant cache) shared between requests.
//!
//! Tests swap [`SystemClock`] and [`LogMailer`] for [`FixedClock`] and
//! [`RecordingMailer`] by building a [`Services`] value by hand.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, Utc};
use thiserror::Error;

use crate::{config::Settings, permission::GrantCache, ratelimit::RateLimiter};

// ─── Clock ───────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  fn current_year(&self) -> i32 { self.now().year() }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
  now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
  pub fn new(now: DateTime<Utc>) -> Self { Self { now: Mutex::new(now) } }

  pub fn advance(&self, by: Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }
}

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.lock().map(|n| *n).unwrap_or_else(|e| *e.into_inner())
  }
}

// ─── Mailer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("mail delivery failed: {0}")]
pub struct MailError(pub String);

pub trait Mailer: Send + Sync {
  fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

/// Writes outgoing mail to the log instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
  fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), MailError> {
    tracing::info!(%to, %subject, "mail (not delivered)");
    Ok(())
  }
}

/// A captured message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
  pub to:      String,
  pub subject: String,
  pub body:    String,
}

/// Keeps every message in memory; can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingMailer {
  pub sent: Mutex<Vec<SentMail>>,
  pub fail: bool,
}

impl RecordingMailer {
  pub fn sent(&self) -> Vec<SentMail> {
    self.sent.lock().map(|s| s.clone()).unwrap_or_default()
  }
}

impl Mailer for RecordingMailer {
  fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
    if self.fail {
      return Err(MailError("recording mailer told to fail".into()));
    }
    if let Ok(mut sent) = self.sent.lock() {
      sent.push(SentMail {
        to:      to.to_owned(),
        subject: subject.to_owned(),
        body:    body.to_owned(),
      });
    }
    Ok(())
  }
}

// ─── Services ────────────────────────────────────────────────────────────────

/// Everything a store needs besides its connection.
pub struct Services {
  pub settings:       Arc<Settings>,
  pub clock:          Arc<dyn Clock>,
  pub mailer:         Arc<dyn Mailer>,
  pub change_limiter: RateLimiter,
  pub mark_limiter:   RateLimiter,
  pub grants:         GrantCache,
}

impl Services {
  pub fn new(settings: Settings) -> Self {
    let change_limiter = RateLimiter::new(
      "wiki change",
      settings.wiki_change_rate,
      settings.wiki_change_burst,
    );
    let mark_limiter =
      RateLimiter::new("wiki mark", settings.wiki_mark_rate, settings.wiki_mark_burst);
    Self {
      settings: Arc::new(settings),
      clock: Arc::new(SystemClock),
      mailer: Arc::new(LogMailer),
      change_limiter,
      mark_limiter,
      grants: GrantCache::default(),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
    self.mailer = mailer;
    self
  }

  pub fn now(&self) -> DateTime<Utc> { self.clock.now() }

  /// Fire-and-forget notification. Failures are logged, never returned.
  pub fn notify(&self, to: &str, subject: &str, body: &str) {
    if !self.settings.mail_enabled {
      return;
    }
    if let Err(e) = self.mailer.send(to, subject, body) {
      tracing::warn!(%to, error = %e, "notification mail not sent");
    }
  }
}

impl Default for Services {
  fn default() -> Self { Self::new(Settings::default()) }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn notify_respects_mail_enabled_and_swallows_failures() {
    let mailer = Arc::new(RecordingMailer::default());
    let off = Services::default().with_mailer(mailer.clone());
    off.notify("a@example.org", "hi", "body");
    assert!(mailer.sent().is_empty());

    let settings = Settings { mail_enabled: true, ..Settings::default() };
    let on = Services::new(settings).with_mailer(mailer.clone());
    on.notify("a@example.org", "hi", "body");
    assert_eq!(mailer.sent().len(), 1);

    let failing = Arc::new(RecordingMailer { fail: true, ..Default::default() });
    let settings = Settings { mail_enabled: true, ..Settings::default() };
    Services::new(settings).with_mailer(failing).notify("b@example.org", "x", "y");
  }

  #[test]
  fn fixed_clock_advances() {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(1999, 12, 31, 23, 0, 0).unwrap());
    clock.advance(Duration::hours(2));
    assert_eq!(clock.current_year(), 2000);
  }
}
