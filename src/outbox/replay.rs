//! Replay engine: drains queued mutations against the network.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::store::OutboxStore;
use super::types::{Entry, SyncTag};
use crate::http::{Network, Request};
use crate::notify::{ClientEvent, ClientNotifier};

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub succeeded: usize,
  pub failed: usize,
  pub abandoned: usize,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.succeeded += other.succeeded;
    self.failed += other.failed;
    self.abandoned += other.abandoned;
  }
}

enum EntryOutcome {
  Succeeded,
  /// Another drain already confirmed this entry
  AlreadyRemoved,
  Failed,
  Abandoned,
}

/// Replays outbox entries. Re-entrant: concurrent or duplicate drains never
/// broadcast the same success twice because only the drain whose
/// `remove_by_id` actually deleted the row reports it.
#[derive(Clone)]
pub struct ReplayEngine {
  outbox: Arc<dyn OutboxStore>,
  network: Arc<dyn Network>,
  notifier: ClientNotifier,
  /// Failed attempts before an entry is dead-lettered (0 = never)
  max_attempts: u32,
}

impl ReplayEngine {
  pub fn new(
    outbox: Arc<dyn OutboxStore>,
    network: Arc<dyn Network>,
    notifier: ClientNotifier,
    max_attempts: u32,
  ) -> Self {
    Self {
      outbox,
      network,
      notifier,
      max_attempts,
    }
  }

  /// Replay every entry queued under `tag` at call time.
  ///
  /// Entries enqueued while the drain runs wait for the next trigger. Each
  /// entry is independent; failures stay queued with no backoff.
  pub async fn drain(&self, tag: SyncTag) -> Result<DrainReport> {
    let snapshot = self.outbox.list_by_tag(tag)?;
    if snapshot.is_empty() {
      return Ok(DrainReport::default());
    }

    info!(%tag, pending = snapshot.len(), "draining outbox");
    let mut report = DrainReport::default();

    for entry in snapshot {
      match self.replay_entry(&entry).await {
        Ok(EntryOutcome::Succeeded) => report.succeeded += 1,
        Ok(EntryOutcome::AlreadyRemoved) => {}
        Ok(EntryOutcome::Failed) => report.failed += 1,
        Ok(EntryOutcome::Abandoned) => report.abandoned += 1,
        Err(e) => {
          // Storage trouble on one entry must not stop the others
          error!(%tag, id = %entry.id, error = %e, "replay bookkeeping failed");
          report.failed += 1;
        }
      }
    }

    info!(
      %tag,
      succeeded = report.succeeded,
      failed = report.failed,
      abandoned = report.abandoned,
      "drain finished"
    );
    Ok(report)
  }

  /// Drain every tag, emergencies first.
  pub async fn drain_all(&self) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    for tag in SyncTag::ALL {
      match self.drain(tag).await {
        Ok(tag_report) => report.merge(tag_report),
        Err(e) => error!(%tag, error = %e, "drain failed"),
      }
    }
    Ok(report)
  }

  async fn replay_entry(&self, entry: &Entry) -> Result<EntryOutcome> {
    let request = match to_request(entry) {
      Ok(request) => request,
      Err(e) => return self.record_failure(entry, &e.to_string()),
    };

    let failure = match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        if !self.outbox.remove_by_id(entry.id)? {
          debug!(id = %entry.id, "entry already confirmed by another drain");
          return Ok(EntryOutcome::AlreadyRemoved);
        }
        info!(tag = %entry.tag, id = %entry.id, "entry synced");
        self
          .notifier
          .broadcast(&ClientEvent::synced(entry.tag, response.json_value()));
        return Ok(EntryOutcome::Succeeded);
      }
      Ok(response) => format!("HTTP {}", response.status),
      Err(e) => e.to_string(),
    };

    self.record_failure(entry, &failure)
  }

  fn record_failure(&self, entry: &Entry, failure: &str) -> Result<EntryOutcome> {
    warn!(tag = %entry.tag, id = %entry.id, %failure, "replay failed, keeping entry queued");

    let attempts = self.outbox.record_failure(entry.id, failure)?;
    if attempts == 0 {
      return Ok(EntryOutcome::AlreadyRemoved);
    }
    if self.max_attempts == 0 || attempts < self.max_attempts {
      return Ok(EntryOutcome::Failed);
    }

    if self.outbox.dead_letter(entry.id, failure)? {
      warn!(tag = %entry.tag, id = %entry.id, attempts, "entry abandoned after repeated failures");
      self.notifier.broadcast(&ClientEvent::SyncAbandoned {
        tag: entry.tag,
        id: entry.id,
      });
      return Ok(EntryOutcome::Abandoned);
    }

    Ok(EntryOutcome::AlreadyRemoved)
  }
}

/// Rebuild the stored request exactly; default to a JSON content type when
/// no headers were captured.
fn to_request(entry: &Entry) -> Result<Request> {
  let stored = &entry.request;
  let url = Url::parse(&stored.url).map_err(|e| eyre!("Invalid stored url {}: {}", stored.url, e))?;
  let method = Method::from_bytes(stored.method.as_bytes())
    .map_err(|e| eyre!("Invalid stored method {}: {}", stored.method, e))?;

  let mut request = Request::new(method, url);
  request.headers = stored.headers.clone();
  if request.headers.is_empty() {
    request
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
  }
  request.body = stored.body.clone().map(String::into_bytes);
  Ok(request)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::db::Database;
  use crate::http::Response;
  use crate::notify::SessionRegistry;
  use crate::http::FetchError;
  use crate::outbox::{Priority, RequestDescriptor, SqliteOutbox};
  use crate::testing::{FakeNetwork, RecordingOpener};
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};

  const APPOINTMENTS: &str = "http://localhost:3000/api/appointments";

  struct Fixture {
    engine: ReplayEngine,
    network: Arc<FakeNetwork>,
    outbox: Arc<SqliteOutbox>,
    sessions: Arc<SessionRegistry>,
  }

  fn setup(max_attempts: u32) -> Fixture {
    let outbox = Arc::new(SqliteOutbox::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let network = Arc::new(FakeNetwork::new());
    let sessions = Arc::new(SessionRegistry::new());
    let notifier = ClientNotifier::new(
      Arc::new(Config::default()),
      sessions.clone(),
      network.clone(),
      Arc::new(RecordingOpener::default()),
    );
    let engine = ReplayEngine::new(outbox.clone(), network.clone(), notifier, max_attempts);
    Fixture {
      engine,
      network,
      outbox,
      sessions,
    }
  }

  fn booking(body: &str) -> RequestDescriptor {
    let mut headers = crate::http::Headers::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers.insert("x-client".to_string(), "kiosk-7".to_string());
    RequestDescriptor {
      url: APPOINTMENTS.to_string(),
      method: "POST".to_string(),
      headers,
      body: Some(body.to_string()),
      priority: Priority::Normal,
    }
  }

  #[tokio::test]
  async fn test_successful_drain_removes_and_broadcasts() {
    let f = setup(0);
    let (_id, mut rx) = f.sessions.connect("http://localhost:3000/index.html").unwrap();
    f.outbox
      .enqueue(SyncTag::Booking, &booking(r#"{"slot":"10:00"}"#))
      .unwrap();
    f.network
      .respond(APPOINTMENTS, Response::new(200, r#"{"id":"apt-1","status":"confirmed"}"#));

    let report = f.engine.drain(SyncTag::Booking).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert!(f.outbox.list_by_tag(SyncTag::Booking).unwrap().is_empty());
    assert_eq!(
      rx.try_recv().unwrap(),
      ClientEvent::AppointmentSynced {
        data: json!({"id": "apt-1", "status": "confirmed"})
      }
    );

    let sent = f.network.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].method, Method::POST);
    assert_eq!(sent[0].body.as_deref(), Some(br#"{"slot":"10:00"}"#.as_slice()));
    assert_eq!(sent[0].headers.get("x-client").map(String::as_str), Some("kiosk-7"));
  }

  #[tokio::test]
  async fn test_failed_entries_stay_queued_independently() {
    let f = setup(0);
    f.outbox.enqueue(SyncTag::Booking, &booking("{}")).unwrap();
    let mut other = booking("{}");
    other.url = "http://localhost:3000/api/appointments/urgent".to_string();
    f.outbox.enqueue(SyncTag::Booking, &other).unwrap();
    f.network.respond(APPOINTMENTS, Response::new(503, "busy"));
    f.network.respond(&other.url, Response::new(201, "{}"));

    let report = f.engine.drain(SyncTag::Booking).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    let remaining = f.outbox.list_by_tag(SyncTag::Booking).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].request.url, APPOINTMENTS);
  }

  #[tokio::test]
  async fn test_duplicate_drain_broadcasts_once() {
    let f = setup(0);
    let (_id, mut rx) = f.sessions.connect("http://localhost:3000/").unwrap();
    f.outbox.enqueue(SyncTag::Booking, &booking("{}")).unwrap();
    f.network.respond(APPOINTMENTS, Response::new(200, "{}"));

    let (first, second) = tokio::join!(
      f.engine.drain(SyncTag::Booking),
      f.engine.drain(SyncTag::Booking)
    );

    assert_eq!(first.unwrap().succeeded + second.unwrap().succeeded, 1);
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_transport_failure_then_recovery() {
    let f = setup(0);
    f.outbox.enqueue(SyncTag::EmergencyAlert, &booking("{}")).unwrap();

    let report = f.engine.drain(SyncTag::EmergencyAlert).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(f.outbox.list_all().unwrap().len(), 1);

    f.network.respond(APPOINTMENTS, Response::new(200, "{}"));
    let report = f.engine.drain_all().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(f.outbox.list_all().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_entry_is_abandoned_after_max_attempts() {
    let f = setup(2);
    let (_id, mut rx) = f.sessions.connect("http://localhost:3000/").unwrap();
    let id = f.outbox.enqueue(SyncTag::Booking, &booking("{bad")).unwrap();
    f.network.respond(APPOINTMENTS, Response::new(400, "malformed"));

    assert_eq!(f.engine.drain(SyncTag::Booking).await.unwrap().failed, 1);
    assert_eq!(f.engine.drain(SyncTag::Booking).await.unwrap().abandoned, 1);

    assert!(f.outbox.list_all().unwrap().is_empty());
    let dead = f.outbox.dead_letters().unwrap();
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(
      rx.try_recv().unwrap(),
      ClientEvent::SyncAbandoned {
        tag: SyncTag::Booking,
        id
      }
    );
  }

  #[test]
  fn test_missing_headers_default_to_json() {
    let entry = Entry {
      id: crate::outbox::EntryId(1),
      tag: SyncTag::EmergencyAlert,
      request: RequestDescriptor {
        url: "http://localhost:3000/api/emergency".to_string(),
        method: "POST".to_string(),
        headers: Default::default(),
        body: Some("{}".to_string()),
        priority: Priority::High,
      },
      enqueued_at: chrono::Utc::now(),
    };

    let request = to_request(&entry).unwrap();
    assert_eq!(
      request.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
  }

  /// Accepts every request and queues one more booking while answering the first.
  struct EnqueueWhileServing {
    outbox: Arc<SqliteOutbox>,
    enqueued: AtomicBool,
  }

  #[async_trait]
  impl Network for EnqueueWhileServing {
    async fn fetch(&self, _request: &Request) -> Result<Response, FetchError> {
      if !self.enqueued.swap(true, Ordering::SeqCst) {
        self
          .outbox
          .enqueue(SyncTag::Booking, &booking(r#"{"slot":"11:00"}"#))
          .map_err(|e| FetchError::Transport {
            url: APPOINTMENTS.to_string(),
            reason: e.to_string(),
          })?;
      }
      Ok(Response::new(200, "{}"))
    }
  }

  #[tokio::test]
  async fn test_entries_queued_during_drain_wait_for_next_trigger() {
    let outbox = Arc::new(SqliteOutbox::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let network = Arc::new(EnqueueWhileServing {
      outbox: outbox.clone(),
      enqueued: AtomicBool::new(false),
    });
    let notifier = ClientNotifier::new(
      Arc::new(Config::default()),
      Arc::new(SessionRegistry::new()),
      network.clone(),
      Arc::new(RecordingOpener::default()),
    );
    let engine = ReplayEngine::new(outbox.clone(), network, notifier, 0);
    let first = outbox
      .enqueue(SyncTag::Booking, &booking(r#"{"slot":"10:00"}"#))
      .unwrap();

    let report = engine.drain(SyncTag::Booking).await.unwrap();

    assert_eq!(report.succeeded, 1);
    let remaining = outbox.list_by_tag(SyncTag::Booking).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].id, first);
    assert_eq!(remaining[0].request.body.as_deref(), Some(r#"{"slot":"11:00"}"#));

    let report = engine.drain(SyncTag::Booking).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(outbox.list_by_tag(SyncTag::Booking).unwrap().is_empty());
  }
}
