//! Connected client sessions and the events delivered to them.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::outbox::{EntryId, SyncTag};

/// Event posted to client sessions, serialized with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
  Activated { version: String },
  AppointmentSynced { data: Value },
  EmergencyAlertSynced { data: Value },
  SymptomAnalysisSynced { data: Value },
  OfflineActionSynced { data: Value },
  SyncAbandoned { tag: SyncTag, id: EntryId },
  Focus { url: String },
}

impl ClientEvent {
  /// Success event for a replayed entry of `tag`.
  pub fn synced(tag: SyncTag, data: Value) -> Self {
    match tag {
      SyncTag::Booking => Self::AppointmentSynced { data },
      SyncTag::EmergencyAlert => Self::EmergencyAlertSynced { data },
      SyncTag::SymptomAnalysis => Self::SymptomAnalysisSynced { data },
      SyncTag::Generic => Self::OfflineActionSynced { data },
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "session-{}", self.0)
  }
}

/// Snapshot of a connected session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
  pub id: SessionId,
  pub url: String,
  /// Whether this process has taken control of the session
  pub controlled: bool,
}

struct SessionHandle {
  info: SessionInfo,
  tx: mpsc::UnboundedSender<ClientEvent>,
}

/// Currently connected client sessions.
///
/// Sessions that connect after an event was sent never see it.
#[derive(Default)]
pub struct SessionRegistry {
  sessions: Mutex<Vec<SessionHandle>>,
  next_id: AtomicU64,
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a session showing `url`; events arrive on the returned receiver.
  pub fn connect(&self, url: &str) -> Result<(SessionId, mpsc::UnboundedReceiver<ClientEvent>)> {
    let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
    let (tx, rx) = mpsc::unbounded_channel();

    self.lock()?.push(SessionHandle {
      info: SessionInfo {
        id,
        url: url.to_string(),
        controlled: false,
      },
      tx,
    });

    debug!(%id, %url, "session connected");
    Ok((id, rx))
  }

  pub fn disconnect(&self, id: SessionId) -> Result<bool> {
    let mut sessions = self.lock()?;
    let before = sessions.len();
    sessions.retain(|s| s.info.id != id);
    Ok(sessions.len() < before)
  }

  pub fn list(&self) -> Result<Vec<SessionInfo>> {
    Ok(self.lock()?.iter().map(|s| s.info.clone()).collect())
  }

  /// Take control of every open session. Returns how many were newly claimed.
  pub fn claim(&self) -> Result<usize> {
    let mut sessions = self.lock()?;
    let mut claimed = 0;
    for session in sessions.iter_mut().filter(|s| !s.info.controlled) {
      session.info.controlled = true;
      claimed += 1;
    }
    Ok(claimed)
  }

  /// First session whose URL equals `url` exactly.
  pub fn find_by_url(&self, url: &str) -> Result<Option<SessionId>> {
    Ok(
      self
        .lock()?
        .iter()
        .find(|s| s.info.url == url)
        .map(|s| s.info.id),
    )
  }

  /// Deliver to one session. Returns false if it is gone.
  pub fn send(&self, id: SessionId, event: ClientEvent) -> Result<bool> {
    let mut sessions = self.lock()?;
    let Some(position) = sessions.iter().position(|s| s.info.id == id) else {
      return Ok(false);
    };
    if sessions[position].tx.send(event).is_ok() {
      return Ok(true);
    }
    sessions.remove(position);
    Ok(false)
  }

  /// Ask a session to bring itself to the front at `url`.
  pub fn focus(&self, id: SessionId, url: &str) -> Result<bool> {
    self.send(
      id,
      ClientEvent::Focus {
        url: url.to_string(),
      },
    )
  }

  /// Deliver to every connected session, dropping sessions whose receiver is
  /// gone. Returns the number of deliveries.
  pub fn broadcast(&self, event: &ClientEvent) -> Result<usize> {
    let mut sessions = self.lock()?;
    sessions.retain(|s| s.tx.send(event.clone()).is_ok());
    Ok(sessions.len())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<SessionHandle>>> {
    self
      .sessions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Platform hook for opening a new client session at a URL.
#[async_trait]
pub trait WindowOpener: Send + Sync {
  async fn open(&self, url: &str) -> Result<()>;
}

/// Opener for headless hosts: records the navigation in the log.
pub struct LoggingOpener;

#[async_trait]
impl WindowOpener for LoggingOpener {
  async fn open(&self, url: &str) -> Result<()> {
    info!(%url, "open window");
    Ok(())
  }
}
