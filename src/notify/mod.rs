//! Client notifier: session broadcasts, push notification rendering and
//! notification action routing.

mod render;
mod sessions;

pub use render::{parse_payload, render_notification, Notification};
pub use sessions::{ClientEvent, LoggingOpener, SessionId, SessionRegistry, WindowOpener};

use chrono::Utc;
use color_eyre::Result;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::http::{Network, Request};

/// What a notification action resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
  /// An open session already showed the target and was focused
  Focused(SessionId),
  /// No session matched; a new one was opened at this URL
  Opened(String),
  /// A background call was issued; no navigation
  SideEffect,
}

#[derive(Clone)]
pub struct ClientNotifier {
  config: Arc<Config>,
  sessions: Arc<SessionRegistry>,
  network: Arc<dyn Network>,
  opener: Arc<dyn WindowOpener>,
}

impl ClientNotifier {
  pub fn new(
    config: Arc<Config>,
    sessions: Arc<SessionRegistry>,
    network: Arc<dyn Network>,
    opener: Arc<dyn WindowOpener>,
  ) -> Self {
    Self {
      config,
      sessions,
      network,
      opener,
    }
  }

  pub fn sessions(&self) -> &Arc<SessionRegistry> {
    &self.sessions
  }

  /// Best-effort delivery to every connected session. Returns the number of
  /// sessions reached.
  pub fn broadcast(&self, event: &ClientEvent) -> usize {
    match self.sessions.broadcast(event) {
      Ok(delivered) => {
        debug!(?event, delivered, "broadcast");
        delivered
      }
      Err(e) => {
        warn!(error = %e, "broadcast failed");
        0
      }
    }
  }

  /// Render a raw push payload with the configured defaults.
  pub fn render_notification(&self, raw: Option<&[u8]>) -> Notification {
    render_notification(&self.config.notifications, &parse_payload(raw))
  }

  /// Carry out the user's choice on a notification (`None` = the body was clicked).
  pub async fn route_action(&self, action: Option<&str>, payload: &Value) -> Result<ActionOutcome> {
    let root = self.config.root_document.as_str();
    let target = match action {
      Some("confirm") => format!("{}#appointments", root),
      Some("reschedule") => format!("{}#appointments?action=reschedule", root),
      Some("taken") => {
        self.log_medicine_taken(payload);
        return Ok(ActionOutcome::SideEffect);
      }
      _ => payload
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or(root)
        .to_string(),
    };

    let url = self.config.resolve(&target)?.to_string();

    if let Some(id) = self.sessions.find_by_url(&url)? {
      if self.sessions.focus(id, &url)? {
        debug!(%id, %url, "focused existing session");
        return Ok(ActionOutcome::Focused(id));
      }
    }

    self.opener.open(&url).await?;
    Ok(ActionOutcome::Opened(url))
  }

  /// Fire-and-forget `POST /api/medicine/log`; failures are only logged.
  fn log_medicine_taken(&self, payload: &Value) {
    let url = match self.config.resolve("/api/medicine/log") {
      Ok(url) => url,
      Err(e) => {
        warn!(error = %e, "cannot build medicine log url");
        return;
      }
    };
    let body = json!({
      "medicine": payload.get("medicine").cloned().unwrap_or(Value::Null),
      "timestamp": Utc::now().timestamp_millis(),
      "action": "taken",
    });
    let request = Request::new(Method::POST, url)
      .with_header("content-type", "application/json")
      .with_body(body.to_string());
    let network = Arc::clone(&self.network);

    tokio::spawn(async move {
      match network.fetch(&request).await {
        Ok(response) => debug!(status = response.status, "medicine intake logged"),
        Err(e) => warn!(error = %e, "failed to log medicine intake"),
      }
    });
  }
}
