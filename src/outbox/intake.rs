//! Mutation intake: send now, or queue and acknowledge optimistically.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::store::OutboxStore;
use super::types::{RequestDescriptor, SyncTag};
use crate::config::Config;
use crate::http::{Network, Request, Response, Served};
use crate::triggers::TriggerRegistry;

/// Handles non-GET requests.
///
/// Requests matching a mutation route are tried against the network first;
/// on failure they are queued and the caller gets an immediate 202. All other
/// mutations pass straight through.
#[derive(Clone)]
pub struct OutboxIntake {
  config: Arc<Config>,
  outbox: Arc<dyn OutboxStore>,
  network: Arc<dyn Network>,
  triggers: Arc<dyn TriggerRegistry>,
}

impl OutboxIntake {
  pub fn new(
    config: Arc<Config>,
    outbox: Arc<dyn OutboxStore>,
    network: Arc<dyn Network>,
    triggers: Arc<dyn TriggerRegistry>,
  ) -> Self {
    Self {
      config,
      outbox,
      network,
      triggers,
    }
  }

  pub async fn handle(&self, request: &Request) -> Result<Served> {
    let tag = if self.config.is_allowed_origin(&request.url) {
      self
        .config
        .mutation_tag(request.method.as_str(), request.url.path())
    } else {
      None
    };

    let Some(tag) = tag else {
      debug!(method = %request.method, url = %request.url, "mutation passes through");
      let response = self
        .network
        .fetch(request)
        .await
        .map_err(|e| eyre!(e))?;
      return Ok(Served::passthrough(response));
    };

    match self.network.fetch(request).await {
      // Bookings are only confirmed by a 2xx; other classes accept any answer
      Ok(response) if response.is_success() || tag != SyncTag::Booking => {
        Ok(Served::from_network(response))
      }
      Ok(response) => {
        info!(%tag, status = response.status, "server rejected mutation, queuing for sync");
        self.queue(tag, request)
      }
      Err(e) => {
        info!(%tag, error = %e, "mutation failed, queuing for sync");
        self.queue(tag, request)
      }
    }
  }

  /// Persist, register the trigger, and return the optimistic acknowledgement.
  fn queue(&self, tag: SyncTag, request: &Request) -> Result<Served> {
    let descriptor = RequestDescriptor::from_request(request, tag.priority());
    let id = self.outbox.enqueue(tag, &descriptor)?;
    debug!(%tag, %id, "queued");

    // The entry is durable; a missed registration is picked up by the next periodic sync
    if let Err(e) = self.triggers.register_sync(tag) {
      warn!(%tag, error = %e, "failed to register sync trigger");
    }

    Ok(Served::synthetic(optimistic_response(tag)))
  }
}

/// HTTP 202 acknowledgement for a queued mutation.
pub fn optimistic_response(tag: SyncTag) -> Response {
  let body = match tag {
    SyncTag::Booking => json!({
      "success": true,
      "id": format!("offline-{}", Utc::now().timestamp_millis()),
      "status": "pending-sync",
      "message": "Appointment will be confirmed when online",
    }),
    SyncTag::EmergencyAlert => json!({
      "success": true,
      "message": "Emergency alert will be sent when online",
      "status": "queued",
    }),
    SyncTag::SymptomAnalysis => json!({
      "success": true,
      "message": "Symptom analysis will be submitted when online",
      "status": "queued",
    }),
    SyncTag::Generic => json!({
      "success": true,
      "message": "Request will be sent when online",
      "status": "queued",
    }),
  };
  Response::json(202, &body)
}
