//! Connectivity probe and trigger loop.
//!
//! Stands in for the host platform: it watches connectivity, fires the sync
//! triggers queued on the [`TriggerBoard`] once the network is reachable, and
//! runs the periodic sync on its registered interval. Every online probe also
//! re-arms the tags that still have queued entries, since other processes
//! share the outbox but not this board.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::http::{Network, Request};
use crate::lifecycle::LifecycleController;
use crate::outbox::{OutboxStore, ReplayEngine, SyncTag};
use crate::triggers::{TriggerBoard, TriggerRegistry};

pub struct TriggerLoop {
  config: Arc<Config>,
  network: Arc<dyn Network>,
  triggers: Arc<TriggerBoard>,
  outbox: Arc<dyn OutboxStore>,
  replay: ReplayEngine,
  lifecycle: Arc<LifecycleController>,
  probe_interval: Duration,
  /// Tags with a drain in flight; a tag is never drained twice at once
  draining: Arc<Mutex<HashSet<SyncTag>>>,
}

impl TriggerLoop {
  pub fn new(
    config: Arc<Config>,
    network: Arc<dyn Network>,
    triggers: Arc<TriggerBoard>,
    outbox: Arc<dyn OutboxStore>,
    replay: ReplayEngine,
    lifecycle: Arc<LifecycleController>,
  ) -> Self {
    let probe_interval = config.sync.probe_interval();
    Self {
      config,
      network,
      triggers,
      outbox,
      replay,
      lifecycle,
      probe_interval,
      draining: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  #[cfg(test)]
  fn with_probe_interval(mut self, probe_interval: Duration) -> Self {
    self.probe_interval = probe_interval;
    self
  }

  /// Any HTTP answer from the health endpoint counts as online.
  pub async fn probe(&self) -> bool {
    let url = match self.config.resolve(&self.config.sync.health_path) {
      Ok(url) => url,
      Err(e) => {
        warn!(error = %e, "invalid health path");
        return false;
      }
    };
    match self.network.fetch(&Request::get(url)).await {
      Ok(response) => {
        debug!(status = response.status, "probe answered");
        true
      }
      Err(e) => {
        debug!(error = %e, "probe failed");
        false
      }
    }
  }

  /// Run until `shutdown` resolves.
  pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
    let mut online = self.probe().await;
    info!(online, "trigger loop started");
    if online {
      self.fire_pending()?;
    }

    let mut probe = time::interval_at(Instant::now() + self.probe_interval, self.probe_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut periodic = self.triggers.periodic()?.map(|(name, period)| {
      info!(%name, ?period, "periodic sync armed");
      let mut interval = time::interval_at(Instant::now() + period, period);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval
    });

    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("trigger loop stopping");
          break;
        }
        _ = probe.tick() => {
          let reachable = self.probe().await;
          match (online, reachable) {
            (false, true) => info!("connectivity restored"),
            (true, false) => info!("connectivity lost"),
            _ => {}
          }
          online = reachable;
          if online {
            self.fire_pending()?;
          }
        }
        _ = next_tick(&mut periodic) => {
          self.fire_periodic();
        }
      }
    }

    Ok(())
  }

  /// Register a sync for every tag that has queued entries.
  fn rearm_from_outbox(&self) -> Result<()> {
    let queued: HashSet<SyncTag> = self
      .outbox
      .list_all()?
      .into_iter()
      .map(|entry| entry.tag)
      .collect();
    for tag in SyncTag::ALL.into_iter().filter(|tag| queued.contains(tag)) {
      self.triggers.register_sync(tag)?;
    }
    Ok(())
  }

  /// Spawn one drain per pending tag. A tag whose drain leaves entries
  /// behind is re-registered so the next probe retries it.
  fn fire_pending(&self) -> Result<()> {
    if let Err(e) = self.rearm_from_outbox() {
      warn!(error = %e, "failed to re-arm triggers from the outbox");
    }

    for tag in self.triggers.take_pending()? {
      let newly_started = self
        .draining
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?
        .insert(tag);
      if !newly_started {
        debug!(%tag, "drain already running");
        continue;
      }

      info!(%tag, "sync trigger fired");
      let replay = self.replay.clone();
      let triggers = Arc::clone(&self.triggers);
      let draining = Arc::clone(&self.draining);
      tokio::spawn(async move {
        let result = replay.drain(tag).await;
        if let Ok(mut draining) = draining.lock() {
          draining.remove(&tag);
        }
        match result {
          Ok(report) => {
            debug!(%tag, ?report, "drain finished");
            if report.failed > 0 {
              if let Err(e) = triggers.register_sync(tag) {
                warn!(%tag, error = %e, "failed to re-register sync trigger");
              }
            }
          }
          Err(e) => {
            error!(%tag, error = %e, "drain failed");
            if let Err(e) = triggers.register_sync(tag) {
              warn!(%tag, error = %e, "failed to re-register sync trigger");
            }
          }
        }
      });
    }
    Ok(())
  }

  fn fire_periodic(&self) {
    let lifecycle = Arc::clone(&self.lifecycle);
    tokio::spawn(async move {
      match lifecycle.periodic_sync().await {
        Ok(report) => info!(?report, "periodic sync finished"),
        Err(e) => error!(error = %e, "periodic sync failed"),
      }
    });
  }
}

async fn next_tick(interval: &mut Option<Interval>) {
  match interval {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending().await,
  }
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("received Ctrl+C, shutting down"),
    Err(e) => {
      error!(error = %e, "failed to listen for Ctrl+C");
      std::future::pending::<()>().await
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{Dispatcher, SqlitePartitionStore};
  use crate::db::Database;
  use crate::http::Response;
  use crate::notify::{ClientNotifier, SessionRegistry};
  use crate::outbox::{OutboxStore, Priority, RequestDescriptor, SqliteOutbox, SyncTag};
  use crate::testing::{FakeNetwork, RecordingOpener};
  use tokio::sync::oneshot;

  const BOOKING_URL: &str = "http://localhost:3000/api/appointments";

  struct Fixture {
    runtime: TriggerLoop,
    network: Arc<FakeNetwork>,
    outbox: Arc<SqliteOutbox>,
    triggers: Arc<TriggerBoard>,
  }

  fn setup() -> Fixture {
    let config = Arc::new(Config::default());
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = Arc::new(SqlitePartitionStore::new(db.clone()));
    let outbox = Arc::new(SqliteOutbox::new(db));
    let network = Arc::new(FakeNetwork::new());
    let triggers = Arc::new(TriggerBoard::new());
    let notifier = ClientNotifier::new(
      config.clone(),
      Arc::new(SessionRegistry::new()),
      network.clone(),
      Arc::new(RecordingOpener::default()),
    );
    let dispatcher = Dispatcher::new(config.clone(), store.clone(), network.clone());
    let replay = ReplayEngine::new(outbox.clone(), network.clone(), notifier.clone(), 0);
    let lifecycle = Arc::new(LifecycleController::new(
      config.clone(),
      store,
      dispatcher,
      outbox.clone(),
      replay.clone(),
      notifier,
      triggers.clone(),
    ));
    let runtime = TriggerLoop::new(
      config,
      network.clone(),
      triggers.clone(),
      outbox.clone(),
      replay,
      lifecycle,
    )
    .with_probe_interval(Duration::from_millis(10));
    Fixture {
      runtime,
      network,
      outbox,
      triggers,
    }
  }

  fn queue_booking(f: &Fixture) {
    enqueue_booking(&f.outbox);
    f.triggers.register_sync(SyncTag::Booking).unwrap();
  }

  /// Queue a booking without touching this loop's trigger board, the way a
  /// separate `send` process would.
  fn enqueue_booking(outbox: &SqliteOutbox) {
    outbox
      .enqueue(
        SyncTag::Booking,
        &RequestDescriptor {
          url: BOOKING_URL.to_string(),
          method: "POST".to_string(),
          headers: Default::default(),
          body: Some("{}".to_string()),
          priority: Priority::Normal,
        },
      )
      .unwrap();
  }

  async fn wait_until_empty(outbox: &SqliteOutbox) -> bool {
    for _ in 0..200 {
      if outbox.list_all().unwrap().is_empty() {
        return true;
      }
      time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_probe_treats_any_status_as_online() {
    let f = setup();
    assert!(!f.runtime.probe().await);

    f.network
      .respond("http://localhost:3000/", Response::new(500, "down for maintenance"));
    assert!(f.runtime.probe().await);
  }

  #[tokio::test]
  async fn test_drains_pending_tags_when_connectivity_returns() {
    let f = setup();
    queue_booking(&f);
    f.network.respond(BOOKING_URL, Response::new(200, "{}"));
    f.network.set_offline(true);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let network = f.network.clone();
    let outbox = f.outbox.clone();
    let handle = tokio::spawn(f.runtime.run(async move {
      let _ = stop_rx.await;
    }));

    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(outbox.list_all().unwrap().len(), 1);

    network.respond("http://localhost:3000/", Response::new(200, "ok"));
    network.set_offline(false);
    assert!(wait_until_empty(&outbox).await);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_failed_drain_rearms_trigger() {
    let f = setup();
    queue_booking(&f);
    f.network.respond("http://localhost:3000/", Response::new(200, "ok"));
    f.network.respond(BOOKING_URL, Response::new(500, "{}"));

    let network = f.network.clone();
    let outbox = f.outbox.clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(f.runtime.run(async move {
      let _ = stop_rx.await;
    }));

    network.wait_for_request("/api/appointments").await;
    time::sleep(Duration::from_millis(30)).await;
    assert_eq!(outbox.list_all().unwrap().len(), 1);

    network.respond(BOOKING_URL, Response::new(201, "{}"));
    assert!(wait_until_empty(&outbox).await);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_drains_entries_queued_by_another_process() {
    let f = setup();
    f.network.respond("http://localhost:3000/", Response::new(200, "ok"));
    f.network.respond(BOOKING_URL, Response::new(201, "{}"));

    let outbox = f.outbox.clone();
    let triggers = f.triggers.clone();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(f.runtime.run(async move {
      let _ = stop_rx.await;
    }));

    time::sleep(Duration::from_millis(30)).await;
    enqueue_booking(&outbox);
    assert!(triggers.pending().unwrap().is_empty());
    assert!(wait_until_empty(&outbox).await);

    stop_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
  }
}
