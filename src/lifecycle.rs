//! Install/activate passes: partition warm-up, version eviction and trigger arming.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{Dispatcher, PartitionStore, ResourceClass};
use crate::config::Config;
use crate::notify::{ClientEvent, ClientNotifier};
use crate::outbox::{DrainReport, OutboxStore, ReplayEngine, SyncTag};
use crate::triggers::{TriggerRegistry, PERIODIC_SYNC};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub essential: usize,
  pub api_warmed: usize,
  pub images_warmed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  /// Partitions from superseded versions that were deleted
  pub evicted: Vec<String>,
  /// Sessions newly taken under control
  pub claimed: usize,
  pub periodic_armed: bool,
  /// Tags re-armed because they still have queued entries
  pub rearmed: Vec<SyncTag>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodicReport {
  pub drain: DrainReport,
  pub api_refreshed: usize,
}

/// Owns partition versioning and arms the replay triggers.
pub struct LifecycleController {
  config: Arc<Config>,
  store: Arc<dyn PartitionStore>,
  dispatcher: Dispatcher,
  outbox: Arc<dyn OutboxStore>,
  replay: ReplayEngine,
  notifier: ClientNotifier,
  triggers: Arc<dyn TriggerRegistry>,
}

impl LifecycleController {
  pub fn new(
    config: Arc<Config>,
    store: Arc<dyn PartitionStore>,
    dispatcher: Dispatcher,
    outbox: Arc<dyn OutboxStore>,
    replay: ReplayEngine,
    notifier: ClientNotifier,
    triggers: Arc<dyn TriggerRegistry>,
  ) -> Self {
    Self {
      config,
      store,
      dispatcher,
      outbox,
      replay,
      notifier,
      triggers,
    }
  }

  fn current_partitions(&self) -> Vec<String> {
    ResourceClass::ALL
      .iter()
      .map(|class| self.config.partition_name(class.as_str()))
      .collect()
  }

  /// Open every partition and pre-populate it.
  ///
  /// The essential manifest is all-or-nothing and its failure fails the
  /// install; API and image warm-up are best-effort.
  pub async fn on_install(&self) -> Result<InstallReport> {
    info!(version = %self.config.version, "installing");

    for partition in self.current_partitions() {
      self.store.open(&partition)?;
    }

    let (essential, api_warmed, images_warmed) = tokio::join!(
      self
        .dispatcher
        .warm_all_or_nothing(ResourceClass::Static, &self.config.essential_resources),
      self
        .dispatcher
        .warm(ResourceClass::Api, &self.config.api_endpoints),
      self
        .dispatcher
        .warm(ResourceClass::Image, &self.config.image_resources),
    );

    let report = InstallReport {
      essential: essential?,
      api_warmed: api_warmed.unwrap_or_else(|e| {
        warn!(error = %e, "api warm-up failed");
        0
      }),
      images_warmed: images_warmed.unwrap_or_else(|e| {
        warn!(error = %e, "image warm-up failed");
        0
      }),
    };

    info!(
      essential = report.essential,
      api = report.api_warmed,
      images = report.images_warmed,
      "install complete"
    );
    Ok(report)
  }

  /// Evict stale partitions, claim sessions, arm triggers, announce activation.
  pub async fn on_activate(&self) -> Result<ActivationReport> {
    let valid: HashSet<String> = self.current_partitions().into_iter().collect();

    let mut evicted = Vec::new();
    for name in self.store.partition_names()? {
      if !valid.contains(&name) {
        info!(partition = %name, "deleting old partition");
        if self.store.delete_partition(&name)? {
          evicted.push(name);
        }
      }
    }

    let claimed = self.notifier.sessions().claim()?;

    let periodic_armed = match self
      .triggers
      .register_periodic(PERIODIC_SYNC, self.config.sync.periodic_interval())
    {
      Ok(armed) => armed,
      Err(e) => {
        warn!(error = %e, "periodic sync registration failed");
        false
      }
    };

    let pending: HashSet<SyncTag> = self
      .outbox
      .list_all()?
      .into_iter()
      .map(|entry| entry.tag)
      .collect();
    let mut rearmed = Vec::new();
    for tag in SyncTag::ALL.into_iter().filter(|tag| pending.contains(tag)) {
      self.triggers.register_sync(tag)?;
      rearmed.push(tag);
    }

    self.notifier.broadcast(&ClientEvent::Activated {
      version: self.config.version.clone(),
    });

    info!(evicted = evicted.len(), claimed, periodic_armed, "activated");
    Ok(ActivationReport {
      evicted,
      claimed,
      periodic_armed,
      rearmed,
    })
  }

  /// Periodic tick: drain every tag, then refresh the API partition.
  pub async fn periodic_sync(&self) -> Result<PeriodicReport> {
    info!("performing periodic data sync");
    let drain = self.replay.drain_all().await?;
    let api_refreshed = self.dispatcher.refresh_api_cache().await?;
    Ok(PeriodicReport {
      drain,
      api_refreshed,
    })
  }
}
