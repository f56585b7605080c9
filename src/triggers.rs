//! Sync trigger registrations: the intents that wake the replay engine.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::outbox::SyncTag;

/// Name of the single periodic registration.
pub const PERIODIC_SYNC: &str = "data-sync";

/// Platform facility that records sync intents and later delivers them.
pub trait TriggerRegistry: Send + Sync {
  /// Ask to be woken for `tag` once connectivity returns.
  fn register_sync(&self, tag: SyncTag) -> Result<()>;

  /// Register a periodic wake-up. Returns `false` when the platform has no
  /// periodic facility, which callers treat as a no-op.
  fn register_periodic(&self, name: &str, min_interval: Duration) -> Result<bool>;
}

/// In-process registry consumed by the runtime loop.
pub struct TriggerBoard {
  state: Mutex<BoardState>,
  periodic_supported: bool,
}

#[derive(Default)]
struct BoardState {
  pending: HashSet<SyncTag>,
  periodic: Option<(String, Duration)>,
}

impl BoardState {
  fn pending_in_drain_order(&self) -> Vec<SyncTag> {
    SyncTag::ALL
      .into_iter()
      .filter(|tag| self.pending.contains(tag))
      .collect()
  }
}

impl TriggerBoard {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(BoardState::default()),
      periodic_supported: true,
    }
  }

  /// A board whose platform has no periodic facility.
  #[cfg(test)]
  pub fn without_periodic() -> Self {
    Self {
      state: Mutex::new(BoardState::default()),
      periodic_supported: false,
    }
  }

  /// Consume every pending one-shot registration, emergencies first.
  pub fn take_pending(&self) -> Result<Vec<SyncTag>> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let pending = state.pending_in_drain_order();
    state.pending.clear();
    Ok(pending)
  }

  #[cfg(test)]
  pub fn pending(&self) -> Result<Vec<SyncTag>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(state.pending_in_drain_order())
  }

  /// Current periodic registration, if any.
  pub fn periodic(&self) -> Result<Option<(String, Duration)>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(state.periodic.clone())
  }
}

impl Default for TriggerBoard {
  fn default() -> Self {
    Self::new()
  }
}

impl TriggerRegistry for TriggerBoard {
  fn register_sync(&self, tag: SyncTag) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    state.pending.insert(tag);
    Ok(())
  }

  fn register_periodic(&self, name: &str, min_interval: Duration) -> Result<bool> {
    if !self.periodic_supported {
      return Ok(false);
    }
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    state.periodic = Some((name.to_string(), min_interval));
    Ok(true)
  }
}
