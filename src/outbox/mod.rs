//! Durable outbox for mutations issued while offline, and the replay engine
//! that delivers them once a trigger fires.

mod intake;
mod replay;
mod store;
mod types;

pub use intake::OutboxIntake;
pub use replay::{DrainReport, ReplayEngine};
pub use store::{OutboxStore, SqliteOutbox};
pub use types::{EntryId, SyncTag};

#[cfg(test)]
pub use types::{Priority, RequestDescriptor};
