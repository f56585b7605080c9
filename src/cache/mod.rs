//! Partitioned response cache and the strategy dispatcher.
//!
//! This module provides:
//! - Durable named partitions (static, dynamic, image, api) keyed by normalized URL
//! - Request classification into those resource classes
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Degraded responses when neither network nor cache can answer

mod classify;
mod dispatcher;
mod fallback;
mod storage;
mod traits;

pub use dispatcher::Dispatcher;
pub use storage::{PartitionStore, SqlitePartitionStore};
pub use traits::ResourceClass;
#[cfg(test)]
pub use traits::cache_key;

pub(crate) use storage::parse_datetime;
