//! Partition storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use super::traits::{key_hash, CachedResponse};
use crate::db::Database;
use crate::http::{Headers, Response};

/// Named, durable key -> response mappings.
///
/// Every method is a single atomic operation per key; there are no cross-key
/// transactions, and concurrent writers resolve as "latest wins".
pub trait PartitionStore: Send + Sync {
  /// Create the partition if it does not exist.
  fn open(&self, partition: &str) -> Result<()>;

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>>;

  /// Insert or replace the entry for `key`. Opens the partition if needed.
  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()>;

  /// Returns whether an entry was removed.
  fn delete(&self, partition: &str, key: &str) -> Result<bool>;

  fn keys(&self, partition: &str) -> Result<Vec<String>>;

  /// Drop a partition and all of its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  fn partition_names(&self) -> Result<Vec<String>>;
}

/// SQLite-based partition storage.
pub struct SqlitePartitionStore {
  db: Arc<Database>,
}

impl SqlitePartitionStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl PartitionStore for SqlitePartitionStore {
  fn open(&self, partition: &str) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
        params![partition, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;
    Ok(())
  }

  fn get(&self, partition: &str, key: &str) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM partition_entries
         WHERE partition = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![partition, key_hash(key)], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", key, partition, e))?;

    match row {
      Some((status, headers, body, cached_at)) => {
        let headers: Headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;
        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, key: &str, response: &Response) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let now = Utc::now().to_rfc3339();

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO partitions (name, created_at) VALUES (?, ?)",
        params![partition, now],
      )
      .map_err(|e| eyre!("Failed to open partition {}: {}", partition, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO partition_entries (partition, key_hash, key, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          partition,
          key_hash(key),
          key,
          response.status,
          headers,
          response.body,
          now
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key, partition, e))?;

    Ok(())
  }

  fn delete(&self, partition: &str, key: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM partition_entries WHERE partition = ? AND key_hash = ?",
        params![partition, key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to delete {} from {}: {}", key, partition, e))?;
    Ok(removed > 0)
  }

  fn keys(&self, partition: &str) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM partition_entries WHERE partition = ? ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read keys of {}: {}", partition, e))?;

    Ok(keys)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let conn = self.db.conn()?;
    // Entries go with the partition via ON DELETE CASCADE
    let removed = conn
      .execute("DELETE FROM partitions WHERE name = ?", params![partition])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", partition, e))?;
    Ok(removed > 0)
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read partition names: {}", e))?;

    Ok(names)
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
