//! Durable outbox storage trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::warn;

use super::types::{DeadLetter, Entry, EntryId, RequestDescriptor, SyncTag};
use crate::cache::parse_datetime;
use crate::db::Database;

/// Durable queue of mutations awaiting confirmed delivery.
///
/// Listing order is unspecified; callers must not assume FIFO.
pub trait OutboxStore: Send + Sync {
  /// Persist a new entry. Storage errors are returned, never swallowed.
  fn enqueue(&self, tag: SyncTag, request: &RequestDescriptor) -> Result<EntryId>;

  fn list_by_tag(&self, tag: SyncTag) -> Result<Vec<Entry>>;

  fn list_all(&self) -> Result<Vec<Entry>>;

  /// Idempotent. Returns whether this call removed the entry.
  fn remove_by_id(&self, id: EntryId) -> Result<bool>;

  /// Record a failed replay; returns the total number of failed attempts,
  /// or 0 when the entry is no longer queued.
  fn record_failure(&self, id: EntryId, error: &str) -> Result<u32>;

  /// Move an entry to the dead-letter table. Returns whether it was still queued.
  fn dead_letter(&self, id: EntryId, error: &str) -> Result<bool>;

  fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

/// SQLite-based outbox.
pub struct SqliteOutbox {
  db: Arc<Database>,
}

impl SqliteOutbox {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  fn query_entries(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Entry>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let rows: Vec<(i64, String, String, String)> = stmt
      .query_map(args, |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to scan outbox: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

    let mut entries = Vec::with_capacity(rows.len());
    for (id, tag, data, timestamp) in rows {
      // Rows written by a newer schema are left for that version to handle
      let tag = match tag.parse::<SyncTag>() {
        Ok(tag) => tag,
        Err(e) => {
          warn!(id, error = %e, "skipping outbox entry");
          continue;
        }
      };
      let request: RequestDescriptor = serde_json::from_str(&data)
        .map_err(|e| eyre!("Failed to deserialize outbox entry {}: {}", id, e))?;
      entries.push(Entry {
        id: EntryId(id),
        tag,
        request,
        enqueued_at: parse_datetime(&timestamp)?,
      });
    }

    Ok(entries)
  }
}

impl OutboxStore for SqliteOutbox {
  fn enqueue(&self, tag: SyncTag, request: &RequestDescriptor) -> Result<EntryId> {
    let data =
      serde_json::to_string(request).map_err(|e| eyre!("Failed to serialize request: {}", e))?;

    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO outbox (tag, data, timestamp) VALUES (?, ?, ?)",
        params![tag.as_str(), data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue {} request: {}", tag, e))?;

    Ok(EntryId(conn.last_insert_rowid()))
  }

  fn list_by_tag(&self, tag: SyncTag) -> Result<Vec<Entry>> {
    self.query_entries(
      "SELECT id, tag, data, timestamp FROM outbox WHERE tag = ?",
      &[&tag.as_str()],
    )
  }

  fn list_all(&self) -> Result<Vec<Entry>> {
    self.query_entries("SELECT id, tag, data, timestamp FROM outbox ORDER BY id", &[])
  }

  fn remove_by_id(&self, id: EntryId) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let removed = tx
      .execute("DELETE FROM outbox WHERE id = ?", params![id.0])
      .map_err(|e| eyre!("Failed to remove outbox entry {}: {}", id, e))?;
    tx.execute(
      "DELETE FROM outbox_attempts WHERE entry_id = ?",
      params![id.0],
    )
    .map_err(|e| eyre!("Failed to clear attempts for {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn record_failure(&self, id: EntryId, error: &str) -> Result<u32> {
    // Rows for an entry another drain already removed would never be cleared
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO outbox_attempts (entry_id, attempted_at, error)
         SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM outbox WHERE id = ?1)",
        params![id.0, Utc::now().to_rfc3339(), error],
      )
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", id, e))?;

    let attempts: u32 = conn
      .query_row(
        "SELECT COUNT(*) FROM outbox_attempts WHERE entry_id = ?",
        params![id.0],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count attempts for {}: {}", id, e))?;

    Ok(attempts)
  }

  fn dead_letter(&self, id: EntryId, error: &str) -> Result<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO dead_letters (id, tag, data, timestamp, attempts, last_error, abandoned_at)
       SELECT o.id, o.tag, o.data, o.timestamp,
              (SELECT COUNT(*) FROM outbox_attempts a WHERE a.entry_id = o.id), ?, ?
       FROM outbox o WHERE o.id = ?",
      params![error, Utc::now().to_rfc3339(), id.0],
    )
    .map_err(|e| eyre!("Failed to dead-letter entry {}: {}", id, e))?;

    let removed = tx
      .execute("DELETE FROM outbox WHERE id = ?", params![id.0])
      .map_err(|e| eyre!("Failed to remove outbox entry {}: {}", id, e))?;
    tx.execute(
      "DELETE FROM outbox_attempts WHERE entry_id = ?",
      params![id.0],
    )
    .map_err(|e| eyre!("Failed to clear attempts for {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, tag, data, timestamp, attempts, last_error, abandoned_at
         FROM dead_letters ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare dead-letter query: {}", e))?;

    let rows = stmt
      .query_map([], dead_letter_row)
      .map_err(|e| eyre!("Failed to scan dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read dead letter: {}", e))?;

    rows
      .into_iter()
      .map(|(id, tag, data, timestamp, attempts, last_error, abandoned_at)| {
        Ok(DeadLetter {
          id: EntryId(id),
          tag: tag.parse()?,
          request: serde_json::from_str(&data)
            .map_err(|e| eyre!("Failed to deserialize dead letter {}: {}", id, e))?,
          enqueued_at: parse_datetime(&timestamp)?,
          attempts,
          last_error,
          abandoned_at: parse_datetime(&abandoned_at)?,
        })
      })
      .collect()
  }
}

type DeadLetterRow = (i64, String, String, String, u32, String, String);

fn dead_letter_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}
