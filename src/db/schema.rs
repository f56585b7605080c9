/// Schema for partitions and the outbox.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named cache partitions (one per resource class and version)
CREATE TABLE IF NOT EXISTS partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Partition entries keyed by sha256(normalized url)
CREATE TABLE IF NOT EXISTS partition_entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (partition, key_hash),
    FOREIGN KEY (partition) REFERENCES partitions(name) ON DELETE CASCADE
);

-- Pending mutations awaiting confirmed delivery
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_tag ON outbox(tag);

-- Failed replay attempts; entries themselves are never updated
CREATE TABLE IF NOT EXISTS outbox_attempts (
    entry_id INTEGER NOT NULL,
    attempted_at TEXT NOT NULL,
    error TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_attempts_entry ON outbox_attempts(entry_id);

-- Entries that exhausted their replay attempts
CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY,
    tag TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    abandoned_at TEXT NOT NULL
);
"#;
