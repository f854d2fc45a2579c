//! Additive schema ladder keyed by `PRAGMA user_version`.

use rusqlite::Connection;

use crate::error::Result;

/// Schema version this build expects
pub const CURRENT_VERSION: u32 = 4;

struct Step {
  version: u32,
  sql: &'static str,
}

/// Ordered upgrade steps. Each step only adds tables or indexes, so any
/// stored version can fall through every later step in one go.
const STEPS: &[Step] = &[
  Step {
    version: 1,
    sql: r#"
-- Structured records, one row per (collection, id)
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (collection, id)
);

-- Secondary index entries maintained alongside each record
CREATE TABLE IF NOT EXISTS record_indexes (
    collection TEXT NOT NULL,
    index_name TEXT NOT NULL,
    value TEXT NOT NULL,
    id TEXT NOT NULL,
    PRIMARY KEY (collection, index_name, id)
);

CREATE INDEX IF NOT EXISTS idx_record_indexes_lookup
    ON record_indexes(collection, index_name, value);
"#,
  },
  Step {
    version: 2,
    sql: r#"
-- Which collections (or per-catalog review sets) have been populated
CREATE TABLE IF NOT EXISTS population (
    population_key TEXT PRIMARY KEY,
    populated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
  },
  Step {
    version: 3,
    sql: r#"
-- Deferred user writes awaiting acknowledgement from the origin
CREATE TABLE IF NOT EXISTS pending_mutations (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    target_id INTEGER NOT NULL,
    payload TEXT NOT NULL,
    client_token TEXT NOT NULL,
    accepted_at TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    leased_until TEXT
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_status
    ON pending_mutations(status, target_id);
"#,
  },
  Step {
    version: 4,
    sql: r#"
-- Response bodies keyed by request identity, scoped to a generation
CREATE TABLE IF NOT EXISTS blob_cache (
    generation TEXT NOT NULL,
    url_hash TEXT NOT NULL,
    path_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, url_hash)
);

CREATE INDEX IF NOT EXISTS idx_blob_cache_path
    ON blob_cache(path_hash, generation);
"#,
  },
];

/// Read the stored schema version (0 for a fresh database)
pub fn stored_version(conn: &Connection) -> Result<u32> {
  Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Apply every step newer than `from` up to and including `to`.
pub fn upgrade(conn: &Connection, from: u32, to: u32) -> Result<()> {
  for step in STEPS.iter().filter(|s| s.version > from && s.version <= to) {
    conn.execute_batch(step.sql)?;
  }
  Ok(())
}
