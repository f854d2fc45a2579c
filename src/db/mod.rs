//! Durable SQLite database shared by the blob cache, record store and
//! pending-write queue.
//!
//! Each execution context opens its own `Database` on the same file. SQLite
//! transactions give the atomicity and isolation the layers above rely on:
//! every write runs inside one `IMMEDIATE` transaction that is committed only
//! when the body returns `Ok`.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How long a connection waits for the other context's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper
pub struct Database {
  conn: Mutex<Connection>,
  path: Option<PathBuf>,
}

impl Database {
  /// Open (or create) the database at `path` and bring it to `schema_version`
  /// using the built-in upgrade ladder.
  pub fn open(path: &Path, schema_version: u32) -> Result<Self> {
    Self::open_with(path, schema_version, |tx, from| {
      schema::upgrade(tx, from, schema_version)
    })
  }

  /// Open the database with a caller-supplied upgrade function.
  ///
  /// `upgrade` receives the stored version and must bring the schema up to
  /// `schema_version`. It runs inside one transaction, so a failing step
  /// leaves the previous schema untouched.
  pub fn open_with<F>(path: &Path, schema_version: u32, upgrade: F) -> Result<Self>
  where
    F: FnOnce(&Transaction<'_>, u32) -> Result<()>,
  {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StorageUnavailable(format!("Failed to create database directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::StorageUnavailable(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;
    conn
      .busy_timeout(BUSY_TIMEOUT)
      .map_err(|e| Error::StorageUnavailable(format!("Failed to set busy timeout: {}", e)))?;
    let mode: String = conn
      .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
      .map_err(|e| Error::StorageUnavailable(format!("Failed to enable WAL: {}", e)))?;
    debug!(path = %path.display(), journal_mode = %mode, "Opened database");

    let db = Self {
      conn: Mutex::new(conn),
      path: Some(path.to_path_buf()),
    };
    db.run_upgrade(schema_version, upgrade)?;
    Ok(db)
  }

  /// Open a private in-memory database (single context only).
  pub fn open_in_memory(schema_version: u32) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| Error::StorageUnavailable(format!("Failed to open in-memory database: {}", e)))?;
    let db = Self {
      conn: Mutex::new(conn),
      path: None,
    };
    db.run_upgrade(schema_version, |tx, from| {
      schema::upgrade(tx, from, schema_version)
    })?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    Self::path_in(dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share"))))
  }

  /// Database path under `data_dir`. No data directory means no storage.
  pub(crate) fn path_in(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    let data_dir = data_dir.ok_or_else(|| {
      Error::StorageUnavailable("Could not determine data directory".to_string())
    })?;
    Ok(data_dir.join("restocache").join("offline.db"))
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  fn run_upgrade<F>(&self, schema_version: u32, upgrade: F) -> Result<()>
  where
    F: FnOnce(&Transaction<'_>, u32) -> Result<()>,
  {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| Error::SchemaUpgradeFailure(format!("Failed to begin upgrade: {}", e)))?;

    let stored = schema::stored_version(&tx)
      .map_err(|e| Error::SchemaUpgradeFailure(format!("Failed to read schema version: {}", e)))?;

    if stored > schema_version {
      return Err(Error::SchemaUpgradeFailure(format!(
        "Database schema version {} is newer than supported version {}",
        stored, schema_version
      )));
    }
    if stored == schema_version {
      return Ok(());
    }

    upgrade(&tx, stored).map_err(|e| match e {
      Error::SchemaUpgradeFailure(msg) => Error::SchemaUpgradeFailure(msg),
      other => Error::SchemaUpgradeFailure(other.to_string()),
    })?;
    tx.pragma_update(None, "user_version", schema_version)
      .map_err(|e| Error::SchemaUpgradeFailure(format!("Failed to record schema version: {}", e)))?;
    tx.commit()
      .map_err(|e| Error::SchemaUpgradeFailure(format!("Failed to commit upgrade: {}", e)))?;

    info!(from = stored, to = schema_version, "Upgraded database schema");
    Ok(())
  }

  /// Stored schema version
  pub fn schema_version(&self) -> Result<u32> {
    let conn = self.lock()?;
    Ok(schema::stored_version(&conn)?)
  }

  /// Run `f` inside a read transaction so it sees one consistent snapshot.
  pub fn read<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let value = f(&tx)?;
    tx.finish()?;
    Ok(value)
  }

  /// Run `f` inside a write transaction. Any error rolls back every write
  /// made by `f`; nothing is visible to later reads.
  pub fn write<T, F>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
  {
    let mut conn = self.lock()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
  }
}

/// Fixed-width UTC timestamp, so stored values sort lexicographically
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Config(format!("Failed to parse datetime '{}': {}", s, e)))
}
