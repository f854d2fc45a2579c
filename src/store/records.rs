//! Persistent record store over the shared SQLite database.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

use super::models::CatalogRecord;
use super::traits::{Collection, Mode, PopulationKey, Record};
use crate::db::Database;
use crate::error::{Error, Result};

/// Durable store for catalog and review records.
#[derive(Clone)]
pub struct RecordStore {
  db: Arc<Database>,
}

impl RecordStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  #[cfg(test)]
  pub(crate) fn database(&self) -> &Arc<Database> {
    &self.db
  }

  /// All records of a collection, in insertion order.
  pub fn get_all<R: Record>(&self) -> Result<Vec<R>> {
    self.db.read(|conn| load_all(conn))
  }

  /// A single record by primary key.
  pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
    self.db.read(|conn| load_one(conn, key))
  }

  /// Records whose `index` equals `value`.
  pub fn get_by_index<R: Record>(&self, index: &str, value: &str) -> Result<Vec<R>> {
    self.db.read(|conn| load_by_index(conn, index, value))
  }

  /// Insert or replace a record.
  pub fn put<R: Record>(&self, record: &R) -> Result<()> {
    self.db.write(|conn| store_record(conn, record))
  }

  pub fn count(&self, collection: Collection) -> Result<usize> {
    self.db.read(|conn| count_records(conn, collection))
  }

  /// Run `f` in a transaction scoped to `collections`.
  ///
  /// If `f` returns an error the transaction is rolled back in full.
  pub fn transaction<T, F>(&self, collections: &[Collection], mode: Mode, f: F) -> Result<T>
  where
    F: FnOnce(&StoreTransaction<'_>) -> Result<T>,
  {
    let run = |conn: &Connection| {
      let tx = StoreTransaction {
        conn,
        scope: collections,
        mode,
      };
      f(&tx)
    };
    match mode {
      Mode::ReadOnly => self.db.read(|conn| run(conn)),
      Mode::ReadWrite => self.db.write(|conn| run(conn)),
    }
  }

  pub fn is_populated(&self, key: PopulationKey) -> Result<bool> {
    self.db.read(|conn| is_populated(conn, key))
  }

  /// Forget that `key` was populated so the next read repopulates it.
  pub fn clear_population(&self, key: PopulationKey) -> Result<()> {
    self.db.write(|conn| {
      conn.execute(
        "DELETE FROM population WHERE population_key = ?",
        params![key.as_key()],
      )?;
      Ok(())
    })
  }

  /// Distinct neighborhoods in first-seen order.
  pub fn neighborhoods(&self) -> Result<Vec<String>> {
    let catalog: Vec<CatalogRecord> = self.get_all()?;
    Ok(distinct(catalog.iter().map(|r| r.neighborhood.as_str())))
  }

  /// Distinct cuisines in first-seen order.
  pub fn cuisines(&self) -> Result<Vec<String>> {
    let catalog: Vec<CatalogRecord> = self.get_all()?;
    Ok(distinct(catalog.iter().map(|r| r.cuisine_type.as_str())))
  }

  /// Catalog records matching both filters; `None` means "all".
  pub fn filter_catalog(
    &self,
    cuisine: Option<&str>,
    neighborhood: Option<&str>,
  ) -> Result<Vec<CatalogRecord>> {
    let records: Vec<CatalogRecord> = match neighborhood {
      Some(n) => self.get_by_index("neighborhood", n)?,
      None => self.get_all()?,
    };
    Ok(
      records
        .into_iter()
        .filter(|r| cuisine.map_or(true, |c| r.cuisine_type == c))
        .collect(),
    )
  }
}

pub(crate) fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
  let mut seen = Vec::<String>::new();
  for v in values {
    if !seen.iter().any(|s| s == v) {
      seen.push(v.to_string());
    }
  }
  seen
}

/// A transaction restricted to a declared set of collections.
pub struct StoreTransaction<'a> {
  conn: &'a Connection,
  scope: &'a [Collection],
  mode: Mode,
}

impl<'a> StoreTransaction<'a> {
  fn check_scope(&self, collection: Collection) -> Result<()> {
    if self.scope.contains(&collection) {
      Ok(())
    } else {
      Err(Error::Scope(format!(
        "collection '{}' is not part of this transaction",
        collection.as_str()
      )))
    }
  }

  fn check_writable(&self, collection: Collection) -> Result<()> {
    self.check_scope(collection)?;
    if self.mode == Mode::ReadOnly {
      return Err(Error::Scope(format!(
        "write to '{}' in a read-only transaction",
        collection.as_str()
      )));
    }
    Ok(())
  }

  pub fn get_all<R: Record>(&self) -> Result<Vec<R>> {
    self.check_scope(R::COLLECTION)?;
    load_all(self.conn)
  }

  pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>> {
    self.check_scope(R::COLLECTION)?;
    load_one(self.conn, key)
  }

  pub fn get_by_index<R: Record>(&self, index: &str, value: &str) -> Result<Vec<R>> {
    self.check_scope(R::COLLECTION)?;
    load_by_index(self.conn, index, value)
  }

  pub fn put<R: Record>(&self, record: &R) -> Result<()> {
    self.check_writable(R::COLLECTION)?;
    store_record(self.conn, record)
  }

  pub fn delete(&self, collection: Collection, key: &str) -> Result<bool> {
    self.check_writable(collection)?;
    delete_record(self.conn, collection, key)
  }

  pub fn count(&self, collection: Collection) -> Result<usize> {
    self.check_scope(collection)?;
    count_records(self.conn, collection)
  }

  /// Record that `key` has been fully populated, atomically with the data.
  pub fn mark_populated(&self, key: PopulationKey) -> Result<()> {
    self.check_writable(key.collection())?;
    self.conn.execute(
      "INSERT INTO population (population_key, populated_at) VALUES (?, datetime('now'))
       ON CONFLICT(population_key) DO UPDATE SET populated_at = excluded.populated_at",
      params![key.as_key()],
    )?;
    Ok(())
  }
}

pub(crate) fn load_all<R: Record>(conn: &Connection) -> Result<Vec<R>> {
  let mut stmt = conn.prepare("SELECT data FROM records WHERE collection = ? ORDER BY rowid")?;
  let rows = stmt
    .query_map(params![R::COLLECTION.as_str()], |row| row.get::<_, Vec<u8>>(0))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  rows
    .iter()
    .map(|data| serde_json::from_slice(data).map_err(Error::from))
    .collect()
}

pub(crate) fn load_one<R: Record>(conn: &Connection, key: &str) -> Result<Option<R>> {
  let data: Option<Vec<u8>> = conn
    .query_row(
      "SELECT data FROM records WHERE collection = ? AND id = ?",
      params![R::COLLECTION.as_str(), key],
      |row| row.get(0),
    )
    .optional()?;
  match data {
    Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
    None => Ok(None),
  }
}

pub(crate) fn load_by_index<R: Record>(conn: &Connection, index: &str, value: &str) -> Result<Vec<R>> {
  if !R::COLLECTION.indexes().contains(&index) {
    return Err(Error::NotFound(format!(
      "index '{}' on collection '{}'",
      index,
      R::COLLECTION.as_str()
    )));
  }

  let mut stmt = conn.prepare(
    "SELECT r.data FROM records r
     INNER JOIN record_indexes i ON i.collection = r.collection AND i.id = r.id
     WHERE i.collection = ? AND i.index_name = ? AND i.value = ?
     ORDER BY r.rowid",
  )?;
  let rows = stmt
    .query_map(params![R::COLLECTION.as_str(), index, value], |row| {
      row.get::<_, Vec<u8>>(0)
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  rows
    .iter()
    .map(|data| serde_json::from_slice(data).map_err(Error::from))
    .collect()
}

pub(crate) fn store_record<R: Record>(conn: &Connection, record: &R) -> Result<()> {
  let collection = R::COLLECTION.as_str();
  let key = record.key();
  let data = serde_json::to_vec(record)?;

  // Upsert keeps the rowid, so insertion order survives updates
  conn.execute(
    "INSERT INTO records (collection, id, data, updated_at) VALUES (?, ?, ?, datetime('now'))
     ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
    params![collection, key, data],
  )?;

  conn.execute(
    "DELETE FROM record_indexes WHERE collection = ? AND id = ?",
    params![collection, key],
  )?;
  for (index, value) in record.index_values() {
    conn.execute(
      "INSERT INTO record_indexes (collection, index_name, value, id) VALUES (?, ?, ?, ?)",
      params![collection, index, value, key],
    )?;
  }

  debug!(collection, key = %key, "Stored record");
  Ok(())
}

pub(crate) fn delete_record(conn: &Connection, collection: Collection, key: &str) -> Result<bool> {
  conn.execute(
    "DELETE FROM record_indexes WHERE collection = ? AND id = ?",
    params![collection.as_str(), key],
  )?;
  let removed = conn.execute(
    "DELETE FROM records WHERE collection = ? AND id = ?",
    params![collection.as_str(), key],
  )?;
  Ok(removed > 0)
}

fn count_records(conn: &Connection, collection: Collection) -> Result<usize> {
  let count: i64 = conn.query_row(
    "SELECT COUNT(*) FROM records WHERE collection = ?",
    params![collection.as_str()],
    |row| row.get(0),
  )?;
  Ok(count as usize)
}

fn is_populated(conn: &Connection, key: PopulationKey) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM population WHERE population_key = ?",
      params![key.as_key()],
      |row| row.get(0),
    )
    .optional()?;
  Ok(found.is_some())
}

/// Merge a new favorite flag into the stored catalog record, leaving every
/// other field as it was. Returns false when the record is not stored yet.
pub(crate) fn merge_favorite(conn: &Connection, id: u64, is_favorite: bool) -> Result<bool> {
  match load_one::<CatalogRecord>(conn, &id.to_string())? {
    Some(mut record) => {
      record.is_favorite = is_favorite;
      store_record(conn, &record)?;
      Ok(true)
    }
    None => Ok(false),
  }
}
