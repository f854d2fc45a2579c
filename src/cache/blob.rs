//! Generation-scoped blob cache storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use super::key::{MatchPolicy, RequestKey};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::error::Result;
use crate::origin::RawResponse;

/// A response served from the cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: RawResponse,
  /// Generation the entry was stored under
  pub generation: String,
  pub cached_at: DateTime<Utc>,
}

/// Byte-level cache of GET responses, keyed by request identity.
///
/// Exactly one generation is current; `purge_except` removes the others.
#[derive(Clone)]
pub struct BlobCache {
  db: Arc<Database>,
  current: String,
  policy: MatchPolicy,
}

impl BlobCache {
  pub fn new(db: Arc<Database>, current: impl Into<String>, policy: MatchPolicy) -> Self {
    Self {
      db,
      current: current.into(),
      policy,
    }
  }

  pub fn current_generation(&self) -> &str {
    &self.current
  }

  pub fn policy(&self) -> MatchPolicy {
    self.policy
  }

  /// Store a response under `generation`, replacing any previous entry for
  /// the same URL in that generation.
  pub fn put(&self, key: &RequestKey, response: &RawResponse, generation: &str) -> Result<()> {
    self.db.write(|conn| {
      insert_entry(conn, key, response, generation)?;
      Ok(())
    })?;
    debug!(url = %key.url(), generation, "Cached response");
    Ok(())
  }

  /// Store every entry or none of them.
  pub fn put_all(&self, entries: &[(RequestKey, RawResponse)], generation: &str) -> Result<()> {
    self.db.write(|conn| {
      for (key, response) in entries {
        insert_entry(conn, key, response, generation)?;
      }
      Ok(())
    })?;
    info!(count = entries.len(), generation, "Cached response set");
    Ok(())
  }

  /// Look up a cached response, preferring the current generation.
  pub fn match_request(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let column = match self.policy {
      MatchPolicy::Exact => "url_hash",
      MatchPolicy::IgnoreSearch => "path_hash",
    };
    let sql = format!(
      "SELECT status, content_type, body, generation, cached_at FROM blob_cache
       WHERE {} = ?
       ORDER BY (generation = ?) DESC, cached_at DESC
       LIMIT 1",
      column
    );

    let row: Option<(u16, Option<String>, Vec<u8>, String, String)> = self.db.read(|conn| {
      Ok(
        conn
          .query_row(
            &sql,
            params![key.lookup_hash(self.policy), self.current],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
          )
          .optional()?,
      )
    })?;

    match row {
      Some((status, content_type, body, generation, cached_at)) => {
        debug!(url = %key.url(), generation = %generation, "Blob cache hit");
        Ok(Some(CachedResponse {
          response: RawResponse {
            status,
            content_type,
            body,
          },
          generation,
          cached_at: parse_timestamp(&cached_at)?,
        }))
      }
      None => {
        debug!(url = %key.url(), "Blob cache miss");
        Ok(None)
      }
    }
  }

  /// Names of every generation that still holds entries.
  pub fn generations(&self) -> Result<Vec<String>> {
    self.db.read(|conn| {
      let mut stmt = conn.prepare("SELECT DISTINCT generation FROM blob_cache ORDER BY generation")?;
      let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
      Ok(names)
    })
  }

  /// Delete every generation not named `current`, one transaction per
  /// generation. Returns the purged names.
  pub fn purge_except(&self, current: &str) -> Result<Vec<String>> {
    let stale: Vec<String> = self
      .generations()?
      .into_iter()
      .filter(|g| g != current)
      .collect();

    for generation in &stale {
      let removed = self.db.write(|conn| {
        Ok(conn.execute(
          "DELETE FROM blob_cache WHERE generation = ?",
          params![generation],
        )?)
      })?;
      info!(generation = %generation, removed, "Purged cache generation");
    }
    Ok(stale)
  }
}

fn insert_entry(
  conn: &rusqlite::Connection,
  key: &RequestKey,
  response: &RawResponse,
  generation: &str,
) -> Result<()> {
  conn.execute(
    "INSERT OR REPLACE INTO blob_cache
       (generation, url_hash, path_hash, url, status, content_type, body, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      generation,
      key.url_hash(),
      key.path_hash(),
      key.url().as_str(),
      response.status,
      response.content_type,
      response.body,
      format_timestamp(Utc::now()),
    ],
  )?;
  Ok(())
}
