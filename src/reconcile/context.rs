use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::BlobCache;
use crate::config::Config;
use crate::db::{schema, Database};
use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::queue::PendingQueue;
use crate::store::RecordStore;

/// Durable layers of one context, all backed by the same database.
#[derive(Clone)]
pub struct Storage {
  pub db: Arc<Database>,
  pub blobs: BlobCache,
  pub records: RecordStore,
  pub queue: PendingQueue,
}

impl Storage {
  pub fn new(db: Arc<Database>, config: &Config) -> Self {
    Self {
      blobs: BlobCache::new(
        db.clone(),
        config.cache.generation.clone(),
        config.cache.match_policy,
      ),
      records: RecordStore::new(db.clone()),
      queue: PendingQueue::new(db.clone(), Duration::seconds(config.queue.lease_secs)),
      db,
    }
  }
}

/// Everything one execution context needs, constructed once and owned by
/// its reconciler.
pub struct OfflineContext {
  config: Config,
  origin: Arc<dyn Origin>,
  storage: Option<Storage>,
  /// Why storage is missing, when it is
  degraded: Option<String>,
}

impl OfflineContext {
  /// Open the durable store named by `config`.
  ///
  /// If the store cannot be opened the context runs network-only. A schema
  /// upgrade failure is fatal and returned.
  pub fn open(config: Config, origin: Arc<dyn Origin>) -> Result<Self> {
    let opened = config
      .database_path()
      .and_then(|path| Database::open(&path, schema::CURRENT_VERSION));
    Self::from_opened(config, origin, opened)
  }

  fn from_opened(config: Config, origin: Arc<dyn Origin>, opened: Result<Database>) -> Result<Self> {
    match opened {
      Ok(db) => {
        info!(path = ?db.path(), "Opened offline store");
        Ok(Self::with_database(config, origin, Arc::new(db)))
      }
      Err(Error::StorageUnavailable(reason)) => {
        warn!(reason = %reason, "Storage unavailable, running network-only");
        Ok(Self {
          degraded: Some(reason),
          ..Self::network_only(config, origin)
        })
      }
      Err(e) => Err(e),
    }
  }

  /// Build a context over an already opened database.
  pub fn with_database(config: Config, origin: Arc<dyn Origin>, db: Arc<Database>) -> Self {
    let storage = Storage::new(db, &config);
    Self {
      config,
      origin,
      storage: Some(storage),
      degraded: None,
    }
  }

  /// A context without durable storage; nothing is cached.
  pub fn network_only(config: Config, origin: Arc<dyn Origin>) -> Self {
    Self {
      config,
      origin,
      storage: None,
      degraded: Some("no storage configured".to_string()),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn origin(&self) -> &Arc<dyn Origin> {
    &self.origin
  }

  pub fn storage(&self) -> Option<&Storage> {
    self.storage.as_ref()
  }

  pub fn degraded_reason(&self) -> Option<&str> {
    self.degraded.as_deref()
  }
}
