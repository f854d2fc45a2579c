use chrono::Utc;
use futures::future::{try_join_all, FutureExt};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::context::{OfflineContext, Storage};
use super::population::PopulationGate;
use crate::cache::RequestKey;
use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::origin::{Origin, RawResponse};
use crate::queue::{client_token, enqueue_in, DrainReport, Mutation, PendingMutation};
use crate::store::{
  distinct, store_record, CatalogRecord, Collection, Mode, PopulationKey, RecordStore,
  ReviewDraft, ReviewRecord,
};

/// Outcome of a user write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
  /// Stored locally; replayed against the origin on the next drain
  Queued { local_id: i64 },
  /// Sent straight to the origin (network-only context)
  Applied,
}

/// Owns one context and keeps its store converged with the origin.
pub struct Reconciler {
  context: OfflineContext,
  gate: PopulationGate,
}

impl Reconciler {
  pub fn new(context: OfflineContext) -> Self {
    Self {
      context,
      gate: PopulationGate::new(),
    }
  }

  pub fn context(&self) -> &OfflineContext {
    &self.context
  }

  fn origin(&self) -> &Arc<dyn Origin> {
    self.context.origin()
  }

  /// Every catalog record, populating the store on first use.
  pub async fn catalog(&self) -> Result<Vec<CatalogRecord>> {
    match self.context.storage() {
      None => self.origin().list_catalog().await,
      Some(storage) => {
        self.ensure_populated(storage, PopulationKey::Catalog).await?;
        storage.records.get_all()
      }
    }
  }

  /// One catalog record. Falls back to the origin for items added after
  /// the catalog was populated.
  pub async fn restaurant(&self, id: u64) -> Result<CatalogRecord> {
    let Some(storage) = self.context.storage() else {
      return self.origin().get_catalog(id).await;
    };

    self.ensure_populated(storage, PopulationKey::Catalog).await?;
    if let Some(record) = storage.records.get(&id.to_string())? {
      return Ok(record);
    }

    debug!(id, "Catalog record not stored, asking origin");
    let record = self.origin().get_catalog(id).await?;
    storage.records.put(&record)?;
    Ok(record)
  }

  /// Reviews of one catalog record, provisional ones included.
  pub async fn reviews_for(&self, restaurant_id: u64) -> Result<Vec<ReviewRecord>> {
    match self.context.storage() {
      None => self.origin().list_reviews(restaurant_id).await,
      Some(storage) => {
        self
          .ensure_populated(storage, PopulationKey::Reviews(restaurant_id))
          .await?;
        storage
          .records
          .get_by_index("restaurant_id", &restaurant_id.to_string())
      }
    }
  }

  pub async fn neighborhoods(&self) -> Result<Vec<String>> {
    let catalog = self.catalog().await?;
    Ok(distinct(catalog.iter().map(|r| r.neighborhood.as_str())))
  }

  pub async fn cuisines(&self) -> Result<Vec<String>> {
    let catalog = self.catalog().await?;
    Ok(distinct(catalog.iter().map(|r| r.cuisine_type.as_str())))
  }

  /// Catalog records matching both filters; `None` means "all".
  pub async fn filter(
    &self,
    cuisine: Option<&str>,
    neighborhood: Option<&str>,
  ) -> Result<Vec<CatalogRecord>> {
    match self.context.storage() {
      Some(storage) => {
        self.ensure_populated(storage, PopulationKey::Catalog).await?;
        storage.records.filter_catalog(cuisine, neighborhood)
      }
      None => Ok(
        self
          .origin()
          .list_catalog()
          .await?
          .into_iter()
          .filter(|r| cuisine.map_or(true, |c| r.cuisine_type == c))
          .filter(|r| neighborhood.map_or(true, |n| r.neighborhood == n))
          .collect(),
      ),
    }
  }

  /// Set the favorite flag. The stored record keeps its acknowledged value
  /// until the origin confirms.
  pub async fn toggle_favorite(&self, restaurant_id: u64, is_favorite: bool) -> Result<Accepted> {
    match self.context.storage() {
      Some(storage) => {
        let local_id = storage.queue.enqueue(&Mutation::FavoriteToggle {
          restaurant_id,
          is_favorite,
        })?;
        Ok(Accepted::Queued { local_id })
      }
      None => {
        self.origin().set_favorite(restaurant_id, is_favorite).await?;
        Ok(Accepted::Applied)
      }
    }
  }

  /// Accept a review. The mutation and its provisional record are written
  /// in one transaction, so the review shows up locally at once.
  pub async fn submit_review(&self, draft: ReviewDraft) -> Result<Accepted> {
    draft.validate()?;

    match self.context.storage() {
      Some(storage) => {
        let local_id = storage.db.write(|conn| {
          let (local_id, token) = enqueue_in(
            conn,
            &Mutation::ReviewCreate {
              draft: draft.clone(),
            },
          )?;
          store_record(conn, &ReviewRecord::provisional(local_id, &draft, &token))?;
          Ok(local_id)
        })?;
        Ok(Accepted::Queued { local_id })
      }
      None => {
        let token = client_token(0, Utc::now().timestamp_nanos_opt().unwrap_or_default());
        self.origin().create_review(&draft, &token).await?;
        Ok(Accepted::Applied)
      }
    }
  }

  /// Mutations not yet acknowledged by the origin.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    match self.context.storage() {
      Some(storage) => storage.queue.list(),
      None => Ok(Vec::new()),
    }
  }

  /// Replay the pending-write queue.
  pub async fn drain(&self) -> Result<DrainReport> {
    match self.context.storage() {
      Some(storage) => storage.queue.drain(self.origin().as_ref()).await,
      None => Ok(DrainReport::default()),
    }
  }

  /// Discard the population state of `key` and load it again from the origin.
  pub async fn refresh(&self, key: PopulationKey) -> Result<usize> {
    let Some(storage) = self.context.storage() else {
      return Ok(0);
    };
    storage.records.clear_population(key)?;
    self.gate.reset(key)?;
    self.populate_through_gate(storage, key, Load::Refresh).await
  }

  pub async fn handle(&self, event: Lifecycle) -> Result<()> {
    info!(?event, "Lifecycle event");
    match event {
      Lifecycle::Install => self.install().await.map(|_| ()),
      Lifecycle::Activate => self.activate().await.map(|_| ()),
      Lifecycle::NetworkRestored => self.drain().await.map(|_| ()),
    }
  }

  /// Pre-warm the current blob cache generation with the asset list.
  ///
  /// Every asset must fetch successfully or nothing is stored.
  pub async fn install(&self) -> Result<usize> {
    let Some(storage) = self.context.storage() else {
      warn!("No storage, skipping pre-warm");
      return Ok(0);
    };

    let urls = self.context.config().precache_urls()?;
    let origin = self.origin().as_ref();
    let entries = try_join_all(urls.iter().map(|url| fetch_asset(origin, url))).await?;

    let generation = storage.blobs.current_generation().to_string();
    storage.blobs.put_all(&entries, &generation)?;
    info!(generation = %generation, assets = entries.len(), "Installed");
    Ok(entries.len())
  }

  /// Drop stale cache generations, then replay pending writes.
  pub async fn activate(&self) -> Result<DrainReport> {
    if let Some(storage) = self.context.storage() {
      let current = storage.blobs.current_generation().to_string();
      let purged = storage.blobs.purge_except(&current)?;
      info!(current = %current, purged = ?purged, "Activated");
    }
    self.drain().await
  }

  async fn ensure_populated(&self, storage: &Storage, key: PopulationKey) -> Result<usize> {
    self.populate_through_gate(storage, key, Load::First).await
  }

  async fn populate_through_gate(
    &self,
    storage: &Storage,
    key: PopulationKey,
    load: Load,
  ) -> Result<usize> {
    let records = storage.records.clone();
    let origin = self.origin().clone();
    self
      .gate
      .ensure(key, move || populate(records, origin, key, load).boxed())
      .await
  }
}

async fn fetch_asset(origin: &dyn Origin, url: &Url) -> Result<(RequestKey, RawResponse)> {
  let response = origin.fetch(url).await?;
  if !response.is_success() {
    return Err(Error::from_status(
      response.status,
      &String::from_utf8_lossy(&response.body),
    ));
  }
  Ok((RequestKey::new(url), response))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Load {
  /// First use: an already non-empty catalog counts as populated
  First,
  /// Explicit refresh: only the durable marker can skip the fetch
  Refresh,
}

/// Load one population unit from the origin in a single transaction.
async fn populate(
  records: RecordStore,
  origin: Arc<dyn Origin>,
  key: PopulationKey,
  load: Load,
) -> Result<usize> {
  // Another context may already have done the work
  if records.is_populated(key)? {
    return Ok(0);
  }
  if load == Load::First
    && key == PopulationKey::Catalog
    && records.count(Collection::Catalog)? > 0
  {
    return Ok(0);
  }

  match key {
    PopulationKey::Catalog => {
      let catalog = origin.list_catalog().await?;
      let written = records.transaction(&[Collection::Catalog], Mode::ReadWrite, |tx| {
        for record in &catalog {
          tx.put(record)?;
        }
        tx.mark_populated(key)?;
        Ok(catalog.len())
      })?;
      info!(records = written, "Populated catalog");
      Ok(written)
    }
    PopulationKey::Reviews(restaurant_id) => {
      let reviews = origin.list_reviews(restaurant_id).await?;
      let written = records.transaction(&[Collection::Reviews], Mode::ReadWrite, |tx| {
        let local: Vec<ReviewRecord> =
          tx.get_by_index("restaurant_id", &restaurant_id.to_string())?;
        // A provisional review whose submission already landed is replaced
        // by the origin's copy; its mutation is acked on the next drain.
        for provisional in local.iter().filter(|r| r.id.is_provisional()) {
          let landed = reviews
            .iter()
            .any(|r| r.client_token.is_some() && r.client_token == provisional.client_token);
          if landed {
            tx.delete(Collection::Reviews, &provisional.id.to_string())?;
          }
        }
        for review in &reviews {
          let bound_token = local
            .iter()
            .find(|r| r.id == review.id)
            .and_then(|r| r.client_token.clone());
          match (&review.client_token, bound_token) {
            (None, Some(token)) => tx.put(&ReviewRecord {
              client_token: Some(token),
              ..review.clone()
            })?,
            _ => tx.put(review)?,
          }
        }
        tx.mark_populated(key)?;
        Ok(reviews.len())
      })?;
      info!(restaurant_id, records = written, "Populated reviews");
      Ok(written)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::db::{schema::CURRENT_VERSION, Database};
  use crate::error::ErrorKind;
  use crate::origin::fake::FakeOrigin;
  use crate::queue::MutationStatus;
  use crate::store::ReviewId;
  use serde_json::Map;
  use std::sync::atomic::Ordering;
  use std::time::Duration;

  fn restaurant(id: u64, neighborhood: &str, cuisine: &str) -> CatalogRecord {
    CatalogRecord {
      id,
      name: format!("Restaurant {}", id),
      neighborhood: neighborhood.into(),
      cuisine_type: cuisine.into(),
      is_favorite: false,
      extra: Map::new(),
    }
  }

  fn sample_catalog() -> Vec<CatalogRecord> {
    vec![
      restaurant(1, "Manhattan", "Asian"),
      restaurant(2, "Brooklyn", "Pizza"),
      restaurant(3, "Manhattan", "Pizza"),
    ]
  }

  fn origin_test_config() -> Config {
    Config::default().with_origin(Url::parse("http://origin.test/").unwrap())
  }

  fn reconciler_with(origin: Arc<FakeOrigin>, db: Arc<Database>) -> Reconciler {
    Reconciler::new(OfflineContext::with_database(Config::default(), origin, db))
  }

  fn reconciler(origin: Arc<FakeOrigin>) -> Reconciler {
    let db = Arc::new(Database::open_in_memory(CURRENT_VERSION).unwrap());
    reconciler_with(origin, db)
  }

  #[tokio::test]
  async fn test_concurrent_first_reads_fetch_once() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    origin.set_latency(Duration::from_millis(30));
    let r = reconciler(origin.clone());

    let (a, b) = tokio::join!(r.catalog(), r.catalog());
    assert_eq!(a.unwrap().len(), 3);
    assert_eq!(b.unwrap().len(), 3);
    assert_eq!(origin.list_catalog_calls.load(Ordering::SeqCst), 1);

    r.catalog().await.unwrap();
    assert_eq!(origin.list_catalog_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_population_survives_new_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));

    let first = reconciler_with(
      origin.clone(),
      Arc::new(Database::open(&path, CURRENT_VERSION).unwrap()),
    );
    first.catalog().await.unwrap();

    origin.set_offline(true);
    let second = reconciler_with(
      origin.clone(),
      Arc::new(Database::open(&path, CURRENT_VERSION).unwrap()),
    );
    assert_eq!(second.catalog().await.unwrap().len(), 3);
    assert_eq!(origin.list_catalog_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_offline_miss_is_surfaced() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    origin.set_offline(true);
    let r = reconciler(origin.clone());

    let err = r.catalog().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NetworkUnreachable);

    origin.set_offline(false);
    assert_eq!(r.catalog().await.unwrap().len(), 3);
    assert_eq!(origin.list_catalog_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_queries_over_populated_catalog() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    let r = reconciler(origin);

    assert_eq!(r.neighborhoods().await.unwrap(), vec!["Manhattan", "Brooklyn"]);
    assert_eq!(r.cuisines().await.unwrap(), vec!["Asian", "Pizza"]);
    let pizza = r.filter(Some("Pizza"), Some("Manhattan")).await.unwrap();
    assert_eq!(pizza.len(), 1);
    assert_eq!(pizza[0].id, 3);
    assert_eq!(r.restaurant(2).await.unwrap().neighborhood, "Brooklyn");
    assert!(matches!(r.restaurant(42).await, Err(Error::NotFound(_))));
  }

  #[tokio::test]
  async fn test_favorite_applies_only_after_ack() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    let r = reconciler(origin.clone());
    r.catalog().await.unwrap();
    origin.set_offline(true);

    let accepted = r.toggle_favorite(1, true).await.unwrap();
    assert!(matches!(accepted, Accepted::Queued { .. }));
    assert_eq!(r.pending().unwrap()[0].status, MutationStatus::Queued);
    assert!(!r.restaurant(1).await.unwrap().is_favorite);

    r.handle(Lifecycle::NetworkRestored).await.unwrap();
    assert!(!r.restaurant(1).await.unwrap().is_favorite);

    origin.set_offline(false);
    r.handle(Lifecycle::NetworkRestored).await.unwrap();
    assert!(r.restaurant(1).await.unwrap().is_favorite);
    assert!(r.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offline_review_reconciles_to_remote_id() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    let r = reconciler(origin.clone());
    r.reviews_for(2).await.unwrap();
    origin.set_offline(true);

    let draft = ReviewDraft::new(2, "Cy", 5, "Best slice in town");
    let Accepted::Queued { local_id } = r.submit_review(draft).await.unwrap() else {
      panic!("expected a queued review");
    };
    let local = r.reviews_for(2).await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, ReviewId::Local(local_id));

    origin.set_offline(false);
    let report = r.drain().await.unwrap();
    assert_eq!(report.acknowledged, 1);

    let reviews = r.reviews_for(2).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].id, ReviewId::Remote(100));
    assert_eq!(origin.remote_reviews(2).len(), 1);
    assert_eq!(origin.create_review_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalid_review_is_not_queued() {
    let r = reconciler(Arc::new(FakeOrigin::new()));
    let result = r.submit_review(ReviewDraft::new(1, "", 3, "fine")).await;
    assert!(matches!(result, Err(Error::InvalidReview(_))));
    assert!(r.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_review_population_drops_landed_provisional() {
    let origin = Arc::new(FakeOrigin::new());
    let r = reconciler(origin.clone());
    let draft = ReviewDraft::new(3, "Di", 4, "Crispy");
    r.submit_review(draft).await.unwrap();

    // Submission reaches the origin but the ack is lost
    origin.drop_next_ack(1);
    assert_eq!(r.drain().await.unwrap().failed, 1);

    let reviews = r.reviews_for(3).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].id, ReviewId::Remote(100));

    assert_eq!(r.drain().await.unwrap().acknowledged, 1);
    assert_eq!(r.reviews_for(3).await.unwrap().len(), 1);
    assert_eq!(origin.create_review_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_population_keeps_token_of_acked_review() {
    let origin = Arc::new(FakeOrigin::new());
    origin.set_echo_tokens(false);
    let r = reconciler(origin.clone());
    r.submit_review(ReviewDraft::new(4, "Ed", 3, "Decent")).await.unwrap();
    let token = r.pending().unwrap()[0].client_token.clone();
    assert_eq!(r.drain().await.unwrap().acknowledged, 1);

    let reviews = r.reviews_for(4).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].id, ReviewId::Remote(100));
    assert_eq!(reviews[0].client_token.as_deref(), Some(token.as_str()));
    assert_eq!(origin.list_reviews_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refresh_repopulates() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    let r = reconciler(origin.clone());
    r.catalog().await.unwrap();

    assert_eq!(r.refresh(PopulationKey::Catalog).await.unwrap(), 3);
    assert_eq!(origin.list_catalog_calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_install_then_activate_purges_old_generation() {
    let origin = Arc::new(
      FakeOrigin::new()
        .with_asset("index.html", "<html>")
        .with_asset("css/styles.css", "body {}"),
    );
    let db = Arc::new(Database::open_in_memory(CURRENT_VERSION).unwrap());
    let mut config = origin_test_config();
    config.cache.precache = vec!["index.html".into(), "css/styles.css".into()];

    let old = BlobCacheFixture::seed(&db, "restaurant-reviews-v0");
    let r = Reconciler::new(OfflineContext::with_database(config, origin, db.clone()));

    assert_eq!(r.install().await.unwrap(), 2);
    r.handle(Lifecycle::Activate).await.unwrap();

    let storage = r.context().storage().unwrap();
    assert_eq!(
      storage.blobs.generations().unwrap(),
      vec!["restaurant-reviews-v1".to_string()]
    );
    assert!(storage.blobs.match_request(&old).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let origin = Arc::new(FakeOrigin::new().with_asset("index.html", "<html>"));
    let mut config = origin_test_config();
    config.cache.precache = vec!["index.html".into(), "missing.js".into()];
    let db = Arc::new(Database::open_in_memory(CURRENT_VERSION).unwrap());
    let r = Reconciler::new(OfflineContext::with_database(config, origin, db));

    let err = r.install().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let storage = r.context().storage().unwrap();
    assert!(storage.blobs.generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_only_context() {
    let origin = Arc::new(FakeOrigin::new().with_catalog(sample_catalog()));
    let r = Reconciler::new(OfflineContext::network_only(Config::default(), origin.clone()));

    assert_eq!(r.catalog().await.unwrap().len(), 3);
    assert_eq!(r.catalog().await.unwrap().len(), 3);
    assert_eq!(origin.list_catalog_calls.load(Ordering::SeqCst), 2);

    assert_eq!(r.toggle_favorite(1, true).await.unwrap(), Accepted::Applied);
    assert_eq!(origin.remote_favorite(1), Some(true));
    assert_eq!(r.drain().await.unwrap(), DrainReport::default());
  }

  struct BlobCacheFixture;

  impl BlobCacheFixture {
    /// Store one entry under `generation` and return its key
    fn seed(db: &Arc<Database>, generation: &str) -> RequestKey {
      let blobs = crate::cache::BlobCache::new(
        db.clone(),
        generation,
        crate::cache::MatchPolicy::Exact,
      );
      let key = RequestKey::parse("http://origin.test/js/old.js").unwrap();
      blobs
        .put(&key, &RawResponse::json(b"{}".to_vec()), generation)
        .unwrap();
      key
    }
  }
}
