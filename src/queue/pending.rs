//! Durable pending-write queue and its replay against the origin.

use chrono::{Duration, Utc};
use futures::future::join_all;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::mutation::{Mutation, MutationStatus, PendingMutation};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::error::{Error, Result};
use crate::origin::Origin;
use crate::store::{
  delete_record, load_by_index, merge_favorite, store_record, Collection, ReviewId, ReviewRecord,
};

const SELECT_COLUMNS: &str = "local_id, payload, client_token, accepted_at, status, attempts, last_error, leased_until";

/// Result of a drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
  pub acknowledged: usize,
  pub failed: usize,
  /// Left untouched: claimed by another context, or behind a failure for
  /// the same target
  pub skipped: usize,
}

impl DrainReport {
  fn merge(mut self, other: DrainReport) -> Self {
    self.acknowledged += other.acknowledged;
    self.failed += other.failed;
    self.skipped += other.skipped;
    self
  }
}

/// Queue of user mutations awaiting acknowledgement from the origin.
#[derive(Clone)]
pub struct PendingQueue {
  db: Arc<Database>,
  lease: Duration,
}

impl PendingQueue {
  pub fn new(db: Arc<Database>, lease: Duration) -> Self {
    Self { db, lease }
  }

  /// Accept a mutation locally. Never touches the network.
  pub fn enqueue(&self, mutation: &Mutation) -> Result<i64> {
    let (local_id, _) = self.db.write(|conn| enqueue_in(conn, mutation))?;
    Ok(local_id)
  }

  /// Every mutation still held by the queue, oldest first.
  pub fn list(&self) -> Result<Vec<PendingMutation>> {
    self.db.read(|conn| {
      let sql = format!("SELECT {} FROM pending_mutations ORDER BY local_id", SELECT_COLUMNS);
      query_mutations(conn, &sql, params![])
    })
  }

  pub fn get(&self, local_id: i64) -> Result<Option<PendingMutation>> {
    self.db.read(|conn| load_mutation(conn, local_id))
  }

  /// Mutations waiting on one catalog item, for "pending" badges.
  pub fn pending_for(&self, target_id: u64) -> Result<Vec<PendingMutation>> {
    self.db.read(|conn| {
      let sql = format!(
        "SELECT {} FROM pending_mutations WHERE target_id = ? ORDER BY local_id",
        SELECT_COLUMNS
      );
      query_mutations(conn, &sql, params![target_id])
    })
  }

  /// Mark a mutation acknowledged and remove it.
  pub fn ack(&self, local_id: i64) -> Result<()> {
    self.db.write(|conn| ack_in(conn, local_id))
  }

  /// Record a failed attempt. The mutation stays queued for the next drain.
  pub fn fail(&self, local_id: i64, reason: &str) -> Result<()> {
    let reason = Error::truncate_body(reason);
    let updated = self.db.write(|conn| {
      Ok(conn.execute(
        "UPDATE pending_mutations SET status = ?, last_error = ?, leased_until = NULL
         WHERE local_id = ?",
        params![MutationStatus::Failed.as_str(), reason, local_id],
      )?)
    })?;
    if updated == 0 {
      return Err(Error::NotFound(format!("pending mutation {}", local_id)));
    }
    warn!(local_id, reason = %reason, "Pending mutation failed");
    Ok(())
  }

  /// Claim a mutation for submission.
  ///
  /// Claimable means queued, failed, or in flight with an expired lease
  /// (the context that claimed it went away). The conditional update makes
  /// sure two contexts never hold the same claim.
  pub fn claim(&self, local_id: i64) -> Result<Option<PendingMutation>> {
    let now = Utc::now();
    let leased_until = now + self.lease;
    self.db.write(|conn| {
      let claimed = conn.execute(
        "UPDATE pending_mutations
         SET status = ?, attempts = attempts + 1, leased_until = ?
         WHERE local_id = ?
           AND (status IN (?, ?) OR (status = ? AND (leased_until IS NULL OR leased_until < ?)))",
        params![
          MutationStatus::InFlight.as_str(),
          format_timestamp(leased_until),
          local_id,
          MutationStatus::Queued.as_str(),
          MutationStatus::Failed.as_str(),
          MutationStatus::InFlight.as_str(),
          format_timestamp(now),
        ],
      )?;
      if claimed == 0 {
        return Ok(None);
      }
      load_mutation(conn, local_id)
    })
  }

  /// Replay every outstanding mutation against the origin.
  ///
  /// Mutations for the same target run one after another in submission
  /// order; different targets run concurrently. The first failure for a
  /// target holds back its later mutations until the next drain.
  pub async fn drain(&self, origin: &dyn Origin) -> Result<DrainReport> {
    let outstanding = self.list()?;
    let mut groups: BTreeMap<u64, Vec<PendingMutation>> = BTreeMap::new();
    for m in outstanding {
      groups.entry(m.mutation.target_id()).or_default().push(m);
    }
    if groups.is_empty() {
      return Ok(DrainReport::default());
    }

    let reports = join_all(
      groups
        .into_values()
        .map(|group| self.replay_group(origin, group)),
    )
    .await;
    let report = reports
      .into_iter()
      .fold(DrainReport::default(), DrainReport::merge);

    info!(
      acknowledged = report.acknowledged,
      failed = report.failed,
      skipped = report.skipped,
      "Drained pending mutations"
    );
    Ok(report)
  }

  async fn replay_group(&self, origin: &dyn Origin, group: Vec<PendingMutation>) -> DrainReport {
    let mut report = DrainReport::default();
    let total = group.len();

    for (position, pending) in group.into_iter().enumerate() {
      let claimed = match self.claim(pending.local_id) {
        Ok(Some(claimed)) => claimed,
        Ok(None) => {
          debug!(local_id = pending.local_id, "Mutation held by another context");
          report.skipped += total - position;
          break;
        }
        Err(e) => {
          warn!(local_id = pending.local_id, error = %e, "Failed to claim mutation");
          report.skipped += total - position;
          break;
        }
      };

      match self.replay(origin, &claimed).await {
        Ok(()) => report.acknowledged += 1,
        Err(e) => {
          if let Err(mark_err) = self.fail(claimed.local_id, &e.to_string()) {
            warn!(local_id = claimed.local_id, error = %mark_err, "Failed to record mutation failure");
          }
          report.failed += 1;
          report.skipped += total - position - 1;
          break;
        }
      }
    }
    report
  }

  async fn replay(&self, origin: &dyn Origin, pending: &PendingMutation) -> Result<()> {
    let local_id = pending.local_id;
    match &pending.mutation {
      Mutation::FavoriteToggle {
        restaurant_id,
        is_favorite,
      } => {
        origin.set_favorite(*restaurant_id, *is_favorite).await?;
        self.db.write(|conn| {
          if !merge_favorite(conn, *restaurant_id, *is_favorite)? {
            debug!(restaurant_id, "Favorite acknowledged for a record not stored locally");
          }
          ack_in(conn, local_id)
        })?;
        debug!(local_id, restaurant_id, is_favorite, "Favorite acknowledged");
      }
      Mutation::ReviewCreate { draft } => {
        let existing = if pending.previously_submitted() {
          // An earlier submission may have landed with its ack lost
          let bound = self
            .db
            .read(|conn| bound_reviews(conn, draft.restaurant_id, &pending.client_token))?;
          origin
            .list_reviews(draft.restaurant_id)
            .await?
            .into_iter()
            .filter(|r| !bound.contains(&r.id))
            .find(|r| r.matches_submission(draft, &pending.client_token, pending.accepted_at))
        } else {
          None
        };

        let review = match existing {
          Some(review) => {
            info!(local_id, id = %review.id, "Found earlier submission at origin");
            review
          }
          None => origin.create_review(draft, &pending.client_token).await?,
        };
        self
          .db
          .write(|conn| reconcile_review(conn, local_id, &pending.client_token, review.clone()))?;
        debug!(local_id, id = %review.id, "Review acknowledged");
      }
    }
    Ok(())
  }
}

/// Insert a queued mutation; returns its local id and client token.
pub(crate) fn enqueue_in(conn: &Connection, mutation: &Mutation) -> Result<(i64, String)> {
  let accepted_at = Utc::now();
  let payload = serde_json::to_string(mutation)?;

  conn.execute(
    "INSERT INTO pending_mutations (kind, target_id, payload, client_token, accepted_at, status)
     VALUES (?, ?, ?, '', ?, ?)",
    params![
      mutation.kind().as_str(),
      mutation.target_id(),
      payload,
      format_timestamp(accepted_at),
      MutationStatus::Queued.as_str(),
    ],
  )?;
  let local_id = conn.last_insert_rowid();

  let token = client_token(local_id, accepted_at.timestamp_nanos_opt().unwrap_or_default());
  conn.execute(
    "UPDATE pending_mutations SET client_token = ? WHERE local_id = ?",
    params![token, local_id],
  )?;

  info!(local_id, kind = mutation.kind().as_str(), target = mutation.target_id(), "Accepted mutation");
  Ok((local_id, token))
}

pub(crate) fn ack_in(conn: &Connection, local_id: i64) -> Result<()> {
  conn.execute(
    "UPDATE pending_mutations SET status = ? WHERE local_id = ?",
    params![MutationStatus::Acknowledged.as_str(), local_id],
  )?;
  conn.execute(
    "DELETE FROM pending_mutations WHERE local_id = ?",
    params![local_id],
  )?;
  Ok(())
}

/// Swap the provisional review for the origin's copy and retire the mutation.
///
/// The stored copy keeps the submission's token so later replays can tell
/// it belongs to this submission even when the origin does not echo tokens.
fn reconcile_review(
  conn: &Connection,
  local_id: i64,
  client_token: &str,
  mut review: ReviewRecord,
) -> Result<()> {
  review
    .client_token
    .get_or_insert_with(|| client_token.to_string());
  delete_record(conn, Collection::Reviews, &ReviewId::Local(local_id).to_string())?;
  store_record(conn, &review)?;
  ack_in(conn, local_id)
}

/// Remote reviews already acknowledged for some other submission.
fn bound_reviews(conn: &Connection, restaurant_id: u64, client_token: &str) -> Result<Vec<ReviewId>> {
  let local: Vec<ReviewRecord> = load_by_index(conn, "restaurant_id", &restaurant_id.to_string())?;
  Ok(
    local
      .into_iter()
      .filter(|r| !r.id.is_provisional())
      .filter(|r| matches!(&r.client_token, Some(token) if token != client_token))
      .map(|r| r.id)
      .collect(),
  )
}

pub(crate) fn client_token(local_id: i64, nanos: i64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(format!("{}:{}:{}", std::process::id(), local_id, nanos).as_bytes());
  hex::encode(&hasher.finalize()[..16])
}

fn load_mutation(conn: &Connection, local_id: i64) -> Result<Option<PendingMutation>> {
  let sql = format!("SELECT {} FROM pending_mutations WHERE local_id = ?", SELECT_COLUMNS);
  let raw = conn
    .query_row(&sql, params![local_id], RawRow::from_row)
    .optional()?;
  raw.map(RawRow::into_mutation).transpose()
}

fn query_mutations<P: rusqlite::Params>(
  conn: &Connection,
  sql: &str,
  params: P,
) -> Result<Vec<PendingMutation>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt
    .query_map(params, RawRow::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  rows.into_iter().map(RawRow::into_mutation).collect()
}

struct RawRow {
  local_id: i64,
  payload: String,
  client_token: String,
  accepted_at: String,
  status: String,
  attempts: u32,
  last_error: Option<String>,
  leased_until: Option<String>,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      local_id: row.get(0)?,
      payload: row.get(1)?,
      client_token: row.get(2)?,
      accepted_at: row.get(3)?,
      status: row.get(4)?,
      attempts: row.get(5)?,
      last_error: row.get(6)?,
      leased_until: row.get(7)?,
    })
  }

  fn into_mutation(self) -> Result<PendingMutation> {
    Ok(PendingMutation {
      local_id: self.local_id,
      mutation: serde_json::from_str(&self.payload)?,
      client_token: self.client_token,
      accepted_at: parse_timestamp(&self.accepted_at)?,
      status: self.status.parse()?,
      attempts: self.attempts,
      last_error: self.last_error,
      leased_until: self.leased_until.as_deref().map(parse_timestamp).transpose()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::schema::CURRENT_VERSION;
  use crate::origin::fake::FakeOrigin;
  use crate::store::{CatalogRecord, RecordStore, ReviewDraft};
  use serde_json::Map;
  use std::sync::atomic::Ordering;

  fn setup() -> (PendingQueue, RecordStore) {
    let db = Arc::new(Database::open_in_memory(CURRENT_VERSION).unwrap());
    (
      PendingQueue::new(db.clone(), Duration::seconds(60)),
      RecordStore::new(db),
    )
  }

  fn restaurant(id: u64, is_favorite: bool) -> CatalogRecord {
    CatalogRecord {
      id,
      name: format!("Restaurant {}", id),
      neighborhood: "Queens".into(),
      cuisine_type: "Pizza".into(),
      is_favorite,
      extra: Map::new(),
    }
  }

  fn favorite(id: u64, value: bool) -> Mutation {
    Mutation::FavoriteToggle {
      restaurant_id: id,
      is_favorite: value,
    }
  }

  #[test]
  fn test_enqueue_is_immediately_queued() {
    let (queue, _) = setup();
    let id = queue.enqueue(&favorite(1, true)).unwrap();

    let all = queue.list().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].local_id, id);
    assert_eq!(all[0].status, MutationStatus::Queued);
    assert_eq!(all[0].attempts, 0);
    assert_eq!(all[0].client_token.len(), 32);
  }

  #[tokio::test]
  async fn test_fifo_per_target_leaves_last_value() {
    let (queue, store) = setup();
    store.put(&restaurant(1, false)).unwrap();
    let origin = FakeOrigin::new().with_catalog(vec![restaurant(1, false)]);
    origin.set_latency(std::time::Duration::from_millis(5));

    queue.enqueue(&favorite(1, true)).unwrap();
    queue.enqueue(&favorite(1, false)).unwrap();

    let report = queue.drain(&origin).await.unwrap();
    assert_eq!(report.acknowledged, 2);
    assert_eq!(origin.favorite_calls(), vec![(1, true), (1, false)]);

    let stored: CatalogRecord = store.get("1").unwrap().unwrap();
    assert!(!stored.is_favorite);
    assert_eq!(origin.remote_favorite(1), Some(false));
    assert!(queue.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_duplicate_favorite_replay_converges() {
    let (queue, store) = setup();
    store.put(&restaurant(2, false)).unwrap();
    let origin = FakeOrigin::new().with_catalog(vec![restaurant(2, false)]);

    queue.enqueue(&favorite(2, true)).unwrap();
    queue.drain(&origin).await.unwrap();
    let once: CatalogRecord = store.get("2").unwrap().unwrap();

    // Same mutation delivered again
    queue.enqueue(&favorite(2, true)).unwrap();
    queue.drain(&origin).await.unwrap();
    let twice: CatalogRecord = store.get("2").unwrap().unwrap();

    assert_eq!(once.is_favorite, twice.is_favorite);
    assert!(twice.is_favorite);
  }

  #[tokio::test]
  async fn test_offline_failure_keeps_mutation_and_local_flag() {
    let (queue, store) = setup();
    store.put(&restaurant(3, false)).unwrap();
    let origin = FakeOrigin::new().with_catalog(vec![restaurant(3, false)]);
    origin.set_offline(true);

    let id = queue.enqueue(&favorite(3, true)).unwrap();
    queue.enqueue(&favorite(3, false)).unwrap();
    let report = queue.drain(&origin).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);

    let failed = queue.get(id).unwrap().unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert!(failed.last_error.unwrap().contains("offline"));
    let stored: CatalogRecord = store.get("3").unwrap().unwrap();
    assert!(!stored.is_favorite, "speculative value must not be stored");

    origin.set_offline(false);
    let report = queue.drain(&origin).await.unwrap();
    assert_eq!(report.acknowledged, 2);
    assert!(queue.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_remote_rejection_marks_failed() {
    let (queue, _) = setup();
    let origin = FakeOrigin::new().with_catalog(vec![restaurant(4, false)]);
    origin.reject_next(1);

    let id = queue.enqueue(&favorite(4, true)).unwrap();
    let report = queue.drain(&origin).await.unwrap();
    assert_eq!(report.failed, 1);
    let m = queue.get(id).unwrap().unwrap();
    assert_eq!(m.status, MutationStatus::Failed);
    assert!(m.last_error.unwrap().contains("500"));
  }

  #[tokio::test]
  async fn test_review_ack_replaces_provisional_record() {
    let (queue, store) = setup();
    let origin = FakeOrigin::new();
    let draft = ReviewDraft::new(5, "Ann", 4, "Good noodles");

    let (local_id, token) = store
      .database()
      .write(|conn| {
        let (id, token) = enqueue_in(conn, &Mutation::ReviewCreate { draft: draft.clone() })?;
        store_record(conn, &ReviewRecord::provisional(id, &draft, &token))?;
        Ok((id, token))
      })
      .unwrap();
    assert!(store
      .get::<ReviewRecord>(&ReviewId::Local(local_id).to_string())
      .unwrap()
      .is_some());

    queue.drain(&origin).await.unwrap();

    let reviews: Vec<ReviewRecord> = store.get_by_index("restaurant_id", "5").unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].id, ReviewId::Remote(100));
    assert_eq!(reviews[0].client_token.as_deref(), Some(token.as_str()));
  }

  #[tokio::test]
  async fn test_lost_ack_does_not_double_create() {
    let (queue, store) = setup();
    let origin = FakeOrigin::new();
    origin.drop_next_ack(1);
    let draft = ReviewDraft::new(6, "Bo", 5, "Superb");

    queue.enqueue(&Mutation::ReviewCreate { draft }).unwrap();
    let first = queue.drain(&origin).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(origin.remote_reviews(6).len(), 1);

    let second = queue.drain(&origin).await.unwrap();
    assert_eq!(second.acknowledged, 1);
    assert_eq!(origin.create_review_calls.load(Ordering::SeqCst), 1);
    assert_eq!(origin.remote_reviews(6).len(), 1);
    let local: Vec<ReviewRecord> = store.get_by_index("restaurant_id", "6").unwrap();
    assert_eq!(local.len(), 1);
  }

  #[tokio::test]
  async fn test_lost_ack_against_idempotent_origin() {
    let (queue, store) = setup();
    let origin = FakeOrigin::new();
    origin.set_idempotent(true);
    origin.drop_next_ack(1);
    let draft = ReviewDraft::new(11, "Gus", 5, "Worth the wait");

    let id = queue.enqueue(&Mutation::ReviewCreate { draft }).unwrap();
    let token = queue.get(id).unwrap().unwrap().client_token;
    assert_eq!(queue.drain(&origin).await.unwrap().failed, 1);
    assert_eq!(queue.drain(&origin).await.unwrap().acknowledged, 1);

    let remote = origin.remote_reviews(11);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].client_token.as_deref(), Some(token.as_str()));
    assert_eq!(origin.create_review_calls.load(Ordering::SeqCst), 1);
    assert_eq!(origin.list_reviews_calls.load(Ordering::SeqCst), 1);
    let local: Vec<ReviewRecord> = store.get_by_index("restaurant_id", "11").unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, ReviewId::Remote(100));
  }

  #[tokio::test]
  async fn test_retry_posts_when_identical_review_predates_acceptance() {
    let (queue, store) = setup();
    let draft = ReviewDraft::new(9, "Eve", 3, "Fine");
    let mut earlier = ReviewRecord::provisional(0, &draft, "unused");
    earlier.id = ReviewId::Remote(55);
    earlier.client_token = None;
    earlier.created_at = Utc::now() - Duration::days(1);
    let origin = FakeOrigin::new().with_review(earlier);
    origin.set_offline(true);

    queue.enqueue(&Mutation::ReviewCreate { draft }).unwrap();
    assert_eq!(queue.drain(&origin).await.unwrap().failed, 1);

    origin.set_offline(false);
    assert_eq!(queue.drain(&origin).await.unwrap().acknowledged, 1);
    assert_eq!(origin.remote_reviews(9).len(), 2);
    let local: Vec<ReviewRecord> = store.get_by_index("restaurant_id", "9").unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, ReviewId::Remote(100));
  }

  #[tokio::test]
  async fn test_retry_skips_review_acked_for_another_submission() {
    let (queue, store) = setup();
    let origin = FakeOrigin::new();
    origin.set_echo_tokens(false);
    let draft = ReviewDraft::new(10, "Flo", 4, "Twice as good");

    queue
      .enqueue(&Mutation::ReviewCreate { draft: draft.clone() })
      .unwrap();
    let second = queue.enqueue(&Mutation::ReviewCreate { draft }).unwrap();
    // An earlier attempt of the second submission never reached the origin
    queue.claim(second).unwrap().unwrap();
    queue.fail(second, "origin offline").unwrap();

    let report = queue.drain(&origin).await.unwrap();
    assert_eq!(report.acknowledged, 2);
    assert_eq!(origin.remote_reviews(10).len(), 2);

    let local: Vec<ReviewRecord> = store.get_by_index("restaurant_id", "10").unwrap();
    let mut ids: Vec<String> = local.iter().map(|r| r.id.to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["100", "101"]);
  }

  #[test]
  fn test_claim_respects_live_lease() {
    let (queue, _) = setup();
    let id = queue.enqueue(&favorite(7, true)).unwrap();

    let claimed = queue.claim(id).unwrap().unwrap();
    assert_eq!(claimed.status, MutationStatus::InFlight);
    assert_eq!(claimed.attempts, 1);
    assert!(queue.claim(id).unwrap().is_none());
  }

  #[test]
  fn test_expired_lease_can_be_reclaimed() {
    let db = Arc::new(Database::open_in_memory(CURRENT_VERSION).unwrap());
    let dead_context = PendingQueue::new(db.clone(), Duration::seconds(-1));
    let id = dead_context.enqueue(&favorite(8, true)).unwrap();
    assert!(dead_context.claim(id).unwrap().is_some());

    let survivor = PendingQueue::new(db, Duration::seconds(60));
    let reclaimed = survivor.claim(id).unwrap().unwrap();
    assert_eq!(reclaimed.attempts, 2);
    assert!(reclaimed.previously_submitted());
  }

  #[test]
  fn test_fail_unknown_mutation() {
    let (queue, _) = setup();
    assert!(matches!(queue.fail(99, "nope"), Err(Error::NotFound(_))));
  }
}
