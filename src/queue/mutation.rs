use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::store::ReviewDraft;

/// A user write accepted locally before the origin has confirmed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
  /// Set the favorite flag of a catalog item to an absolute value, so a
  /// duplicate replay lands in the same state.
  FavoriteToggle { restaurant_id: u64, is_favorite: bool },
  ReviewCreate { draft: ReviewDraft },
}

impl Mutation {
  pub fn kind(&self) -> MutationKind {
    match self {
      Mutation::FavoriteToggle { .. } => MutationKind::FavoriteToggle,
      Mutation::ReviewCreate { .. } => MutationKind::ReviewCreate,
    }
  }

  /// Catalog id the mutation applies to; replay is FIFO per target.
  pub fn target_id(&self) -> u64 {
    match self {
      Mutation::FavoriteToggle { restaurant_id, .. } => *restaurant_id,
      Mutation::ReviewCreate { draft } => draft.restaurant_id,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
  FavoriteToggle,
  ReviewCreate,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::FavoriteToggle => "favorite_toggle",
      MutationKind::ReviewCreate => "review_create",
    }
  }
}

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Queued,
  /// Claimed by a context and sent (or about to be sent) to the origin
  InFlight,
  Acknowledged,
  /// Last attempt failed; retried on the next drain
  Failed,
}

impl MutationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationStatus::Queued => "queued",
      MutationStatus::InFlight => "in_flight",
      MutationStatus::Acknowledged => "acknowledged",
      MutationStatus::Failed => "failed",
    }
  }
}

impl FromStr for MutationStatus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "queued" => Ok(MutationStatus::Queued),
      "in_flight" => Ok(MutationStatus::InFlight),
      "acknowledged" => Ok(MutationStatus::Acknowledged),
      "failed" => Ok(MutationStatus::Failed),
      other => Err(Error::Config(format!("Unknown mutation status '{}'", other))),
    }
  }
}

impl fmt::Display for MutationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A durable queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub local_id: i64,
  pub mutation: Mutation,
  /// Sent with every submission so an idempotent origin can dedupe
  pub client_token: String,
  pub accepted_at: DateTime<Utc>,
  pub status: MutationStatus,
  /// Number of times the mutation has been claimed for submission
  pub attempts: u32,
  pub last_error: Option<String>,
  pub leased_until: Option<DateTime<Utc>>,
}

impl PendingMutation {
  /// Whether an earlier attempt may have reached the origin.
  pub fn previously_submitted(&self) -> bool {
    self.attempts > 1
  }
}
