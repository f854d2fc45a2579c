//! Catalog and review records as stored locally and exchanged with the origin.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use super::traits::{Collection, Record};
use crate::error::{Error, Result};

const LOCAL_ID_PREFIX: &str = "local:";

/// A catalog item (restaurant).
///
/// Only the fields the data layer indexes or mutates are typed; everything
/// else the origin sends is carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
  #[serde(deserialize_with = "deserialize_flexible_u64")]
  pub id: u64,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub neighborhood: String,
  #[serde(default)]
  pub cuisine_type: String,
  #[serde(default, deserialize_with = "deserialize_flexible_bool")]
  pub is_favorite: bool,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Record for CatalogRecord {
  const COLLECTION: Collection = Collection::Catalog;

  fn key(&self) -> String {
    self.id.to_string()
  }

  fn index_values(&self) -> Vec<(&'static str, String)> {
    vec![
      ("neighborhood", self.neighborhood.clone()),
      ("cuisine_type", self.cuisine_type.clone()),
    ]
  }
}

/// Review identity: assigned by the origin, or provisional until the
/// matching pending mutation is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReviewId {
  Remote(u64),
  /// Provisional id derived from the pending mutation's local id
  Local(i64),
}

impl ReviewId {
  pub fn is_provisional(&self) -> bool {
    matches!(self, ReviewId::Local(_))
  }
}

impl fmt::Display for ReviewId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ReviewId::Remote(id) => write!(f, "{}", id),
      ReviewId::Local(id) => write!(f, "{}{}", LOCAL_ID_PREFIX, id),
    }
  }
}

impl Serialize for ReviewId {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      ReviewId::Remote(id) => serializer.serialize_u64(*id),
      ReviewId::Local(_) => serializer.serialize_str(&self.to_string()),
    }
  }
}

impl<'de> Deserialize<'de> for ReviewId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Num(u64),
      Str(String),
    }

    match Raw::deserialize(deserializer)? {
      Raw::Num(id) => Ok(ReviewId::Remote(id)),
      Raw::Str(s) => {
        if let Some(local) = s.strip_prefix(LOCAL_ID_PREFIX) {
          local
            .parse()
            .map(ReviewId::Local)
            .map_err(serde::de::Error::custom)
        } else {
          s.parse()
            .map(ReviewId::Remote)
            .map_err(serde::de::Error::custom)
        }
      }
    }
  }
}

/// A review of a catalog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
  pub id: ReviewId,
  #[serde(deserialize_with = "deserialize_flexible_u64")]
  pub restaurant_id: u64,
  pub name: String,
  #[serde(deserialize_with = "deserialize_flexible_u8")]
  pub rating: u8,
  pub comments: String,
  #[serde(
    rename = "createdAt",
    alias = "created_at",
    default = "Utc::now",
    deserialize_with = "deserialize_timestamp"
  )]
  pub created_at: DateTime<Utc>,
  /// Echoed back by origins that support idempotent creation
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_token: Option<String>,
}

impl Record for ReviewRecord {
  const COLLECTION: Collection = Collection::Reviews;

  fn key(&self) -> String {
    self.id.to_string()
  }

  fn index_values(&self) -> Vec<(&'static str, String)> {
    vec![("restaurant_id", self.restaurant_id.to_string())]
  }
}

impl ReviewRecord {
  /// Build the provisional record shown while a submission is pending.
  pub fn provisional(local_id: i64, draft: &ReviewDraft, client_token: &str) -> Self {
    Self {
      id: ReviewId::Local(local_id),
      restaurant_id: draft.restaurant_id,
      name: draft.name.clone(),
      rating: draft.rating,
      comments: draft.comments.clone(),
      created_at: Utc::now(),
      client_token: Some(client_token.to_string()),
    }
  }

  /// Whether this (remote) review is the origin's copy of `draft`, as
  /// submitted with `client_token` after being accepted at `accepted_at`.
  ///
  /// Without an echoed token only a review created after acceptance with
  /// identical content qualifies.
  pub fn matches_submission(
    &self,
    draft: &ReviewDraft,
    client_token: &str,
    accepted_at: DateTime<Utc>,
  ) -> bool {
    if let Some(token) = &self.client_token {
      return token == client_token;
    }
    self.created_at >= accepted_at
      && self.restaurant_id == draft.restaurant_id
      && self.name == draft.name
      && self.rating == draft.rating
      && self.comments == draft.comments
  }
}

/// A review as entered by the user, before it has any identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDraft {
  pub restaurant_id: u64,
  pub name: String,
  pub rating: u8,
  pub comments: String,
}

impl ReviewDraft {
  pub fn new(
    restaurant_id: u64,
    name: impl Into<String>,
    rating: u8,
    comments: impl Into<String>,
  ) -> Self {
    Self {
      restaurant_id,
      name: name.into(),
      rating,
      comments: comments.into(),
    }
  }

  /// Reject drafts the review form would not submit.
  pub fn validate(&self) -> Result<()> {
    if self.name.trim().is_empty() {
      return Err(Error::InvalidReview("Please enter your name"));
    }
    if !(1..=5).contains(&self.rating) {
      return Err(Error::InvalidReview("Rating is required"));
    }
    if self.comments.trim().is_empty() {
      return Err(Error::InvalidReview("Please type a comment"));
    }
    Ok(())
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
  Num(u64),
  Str(String),
}

fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
  D: Deserializer<'de>,
{
  match NumOrString::deserialize(deserializer)? {
    NumOrString::Num(n) => Ok(n),
    NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
  }
}

fn deserialize_flexible_u8<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
  D: Deserializer<'de>,
{
  let value = deserialize_flexible_u64(deserializer)?;
  u8::try_from(value).map_err(serde::de::Error::custom)
}

/// The origin reports favorites as either a JSON bool or "true"/"false".
fn deserialize_flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
  D: Deserializer<'de>,
{
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum BoolOrString {
    Bool(bool),
    Str(String),
  }

  match BoolOrString::deserialize(deserializer)? {
    BoolOrString::Bool(b) => Ok(b),
    BoolOrString::Str(s) => match s.trim().to_lowercase().as_str() {
      "true" => Ok(true),
      "false" | "" => Ok(false),
      other => Err(serde::de::Error::custom(format!(
        "invalid favorite flag '{}'",
        other
      ))),
    },
  }
}

/// Accepts epoch milliseconds or an RFC 3339 string.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
  D: Deserializer<'de>,
{
  match NumOrString::deserialize(deserializer)? {
    NumOrString::Num(ms) => {
      let ms = i64::try_from(ms).map_err(serde::de::Error::custom)?;
      Utc
        .timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", ms)))
    }
    NumOrString::Str(s) => DateTime::parse_from_rfc3339(&s)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(serde::de::Error::custom),
  }
}
