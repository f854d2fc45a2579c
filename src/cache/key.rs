//! Request identity for the blob cache.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

/// How a lookup compares request URLs.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
  /// Full URL including the query string must match
  Exact,
  /// Query string is ignored (cache-busting parameters)
  #[default]
  IgnoreSearch,
}

/// Normalized request identity with stable hashed lookup keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  url: Url,
  url_hash: String,
  path_hash: String,
}

impl RequestKey {
  pub fn new(url: &Url) -> Self {
    let mut full = url.clone();
    full.set_fragment(None);

    let mut path_only = full.clone();
    path_only.set_query(None);

    Self {
      url_hash: hash(full.as_str()),
      path_hash: hash(path_only.as_str()),
      url: full,
    }
  }

  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| Error::Config(format!("Invalid URL '{}': {}", url, e)))?;
    Ok(Self::new(&url))
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn url_hash(&self) -> &str {
    &self.url_hash
  }

  pub fn path_hash(&self) -> &str {
    &self.path_hash
  }

  /// The hash a lookup under `policy` compares against.
  pub fn lookup_hash(&self, policy: MatchPolicy) -> &str {
    match policy {
      MatchPolicy::Exact => &self.url_hash,
      MatchPolicy::IgnoreSearch => &self.path_hash,
    }
  }
}

/// SHA256 hash for stable, fixed-length keys
fn hash(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
