//! Remote origin seam.
//!
//! The data layer talks to the origin only through the [`Origin`] trait, so
//! the HTTP client can be swapped for a scripted one in tests.

mod http;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use reqwest::Method;
use url::Url;

use crate::error::Result;
use crate::store::{CatalogRecord, ReviewDraft, ReviewRecord};

pub use http::HttpOrigin;

/// Raw bytes of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl RawResponse {
  pub fn json(body: Vec<u8>) -> Self {
    Self {
      status: 200,
      content_type: Some("application/json".to_string()),
      body,
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Operations the remote origin exposes to the data layer.
#[async_trait]
pub trait Origin: Send + Sync {
  /// Base URL the origin's routes are resolved against
  fn base_url(&self) -> &Url;

  /// Raw request. Error statuses are returned as responses; only transport
  /// failures are errors.
  async fn send(&self, method: Method, url: &Url, body: Option<Vec<u8>>) -> Result<RawResponse>;

  /// Plain GET used for static assets.
  async fn fetch(&self, url: &Url) -> Result<RawResponse> {
    self.send(Method::GET, url, None).await
  }

  async fn list_catalog(&self) -> Result<Vec<CatalogRecord>>;

  async fn get_catalog(&self, id: u64) -> Result<CatalogRecord>;

  async fn list_reviews(&self, restaurant_id: u64) -> Result<Vec<ReviewRecord>>;

  /// Create a review. `client_token` lets an idempotent origin recognize a
  /// resubmission of the same draft.
  async fn create_review(&self, draft: &ReviewDraft, client_token: &str) -> Result<ReviewRecord>;

  /// Set the favorite flag. The response body is deliberately ignored; only
  /// the flag itself is merged locally.
  async fn set_favorite(&self, id: u64, is_favorite: bool) -> Result<()>;
}
