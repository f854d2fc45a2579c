use async_trait::async_trait;
use reqwest::{Client, Method, Request, Response};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Origin, RawResponse};
use crate::config::OriginConfig;
use crate::error::{Error, Result};
use crate::store::{CatalogRecord, ReviewDraft, ReviewRecord};

/// REST client for the catalog origin
#[derive(Clone)]
pub struct HttpOrigin {
  client: Client,
  base: Url,
}

#[derive(Serialize)]
struct CreateReviewBody<'a> {
  restaurant_id: u64,
  name: &'a str,
  rating: u8,
  comments: &'a str,
  client_token: &'a str,
}

impl HttpOrigin {
  pub fn new(config: &OriginConfig) -> Result<Self> {
    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base: config.url.clone(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| Error::Config(format!("Invalid endpoint '{}': {}", path, e)))
  }

  fn reviews_url(&self, restaurant_id: u64) -> Result<Url> {
    let mut url = self.endpoint("reviews/")?;
    url
      .query_pairs_mut()
      .append_pair("restaurant_id", &restaurant_id.to_string());
    Ok(url)
  }

  /// POST of a new review. The token travels in the body and as the
  /// `Idempotency-Key` header.
  fn create_review_request(&self, draft: &ReviewDraft, client_token: &str) -> Result<Request> {
    let url = self.endpoint("reviews/")?;
    let body = CreateReviewBody {
      restaurant_id: draft.restaurant_id,
      name: &draft.name,
      rating: draft.rating,
      comments: &draft.comments,
      client_token,
    };
    Ok(
      self
        .client
        .post(url)
        .header("Idempotency-Key", client_token)
        .json(&body)
        .build()?,
    )
  }

  fn set_favorite_request(&self, id: u64, is_favorite: bool) -> Result<Request> {
    let mut url = self.endpoint(&format!("restaurants/{}/", id))?;
    url
      .query_pairs_mut()
      .append_pair("is_favorite", if is_favorite { "true" } else { "false" });
    Ok(self.client.put(url).build()?)
  }

  /// Map error statuses to typed errors, keeping the body for diagnostics
  async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::from_status(status.as_u16(), &body))
  }
}

#[async_trait]
impl Origin for HttpOrigin {
  fn base_url(&self) -> &Url {
    &self.base
  }

  async fn send(&self, method: Method, url: &Url, body: Option<Vec<u8>>) -> Result<RawResponse> {
    let mut request = self.client.request(method.clone(), url.clone());
    if let Some(body) = body {
      request = request.body(body);
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await?.to_vec();
    debug!(%method, url = %url, status, bytes = body.len(), "Sent request");

    Ok(RawResponse {
      status,
      content_type,
      body,
    })
  }

  async fn list_catalog(&self) -> Result<Vec<CatalogRecord>> {
    let url = self.endpoint("restaurants")?;
    let response = Self::check(self.client.get(url).send().await?).await?;
    Ok(response.json().await?)
  }

  async fn get_catalog(&self, id: u64) -> Result<CatalogRecord> {
    let url = self.endpoint(&format!("restaurants/{}", id))?;
    let response = Self::check(self.client.get(url).send().await?).await?;
    Ok(response.json().await?)
  }

  async fn list_reviews(&self, restaurant_id: u64) -> Result<Vec<ReviewRecord>> {
    let url = self.reviews_url(restaurant_id)?;
    let response = Self::check(self.client.get(url).send().await?).await?;
    Ok(response.json().await?)
  }

  async fn create_review(&self, draft: &ReviewDraft, client_token: &str) -> Result<ReviewRecord> {
    let request = self.create_review_request(draft, client_token)?;
    let response = Self::check(self.client.execute(request).await?).await?;
    Ok(response.json().await?)
  }

  async fn set_favorite(&self, id: u64, is_favorite: bool) -> Result<()> {
    let request = self.set_favorite_request(id, is_favorite)?;
    Self::check(self.client.execute(request).await?).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::{json, Value};

  fn origin(base: &str) -> HttpOrigin {
    HttpOrigin::new(&OriginConfig {
      url: Url::parse(base).unwrap(),
      timeout_secs: 5,
    })
    .unwrap()
  }

  fn body_json(request: &Request) -> Value {
    let bytes = request.body().and_then(|b| b.as_bytes()).unwrap();
    serde_json::from_slice(bytes).unwrap()
  }

  #[test]
  fn test_create_review_request_carries_token() {
    let draft = ReviewDraft::new(3, "Ann", 4, "Great dumplings");
    let request = origin("http://localhost:1337/")
      .create_review_request(&draft, "tok-1")
      .unwrap();

    assert_eq!(request.method(), &Method::POST);
    assert_eq!(request.url().as_str(), "http://localhost:1337/reviews/");
    assert_eq!(request.headers().get("Idempotency-Key").unwrap(), "tok-1");
    assert_eq!(
      body_json(&request),
      json!({
        "restaurant_id": 3,
        "name": "Ann",
        "rating": 4,
        "comments": "Great dumplings",
        "client_token": "tok-1"
      })
    );
  }

  #[test]
  fn test_favorite_request_sets_query_flag() {
    let origin = origin("http://localhost:1337/");

    let on = origin.set_favorite_request(4, true).unwrap();
    assert_eq!(on.method(), &Method::PUT);
    assert_eq!(on.url().as_str(), "http://localhost:1337/restaurants/4/?is_favorite=true");
    assert!(on.body().is_none());

    let off = origin.set_favorite_request(4, false).unwrap();
    assert_eq!(off.url().query(), Some("is_favorite=false"));
  }

  #[test]
  fn test_endpoints_keep_base_path() {
    let origin = origin("http://api.test/v1/");
    assert_eq!(
      origin.reviews_url(7).unwrap().as_str(),
      "http://api.test/v1/reviews/?restaurant_id=7"
    );
    let request = origin
      .create_review_request(&ReviewDraft::new(7, "Bo", 2, "Meh"), "tok-2")
      .unwrap();
    assert_eq!(request.url().path(), "/v1/reviews/");
  }
}
