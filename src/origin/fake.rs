//! Scripted in-memory origin for tests.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use super::{Origin, RawResponse};
use crate::error::{Error, Result};
use crate::store::{CatalogRecord, ReviewDraft, ReviewId, ReviewRecord};

#[derive(Default)]
struct State {
  catalog: Vec<CatalogRecord>,
  reviews: Vec<ReviewRecord>,
  assets: HashMap<String, RawResponse>,
  next_review_id: u64,
  favorite_calls: Vec<(u64, bool)>,
  forwarded: Vec<(Method, String)>,
  /// Client token of every created review, for idempotent replays
  created_tokens: HashMap<String, u64>,
  reject_next: usize,
  drop_next_ack: usize,
}

pub(crate) struct FakeOrigin {
  base: Url,
  state: Mutex<State>,
  offline: AtomicBool,
  /// Honor client tokens like an idempotent origin would
  idempotent: AtomicBool,
  /// Return and store the client token with created reviews
  echo_tokens: AtomicBool,
  latency: Mutex<Duration>,
  pub list_catalog_calls: AtomicUsize,
  pub list_reviews_calls: AtomicUsize,
  pub create_review_calls: AtomicUsize,
  pub fetch_calls: AtomicUsize,
}

impl FakeOrigin {
  pub fn new() -> Self {
    Self {
      base: Url::parse("http://origin.test/").expect("static url"),
      state: Mutex::new(State {
        next_review_id: 100,
        ..State::default()
      }),
      offline: AtomicBool::new(false),
      idempotent: AtomicBool::new(false),
      echo_tokens: AtomicBool::new(true),
      latency: Mutex::new(Duration::ZERO),
      list_catalog_calls: AtomicUsize::new(0),
      list_reviews_calls: AtomicUsize::new(0),
      create_review_calls: AtomicUsize::new(0),
      fetch_calls: AtomicUsize::new(0),
    }
  }

  pub fn with_catalog(self, records: Vec<CatalogRecord>) -> Self {
    self.state.lock().unwrap().catalog = records;
    self
  }

  pub fn with_asset(self, path: &str, body: &str) -> Self {
    let url = self.base.join(path).unwrap();
    self.state.lock().unwrap().assets.insert(
      url.to_string(),
      RawResponse {
        status: 200,
        content_type: Some("text/plain".into()),
        body: body.as_bytes().to_vec(),
      },
    );
    self
  }

  pub fn with_review(self, review: ReviewRecord) -> Self {
    self.state.lock().unwrap().reviews.push(review);
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_idempotent(&self, idempotent: bool) {
    self.idempotent.store(idempotent, Ordering::SeqCst);
  }

  pub fn set_echo_tokens(&self, echo: bool) {
    self.echo_tokens.store(echo, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Reject the next `n` mutations with a 500
  pub fn reject_next(&self, n: usize) {
    self.state.lock().unwrap().reject_next = n;
  }

  /// Apply the next `n` review creations but report a network error
  pub fn drop_next_ack(&self, n: usize) {
    self.state.lock().unwrap().drop_next_ack = n;
  }

  pub fn favorite_calls(&self) -> Vec<(u64, bool)> {
    self.state.lock().unwrap().favorite_calls.clone()
  }

  /// Non-GET requests seen by `send`
  pub fn forwarded(&self) -> Vec<(Method, String)> {
    self.state.lock().unwrap().forwarded.clone()
  }

  pub fn remote_reviews(&self, restaurant_id: u64) -> Vec<ReviewRecord> {
    self
      .state
      .lock()
      .unwrap()
      .reviews
      .iter()
      .filter(|r| r.restaurant_id == restaurant_id)
      .cloned()
      .collect()
  }

  pub fn remote_favorite(&self, id: u64) -> Option<bool> {
    self
      .state
      .lock()
      .unwrap()
      .catalog
      .iter()
      .find(|r| r.id == id)
      .map(|r| r.is_favorite)
  }

  async fn round_trip(&self) -> Result<()> {
    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(Error::NetworkUnreachable("origin offline".into()));
    }
    Ok(())
  }

  fn take_rejection(&self) -> Result<()> {
    let mut state = self.state.lock().unwrap();
    if state.reject_next > 0 {
      state.reject_next -= 1;
      return Err(Error::RemoteRejected {
        status: 500,
        body: "internal error".into(),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl Origin for FakeOrigin {
  fn base_url(&self) -> &Url {
    &self.base
  }

  async fn send(&self, method: Method, url: &Url, _body: Option<Vec<u8>>) -> Result<RawResponse> {
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    self.round_trip().await?;
    let mut state = self.state.lock().unwrap();
    if method != Method::GET {
      state.forwarded.push((method, url.to_string()));
      return Ok(RawResponse::json(b"{}".to_vec()));
    }
    Ok(state.assets.get(url.as_str()).cloned().unwrap_or(RawResponse {
      status: 404,
      content_type: None,
      body: b"not found".to_vec(),
    }))
  }

  async fn list_catalog(&self) -> Result<Vec<CatalogRecord>> {
    self.list_catalog_calls.fetch_add(1, Ordering::SeqCst);
    self.round_trip().await?;
    Ok(self.state.lock().unwrap().catalog.clone())
  }

  async fn get_catalog(&self, id: u64) -> Result<CatalogRecord> {
    self.round_trip().await?;
    self
      .state
      .lock()
      .unwrap()
      .catalog
      .iter()
      .find(|r| r.id == id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("restaurant {}", id)))
  }

  async fn list_reviews(&self, restaurant_id: u64) -> Result<Vec<ReviewRecord>> {
    self.list_reviews_calls.fetch_add(1, Ordering::SeqCst);
    self.round_trip().await?;
    Ok(self.remote_reviews(restaurant_id))
  }

  async fn create_review(&self, draft: &ReviewDraft, client_token: &str) -> Result<ReviewRecord> {
    self.create_review_calls.fetch_add(1, Ordering::SeqCst);
    self.round_trip().await?;
    self.take_rejection()?;

    let mut state = self.state.lock().unwrap();
    if self.idempotent.load(Ordering::SeqCst) {
      if let Some(id) = state.created_tokens.get(client_token).copied() {
        if let Some(existing) = state.reviews.iter().find(|r| r.id == ReviewId::Remote(id)) {
          return Ok(existing.clone());
        }
      }
    }

    let id = state.next_review_id;
    state.next_review_id += 1;
    let mut review = ReviewRecord::provisional(0, draft, client_token);
    review.id = ReviewId::Remote(id);
    if !self.echo_tokens.load(Ordering::SeqCst) {
      review.client_token = None;
    }
    state.created_tokens.insert(client_token.to_string(), id);
    state.reviews.push(review.clone());

    if state.drop_next_ack > 0 {
      state.drop_next_ack -= 1;
      return Err(Error::NetworkUnreachable("connection reset".into()));
    }
    Ok(review)
  }

  async fn set_favorite(&self, id: u64, is_favorite: bool) -> Result<()> {
    self.round_trip().await?;
    self.take_rejection()?;

    let mut state = self.state.lock().unwrap();
    state.favorite_calls.push((id, is_favorite));
    if let Some(record) = state.catalog.iter_mut().find(|r| r.id == id) {
      record.is_favorite = is_favorite;
    }
    Ok(())
  }
}
