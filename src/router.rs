//! Request interception.
//!
//! Every outgoing request is classified once through an explicit route
//! table, and the class decides the caching policy:
//! - `Static` assets are cache-first against the blob cache
//! - `CatalogRead` / `ReviewRead` are store-first against the record store
//! - `Passthrough` is network-first with the blob cache as fallback
//! - anything that is not a GET goes to the network and is never cached

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::RequestKey;
use crate::error::{ErrorKind, Result};
use crate::origin::RawResponse;
use crate::reconcile::Reconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
  Static,
  CatalogRead,
  ReviewRead,
  Passthrough,
}

impl ResourceClass {
  pub fn policy(&self) -> Policy {
    match self {
      ResourceClass::Static => Policy::CacheFirst,
      ResourceClass::CatalogRead | ResourceClass::ReviewRead => Policy::StoreFirst,
      ResourceClass::Passthrough => Policy::NetworkFirst,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
  CacheFirst,
  StoreFirst,
  NetworkFirst,
  NetworkOnly,
}

/// One row of the route table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
  /// Path prefix relative to the origin url, matched on segment boundaries
  pub prefix: String,
  pub class: ResourceClass,
}

impl RouteRule {
  pub fn new(prefix: &str, class: ResourceClass) -> Self {
    Self {
      prefix: prefix.to_string(),
      class,
    }
  }

  fn matches(&self, path: &str) -> bool {
    match path.strip_prefix(self.prefix.as_str()) {
      Some(rest) => self.prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
      None => false,
    }
  }
}

/// Ordered prefix table; requests to other hosts are always passthrough.
#[derive(Debug, Clone)]
pub struct RouteTable {
  origin: Url,
  rules: Vec<RouteRule>,
}

impl RouteTable {
  pub fn new(origin: Url, rules: Vec<RouteRule>) -> Self {
    Self { origin, rules }
  }

  /// Path of `url` relative to the origin, or `None` for another host.
  fn relative_path<'u>(&self, url: &'u Url) -> Option<&'u str> {
    let same_origin = url.scheme() == self.origin.scheme()
      && url.host_str() == self.origin.host_str()
      && url.port_or_known_default() == self.origin.port_or_known_default();
    if !same_origin {
      return None;
    }
    let base = self.origin.path().trim_end_matches('/');
    url.path().strip_prefix(base)
  }

  pub fn classify(&self, url: &Url) -> ResourceClass {
    let Some(path) = self.relative_path(url) else {
      return ResourceClass::Passthrough;
    };
    self
      .rules
      .iter()
      .find(|rule| rule.matches(path))
      .map(|rule| rule.class)
      .unwrap_or(ResourceClass::Passthrough)
  }

  pub fn policy_for(&self, request: &Request) -> Policy {
    if request.method != Method::GET {
      return Policy::NetworkOnly;
    }
    self.classify(&request.url).policy()
  }
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      body: None,
    }
  }
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
  Cache,
  Store,
  Network,
}

#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl Response {
  fn from_raw(raw: RawResponse, source: ResponseSource) -> Self {
    Self {
      status: raw.status,
      content_type: raw.content_type,
      body: raw.body,
      source,
    }
  }

  fn json<T: Serialize>(value: &T, source: ResponseSource) -> Result<Self> {
    Ok(Self {
      status: 200,
      content_type: Some("application/json".to_string()),
      body: serde_json::to_vec(value)?,
      source,
    })
  }
}

/// Store-first request shapes
enum StoreRead {
  Catalog,
  Restaurant(u64),
  Reviews(u64),
}

/// Intercepts requests for one context.
pub struct Router {
  reconciler: Arc<Reconciler>,
  table: RouteTable,
}

impl Router {
  pub fn new(reconciler: Arc<Reconciler>) -> Self {
    let config = reconciler.context().config();
    let table = RouteTable::new(config.origin.url.clone(), config.route_rules());
    Self { reconciler, table }
  }

  pub fn table(&self) -> &RouteTable {
    &self.table
  }

  pub async fn intercept(&self, request: &Request) -> Result<Response> {
    let policy = self.table.policy_for(request);
    debug!(method = %request.method, url = %request.url, ?policy, "Intercepted request");

    match policy {
      Policy::CacheFirst => self.cache_first(request).await,
      Policy::StoreFirst => self.store_first(request).await,
      Policy::NetworkFirst => self.network_first(request).await,
      Policy::NetworkOnly => self.network_only(request).await,
    }
  }

  async fn cache_first(&self, request: &Request) -> Result<Response> {
    let key = RequestKey::new(&request.url);
    if let Some(storage) = self.reconciler.context().storage() {
      if let Some(hit) = storage.blobs.match_request(&key)? {
        debug!(url = %request.url, generation = %hit.generation, "Cache hit");
        return Ok(Response::from_raw(hit.response, ResponseSource::Cache));
      }
      debug!(url = %request.url, "Cache miss");
    }
    self.fetch_and_store(&key).await
  }

  async fn network_first(&self, request: &Request) -> Result<Response> {
    let key = RequestKey::new(&request.url);
    match self.fetch_and_store(&key).await {
      Ok(response) => Ok(response),
      Err(e) if e.kind() == ErrorKind::NetworkUnreachable => {
        let Some(storage) = self.reconciler.context().storage() else {
          return Err(e);
        };
        match storage.blobs.match_request(&key)? {
          Some(hit) => {
            debug!(url = %request.url, "Network failed, served from cache");
            Ok(Response::from_raw(hit.response, ResponseSource::Cache))
          }
          None => Err(e),
        }
      }
      Err(e) => Err(e),
    }
  }

  async fn network_only(&self, request: &Request) -> Result<Response> {
    let raw = self
      .reconciler
      .context()
      .origin()
      .send(request.method.clone(), &request.url, request.body.clone())
      .await?;
    Ok(Response::from_raw(raw, ResponseSource::Network))
  }

  /// GET from the origin, keeping a copy of successful responses in the
  /// current generation.
  async fn fetch_and_store(&self, key: &RequestKey) -> Result<Response> {
    let context = self.reconciler.context();
    let raw = context.origin().fetch(key.url()).await?;

    if raw.is_success() {
      if let Some(storage) = context.storage() {
        let generation = storage.blobs.current_generation();
        if let Err(e) = storage.blobs.put(key, &raw, generation) {
          warn!(url = %key.url(), error = %e, "Failed to cache response");
        }
      }
    }
    Ok(Response::from_raw(raw, ResponseSource::Network))
  }

  async fn store_first(&self, request: &Request) -> Result<Response> {
    let Some(read) = self.store_read(&request.url) else {
      return self.network_first(request).await;
    };
    let source = if self.reconciler.context().storage().is_some() {
      ResponseSource::Store
    } else {
      ResponseSource::Network
    };

    match read {
      StoreRead::Catalog => Response::json(&self.reconciler.catalog().await?, source),
      StoreRead::Restaurant(id) => Response::json(&self.reconciler.restaurant(id).await?, source),
      StoreRead::Reviews(id) => Response::json(&self.reconciler.reviews_for(id).await?, source),
    }
  }

  fn store_read(&self, url: &Url) -> Option<StoreRead> {
    let path = self.table.relative_path(url)?;
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
      ["restaurants"] => Some(StoreRead::Catalog),
      ["restaurants", id] => id.parse().ok().map(StoreRead::Restaurant),
      ["reviews"] => url
        .query_pairs()
        .find(|(k, _)| k == "restaurant_id")
        .and_then(|(_, v)| v.parse().ok())
        .map(StoreRead::Reviews),
      _ => None,
    }
  }
}
