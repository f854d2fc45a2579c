use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::MatchPolicy;
use crate::error::{Error, Result};
use crate::router::{ResourceClass, RouteRule};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub origin: OriginConfig,
  pub cache: CacheConfig,
  /// Ordered path-prefix table; the first matching prefix wins
  pub routes: Vec<RouteRule>,
  pub store: StoreConfig,
  pub queue: QueueConfig,
  pub connectivity: ConnectivityConfig,
  /// Also write logs to a daily rolling file in the data directory
  pub log_file: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
  pub url: Url,
  pub timeout_secs: u64,
}

impl Default for OriginConfig {
  fn default() -> Self {
    Self {
      url: default_origin_url(),
      timeout_secs: 10,
    }
  }
}

fn default_origin_url() -> Url {
  Url::parse("http://localhost:1337/").unwrap_or_else(|_| unreachable!("static url"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the live blob cache generation
  pub generation: String,
  pub match_policy: MatchPolicy,
  /// Assets stored on install, relative to the origin url
  pub precache: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: "restaurant-reviews-v1".to_string(),
      match_policy: MatchPolicy::default(),
      precache: [
        "/",
        "index.html",
        "restaurant.html",
        "css/styles.css",
        "js/dbhelper.js",
        "js/main.js",
        "js/restaurant_info.js",
        "restaurant.svg",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Defaults to `$XDG_DATA_HOME/restocache/offline.db`
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// How long a claimed mutation stays reserved for the claiming context
  pub lease_secs: i64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self { lease_secs: 60 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self { probe_secs: 15 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./restocache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/restocache/config.yaml
  ///
  /// Without a config file every field takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!("Config file not found: {}", p.display())));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("restocache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("restocache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;
    Self::parse(&contents)
      .map_err(|e| Error::Config(format!("Failed to parse config file {}: {}", path.display(), e)))
  }

  /// Parse a YAML document and normalize it.
  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
    Ok(config.normalized())
  }

  /// Replace the origin url, e.g. from a command-line flag.
  pub fn with_origin(mut self, url: Url) -> Self {
    self.origin.url = url;
    self.normalized()
  }

  fn normalized(mut self) -> Self {
    // Relative endpoint joins drop the last path segment without this
    if !self.origin.url.path().ends_with('/') {
      let path = format!("{}/", self.origin.url.path());
      self.origin.url.set_path(&path);
    }
    self
  }

  /// Route table to use, falling back to the built-in one.
  pub fn route_rules(&self) -> Vec<RouteRule> {
    if self.routes.is_empty() {
      vec![
        RouteRule::new("/restaurants", ResourceClass::CatalogRead),
        RouteRule::new("/reviews", ResourceClass::ReviewRead),
        RouteRule::new("/", ResourceClass::Static),
      ]
    } else {
      self.routes.clone()
    }
  }

  /// Database path from config, or the default data directory location.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.store.path {
      Some(p) => Ok(p.clone()),
      None => crate::db::Database::default_path(),
    }
  }

  /// Absolute urls of the install-time asset list.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self
      .cache
      .precache
      .iter()
      .map(|asset| {
        self
          .origin
          .url
          .join(asset)
          .map_err(|e| Error::Config(format!("Invalid precache entry '{}': {}", asset, e)))
      })
      .collect()
  }
}
