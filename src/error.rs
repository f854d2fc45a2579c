//! Error types for the offline data layer.

use std::sync::Arc;

use thiserror::Error;

/// Maximum length for remote response bodies kept in errors and queue rows
const MAX_ERROR_BODY_LENGTH: usize = 500;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
  /// The durable store could not be opened. The caller degrades to network-only.
  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  #[error("Network unreachable: {0}")]
  NetworkUnreachable(String),

  #[error("Remote rejected request with status {status}: {body}")]
  RemoteRejected { status: u16, body: String },

  #[error("Schema upgrade failed: {0}")]
  SchemaUpgradeFailure(String),

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Not found: {0}")]
  NotFound(String),

  #[error("Invalid review: {0}")]
  InvalidReview(&'static str),

  #[error("Transaction scope violation: {0}")]
  Scope(String),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Configuration error: {0}")]
  Config(String),

  #[error(transparent)]
  Shared(Arc<Error>),
}

/// Coarse classification used by callers that need to tell
/// "no data" apart from "could not reach origin".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  StorageUnavailable,
  NetworkUnreachable,
  RemoteRejected,
  SchemaUpgradeFailure,
  Storage,
  NotFound,
  Invalid,
  Internal,
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
      Error::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
      Error::RemoteRejected { .. } => ErrorKind::RemoteRejected,
      Error::SchemaUpgradeFailure(_) => ErrorKind::SchemaUpgradeFailure,
      Error::Storage(_) => ErrorKind::Storage,
      Error::NotFound(_) => ErrorKind::NotFound,
      Error::InvalidReview(_) | Error::Scope(_) => ErrorKind::Invalid,
      Error::Serialization(_) | Error::Config(_) => ErrorKind::Internal,
      Error::Shared(inner) => inner.kind(),
    }
  }

  /// Whether a retry on the next reconnect could succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::NetworkUnreachable | ErrorKind::RemoteRejected | ErrorKind::Storage
    )
  }

  /// Truncate a response body to avoid storing excessive data
  pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
  }

  pub fn from_status(status: u16, body: &str) -> Self {
    match status {
      404 => Error::NotFound(Self::truncate_body(body)),
      _ => Error::RemoteRejected {
        status,
        body: Self::truncate_body(body),
      },
    }
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    if e.is_builder() {
      return Error::Config(format!("Invalid request: {}", e));
    }
    if e.is_decode() {
      return Error::RemoteRejected {
        status: e.status().map(|s| s.as_u16()).unwrap_or(200),
        body: format!("undecodable response: {}", e),
      };
    }
    Error::NetworkUnreachable(e.to_string())
  }
}
