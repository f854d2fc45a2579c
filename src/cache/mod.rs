//! Versioned blob cache for static assets and GET responses.
//!
//! This module provides a byte-level response cache that:
//! - Keys entries by request identity (hashed URL, with or without query)
//! - Scopes every entry to a named generation
//! - Purges whole non-current generations on activation

mod blob;
mod key;

pub use blob::{BlobCache, CachedResponse};
pub use key::{MatchPolicy, RequestKey};
