//! Offline-resilient data layer for a restaurant catalog.
//!
//! Reads go through a [`Router`] that serves static assets from a
//! generation-scoped blob cache and catalog/review data from a persistent
//! record store. Writes are accepted into a durable pending-write queue and
//! replayed against the origin by a [`Reconciler`] once it is reachable.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod origin;
pub mod queue;
pub mod reconcile;
pub mod router;
pub mod store;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::{EventHandler, EventLoop, Lifecycle};
pub use origin::{HttpOrigin, Origin};
pub use reconcile::{Accepted, OfflineContext, Reconciler};
pub use router::{Request, Response, ResponseSource, Router};
