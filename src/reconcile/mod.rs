//! Reconciliation between the local store and the remote origin.
//!
//! A [`Reconciler`] owns one [`OfflineContext`]. Reads are served from the
//! record store after a single-flight first-load population; writes go
//! through the pending-write queue and are applied locally only when the
//! origin acknowledges them. Without storage the context falls back to
//! talking to the origin directly.

mod context;
mod driver;
mod population;

pub use context::{OfflineContext, Storage};
pub use driver::{Accepted, Reconciler};
pub use population::PopulationGate;
