//! Pending-write queue for user mutations made while offline.
//!
//! Writes are accepted locally first and replayed against the origin later:
//! - `enqueue` always succeeds locally and never blocks on the network
//! - `drain` replays FIFO per target, concurrently across targets
//! - a mutation leaves the queue only once the origin acknowledges it

mod mutation;
mod pending;

pub use mutation::{Mutation, MutationKind, MutationStatus, PendingMutation};
pub use pending::{DrainReport, PendingQueue};
pub(crate) use pending::{client_token, enqueue_in};
