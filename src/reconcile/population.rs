//! Single-flight first-load population per collection.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::PopulationKey;

type PopulateFuture = Shared<BoxFuture<'static, Result<usize, Arc<Error>>>>;

/// Population state of one key
enum GateState {
  Empty,
  /// Every reader arriving now awaits this same future
  Populating(PopulateFuture),
  Populated,
}

/// Per-context guard that lets exactly one population run per key.
///
/// The lock is only held to inspect or swap state, never across an await.
#[derive(Default)]
pub struct PopulationGate {
  states: Mutex<HashMap<PopulationKey, GateState>>,
}

impl PopulationGate {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PopulationKey, GateState>>> {
    self
      .states
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("Lock poisoned: {}", e)))
  }

  pub fn is_populated(&self, key: PopulationKey) -> bool {
    self
      .lock()
      .map(|states| matches!(states.get(&key), Some(GateState::Populated)))
      .unwrap_or(false)
  }

  /// Ensure `key` is populated, starting `populate` only if no population
  /// is already running or finished. Returns the number of records written
  /// by the population this call awaited (0 if it was already populated).
  pub async fn ensure<F>(&self, key: PopulationKey, populate: F) -> Result<usize>
  where
    F: FnOnce() -> BoxFuture<'static, Result<usize>>,
  {
    let pending = {
      let mut states = self.lock()?;
      match states.get(&key) {
        Some(GateState::Populated) => return Ok(0),
        Some(GateState::Populating(pending)) => {
          debug!(key = %key.as_key(), "Waiting for population in progress");
          pending.clone()
        }
        Some(GateState::Empty) | None => {
          debug!(key = %key.as_key(), "Starting population");
          let pending = populate().map(|r| r.map_err(Arc::new)).boxed().shared();
          states.insert(key, GateState::Populating(pending.clone()));
          pending
        }
      }
    };

    let result = pending.clone().await;

    let mut states = self.lock()?;
    let still_ours = matches!(
      states.get(&key),
      Some(GateState::Populating(current)) if current.ptr_eq(&pending)
    );
    if still_ours {
      let next = if result.is_ok() {
        GateState::Populated
      } else {
        GateState::Empty
      };
      states.insert(key, next);
    }

    result.map_err(Error::Shared)
  }

  /// Forget the state of `key` so the next `ensure` populates again.
  pub fn reset(&self, key: PopulationKey) -> Result<()> {
    self.lock()?.insert(key, GateState::Empty);
    Ok(())
  }
}
