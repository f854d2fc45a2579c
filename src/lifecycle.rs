use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};
use crate::origin::Origin;
use crate::reconcile::Reconciler;

/// Lifecycle events of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  /// Pre-warm the blob cache and open the store
  Install,
  /// Purge stale cache generations and replay pending writes
  Activate,
  /// Connectivity came back; replay pending writes
  NetworkRestored,
}

/// Sending half for lifecycle events
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<Lifecycle>,
}

impl EventSender {
  /// Returns false once the event loop has gone away
  pub fn send(&self, event: Lifecycle) -> bool {
    self.tx.send(event).is_ok()
  }
}

/// Event handler that yields lifecycle events in arrival order
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Lifecycle>,
}

impl EventHandler {
  pub fn channel() -> (EventSender, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Lifecycle> {
    self.rx.recv().await
  }
}

/// Tracks reachability and reports offline-to-online transitions.
#[derive(Debug, Default)]
pub struct Connectivity {
  online: Option<bool>,
}

impl Connectivity {
  pub fn observe(&mut self, online: bool) -> Option<Lifecycle> {
    let previous = self.online.replace(online);
    match (previous, online) {
      (Some(false), true) => Some(Lifecycle::NetworkRestored),
      (Some(true), false) => {
        warn!("Origin unreachable");
        None
      }
      _ => None,
    }
  }
}

/// Whether the origin answers at all; any status counts as reachable.
pub async fn probe(origin: &dyn Origin) -> bool {
  origin.fetch(origin.base_url()).await.is_ok()
}

/// Poll the origin every `interval` and emit `NetworkRestored` when it
/// comes back.
pub fn spawn_probe(origin: Arc<dyn Origin>, interval: Duration, events: EventSender) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut connectivity = Connectivity::default();
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      let online = probe(origin.as_ref()).await;
      debug!(online, "Connectivity probe");
      if let Some(event) = connectivity.observe(online) {
        if !events.send(event) {
          break;
        }
      }
    }
  })
}

/// Feeds lifecycle events to one reconciler, one at a time.
pub struct EventLoop {
  reconciler: Arc<Reconciler>,
  events: EventHandler,
}

impl EventLoop {
  pub fn new(reconciler: Arc<Reconciler>, events: EventHandler) -> Self {
    Self { reconciler, events }
  }

  /// Run until every sender is dropped.
  ///
  /// Failed events are logged and the loop goes on; only a schema upgrade
  /// failure ends it.
  pub async fn run(mut self) -> Result<()> {
    while let Some(event) = self.events.next().await {
      if let Err(e) = self.reconciler.handle(event).await {
        if e.kind() == ErrorKind::SchemaUpgradeFailure {
          return Err(e);
        }
        warn!(?event, error = %e, "Lifecycle event failed");
      }
    }
    info!("Event loop finished");
    Ok(())
  }
}
