//! The admission feed: a channel carrying [`AdmissionEvent`]s from the
//! (out-of-scope) relay subsystem into the registry.
//!
//! Grounded on `original_source`'s `activeConnectionsWatcher` (a blocking
//! `Queue.get()` loop) structurally, and on
//! `ando-observability/src/logger.rs`'s mpsc-channel-plus-task-loop shape
//! for the Rust idiom (bounded `tokio::sync::mpsc` channel instead of an
//! unbounded `queue.Queue`, since unbounded admission would let a runaway
//! relay subsystem exhaust memory).

use crate::registry::{AdmissionEvent, Registry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The producer-facing handle for the admission feed. Cloned freely by
/// anything that announces new relay sessions.
#[derive(Clone)]
pub struct AdmissionSender {
    tx: mpsc::Sender<AdmissionEvent>,
}

impl AdmissionSender {
    pub async fn announce(&self, event: AdmissionEvent) -> Result<(), AdmissionEvent> {
        self.tx.send(event).await.map_err(|e| e.0)
    }
}

/// Builds the channel and returns the sender half plus a future that, when
/// spawned, drains events into `registry` until every sender is dropped.
pub fn channel(capacity: usize, registry: Arc<Registry>) -> (AdmissionSender, impl std::future::Future<Output = ()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let consumer = run_consumer(rx, registry);
    (AdmissionSender { tx }, consumer)
}

async fn run_consumer(mut rx: mpsc::Receiver<AdmissionEvent>, registry: Arc<Registry>) {
    while let Some(event) = rx.recv().await {
        debug!(host = %event.host, port = event.port, principal = %event.principal, "admission event received");
        if let Err(err) = registry.announce(event).await {
            if err.is_expected() {
                debug!(%err, "admission event not applied");
            } else {
                warn!(%err, "admission event rejected");
            }
        }
    }
}
