//! The keepalive engine: a fixed-interval timer that probes every idle
//! relay entry and evicts ones whose probe reports a dead peer.

use socksrelay_core::error::classify_io_error;
use socksrelay_core::ProxyError;
use socksrelay_registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Runs the keepalive loop until the returned future is dropped or its
/// enclosing task is aborted. Intended to be `tokio::spawn`ed once at
/// server startup.
///
/// `MissedTickBehavior::Skip` means a tick delayed by a slow probe round
/// does not queue up a burst of catch-up ticks afterward — matching the
/// "missed ticks coalesce" scheduling policy.
pub async fn run(registry: Arc<Registry>, interval_secs: u64) {
    let mut tick = interval(Duration::from_secs(interval_secs));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        debug!("keepalive tick");
        registry
            .for_each_idle_entry(|host, port, principal, client| async move {
                match client.keep_alive().await {
                    Ok(()) => Ok(()),
                    Err(err) if classify_io_error(&err) => Err(ProxyError::DeadPeer {
                        host,
                        port,
                        principal,
                    }),
                    Err(err) => {
                        debug!(host, port, principal, %err, "keepalive probe failed, not a dead-peer signature");
                        Ok(())
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use socksrelay_core::ProtocolClient;
    use socksrelay_registry::AdmissionEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct FlakyClient {
        calls: Arc<AtomicUsize>,
        fail_after: usize,
    }

    #[async_trait]
    impl ProtocolClient for FlakyClient {
        async fn keep_alive(&self) -> std::io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_after {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Broken pipe"))
            } else {
                Ok(())
            }
        }
        async fn kill_connection(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn is_admin(&self) -> Option<bool> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dead_peer_is_evicted_after_one_tick() {
        let registry = Arc::new(Registry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .announce(AdmissionEvent {
                host: "10.0.0.1".into(),
                port: 445,
                scheme: "SMB".into(),
                principal: "CORP\\alice".into(),
                protocol_client: Arc::new(FlakyClient {
                    calls: calls.clone(),
                    fail_after: 0,
                }),
                session_data: Bytes::new(),
            })
            .await
            .unwrap();

        let engine = tokio::spawn(run(registry.clone(), 30));
        tokio::time::advance(StdDuration::from_secs(31)).await;
        tokio::task::yield_now().await;
        // Allow the spawned task to process the tick.
        for _ in 0..10 {
            if registry.len().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        engine.abort();

        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_peer_survives_a_tick() {
        let registry = Arc::new(Registry::new());
        registry
            .announce(AdmissionEvent {
                host: "10.0.0.1".into(),
                port: 445,
                scheme: "SMB".into(),
                principal: "CORP\\alice".into(),
                protocol_client: Arc::new(FlakyClient {
                    calls: Arc::new(AtomicUsize::new(0)),
                    fail_after: 1000,
                }),
                session_data: Bytes::new(),
            })
            .await
            .unwrap();

        let engine = tokio::spawn(run(registry.clone(), 30));
        tokio::time::advance(StdDuration::from_secs(31)).await;
        tokio::task::yield_now().await;
        engine.abort();

        assert_eq!(registry.len().await, 1);
    }
}
