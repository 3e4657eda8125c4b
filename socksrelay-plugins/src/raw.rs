//! `RAW` — a demonstration plugin identical to [`crate::echo`]'s `ECHO`
//! except that it fails `init_connection` once every `fail_every`
//! connections, deterministically. Exists to exercise
//! `ProxyError::PluginInitFailure` handling in the handler and server
//! tests without needing a flaky real dependency.

use async_trait::async_trait;
use socksrelay_core::ProxyError;
use socksrelay_plugin::{AsyncReadWrite, PluginFactory, PluginInstance};
use socksrelay_registry::CheckedOutEntry;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct RawPluginFactory {
    fail_every: usize,
    attempts: AtomicUsize,
}

impl RawPluginFactory {
    /// `fail_every == 0` disables failure injection entirely.
    pub fn new(fail_every: usize) -> Self {
        Self {
            fail_every,
            attempts: AtomicUsize::new(0),
        }
    }
}

impl Default for RawPluginFactory {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl PluginFactory for RawPluginFactory {
    fn scheme(&self) -> &str {
        "RAW"
    }

    async fn build(
        &self,
        entry: &CheckedOutEntry,
        _client_addr: std::net::SocketAddr,
    ) -> Result<Box<dyn PluginInstance>, ProxyError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let should_fail = self.fail_every != 0 && attempt % self.fail_every == 0;
        Ok(Box::new(RawInstance {
            principal: entry.principal.clone(),
            host: entry.host.clone(),
            port: entry.port,
            should_fail,
        }))
    }
}

struct RawInstance {
    principal: String,
    host: String,
    port: u16,
    should_fail: bool,
}

#[async_trait]
impl PluginInstance for RawInstance {
    async fn init_connection(&mut self) -> Result<(), ProxyError> {
        if self.should_fail {
            return Err(ProxyError::PluginInitFailure {
                scheme: "RAW".to_string(),
                host: self.host.clone(),
                port: self.port,
                reason: "injected failure for testing".to_string(),
            });
        }
        Ok(())
    }

    async fn skip_authentication(&mut self) -> Result<bool, ProxyError> {
        Ok(true)
    }

    async fn tunnel_connection(
        &mut self,
        client: &mut (dyn AsyncReadWrite + Send + Unpin),
    ) -> Result<(), ProxyError> {
        let mut buf = [0u8; 4096];
        loop {
            let n = client.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            client.write_all(&buf[..n]).await?;
        }
    }

    fn username(&self) -> &str {
        &self.principal
    }
}
