//! `ECHO` — a demonstration plugin that skips authentication unconditionally
//! and tunnels bytes straight back to the client. Not a real protocol: it
//! exists to exercise the plugin contract end-to-end in tests and to serve
//! as a worked example for anyone wiring in a real one.

use async_trait::async_trait;
use socksrelay_core::ProxyError;
use socksrelay_plugin::{AsyncReadWrite, PluginFactory, PluginInstance};
use socksrelay_registry::CheckedOutEntry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct EchoPluginFactory;

#[async_trait]
impl PluginFactory for EchoPluginFactory {
    fn scheme(&self) -> &str {
        "ECHO"
    }

    async fn build(
        &self,
        entry: &CheckedOutEntry,
        _client_addr: std::net::SocketAddr,
    ) -> Result<Box<dyn PluginInstance>, ProxyError> {
        Ok(Box::new(EchoInstance {
            principal: entry.principal.clone(),
        }))
    }
}

struct EchoInstance {
    principal: String,
}

#[async_trait]
impl PluginInstance for EchoInstance {
    async fn init_connection(&mut self) -> Result<(), ProxyError> {
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
