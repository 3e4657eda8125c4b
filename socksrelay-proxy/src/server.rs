//! The SOCKS accept loop: binds the configured listen address and spawns
//! one [`crate::handler::handle_connection`] task per accepted client.
//!
//! A single accept loop on one runtime, rather than one worker per core,
//! since every connection serializes through the registry's lock anyway.

use crate::handler::{handle_connection, HandlerContext};
use socksrelay_plugin::PluginRegistry;
use socksrelay_registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Binds `listen_addr` and accepts SOCKS connections until the process is
/// told to stop (the caller is expected to race this future against a
/// shutdown signal; it never returns on its own).
pub async fn run(listen_addr: SocketAddr, registry: Arc<Registry>, plugins: Arc<PluginRegistry>, dns_passthrough: bool) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "SOCKS listener bound");

    let ctx = Arc::new(HandlerContext {
        registry,
        plugins,
        dns_passthrough,
    });

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    handle_connection(stream, peer_addr, ctx).await;
                });
            }
            Err(err) => {
                error!(%err, "accept error");
            }
        }
    }
}
