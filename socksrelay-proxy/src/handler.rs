//! The SOCKS front-end state machine:
//! `GREETING -> REQUEST -> DISPATCH -> {TUNNEL | REPLY_ERROR | DNS_PASSTHROUGH} -> DONE`.
//!
//! One function owns the whole connection lifecycle, with explicit `Result`
//! propagation and tracing at each decision point.

use socksrelay_core::error::classify_io_error;
use socksrelay_core::wire::{self, reply_field, ConnectRequest, SocksVersion};
use socksrelay_core::ProxyError;
use socksrelay_plugin::PluginRegistry;
use socksrelay_registry::Registry;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const DNS_PORT: u16 = 53;

/// Shared, read-mostly state every handler task needs: the relay registry,
/// the plugin registry built once at startup, and the DNS-passthrough
/// toggle.
pub struct HandlerContext {
    pub registry: Arc<Registry>,
    pub plugins: Arc<PluginRegistry>,
    pub dns_passthrough: bool,
}

/// Entry point spawned once per accepted TCP connection.
pub async fn handle_connection(mut client: TcpStream, peer_addr: SocketAddr, ctx: Arc<HandlerContext>) {
    let local_addr = client
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    if let Err(err) = run(&mut client, peer_addr, local_addr, &ctx).await {
        if err.is_expected() {
            debug!(peer = %peer_addr, %err, "socks session ended");
        } else {
            warn!(peer = %peer_addr, %err, "socks session failed");
        }
    }
}

async fn run<S>(
    client: &mut S,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    ctx: &HandlerContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // GREETING
    let version_byte = wire::read_version(client).await?;
    let socks_version = match version_byte {
        0x05 => SocksVersion::V5,
        0x04 => SocksVersion::V4,
        other => return Err(ProxyError::UnsupportedVersion(other)),
    };

    if socks_version == SocksVersion::V5 {
        wire::read_socks5_greeting(client).await?;
        wire::write_socks5_greeting_reply(client).await?;
    }

    let parsed = match socks_version {
        SocksVersion::V5 => wire::read_socks5_request(client).await,
        SocksVersion::V4 => wire::read_socks4_request(client).await,
    };
    let request = match parsed {
        Ok(request) => request,
        Err(err) => {
            // The version is known at this point, so an unsupported CMD or
            // ATYP still gets exactly one reply frame before the connection
            // closes, instead of silently dropping the client.
            debug!(%err, "malformed or unsupported request, refusing");
            reply_failure(client, socks_version, rep_for_parse_error(&err)).await?;
            return Err(err);
        }
    };

    // DISPATCH
    if request.port == DNS_PORT && ctx.dns_passthrough {
        return dns_passthrough(client, &request, peer_addr).await;
    }

    dispatch_relay(client, &request, peer_addr, local_addr, ctx).await
}

async fn dispatch_relay<S>(
    client: &mut S,
    request: &ConnectRequest,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    ctx: &HandlerContext,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let host = request.target.host_string();
    let port = request.port;

    let checked_out = match ctx.registry.checkout(&host, port).await {
        Ok(entry) => entry,
        Err(err) => {
            debug!(host, port, %err, "no relay available");
            reply_error(client, request.version).await?;
            return Ok(());
        }
    };
    let scheme = checked_out.scheme.clone();
    let principal = checked_out.principal.clone();

    let factory = match ctx.plugins.get(&scheme) {
        Some(factory) => factory,
        None => {
            warn!(host, port, scheme = %scheme, "no plugin registered for scheme");
            ctx.registry.release(&host, port, &principal).await;
            reply_error(client, request.version).await?;
            return Ok(());
        }
    };

    let mut instance = match factory.build(&checked_out, peer_addr).await {
        Ok(instance) => instance,
        Err(err) => {
            warn!(host, port, scheme = %scheme, %err, "plugin failed to build");
            ctx.registry.release(&host, port, &principal).await;
            reply_error(client, request.version).await?;
            return Err(err);
        }
    };

    if let Err(err) = instance.init_connection().await {
        warn!(host, port, scheme = %scheme, %err, "plugin init_connection failed");
        ctx.registry.release(&host, port, &principal).await;
        reply_error(client, request.version).await?;
        return Err(err);
    }

    reply_success(client, request.version, local_addr).await?;

    match instance.skip_authentication().await {
        Ok(true) => {}
        Ok(false) => {
            debug!(host, port, principal = %principal, "plugin declined auth skip, closing");
            ctx.registry.release(&host, port, &principal).await;
            return Ok(());
        }
        Err(err) => {
            warn!(host, port, principal = %principal, %err, "plugin auth-skip failed");
            ctx.registry.release(&host, port, &principal).await;
            return Err(err);
        }
    }

    info!(host, port, scheme = %scheme, principal = %principal, "tunnel established");
    match instance.tunnel_connection(client).await {
        Ok(()) => {
            ctx.registry.release(&host, port, &principal).await;
            Ok(())
        }
        Err(err) => {
            let dead_peer = matches!(err, ProxyError::DeadPeer { .. })
                || matches!(&err, ProxyError::Io(io_err) if classify_io_error(io_err));
            if dead_peer {
                warn!(host, port, principal = %principal, "tunnel detected a dead peer, evicting");
                ctx.registry.evict(&host, port, &principal).await;
            } else {
                ctx.registry.release(&host, port, &principal).await;
            }
            Err(err)
        }
    }
}

async fn dns_passthrough<S>(
    client: &mut S,
    request: &ConnectRequest,
    peer_addr: SocketAddr,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let target = format!("{}:{}", request.target.host_string(), request.port);
    info!(peer = %peer_addr, target = %target, "dns passthrough connect");

    let mut upstream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(target = %target, %err, "dns passthrough connect failed");
            reply_error(client, request.version).await?;
            return Ok(());
        }
    };

    reply_success(
        client,
        request.version,
        SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    )
    .await?;

    copy_bidirectional(client, &mut upstream).await?;
    Ok(())
}

async fn reply_error<S>(client: &mut S, version: SocksVersion) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    reply_failure(client, version, reply_field::CONNECTION_REFUSED).await
}

async fn reply_failure<S>(client: &mut S, version: SocksVersion, rep: u8) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => wire::write_socks5_reply(client, rep, Ipv4Addr::UNSPECIFIED, 0).await,
        SocksVersion::V4 => wire::write_socks4_reply(client, false).await,
    }
}

/// Maps a request-parse failure to the closest SOCKS5 REP code. SOCKS4 has
/// no equivalent field; every failure there sends the single generic
/// rejection byte regardless of this mapping.
fn rep_for_parse_error(err: &ProxyError) -> u8 {
    match err {
        ProxyError::UnsupportedCommand(_) => reply_field::COMMAND_NOT_SUPPORTED,
        ProxyError::UnsupportedAddressType(_) => reply_field::ADDRESS_NOT_SUPPORTED,
        _ => reply_field::CONNECTION_REFUSED,
    }
}

async fn reply_success<S>(client: &mut S, version: SocksVersion, local_addr: SocketAddr) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => {
            let bind_addr = match local_addr.ip() {
                std::net::IpAddr::V4(v4) => v4,
                std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            wire::write_socks5_reply(client, reply_field::SUCCEEDED, bind_addr, local_addr.port()).await
        }
        SocksVersion::V4 => wire::write_socks4_reply(client, true).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use socksrelay_core::ProtocolClient;
    use socksrelay_plugin::{AsyncReadWrite, PluginFactory, PluginInstance};
    use socksrelay_registry::{AdmissionEvent, CheckedOutEntry};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    struct NullClient;
    #[async_trait]
    impl ProtocolClient for NullClient {
        async fn keep_alive(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn kill_connection(&self) -> std::io::Result<()> {
            Ok(())
        }
        async fn is_admin(&self) -> Option<bool> {
            Some(false)
        }
    }

    struct EchoFactory;
    #[async_trait]
    impl PluginFactory for EchoFactory {
        fn scheme(&self) -> &str {
            "ECHO"
        }
        async fn build(
            &self,
            entry: &CheckedOutEntry,
            _client_addr: SocketAddr,
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

    async fn seeded_ctx() -> HandlerContext {
        let registry = Arc::new(Registry::new());
        registry
            .announce(AdmissionEvent {
                host: "10.0.0.1".into(),
                port: 445,
                scheme: "ECHO".into(),
                principal: "CORP\\alice".into(),
                protocol_client: Arc::new(NullClient),
                session_data: Bytes::new(),
            })
            .await
            .unwrap();

        let mut plugins = PluginRegistry::new();
        plugins.register(Arc::new(EchoFactory));

        HandlerContext {
            registry,
            plugins: Arc::new(plugins),
            dns_passthrough: true,
        }
    }

    #[tokio::test]
    async fn happy_path_socks5_ipv4_tunnels_and_releases() {
        let ctx = seeded_ctx().await;
        let (mut test_side, mut server_side) = duplex(256);
        let local_addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let peer_addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();

        let ctx_arc = Arc::new(ctx);
        let ctx_for_task = ctx_arc.clone();
        let handle = tokio::spawn(async move {
            run(&mut server_side, peer_addr, local_addr, &ctx_for_task).await
        });

        test_side.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        test_side.read_exact(&mut greeting_reply).await.unwrap();
        assert_eq!(greeting_reply, [0x05, 0x00]);

        test_side
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x01, 0xBD])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        test_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], reply_field::SUCCEEDED);

        test_side.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        test_side.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(test_side);
        handle.await.unwrap().unwrap();

        // The principal is idle again after the session ends.
        let entry = ctx_arc.registry.checkout("10.0.0.1", 445).await.unwrap();
        assert_eq!(entry.principal, "CORP\\alice");
    }

    #[tokio::test]
    async fn no_relay_replies_connection_refused() {
        let ctx = seeded_ctx().await;
        let (mut test_side, mut server_side) = duplex(256);
        let local_addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let peer_addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();

        let handle = tokio::spawn(async move { run(&mut server_side, peer_addr, local_addr, &ctx).await });

        test_side.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        test_side.read_exact(&mut greeting_reply).await.unwrap();

        // No entry for 192.168.1.5:445 in the seeded registry.
        test_side
            .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 168, 1, 5, 0x01, 0xBD])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        test_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], reply_field::CONNECTION_REFUSED);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn socks5_ipv6_request_replies_address_not_supported() {
        let ctx = seeded_ctx().await;
        let (mut test_side, mut server_side) = duplex(256);
        let local_addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let peer_addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();

        let handle = tokio::spawn(async move { run(&mut server_side, peer_addr, local_addr, &ctx).await });

        test_side.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        test_side.read_exact(&mut greeting_reply).await.unwrap();

        test_side
            .write_all(&[0x05, 0x01, 0x00, 0x04, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        test_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], reply_field::ADDRESS_NOT_SUPPORTED);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedAddressType(4)));
    }

    #[tokio::test]
    async fn socks4a_unknown_host_replies_failure() {
        let ctx = seeded_ctx().await;
        let (mut test_side, mut server_side) = duplex(256);
        let local_addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let peer_addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();

        let handle = tokio::spawn(async move { run(&mut server_side, peer_addr, local_addr, &ctx).await });

        let mut payload = vec![0x04, 0x01];
        payload.extend_from_slice(&443u16.to_be_bytes());
        payload.extend_from_slice(&[0, 0, 0, 1]);
        payload.push(0); // empty userid
        payload.extend_from_slice(b"foo.bar");
        payload.push(0);
        test_side.write_all(&payload).await.unwrap();

        let mut reply = [0u8; 8];
        test_side.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 0x5B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

        handle.await.unwrap().unwrap();
    }
}
