//! The per-scheme plugin capability contract. Async throughout: every
//! operation a SOCKS plugin performs is I/O.

use async_trait::async_trait;
use socksrelay_core::ProxyError;
use socksrelay_registry::CheckedOutEntry;
use tokio::io::{AsyncRead, AsyncWrite};

/// Convenience bound so plugin instances don't need to know whether their
/// client handle is a live `TcpStream` or, in tests, an in-memory duplex.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Everything a plugin instance needs to bypass a target protocol's own
/// authentication handshake and tunnel bytes for one checked-out relay
/// entry. One instance is constructed per accepted client connection that
/// matches a registry entry; instances are never reused.
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// Leaves the relay session ready to accept the client's traffic —
    /// whatever handshake replay or state reset the protocol needs before
    /// a new client can be multiplexed onto it.
    async fn init_connection(&mut self) -> Result<(), ProxyError>;

    /// Bypasses the target protocol's own authentication so the client
    /// never has to present real credentials — the client is already
    /// trusted by virtue of having reached this proxy. Returns `false` if
    /// the bypass itself could not be completed (the reference
    /// implementation treats this as "something didn't go right" and
    /// closes the client socket without a reply).
    async fn skip_authentication(&mut self) -> Result<bool, ProxyError>;

    /// Tunnels bytes between the client and the relayed session until
    /// either side closes or an unrecoverable error occurs.
    async fn tunnel_connection(
        &mut self,
        client: &mut (dyn AsyncReadWrite + Send + Unpin),
    ) -> Result<(), ProxyError>;

    /// The principal this instance ended up using — the checked-out
    /// entry's principal, echoed back so the handler can release/evict
    /// the right registry entry without re-deriving it.
    fn username(&self) -> &str;
}

/// A stateless, per-scheme constructor. One factory is registered per
/// scheme at startup and is never mutated afterward: it is safe
/// to share across every handler task via the registry.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    /// The scheme this factory handles, e.g. `"SMB"`, `"LDAP"`.
    fn scheme(&self) -> &str;

    /// Builds a fresh instance bound to one checked-out relay entry and
    /// the raw TCP target (host/port) the client asked for — a plugin may
    /// need the client's address even though the relay entry is already
    /// associated with the target, e.g. to log it.
    async fn build(
        &self,
        entry: &CheckedOutEntry,
        client_addr: std::net::SocketAddr,
    ) -> Result<Box<dyn PluginInstance>, ProxyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use socksrelay_core::ProtocolClient;
    use std::sync::Arc;

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
            None
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
            _client: &mut (dyn AsyncReadWrite + Send + Unpin),
        ) -> Result<(), ProxyError> {
            Ok(())
        }
        fn username(&self) -> &str {
            &self.principal
        }
    }

    fn entry() -> CheckedOutEntry {
        CheckedOutEntry {
            host: "10.0.0.1".into(),
            port: 445,
            principal: "CORP\\alice".into(),
            scheme: "SMB".into(),
            shared_data: Bytes::new(),
            session_data: Bytes::new(),
            protocol_client: Arc::new(NullClient),
        }
    }

    #[tokio::test]
    async fn echo_instance_reports_its_username() {
        let mut instance = EchoInstance {
            principal: entry().principal,
        };
        instance.init_connection().await.unwrap();
        assert!(instance.skip_authentication().await.unwrap());
        assert_eq!(instance.username(), "CORP\\alice");
    }
}
