//! The capability a relay subsystem's client object must expose to the
//! registry and keepalive engine. Kept separate from the plugin traits
//! (`socksrelay-plugin`) because both the registry crate and the plugin
//! crate need it, and the registry must not depend on the plugin crate.

use async_trait::async_trait;

/// A handle onto an already-authenticated session with a target, as
/// produced by the (out-of-scope) relay subsystem. The registry holds one
/// of these per `RelayEntry`; the keepalive engine and admission consumer
/// call back into it without knowing which concrete protocol it speaks.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send whatever no-op traffic keeps the underlying session from
    /// timing out. Not every protocol needs this on every tick; it is up
    /// to the implementation whether a given call actually touches the
    /// wire.
    async fn keep_alive(&self) -> std::io::Result<()>;

    /// Forcibly tear down the session, used when a duplicate announcement
    /// for the same principal arrives (the newer connection is killed, the
    /// existing one is kept) and during shutdown.
    async fn kill_connection(&self) -> std::io::Result<()>;

    /// Whether the captured identity has administrative rights on the
    /// target. `None` means the underlying protocol has no notion of this
    /// or the probe failed — reported as `"N/A"` over the status endpoint.
    async fn is_admin(&self) -> Option<bool>;
}
