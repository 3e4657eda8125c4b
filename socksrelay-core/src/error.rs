use thiserror::Error;

/// Unified error type for the relay proxy.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed SOCKS greeting from client")]
    BadGreeting,

    #[error("malformed SOCKS request from client")]
    BadRequest,

    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("unsupported command: {0} (only CONNECT is implemented)")]
    UnsupportedCommand(u8),

    #[error("no relay available for {host}:{port}")]
    NoRelayAvailable { host: String, port: u16 },

    #[error("no relay available for {host}:{port} under principal {principal}")]
    NoMatchingPrincipal {
        host: String,
        port: u16,
        principal: String,
    },

    #[error("relay entry for {host}:{port}/{principal} is already checked out")]
    EntryInUse {
        host: String,
        port: u16,
        principal: String,
    },

    #[error("plugin for scheme {scheme} failed to initialize connection to {host}:{port}: {reason}")]
    PluginInitFailure {
        scheme: String,
        host: String,
        port: u16,
        reason: String,
    },

    #[error("plugin for scheme {scheme} could not bypass authentication for {host}:{port}")]
    AuthSkipFailure {
        scheme: String,
        host: String,
        port: u16,
    },

    #[error("tunnel to {host}:{port} failed: {reason}")]
    TunnelFailure {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("relay peer for {host}:{port}/{principal} is dead")]
    DeadPeer {
        host: String,
        port: u16,
        principal: String,
    },

    #[error("duplicate announcement for {host}:{port}/{principal}")]
    DuplicateAnnouncement {
        host: String,
        port: u16,
        principal: String,
    },

    #[error("registry invariant violated: {0}")]
    RegistryInvariant(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ProxyError {
    /// SOCKS5 REP code to send back to the client for this error. Every
    /// refusal path uses the same general-failure code; host-unreachable
    /// and connection-refused are not distinguished on the wire.
    pub const GENERAL_FAILURE_REP: u8 = 0x05;

    /// Whether this error should be logged as a warning (operationally
    /// expected, e.g. no matching relay) vs. an error (unexpected failure).
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ProxyError::NoRelayAvailable { .. }
                | ProxyError::NoMatchingPrincipal { .. }
                | ProxyError::EntryInUse { .. }
                | ProxyError::DeadPeer { .. }
        )
    }
}

/// Classifies a raw I/O error surfaced from the tunnel copy loop as a dead
/// peer, by substring match against the OS/plugin error message, since
/// those messages are not otherwise structured.
pub fn classify_io_error(err: &std::io::Error) -> bool {
    let msg = err.to_string();
    const DEAD_PEER_MARKERS: [&str; 4] = [
        "Broken pipe",
        "reset by peer",
        "Invalid argument",
        "Server not connected",
    ];
    DEAD_PEER_MARKERS.iter().any(|marker| msg.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_errors_are_classified() {
        assert!(ProxyError::NoRelayAvailable {
            host: "h".into(),
            port: 80
        }
        .is_expected());
        assert!(!ProxyError::Config("bad".into()).is_expected());
    }

    #[test]
    fn classify_io_error_matches_known_markers() {
        let broken = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "Broken pipe");
        assert!(classify_io_error(&broken));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "Connection reset by peer");
        assert!(classify_io_error(&reset));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "timed out");
        assert!(!classify_io_error(&other));
    }

    #[test]
    fn display_messages_carry_context() {
        let err = ProxyError::NoMatchingPrincipal {
            host: "10.0.0.5".into(),
            port: 445,
            principal: "CORP\\alice".into(),
        };
        let text = err.to_string();
        assert!(text.contains("10.0.0.5"));
        assert!(text.contains("445"));
        assert!(text.contains("CORP\\alice"));
    }
}
