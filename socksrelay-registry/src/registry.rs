//! The active-relay registry: a concurrent `host -> port -> principal`
//! map of pre-authenticated relay sessions, plus the shared per-`host:port`
//! scheme and session data slots.
//!
//! Grounded on `ando-proxy`'s `health_check.rs`
//! (`Arc<tokio::sync::RwLock<HashMap<...>>>`, one lock for the whole
//! structure) rather than on `ando-store`'s `DashMap`-sharded
//! `ConfigCache`: the races this registry must defend against (a cascading
//! delete racing a snapshot read, §5) need one consistent view of the
//! whole structure while a snapshot is being taken, which a sharded map
//! does not give you.

use bytes::Bytes;
use socksrelay_core::ProtocolClient;
use socksrelay_core::ProxyError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Whether the captured identity has administrative rights on the target,
/// as reported by `ProtocolClient::is_admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsAdmin {
    Yes,
    No,
    /// The protocol has no notion of this, or the probe failed.
    Unknown,
}

impl IsAdmin {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsAdmin::Yes => "true",
            IsAdmin::No => "false",
            IsAdmin::Unknown => "N/A",
        }
    }
}

impl From<Option<bool>> for IsAdmin {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => IsAdmin::Yes,
            Some(false) => IsAdmin::No,
            None => IsAdmin::Unknown,
        }
    }
}

/// A single captured identity's relay session against one target.
pub struct RelayEntry {
    pub principal: String,
    pub protocol_client: Arc<dyn ProtocolClient>,
    /// Per-principal session payload (e.g. an NTLM challenge).
    pub session_data: Bytes,
    pub in_use: bool,
    pub is_admin: IsAdmin,
}

/// Everything shared by every principal relayed against one `host:port`.
struct PortEntry {
    scheme: String,
    /// The shared challenge/session payload stored once per `host:port`.
    shared_data: Bytes,
    principals: HashMap<String, RelayEntry>,
}

/// One fully-identified, checked-out relay entry handed to a SOCKS
/// handler. Dropping this without calling [`Registry::release`] or
/// [`Registry::evict`] leaves the entry permanently marked in-use — the
/// handler is responsible for always doing one or the other.
pub struct CheckedOutEntry {
    pub host: String,
    pub port: u16,
    pub principal: String,
    pub scheme: String,
    pub shared_data: Bytes,
    pub session_data: Bytes,
    pub protocol_client: Arc<dyn ProtocolClient>,
}

/// An announcement from the (out-of-scope) relay subsystem, carried by the
/// admission feed.
pub struct AdmissionEvent {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub principal: String,
    pub protocol_client: Arc<dyn ProtocolClient>,
    pub session_data: Bytes,
}

/// A read-only row for the status endpoint: `(scheme, host, principal,
/// is_admin, port)`.
#[derive(Debug, Clone)]
pub struct RelaySnapshotRow {
    pub scheme: String,
    pub host: String,
    pub principal: String,
    pub is_admin: IsAdmin,
    pub port: u16,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, HashMap<u16, PortEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies an admission event: invariants I1-I4 from the data model.
    ///
    /// - If no entry exists yet for `host:port`, one is created and the
    ///   scheme/shared-data slots are seeded from this event.
    /// - If an entry exists but its scheme differs (I1 violated — this
    ///   should never happen since one relay subsystem announces one
    ///   scheme per target), the event is rejected.
    /// - If the principal already has a live entry (I3), the *new*
    ///   connection is killed and discarded — the existing one is kept.
    pub async fn announce(&self, event: AdmissionEvent) -> Result<(), ProxyError> {
        let is_admin: IsAdmin = event.protocol_client.is_admin().await.into();

        let mut guard = self.inner.write().await;
        let ports = guard.entry(event.host.clone()).or_default();

        match ports.get_mut(&event.port) {
            None => {
                let mut principals = HashMap::new();
                principals.insert(
                    event.principal.clone(),
                    RelayEntry {
                        principal: event.principal.clone(),
                        protocol_client: event.protocol_client,
                        session_data: event.session_data.clone(),
                        in_use: false,
                        is_admin,
                    },
                );
                ports.insert(
                    event.port,
                    PortEntry {
                        scheme: event.scheme.clone(),
                        shared_data: event.session_data,
                        principals,
                    },
                );
                info!(
                    host = %event.host, port = event.port, principal = %event.principal,
                    scheme = %event.scheme, "added relay to active SOCKS connections"
                );
                Ok(())
            }
            Some(port_entry) => {
                if port_entry.scheme != event.scheme {
                    return Err(ProxyError::RegistryInvariant(format!(
                        "scheme mismatch for {}:{}: have {}, got {}",
                        event.host, event.port, port_entry.scheme, event.scheme
                    )));
                }
                if port_entry.principals.contains_key(&event.principal) {
                    info!(
                        host = %event.host, port = event.port, principal = %event.principal,
                        "relay connection already exists, discarding new one"
                    );
                    let _ = event.protocol_client.kill_connection().await;
                    return Err(ProxyError::DuplicateAnnouncement {
                        host: event.host,
                        port: event.port,
                        principal: event.principal,
                    });
                }
                port_entry.principals.insert(
                    event.principal.clone(),
                    RelayEntry {
                        principal: event.principal.clone(),
                        protocol_client: event.protocol_client,
                        session_data: event.session_data,
                        in_use: false,
                        is_admin,
                    },
                );
                info!(
                    host = %event.host, port = event.port, principal = %event.principal,
                    "added relay to active SOCKS connections"
                );
                Ok(())
            }
        }
    }

    /// Returns the scheme registered for `host:port`, if any, without
    /// checking out an entry. Used by the SOCKS handler to decide whether
    /// it has a plugin for this target at all.
    pub async fn scheme_for(&self, host: &str, port: u16) -> Option<String> {
        let guard = self.inner.read().await;
        guard.get(host)?.get(&port).map(|p| p.scheme.clone())
    }

    /// Atomically finds a principal entry for `host:port` that is not
    /// currently in use and marks it in-use, handing the caller everything
    /// it needs to run a plugin instance against it. Picks the
    /// lexicographically first eligible principal — this proxy has no
    /// notion of preferring one captured identity over another.
    pub async fn checkout(&self, host: &str, port: u16) -> Result<CheckedOutEntry, ProxyError> {
        let mut guard = self.inner.write().await;
        let port_entry = guard
            .get_mut(host)
            .and_then(|ports| ports.get_mut(&port))
            .ok_or_else(|| ProxyError::NoRelayAvailable {
                host: host.to_string(),
                port,
            })?;

        let mut candidates: Vec<&String> = port_entry
            .principals
            .iter()
            .filter(|(_, entry)| !entry.in_use)
            .map(|(name, _)| name)
            .collect();
        candidates.sort();
        let principal = candidates
            .into_iter()
            .next()
            .cloned()
            .ok_or_else(|| ProxyError::EntryInUse {
                host: host.to_string(),
                port,
                principal: "*".to_string(),
            })?;

        let entry = port_entry.principals.get_mut(&principal).unwrap();
        entry.in_use = true;

        Ok(CheckedOutEntry {
            host: host.to_string(),
            port,
            principal,
            scheme: port_entry.scheme.clone(),
            shared_data: port_entry.shared_data.clone(),
            session_data: entry.session_data.clone(),
            protocol_client: entry.protocol_client.clone(),
        })
    }

    /// Marks a checked-out entry free again. Idempotent: releasing an
    /// entry that no longer exists (e.g. evicted concurrently) is not an
    /// error.
    pub async fn release(&self, host: &str, port: u16, principal: &str) {
        let mut guard = self.inner.write().await;
        if let Some(entry) = guard
            .get_mut(host)
            .and_then(|ports| ports.get_mut(&port))
            .and_then(|port_entry| port_entry.principals.get_mut(principal))
        {
            entry.in_use = false;
        }
    }

    /// Removes a dead relay entry, cascading to drop the `host:port` group
    /// entirely once its last principal is gone (invariant I4).
    pub async fn evict(&self, host: &str, port: u16, principal: &str) {
        let mut guard = self.inner.write().await;
        let Some(ports) = guard.get_mut(host) else {
            return;
        };
        let Some(port_entry) = ports.get_mut(&port) else {
            return;
        };
        if port_entry.principals.remove(principal).is_some() {
            warn!(host, port, principal, "removing dead relay entry");
        }
        if port_entry.principals.is_empty() {
            ports.remove(&port);
        }
        if ports.is_empty() {
            guard.remove(host);
        }
    }

    /// Runs `probe` against every principal entry not currently in use,
    /// evicting any for which it returns `Err`. Used by the keepalive
    /// engine; takes a read lock for the duration of building the probe
    /// list, then mutates one entry at a time so a slow probe on one peer
    /// does not block announcements or handler checkouts against others
    /// for longer than necessary.
    pub async fn for_each_idle_entry<F, Fut>(&self, mut probe: F)
    where
        F: FnMut(String, u16, String, Arc<dyn ProtocolClient>) -> Fut,
        Fut: std::future::Future<Output = Result<(), ProxyError>>,
    {
        let targets: Vec<(String, u16, String, Arc<dyn ProtocolClient>)> = {
            let guard = self.inner.read().await;
            guard
                .iter()
                .flat_map(|(host, ports)| {
                    ports.iter().flat_map(move |(port, port_entry)| {
                        port_entry.principals.values().filter_map(move |entry| {
                            if entry.in_use {
                                debug!(host, port, principal = %entry.principal, "skipping in-use entry");
                                None
                            } else {
                                Some((
                                    host.clone(),
                                    *port,
                                    entry.principal.clone(),
                                    entry.protocol_client.clone(),
                                ))
                            }
                        })
                    })
                })
                .collect()
        };

        for (host, port, principal, client) in targets {
            if let Err(err) = probe(host.clone(), port, principal.clone(), client).await {
                warn!(%err, host, port, principal, "keepalive probe failed, evicting");
                self.evict(&host, port, &principal).await;
            }
        }
    }

    /// A read-only snapshot of every live relay entry, for the status
    /// endpoint. Holds the read lock for the whole traversal — proportional
    /// to the number of entries, matching the documented O(entries) bound.
    pub async fn snapshot(&self) -> Vec<RelaySnapshotRow> {
        let guard = self.inner.read().await;
        guard
            .iter()
            .flat_map(|(host, ports)| {
                ports.iter().flat_map(move |(port, port_entry)| {
                    port_entry.principals.values().map(move |entry| RelaySnapshotRow {
                        scheme: port_entry.scheme.clone(),
                        host: host.clone(),
                        principal: entry.principal.clone(),
                        is_admin: entry.is_admin,
                        port: *port,
                    })
                })
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }
}
