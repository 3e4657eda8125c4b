use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Top-level configuration for the relay proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// SOCKS listener address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Status HTTP endpoint configuration
    #[serde(default)]
    pub status: StatusConfig,

    /// Keepalive engine configuration
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Port-53 DNS passthrough (bypasses the registry entirely)
    #[serde(default = "default_true")]
    pub dns_passthrough: bool,

    /// Admission feed channel capacity
    #[serde(default = "default_admission_capacity")]
    pub admission_capacity: usize,

    /// Log level, e.g. "info", "debug"
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Status API listener address
    #[serde(default = "default_status_addr")]
    pub addr: SocketAddr,

    /// Enable the status endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Probe interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub interval_secs: u64,
}

impl ProxyConfig {
    /// Load configuration from YAML file + environment variables. A missing
    /// file at `config_path` (or at any of the default locations, when
    /// `config_path` is `None`) is not an error; a malformed one is.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["socksrelay.yaml", "/etc/socksrelay/socksrelay.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        // Environment variables override: SOCKSRELAY_LISTEN_ADDR,
        // SOCKSRELAY_STATUS__ADDR, SOCKSRELAY_KEEPALIVE__INTERVAL_SECS, etc.
        figment = figment.merge(Env::prefixed("SOCKSRELAY_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            status: StatusConfig::default(),
            keepalive: KeepaliveConfig::default(),
            dns_passthrough: true,
            admission_capacity: default_admission_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            addr: default_status_addr(),
            enabled: true,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_keepalive_secs(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:1080".parse().unwrap()
}

fn default_status_addr() -> SocketAddr {
    "0.0.0.0:9090".parse().unwrap()
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_admission_capacity() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
