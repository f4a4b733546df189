use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the multihome transport.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Daemon runtime settings.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Local UDP ports to bind, one endpoint each.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            log_level: "info".to_string(),
        }
    }
}

/// Timing knobs for endpoint health checks and NAT puncturing.
///
/// The puncture cadence sits inside typical NAT mapping lifetimes: a
/// contact goes stale just under a minute of silence, and punctures are
/// never sent more than once per five seconds to the same address.
#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    /// Maintenance loop period in seconds.
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Silence on a contact address after which a puncture is scheduled.
    #[serde(default = "default_contact_expiration")]
    pub contact_expiration_secs: u64,

    /// Minimum spacing between punctures to one address.
    #[serde(default = "default_min_puncture_interval")]
    pub min_puncture_interval_secs: u64,

    /// Puncture attempts before an address is marked unreachable.
    #[serde(default = "default_max_puncture_attempts")]
    pub max_puncture_attempts: u32,

    /// Puncture attempts after which the addresses message is re-sent if
    /// the peer still has not echoed a confirmed-reachable address.
    #[serde(default = "default_addresses_resend_after")]
    pub addresses_resend_after: u32,

    /// Minimum spacing between addresses re-sends to one contact.
    #[serde(default = "default_min_addresses_send_interval")]
    pub min_addresses_send_interval_secs: u64,

    /// Minimum spacing between address-request messages to one contact.
    #[serde(default = "default_min_addresses_request_interval")]
    pub min_addresses_request_interval_secs: u64,

    /// Grace window in which would-block socket errors are tolerated.
    #[serde(default = "default_socket_grace")]
    pub socket_grace_secs: u64,

    /// Persistent socket error age after which the endpoint is evicted.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: default_maintenance_interval(),
            contact_expiration_secs: default_contact_expiration(),
            min_puncture_interval_secs: default_min_puncture_interval(),
            max_puncture_attempts: default_max_puncture_attempts(),
            addresses_resend_after: default_addresses_resend_after(),
            min_addresses_send_interval_secs: default_min_addresses_send_interval(),
            min_addresses_request_interval_secs: default_min_addresses_request_interval(),
            socket_grace_secs: default_socket_grace(),
            socket_timeout_secs: default_socket_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn contact_expiration(&self) -> Duration {
        Duration::from_secs(self.contact_expiration_secs)
    }

    pub fn min_puncture_interval(&self) -> Duration {
        Duration::from_secs(self.min_puncture_interval_secs)
    }

    pub fn min_addresses_send_interval(&self) -> Duration {
        Duration::from_secs(self.min_addresses_send_interval_secs)
    }

    pub fn min_addresses_request_interval(&self) -> Duration {
        Duration::from_secs(self.min_addresses_request_interval_secs)
    }

    pub fn socket_grace(&self) -> Duration {
        Duration::from_secs(self.socket_grace_secs)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

fn default_ports() -> Vec<u16> {
    vec![0] // one endpoint, OS-assigned port
}
fn default_maintenance_interval() -> u64 {
    5
}
fn default_contact_expiration() -> u64 {
    55 // just under typical NAT mapping expiry
}
fn default_min_puncture_interval() -> u64 {
    5
}
fn default_max_puncture_attempts() -> u32 {
    5
}
fn default_addresses_resend_after() -> u32 {
    3
}
fn default_min_addresses_send_interval() -> u64 {
    30
}
fn default_min_addresses_request_interval() -> u64 {
    30
}
fn default_socket_grace() -> u64 {
    1
}
fn default_socket_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = toml::from_str(&content).context("Failed to parse TOML config")?;
        Ok(config)
    }

    /// Load from default paths or return default config.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/multihome/config.toml",
            "~/.multihome/config.toml",
            "./config.toml",
        ];

        for path in &paths {
            let expanded = shellexpand::tilde(path).to_string();
            if Path::new(&expanded).exists() {
                if let Ok(config) = Self::load(&expanded) {
                    return config;
                }
            }
        }

        Self::default()
    }
}
