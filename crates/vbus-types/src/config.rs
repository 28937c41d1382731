//! Configuration types for a vBus client.
//!
//! Every field has a default so an empty or partial TOML file deserializes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default broker port used by the hostname convention.
pub const DEFAULT_BROKER_PORT: u16 = 21400;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbusConfig {
    /// Service identifier, e.g. `system.zigbee`. The bus identity is
    /// `<service_id>.<hostname>`.
    pub service_id: String,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Directory holding identity records. Defaults to `$HOME/vbus`.
    pub state_dir: Option<PathBuf>,
    /// Broker URL override, tried right after the cached URL.
    pub broker_url: Option<String>,
    /// Port for the `nats://<hostname>.local:<port>` convention.
    pub broker_port: u16,
    pub discovery: DiscoveryConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for VbusConfig {
    fn default() -> Self {
        Self {
            service_id: "app.default".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            state_dir: None,
            broker_url: None,
            broker_port: DEFAULT_BROKER_PORT,
            discovery: DiscoveryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Local-network broker discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Service type browsed over mDNS.
    pub service_type: String,
    /// Instance name the broker advertises.
    pub instance: String,
    pub browse_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: "_nats._tcp.local.".to_string(),
            instance: "vBus".to_string(),
            browse_timeout_ms: 1000,
        }
    }
}

impl DiscoveryConfig {
    pub fn browse_timeout(&self) -> Duration {
        Duration::from_millis(self.browse_timeout_ms)
    }
}

/// Timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Liveness probe of a candidate broker URL.
    pub probe_ms: u64,
    /// Remote node `get`.
    pub get_ms: u64,
    /// Remote attribute `get`.
    pub attribute_get_ms: u64,
    /// Permission request round trip.
    pub permission_ms: u64,
    /// Default discovery window.
    pub discover_ms: u64,
    /// Pause between anonymous registration and reconnect.
    pub registration_wait_ms: u64,
    /// Pause after a granted permission before it is used.
    pub permission_settle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_ms: 2000,
            get_ms: 1000,
            attribute_get_ms: 1000,
            permission_ms: 1000,
            discover_ms: 2000,
            registration_wait_ms: 1000,
            permission_settle_ms: 1000,
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.get_ms)
    }

    pub fn attribute_get(&self) -> Duration {
        Duration::from_millis(self.attribute_get_ms)
    }

    pub fn permission(&self) -> Duration {
        Duration::from_millis(self.permission_ms)
    }

    pub fn discover(&self) -> Duration {
        Duration::from_millis(self.discover_ms)
    }

    pub fn registration_wait(&self) -> Duration {
        Duration::from_millis(self.registration_wait_ms)
    }

    pub fn permission_settle(&self) -> Duration {
        Duration::from_millis(self.permission_settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: VbusConfig = toml::from_str("").unwrap();
        assert_eq!(config, VbusConfig::default());
        assert_eq!(config.broker_port, 21400);
        assert_eq!(config.discovery.instance, "vBus");
    }

    #[test]
    fn test_partial_toml() {
        let config: VbusConfig = toml::from_str(
            r#"
            service_id = "system.zigbee"
            log_format = "json"

            [timeouts]
            discover_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.service_id, "system.zigbee");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.timeouts.discover(), Duration::from_millis(500));
        assert_eq!(config.timeouts.permission_ms, 1000);
        assert_eq!(config.discovery.browse_timeout_ms, 1000);
    }
}
