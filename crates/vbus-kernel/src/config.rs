//! Configuration loading from `<state_dir>/vbus.toml` with defaults.
//!
//! The state directory is `$VBUS_PATH` when set, otherwise `~/vbus`.
//! `$VBUS_URL` overrides the broker URL from the file.

use std::path::{Path, PathBuf};
use tracing::info;
use vbus_types::config::VbusConfig;

/// Environment variable overriding the state directory.
pub const ENV_STATE_DIR: &str = "VBUS_PATH";

/// Environment variable overriding the broker URL.
pub const ENV_BROKER_URL: &str = "VBUS_URL";

/// Config file name inside the state directory.
pub const CONFIG_FILE_NAME: &str = "vbus.toml";

/// Load client configuration from a TOML file, with defaults.
///
/// A missing or unreadable file yields the defaults. Environment overrides
/// are applied last.
pub fn load_config(path: Option<&Path>) -> VbusConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<VbusConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                    VbusConfig::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
                VbusConfig::default()
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        VbusConfig::default()
    };

    apply_env_overrides(
        config,
        std::env::var(ENV_STATE_DIR).ok(),
        std::env::var(ENV_BROKER_URL).ok(),
    )
}

/// Apply the state-directory and broker-URL overrides. Empty values are
/// ignored.
pub fn apply_env_overrides(
    mut config: VbusConfig,
    state_dir: Option<String>,
    broker_url: Option<String>,
) -> VbusConfig {
    if let Some(dir) = state_dir.filter(|d| !d.is_empty()) {
        config.state_dir = Some(PathBuf::from(dir));
    }
    if let Some(url) = broker_url.filter(|u| !u.is_empty()) {
        config.broker_url = Some(url);
    }
    config
}

/// `~/vbus`.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vbus")
}

/// The effective state directory of `config`.
pub fn state_dir(config: &VbusConfig) -> PathBuf {
    config.state_dir.clone().unwrap_or_else(default_state_dir)
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    std::env::var(ENV_STATE_DIR)
        .ok()
        .filter(|d| !d.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_state_dir)
        .join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/vbus.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.broker_port, 21400);
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "service_id = \"system.zigbee\"").unwrap();
        writeln!(f, "log_level = \"debug\"").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.service_id, "system.zigbee");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_load_config_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "service_id = [not toml").unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.service_id, "app.default");
    }

    #[test]
    fn test_env_overrides() {
        let config = apply_env_overrides(
            VbusConfig::default(),
            Some("/tmp/vbus-state".to_string()),
            Some("nats://10.0.0.2:21400".to_string()),
        );
        assert_eq!(state_dir(&config), PathBuf::from("/tmp/vbus-state"));
        assert_eq!(config.broker_url.as_deref(), Some("nats://10.0.0.2:21400"));

        let untouched = apply_env_overrides(VbusConfig::default(), Some(String::new()), None);
        assert!(untouched.state_dir.is_none());
        assert!(untouched.broker_url.is_none());
    }
}
