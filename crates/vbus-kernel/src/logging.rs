//! Tracing subscriber setup for hosts embedding the client.

use tracing_subscriber::EnvFilter;
use vbus_types::config::{LogFormat, VbusConfig};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.log_level`. Calling this twice is harmless;
/// the second call leaves the first subscriber in place.
pub fn init_tracing(config: &VbusConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
