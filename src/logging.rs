//! Logging setup and packet tracing
//!
//! The gateway logs through `tracing`. [`init`] installs a `tracing-subscriber`
//! fmt subscriber once per process; `RUST_LOG` takes priority over the
//! configured level.

use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::codec::format_hex;
use crate::error::{GatewayError, GatewayResult};

fn default_level() -> String {
    "info".to_string()
}

/// `logging` section of the gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `"info"` or `"hoodlink=debug"`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// Log every frame sent and received as hex.
    #[serde(default)]
    pub packet_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            packet_logging: false,
        }
    }
}

/// Install the global subscriber.
///
/// Fails if the filter directive is invalid or a subscriber is already set.
pub fn init(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            GatewayError::config(format!("invalid log level {:?}: {}", config.level, e))
        })?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    result.map_err(|e| GatewayError::config(format!("logging already initialized: {}", e)))?;

    info!("Logging initialized (level: {}, json: {})", config.level, config.json);
    Ok(())
}

/// Log one packet with its direction and channel.
pub fn log_packet(direction: &str, channel: Option<&str>, data: &[u8]) {
    let hex_string = format_hex(data);
    match channel {
        Some(channel) => info!("[GATEWAY] {} {} {}", direction, channel, hex_string),
        None => info!("[GATEWAY] {} {}", direction, hex_string),
    }
}
