//! Gateway configuration
//!
//! Loaded from YAML; the poll list may additionally come from a JSON command
//! list file (`cmd_list.json`) resolved relative to the configuration file.
//!
//! ```yaml
//! server:
//!   host: 127.0.0.1
//!   port: 8888
//! serial_ports:
//!   - { name: COM5, description: 3F hoods, baudrate: 9600 }
//! devices:
//!   COM5:
//!     "01": 301通风柜
//!     "02": { name: 排风机, class: exhaust_fan }
//! modbus:
//!   request_delay: 0.5
//!   round_interval: 1.0
//!   cmd_list: cmd_list.json
//! transport:
//!   send_interval_ms: 100
//!   inbound: { mode: json }
//! logging:
//!   level: info
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::codec::RequestDescriptor;
use crate::constants::{
    DEFAULT_BRIDGE_PORT, DEFAULT_QUEUE_CAPACITY, DEFAULT_REQUEST_DELAY_MS,
    DEFAULT_ROUND_INTERVAL_MS, DEFAULT_SEND_INTERVAL_MS,
};
use crate::error::{GatewayError, GatewayResult};
use crate::logging::LoggingConfig;
use crate::registry::{DeviceRegistry, DeviceTable};
use crate::scheduler::PollSettings;
use crate::transport::{InboundMode, TransportConfig};
use crate::wire::ChannelDescriptor;

/// Serial bridge endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_BRIDGE_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// `modbus` section: poll cadence (seconds) and the request list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "default_request_delay")]
    pub request_delay: f64,
    #[serde(default = "default_round_interval")]
    pub round_interval: f64,
    /// JSON command list, relative to the configuration file.
    #[serde(default)]
    pub cmd_list: Option<PathBuf>,
    /// Inline requests, polled before those of `cmd_list`.
    #[serde(default)]
    pub commands: Vec<RequestDescriptor>,
}

fn default_request_delay() -> f64 {
    DEFAULT_REQUEST_DELAY_MS as f64 / 1000.0
}

fn default_round_interval() -> f64 {
    DEFAULT_ROUND_INTERVAL_MS as f64 / 1000.0
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            request_delay: default_request_delay(),
            round_interval: default_round_interval(),
            cmd_list: None,
            commands: Vec::new(),
        }
    }
}

/// `transport` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub inbound: InboundMode,
}

fn default_send_interval_ms() -> u64 {
    DEFAULT_SEND_INTERVAL_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval_ms(),
            queue_capacity: default_queue_capacity(),
            inbound: InboundMode::default(),
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub serial_ports: Vec<ChannelDescriptor>,
    #[serde(default)]
    pub devices: DeviceTable,
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Parse and validate YAML text. `cmd_list` is not read.
    pub fn from_yaml_str(text: &str) -> GatewayResult<Self> {
        let config: GatewayConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file and the command list it points to.
    pub fn load(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml_str(&text)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_command_list(base)?;
        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Append the requests of `modbus.cmd_list`, resolved against `base`.
    pub fn resolve_command_list(&mut self, base: &Path) -> GatewayResult<()> {
        if let Some(cmd_list) = &self.modbus.cmd_list {
            let path = base.join(cmd_list);
            let commands = load_command_list(&path)?;
            check_commands(&commands)?;
            self.modbus.commands.extend(commands);
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.serial_ports.is_empty() {
            return Err(GatewayError::config("serial_ports must not be empty"));
        }
        for (field, value) in [
            ("modbus.request_delay", self.modbus.request_delay),
            ("modbus.round_interval", self.modbus.round_interval),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(GatewayError::config(format!(
                    "{} must be a positive number of seconds, got {}",
                    field, value
                )));
            }
        }
        if self.transport.queue_capacity == 0 {
            return Err(GatewayError::config("transport.queue_capacity must be at least 1"));
        }

        check_commands(&self.modbus.commands)?;
        if self.modbus.commands.is_empty() && self.modbus.cmd_list.is_none() {
            warn!("No poll requests configured; the gateway will only listen");
        }

        DeviceRegistry::from_config(&self.devices)?;

        for channel in self.devices.keys() {
            if !self.serial_ports.iter().any(|port| &port.name == channel) {
                warn!("Devices configured on {} which is not in serial_ports", channel);
            }
        }
        Ok(())
    }

    /// `host:port` of the serial bridge.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::new()
            .with_inter_request_delay_ms(seconds_to_ms(self.modbus.request_delay))
            .with_round_interval_ms(seconds_to_ms(self.modbus.round_interval))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig::default()
            .with_send_interval(Duration::from_millis(self.transport.send_interval_ms))
            .with_queue_capacity(self.transport.queue_capacity)
            .with_inbound(self.transport.inbound.clone())
            .with_packet_logging(self.logging.packet_logging)
    }

    pub fn registry(&self) -> GatewayResult<DeviceRegistry> {
        DeviceRegistry::from_config(&self.devices)
    }
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round() as u64
}

/// Only read requests are polled; other responses have no byte count to
/// frame them by.
fn check_commands(commands: &[RequestDescriptor]) -> GatewayResult<()> {
    match commands.iter().find(|command| !command.is_read()) {
        Some(command) => Err(GatewayError::config(format!(
            "function code {} for device {} on {} is not a read function",
            command.function_code, command.slave_address, command.serial
        ))),
        None => Ok(()),
    }
}

/// Read a JSON command list: an array of request descriptors.
pub fn load_command_list(path: impl AsRef<Path>) -> GatewayResult<Vec<RequestDescriptor>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::config(format!("cannot read command list {}: {}", path.display(), e))
    })?;
    let commands: Vec<RequestDescriptor> = serde_json::from_str(&text)?;
    debug!("Loaded {} command(s) from {}", commands.len(), path.display());
    Ok(commands)
}
