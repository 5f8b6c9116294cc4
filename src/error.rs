//! Error types for the gateway
//!
//! Every failure the collector can observe is expressed as a [`GatewayError`].
//! Per-frame and per-request errors are meant to be logged and contained by the
//! caller; only connection-level failures ([`GatewayError::is_fatal`]) change
//! what the rest of the process can do.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The TCP peer could not be reached.
    #[error("Connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The connection was closed by the peer, failed, or was never open.
    #[error("Disconnected: {message}")]
    Disconnected { message: String },

    /// A request descriptor carried a field outside its wire range.
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// The inbound byte stream could not be reassembled into frames.
    #[error("Reassembly error: {message}")]
    Reassembly { message: String },

    /// A frame or message could not be decoded.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// The bounded outbound queue is full.
    #[error("Outbound queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// An operation did not finish in time.
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    pub fn connect(endpoint: impl ToString, reason: impl ToString) -> Self {
        Self::Connect {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Disconnected {
            message: message.into(),
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    pub fn reassembly(message: impl Into<String>) -> Self {
        Self::Reassembly {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the error ends the connection it was observed on.
    ///
    /// Encoding, decode and queue errors only affect a single request or frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::Connect { .. }
                | GatewayError::Disconnected { .. }
                | GatewayError::Reassembly { .. }
                | GatewayError::Io(_)
        )
    }
}
