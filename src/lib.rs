//! # Hoodlink - Modbus RTU Collector Gateway
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Collector side of a laboratory-air monitoring system. Ventilation hoods,
//! exhaust fans and clean-room sensors sit on RS-485 lines owned by a serial
//! bridge; this crate talks to that bridge over TCP, polls every configured
//! device with Modbus RTU read requests, reassembles and decodes the
//! responses, and keeps the latest value of every field in memory.
//!
//! ## Features
//!
//! - **Async Transport**: Tokio sender/receiver tasks, bounded queues, rate-limited writes
//! - **Stream Reassembly**: Chunk-independent RTU frame reassembly with CRC checking
//! - **Typed Decoding**: Per-device-class field tables with unit scaling
//! - **Concurrent Store**: Per-device locking, snapshot readers
//! - **Explicit Lifecycle**: No hidden reconnects; one session per `connect`
//!
//! ## Data Flow
//!
//! ```text
//! PollScheduler ─► FrameTransport ─► bridge ─► FrameTransport ─► FieldDecoder ─► StateStore
//!                  (outbound queue)            (JSON | frames)   (DeviceRegistry)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hoodlink::{Gateway, GatewayConfig, GatewayResult};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> GatewayResult<()> {
//!     let config = GatewayConfig::load("gateway.yaml")?;
//!     let gateway = Gateway::new(config)?;
//!     let store = gateway.store();
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     gateway.run_session(shutdown_rx).await?;
//!
//!     println!("{}", serde_json::to_string_pretty(&store.get_all())?);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Protocol framing constants and gateway defaults
pub mod constants;

/// CRC16 and read-request encoding
pub mod codec;

/// Response frame reassembly from a byte stream
pub mod frame;

/// JSON messages exchanged with the serial bridge
pub mod wire;

/// TCP transport to the serial bridge
pub mod transport;

// ============================================================================
// Device model
// ============================================================================

/// (channel, device id) to device record mapping
pub mod registry;

/// Per-class field tables and decoded values
pub mod field;

/// Response decoding into the state store
pub mod decoder;

/// Latest-value cache of all devices
pub mod store;

// ============================================================================
// Runtime
// ============================================================================

/// Cyclic request dispatch
pub mod scheduler;

/// YAML/JSON configuration
pub mod config;

/// Subscriber setup and packet logging
pub mod logging;

/// Session wiring of transport, scheduler and decoder
pub mod gateway;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Error handling ===
pub use error::{GatewayError, GatewayResult};

// === Protocol ===
pub use codec::{format_hex, parse_hex, ModbusCodec, ModbusRequest, RequestDescriptor};
pub use frame::{CrcPolicy, FrameReassembler, RawFrame, Reassembly};
pub use wire::{ChannelDescriptor, InboundMessage, ReadRequestMessage, ReadResponse};

// === Transport ===
pub use transport::{
    ConnectionState, FrameTransport, InboundMode, TransportConfig, TransportStats,
};

// === Devices and state ===
pub use decoder::{DecodeOutcome, FieldDecoder};
pub use field::{FieldMap, FieldReading, FieldValue};
pub use registry::{DeviceClass, DeviceId, DeviceRecord, DeviceRegistry};
pub use store::{DeviceSnapshot, StateStore, StoreSnapshot};

// === Runtime ===
pub use config::GatewayConfig;
pub use gateway::Gateway;
pub use scheduler::{PollScheduler, PollSettings, RequestSink, RoundReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Hoodlink v{} - Modbus RTU collector gateway by Evan Liu",
        VERSION
    )
}
