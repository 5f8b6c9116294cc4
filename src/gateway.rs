//! Gateway wiring
//!
//! One [`Gateway`] owns the registry, the state store and the decoder for the
//! lifetime of the process. Each call to [`Gateway::run_session`] connects to
//! the bridge, announces the serial channels, then runs the poll scheduler
//! and the ingest loop until the connection drops or shutdown is requested.
//! Reconnecting is the caller's decision.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::RequestDescriptor;
use crate::config::GatewayConfig;
use crate::decoder::{DecodeOutcome, FieldDecoder};
use crate::error::{GatewayError, GatewayResult};
use crate::registry::DeviceRegistry;
use crate::scheduler::PollScheduler;
use crate::store::StateStore;
use crate::transport::FrameTransport;
use crate::wire::{InboundMessage, ReplyStatus};

/// How long the ingest loop waits before re-checking the connection.
const INGEST_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Counters of one ingest loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub applied: u64,
    pub dropped: u64,
}

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<DeviceRegistry>,
    store: Arc<StateStore>,
    decoder: FieldDecoder,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let registry = Arc::new(config.registry()?);
        let store = Arc::new(StateStore::new(Arc::clone(&registry)));
        let decoder = FieldDecoder::new(Arc::clone(&registry), Arc::clone(&store));
        info!(
            "Gateway ready: {} device(s), {} request(s) per round",
            registry.len(),
            config.modbus.commands.len()
        );
        Ok(Self {
            config,
            registry,
            store,
            decoder,
        })
    }

    /// Read-only view for consumers such as an HTTP facade.
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn decoder(&self) -> &FieldDecoder {
        &self.decoder
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn requests(&self) -> &[RequestDescriptor] {
        &self.config.modbus.commands
    }

    /// Connect and serve one session.
    ///
    /// Returns `Ok` once the session ended, either because the bridge went
    /// away or because `shutdown` was set; connection failures are returned.
    pub async fn run_session(&self, shutdown: watch::Receiver<bool>) -> GatewayResult<IngestReport> {
        let endpoint = self.config.endpoint();
        let transport =
            Arc::new(FrameTransport::connect(&endpoint, self.config.transport_config()).await?);

        if let Err(e) = transport.announce_channels(&self.config.serial_ports) {
            transport.disconnect().await;
            return Err(e);
        }

        let scheduler = PollScheduler::new(self.requests().to_vec(), self.config.poll_settings());
        let scheduler_task = {
            let transport = Arc::clone(&transport);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(&transport, shutdown).await })
        };

        let report = ingest(&transport, &self.decoder, shutdown).await;

        transport.disconnect().await;
        match scheduler_task.await {
            Ok(rounds) => debug!("Scheduler finished after {} round(s)", rounds),
            Err(e) => error!("Scheduler task failed: {}", e),
        }

        let stats = transport.stats();
        info!(
            "Session with {} ended: {} sent, {} received, {} bytes out, {} bytes in, {} error(s)",
            endpoint,
            stats.requests_sent,
            stats.responses_received,
            stats.bytes_sent,
            stats.bytes_received,
            stats.errors
        );
        Ok(report)
    }
}

/// Decode inbound messages into the store until the connection closes or
/// `shutdown` is set.
pub async fn ingest(
    transport: &FrameTransport,
    decoder: &FieldDecoder,
    mut shutdown: watch::Receiver<bool>,
) -> IngestReport {
    let mut report = IngestReport::default();

    loop {
        let message = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                info!("Ingest loop stopping on shutdown");
                break;
            }
            received = transport.receive(INGEST_POLL_INTERVAL) => match received {
                Ok(message) => message,
                Err(GatewayError::Timeout { .. }) => continue,
                Err(e) => {
                    info!("Ingest loop stopping: {}", e);
                    break;
                }
            },
        };

        let outcome = match message {
            InboundMessage::Response(response) => match response.status {
                ReplyStatus::Success if !response.response.is_empty() => {
                    Some(decoder.decode(&response.serial, &response.response))
                }
                _ => {
                    warn!(
                        "No usable response from {} for request {}",
                        response.serial, response.request
                    );
                    None
                }
            },
            InboundMessage::Frame { channel, frame } => Some(decoder.decode_frame(&channel, &frame)),
            InboundMessage::Error(error) => {
                warn!("Bridge reported an error: {}", error.message);
                None
            }
            InboundMessage::Exception { channel, exception } => {
                warn!(
                    "Device {:02} on {} answered function {:02X} with exception {:02X}",
                    exception.device_id, channel, exception.function_code, exception.exception_code
                );
                None
            }
            InboundMessage::Other(value) => {
                debug!("Ignoring unrecognized message: {}", value);
                None
            }
        };

        match outcome {
            Some(DecodeOutcome::Applied { .. }) => report.applied += 1,
            _ => report.dropped += 1,
        }
    }

    report
}
