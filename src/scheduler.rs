//! # Poll Scheduler
//!
//! Cyclic dispatch of the configured read requests.
//!
//! A round walks the request list in order: encode, wrap as a
//! `{serial, request, time}` message, hand it to the sink, then wait the
//! inter-request delay. Rounds repeat after the round interval. One bad
//! request (out-of-range field, full queue) is logged and skipped; the round
//! goes on. Only a disconnected sink or the shutdown signal stops the
//! scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::codec::{ModbusCodec, RequestDescriptor};
use crate::constants::{DEFAULT_REQUEST_DELAY_MS, DEFAULT_ROUND_INTERVAL_MS};
use crate::error::{GatewayError, GatewayResult};
use crate::wire::ReadRequestMessage;

/// Destination of encoded requests.
///
/// Implemented by [`FrameTransport`](crate::transport::FrameTransport); tests
/// use an in-memory sink.
pub trait RequestSink: Send + Sync {
    /// Queue one request without waiting.
    fn send_request(&self, message: &ReadRequestMessage) -> GatewayResult<()>;

    fn is_connected(&self) -> bool;
}

impl<T: RequestSink + ?Sized> RequestSink for Arc<T> {
    fn send_request(&self, message: &ReadRequestMessage) -> GatewayResult<()> {
        (**self).send_request(message)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Polling cadence.
///
/// # Example
///
/// ```rust
/// use hoodlink::PollSettings;
///
/// let settings = PollSettings::new()
///     .with_inter_request_delay_ms(200)
///     .with_round_interval_ms(5000);
///
/// assert_eq!(settings.inter_request_delay_ms, 200);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause after each request of a round (milliseconds).
    pub inter_request_delay_ms: u64,
    /// Pause between the end of one round and the start of the next (milliseconds).
    pub round_interval_ms: u64,
}

impl PollSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    pub fn with_round_interval_ms(mut self, interval_ms: u64) -> Self {
        self.round_interval_ms = interval_ms;
        self
    }

    #[inline]
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    #[inline]
    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(self.round_interval_ms)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            inter_request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            round_interval_ms: DEFAULT_ROUND_INTERVAL_MS,
        }
    }
}

/// Result of one polling round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub sent: usize,
    pub failed: usize,
}

/// Issues the configured requests round after round.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    requests: Vec<RequestDescriptor>,
    settings: PollSettings,
}

impl PollScheduler {
    pub fn new(requests: Vec<RequestDescriptor>, settings: PollSettings) -> Self {
        Self { requests, settings }
    }

    pub fn requests(&self) -> &[RequestDescriptor] {
        &self.requests
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Send every request once, in order.
    ///
    /// Fails only when the sink is disconnected, also with an empty request
    /// list.
    pub async fn run_round<S: RequestSink + ?Sized>(&self, sink: &S) -> GatewayResult<RoundReport> {
        let mut report = RoundReport::default();
        if !sink.is_connected() {
            return Err(GatewayError::disconnected("request sink disconnected"));
        }

        for (index, descriptor) in self.requests.iter().enumerate() {
            if index > 0 && !sink.is_connected() {
                return Err(GatewayError::disconnected("request sink disconnected"));
            }

            match ModbusCodec::encode_descriptor(descriptor) {
                Ok(frame) => {
                    let message = ReadRequestMessage::new(descriptor.serial.clone(), &frame);
                    match sink.send_request(&message) {
                        Ok(()) => {
                            debug!("Queued {} -> {}", message.request, descriptor.serial);
                            report.sent += 1;
                        }
                        Err(e @ GatewayError::Disconnected { .. }) => return Err(e),
                        Err(e) => {
                            warn!("Request to {} not queued: {}", descriptor.serial, e);
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping request {:?}: {}", descriptor, e);
                    report.failed += 1;
                }
            }

            sleep(self.settings.inter_request_delay()).await;
        }

        Ok(report)
    }

    /// Run rounds until the sink disconnects or `shutdown` turns `true`.
    ///
    /// Returns the number of completed rounds.
    pub async fn run<S: RequestSink + ?Sized>(
        &self,
        sink: &S,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        info!(
            "Polling {} request(s), {}ms apart, every {}ms",
            self.requests.len(),
            self.settings.inter_request_delay_ms,
            self.settings.round_interval_ms
        );

        let mut rounds = 0u64;
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Poll scheduler stopping on shutdown after {} round(s)", rounds);
                    return rounds;
                }
                result = self.run_round(sink) => match result {
                    Ok(report) => {
                        rounds += 1;
                        debug!("Round {} done: {} sent, {} failed", rounds, report.sent, report.failed);
                    }
                    Err(e) => {
                        info!("Poll scheduler stopping after {} round(s): {}", rounds, e);
                        return rounds;
                    }
                },
            }

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Poll scheduler stopping on shutdown after {} round(s)", rounds);
                    return rounds;
                }
                _ = sleep(self.settings.round_interval()) => {}
            }
        }
    }
}
