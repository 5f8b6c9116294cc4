//! # Bridge Transport
//!
//! Duplex TCP connection to the serial bridge with queued, rate-limited
//! delivery.
//!
//! ## Task Layout
//!
//! ```text
//!  send() ──► outbound queue ──► sender task ──► socket ──► bridge
//!                                                   │
//!  receive() ◄── inbound queue ◄── receiver task ◄──┘
//!                                   (JSON splitter | frame reassembler)
//! ```
//!
//! Both tasks share one atomic `connected` flag. Whichever side fails first
//! flips it (exactly once) and publishes [`ConnectionState::Closing`] on a
//! watch channel, which wakes the other task even while it is parked in a
//! socket read or dequeue. When the last task exits the state becomes
//! [`ConnectionState::Disconnected`].
//!
//! There is no automatic reconnection: a new session is a new
//! [`FrameTransport::connect`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use hoodlink::transport::{FrameTransport, TransportConfig};
//! use hoodlink::wire::ReadRequestMessage;
//! use std::time::Duration;
//!
//! # async fn example() -> hoodlink::GatewayResult<()> {
//! let transport = FrameTransport::connect("127.0.0.1:8888", TransportConfig::default()).await?;
//! transport.send_request(&ReadRequestMessage::new("COM5", &[0x01, 0x03, 0x00, 0x02, 0x00, 0x04, 0xE5, 0xC9]))?;
//!
//! let reply = transport.receive(Duration::from_secs(2)).await?;
//! println!("{:?}", reply);
//!
//! transport.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::constants::{
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_INTERVAL_MS, RECEIVE_BUFFER_SIZE, SENDER_POLL_INTERVAL_MS,
};
use crate::error::{GatewayError, GatewayResult};
use crate::frame::{CrcPolicy, FrameReassembler, Reassembly};
use crate::logging::log_packet;
use crate::scheduler::RequestSink;
use crate::wire::{ChannelDescriptor, InboundMessage, JsonStreamSplitter, ReadRequestMessage};

// ============================================================================
// Configuration
// ============================================================================

/// How bytes received from the bridge are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InboundMode {
    /// Concatenated JSON messages.
    #[default]
    Json,
    /// Bare Modbus RTU response frames from a single channel.
    RawFrames {
        channel: String,
        #[serde(default, rename = "crc")]
        crc_policy: CrcPolicy,
    },
}

/// Transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pause after every write.
    pub send_interval: Duration,
    /// Capacity of the outbound and inbound queues.
    pub queue_capacity: usize,
    pub inbound: InboundMode,
    pub packet_logging: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_millis(DEFAULT_SEND_INTERVAL_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            inbound: InboundMode::Json,
            packet_logging: false,
        }
    }
}

impl TransportConfig {
    pub fn with_send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_inbound(mut self, inbound: InboundMode) -> Self {
        self.inbound = inbound;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }
}

// ============================================================================
// State and statistics
// ============================================================================

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the handle and both worker tasks.
#[derive(Debug)]
struct Shared {
    endpoint: String,
    connected: AtomicBool,
    live_loops: AtomicUsize,
    state: watch::Sender<ConnectionState>,
    stats: StatsCounters,
}

impl Shared {
    fn new(endpoint: String) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            endpoint,
            connected: AtomicBool::new(true),
            live_loops: AtomicUsize::new(2),
            state,
            stats: StatsCounters::default(),
        }
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Flip the connected flag. Returns `true` only for the caller that flipped it.
    fn mark_closed(&self, reason: &str) -> bool {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("Connection to {} closing: {}", self.endpoint, reason);
            self.state.send_replace(ConnectionState::Closing);
            true
        } else {
            false
        }
    }

    fn loop_exited(&self) {
        if self.live_loops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.send_replace(ConnectionState::Disconnected);
            info!("Disconnected from {}", self.endpoint);
        }
    }

    fn shutdown_signal(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

async fn wait_for_close(signal: &mut watch::Receiver<ConnectionState>) {
    // An error means the sender is gone, which only happens on teardown.
    let _ = signal
        .wait_for(|state| *state != ConnectionState::Connected)
        .await;
}

// ============================================================================
// Transport handle
// ============================================================================

/// One live TCP session with the serial bridge.
pub struct FrameTransport {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Bytes>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    queue_capacity: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameTransport {
    /// Open the socket and start the sender and receiver tasks.
    ///
    /// Nothing is spawned when the connection fails.
    pub async fn connect(endpoint: &str, config: TransportConfig) -> GatewayResult<Self> {
        info!("Connecting to serial bridge at {}", endpoint);

        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| GatewayError::connect(endpoint, e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
        }
        let (reader, writer) = stream.into_split();

        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared::new(endpoint.to_string()));
        shared.state.send_replace(ConnectionState::Connected);

        let sender = tokio::spawn(run_sender(
            Arc::clone(&shared),
            writer,
            outbound_rx,
            config.send_interval,
            config.packet_logging,
        ));
        let receiver = tokio::spawn(run_receiver(
            Arc::clone(&shared),
            reader,
            inbound_tx,
            InboundDecoder::new(&config.inbound),
            config.packet_logging,
        ));

        info!("Connected to serial bridge at {}", endpoint);

        Ok(Self {
            shared,
            outbound: outbound_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            queue_capacity: capacity,
            tasks: Mutex::new(vec![sender, receiver]),
        })
    }

    /// Queue a payload for delivery. Never waits.
    pub fn send(&self, payload: impl Into<Bytes>) -> GatewayResult<()> {
        if !self.shared.is_connected() {
            return Err(GatewayError::disconnected(format!(
                "not connected to {}",
                self.shared.endpoint
            )));
        }
        self.outbound
            .try_send(payload.into())
            .map_err(|e| match e {
                TrySendError::Full(_) => GatewayError::QueueFull {
                    capacity: self.queue_capacity,
                },
                TrySendError::Closed(_) => GatewayError::disconnected("sender task stopped"),
            })
    }

    /// Queue the channel list the bridge should open.
    pub fn announce_channels(&self, channels: &[ChannelDescriptor]) -> GatewayResult<()> {
        let payload = serde_json::to_vec(channels)?;
        info!("Announcing {} serial channel(s)", channels.len());
        self.send(payload)
    }

    /// Serialize and queue a read request.
    pub fn send_request(&self, message: &ReadRequestMessage) -> GatewayResult<()> {
        let payload = serde_json::to_vec(message)?;
        self.send(payload)
    }

    /// Wait up to `wait` for the next inbound message.
    ///
    /// Messages already queued remain readable after the connection closed.
    pub async fn receive(&self, wait: Duration) -> GatewayResult<InboundMessage> {
        let mut inbound = self.inbound.lock().await;
        match timeout(wait, inbound.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(GatewayError::disconnected(format!(
                "connection to {} closed",
                self.shared.endpoint
            ))),
            Err(_) => Err(GatewayError::timeout("receive", wait.as_millis() as u64)),
        }
    }

    /// Take the next inbound message if one is ready.
    pub fn try_receive(&self) -> Option<InboundMessage> {
        let mut inbound = self.inbound.try_lock().ok()?;
        inbound.try_recv().ok()
    }

    /// Close the connection and wait for both tasks to finish. Idempotent.
    pub async fn disconnect(&self) {
        self.shared.mark_closed("disconnect requested");

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Transport task failed: {}", e);
            }
        }
    }

    /// Resolves once both tasks have stopped.
    pub async fn closed(&self) {
        let mut state = self.shared.shutdown_signal();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }
}

impl RequestSink for FrameTransport {
    fn send_request(&self, message: &ReadRequestMessage) -> GatewayResult<()> {
        FrameTransport::send_request(self, message)
    }

    fn is_connected(&self) -> bool {
        FrameTransport::is_connected(self)
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        if self.shared.mark_closed("transport dropped") {
            debug!("Transport handle dropped while connected");
        }
    }
}

// ============================================================================
// Worker tasks
// ============================================================================

async fn run_sender(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    send_interval: Duration,
    packet_logging: bool,
) {
    let mut signal = shared.shutdown_signal();
    let poll_interval = Duration::from_millis(SENDER_POLL_INTERVAL_MS);

    while shared.is_connected() {
        let payload = tokio::select! {
            _ = wait_for_close(&mut signal) => break,
            next = timeout(poll_interval, outbound.recv()) => match next {
                // Idle: re-check the flag
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(payload)) => payload,
            },
        };

        if let Err(e) = writer.write_all(&payload).await {
            error!("Write to {} failed: {}", shared.endpoint, e);
            shared.stats.errors.fetch_add(1, Ordering::Relaxed);
            shared.mark_closed("write failed");
            break;
        }
        shared.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
        shared
            .stats
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        if packet_logging {
            log_packet("send", None, &payload);
        }

        tokio::select! {
            _ = wait_for_close(&mut signal) => break,
            _ = tokio::time::sleep(send_interval) => {}
        }
    }

    let _ = writer.shutdown().await;
    debug!("Sender task for {} stopped", shared.endpoint);
    shared.loop_exited();
}

async fn run_receiver(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<InboundMessage>,
    mut decoder: InboundDecoder,
    packet_logging: bool,
) {
    let mut signal = shared.shutdown_signal();
    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
    let mut messages = Vec::new();

    'receive: while shared.is_connected() {
        let n = tokio::select! {
            _ = wait_for_close(&mut signal) => break,
            read = reader.read(&mut buffer) => match read {
                Ok(0) => {
                    shared.mark_closed("peer closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("Read from {} failed: {}", shared.endpoint, e);
                    shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                    shared.mark_closed("read failed");
                    break;
                }
            },
        };

        shared
            .stats
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        if packet_logging {
            log_packet("recv", None, &buffer[..n]);
        }

        let outcome = decoder.feed(&buffer[..n], &mut messages);

        for message in messages.drain(..) {
            shared
                .stats
                .responses_received
                .fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = wait_for_close(&mut signal) => break 'receive,
                sent = inbound.send(message) => {
                    if sent.is_err() {
                        shared.mark_closed("inbound queue dropped");
                        break 'receive;
                    }
                }
            }
        }

        if let Err(e) = outcome {
            error!("Inbound stream from {} unusable: {}", shared.endpoint, e);
            shared.stats.errors.fetch_add(1, Ordering::Relaxed);
            shared.mark_closed("inbound stream unusable");
            break;
        }
    }

    debug!("Receiver task for {} stopped", shared.endpoint);
    shared.loop_exited();
}

/// Inbound byte interpretation for one connection.
enum InboundDecoder {
    Json(JsonStreamSplitter),
    Raw {
        channel: String,
        reassembler: FrameReassembler,
    },
}

impl InboundDecoder {
    fn new(mode: &InboundMode) -> Self {
        match mode {
            InboundMode::Json => InboundDecoder::Json(JsonStreamSplitter::new()),
            InboundMode::RawFrames {
                channel,
                crc_policy,
            } => InboundDecoder::Raw {
                channel: channel.clone(),
                reassembler: FrameReassembler::new(*crc_policy),
            },
        }
    }

    /// Decode `data` into `out`. Only fatal stream errors are returned.
    fn feed(&mut self, data: &[u8], out: &mut Vec<InboundMessage>) -> GatewayResult<()> {
        match self {
            InboundDecoder::Json(splitter) => {
                splitter.push(data);
                loop {
                    match splitter.next_value() {
                        Ok(Some(value)) => out.push(InboundMessage::from_value(value)),
                        Ok(None) => return Ok(()),
                        Err(e) => warn!("Dropping inbound bytes: {}", e),
                    }
                }
            }
            InboundDecoder::Raw {
                channel,
                reassembler,
            } => {
                reassembler.push(data);
                loop {
                    match reassembler.next_frame()? {
                        Reassembly::Frame(frame) => out.push(InboundMessage::Frame {
                            channel: channel.clone(),
                            frame,
                        }),
                        Reassembly::Exception(exception) => out.push(InboundMessage::Exception {
                            channel: channel.clone(),
                            exception,
                        }),
                        Reassembly::NeedMore(_) => return Ok(()),
                    }
                }
            }
        }
    }
}
