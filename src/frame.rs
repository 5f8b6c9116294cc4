//! # Frame Reassembly
//!
//! Turns the unbounded byte stream coming back from the serial bridge into
//! discrete Modbus RTU response frames.
//!
//! ## State Machine
//!
//! ```text
//!            >= 3 bytes buffered
//! AwaitingHeader ──────────────────► AwaitingBody { expected = 3 + N + 2 }
//!       ▲                                   │
//!       └───────── frame emitted ◄──────────┘  expected bytes buffered
//! ```
//!
//! The reassembler never waits for bytes: each call consumes what is buffered
//! and reports [`Reassembly::NeedMore`] with the number of bytes still missing.
//! Because every decision is taken only once the bytes it depends on are
//! buffered, the emitted frames do not depend on how the stream was chunked.
//!
//! ## Integrity
//!
//! Under [`CrcPolicy::Strict`] a candidate frame whose trailing CRC does not
//! match is dropped as a whole (all `3 + N + 2` bytes its header announced)
//! and the next header is read from the byte after it. Three
//! consecutive bad candidates exhaust the reassembler; from then on every call
//! fails with [`GatewayError::Reassembly`] and the owning connection should be
//! closed.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::codec::{format_hex, ModbusCodec};
use crate::constants::{
    CRC_LEN, EXCEPTION_FLAG, EXCEPTION_FRAME_LEN, MAX_REASSEMBLY_RETRIES, MAX_RESPONSE_FRAME_LEN,
    RESPONSE_HEADER_LEN,
};
use crate::error::{GatewayError, GatewayResult};

/// How the trailing CRC of received frames is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrcPolicy {
    /// Validate the CRC and discard frames that fail.
    #[default]
    Strict,
    /// Accept any trailing two bytes.
    Lenient,
}

/// A complete Modbus read response frame.
///
/// Invariant: `len() == 3 + payload_len() + 2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Bytes,
}

impl RawFrame {
    /// Wrap a byte sequence, checking the structural length invariant.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> GatewayResult<Self> {
        let bytes = bytes.into();
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(GatewayError::decode(format!(
                "frame of {} bytes has no header",
                bytes.len()
            )));
        }
        let expected = frame_len(bytes[2]);
        if bytes.len() != expected {
            return Err(GatewayError::decode(format!(
                "frame length {} does not match byte count {} (expected {})",
                bytes.len(),
                bytes[2],
                expected
            )));
        }
        Ok(Self { bytes })
    }

    #[inline]
    pub fn device_id(&self) -> u8 {
        self.bytes[0]
    }

    #[inline]
    pub fn function_code(&self) -> u8 {
        self.bytes[1]
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.bytes[2] as usize
    }

    /// Register data between the header and the CRC.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[RESPONSE_HEADER_LEN..self.bytes.len() - CRC_LEN]
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn has_valid_crc(&self) -> bool {
        ModbusCodec::verify_crc16(&self.bytes)
    }

    /// Hex text form, as carried in wire messages.
    pub fn to_hex(&self) -> String {
        format_hex(&self.bytes)
    }
}

/// A Modbus exception response (function code with the 0x80 flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionFrame {
    pub device_id: u8,
    /// Function code without the exception flag.
    pub function_code: u8,
    pub exception_code: u8,
}

/// Result of one reassembly step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    Frame(RawFrame),
    Exception(ExceptionFrame),
    /// Insufficient data; this many more bytes are needed to make progress.
    NeedMore(usize),
}

/// Reassembler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblerState {
    AwaitingHeader,
    AwaitingBody { expected: usize },
}

/// Per-stream reassembly state machine.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    state: ReassemblerState,
    policy: CrcPolicy,
    consecutive_failures: u32,
    max_failures: u32,
    exhausted: bool,
    frames_emitted: u64,
    frames_discarded: u64,
}

#[inline]
fn frame_len(byte_count: u8) -> usize {
    RESPONSE_HEADER_LEN + byte_count as usize + CRC_LEN
}

impl FrameReassembler {
    pub fn new(policy: CrcPolicy) -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_RESPONSE_FRAME_LEN),
            state: ReassemblerState::AwaitingHeader,
            policy,
            consecutive_failures: 0,
            max_failures: MAX_REASSEMBLY_RETRIES,
            exhausted: false,
            frames_emitted: 0,
            frames_discarded: 0,
        }
    }

    /// Append received bytes. Never blocks.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to complete one frame from the buffered bytes.
    pub fn next_frame(&mut self) -> GatewayResult<Reassembly> {
        if self.exhausted {
            return Err(GatewayError::reassembly(format!(
                "stream abandoned after {} consecutive malformed frames",
                self.max_failures
            )));
        }

        loop {
            match self.state {
                ReassemblerState::AwaitingHeader => {
                    if self.buffer.len() < RESPONSE_HEADER_LEN {
                        return Ok(Reassembly::NeedMore(RESPONSE_HEADER_LEN - self.buffer.len()));
                    }
                    let expected = if self.buffer[1] & EXCEPTION_FLAG != 0 {
                        EXCEPTION_FRAME_LEN
                    } else {
                        frame_len(self.buffer[2])
                    };
                    debug!(
                        "Frame header: id={:02X} fc={:02X} size={} bytes",
                        self.buffer[0], self.buffer[1], expected
                    );
                    self.state = ReassemblerState::AwaitingBody { expected };
                }
                ReassemblerState::AwaitingBody { expected } => {
                    if self.buffer.len() < expected {
                        let missing = expected - self.buffer.len();
                        debug!("Awaiting {} more bytes", missing);
                        return Ok(Reassembly::NeedMore(missing));
                    }

                    let candidate = self.buffer.split_to(expected).freeze();
                    self.state = ReassemblerState::AwaitingHeader;

                    if self.policy == CrcPolicy::Strict && !ModbusCodec::verify_crc16(&candidate) {
                        self.record_failure(&candidate)?;
                        continue;
                    }

                    self.consecutive_failures = 0;
                    self.frames_emitted += 1;

                    if candidate[1] & EXCEPTION_FLAG != 0 {
                        return Ok(Reassembly::Exception(ExceptionFrame {
                            device_id: candidate[0],
                            function_code: candidate[1] & !EXCEPTION_FLAG,
                            exception_code: candidate[2],
                        }));
                    }

                    debug!("Complete frame: {}", format_hex(&candidate));
                    return Ok(Reassembly::Frame(RawFrame { bytes: candidate }));
                }
            }
        }
    }

    /// Collect every frame that can be completed from the buffered bytes.
    ///
    /// Exception responses are logged and skipped.
    pub fn drain(&mut self) -> GatewayResult<Vec<RawFrame>> {
        let mut frames = Vec::new();
        loop {
            match self.next_frame()? {
                Reassembly::Frame(frame) => frames.push(frame),
                Reassembly::Exception(exception) => {
                    warn!(
                        "Device {:02} answered function {:02X} with exception {:02X}",
                        exception.device_id, exception.function_code, exception.exception_code
                    );
                }
                Reassembly::NeedMore(_) => return Ok(frames),
            }
        }
    }

    fn record_failure(&mut self, candidate: &[u8]) -> GatewayResult<()> {
        self.consecutive_failures += 1;
        self.frames_discarded += 1;
        warn!(
            "Discarding frame with bad CRC ({}/{}): {}",
            self.consecutive_failures,
            self.max_failures,
            format_hex(candidate)
        );
        if self.consecutive_failures >= self.max_failures {
            self.exhausted = true;
            self.buffer.clear();
            return Err(GatewayError::reassembly(format!(
                "{} consecutive malformed frames",
                self.consecutive_failures
            )));
        }
        Ok(())
    }

    /// Drop buffered bytes and start over, clearing the failure count.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ReassemblerState::AwaitingHeader;
        self.consecutive_failures = 0;
        self.exhausted = false;
    }

    #[inline]
    pub fn state(&self) -> ReassemblerState {
        self.state
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    #[inline]
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    #[inline]
    pub fn frames_discarded(&self) -> u64 {
        self.frames_discarded
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(CrcPolicy::default())
    }
}

// ============================================================================
// Tests
// ============================================================================
