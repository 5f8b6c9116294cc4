//! Protocol and gateway constants
//!
//! Frame sizes follow the Modbus RTU framing used on the serial side of the
//! bridge. A read response frame is laid out as:
//!
//! ```text
//! +-----------+----------+------------+--------------+---------+
//! | device id | function | byte count | payload (N)  | CRC(LE) |
//! |  1 byte   |  1 byte  |   1 byte   |   N bytes    | 2 bytes |
//! +-----------+----------+------------+--------------+---------+
//! ```

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Header length of a read response: device id + function code + byte count.
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Trailing CRC16 length.
pub const CRC_LEN: usize = 2;

/// Length of an encoded read request:
/// slave(1) + function(1) + start(2) + quantity(2) + CRC(2).
pub const REQUEST_FRAME_LEN: usize = 8;

/// Length of a Modbus exception response: slave(1) + function|0x80(1) + code(1) + CRC(2).
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Largest frame the byte-count field can describe: 3 + 255 + 2.
pub const MAX_RESPONSE_FRAME_LEN: usize = RESPONSE_HEADER_LEN + u8::MAX as usize + CRC_LEN;

/// Bit set in the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Socket read buffer size for the receive loop.
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

// ============================================================================
// Modbus Function Codes (read subset)
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

// ============================================================================
// Gateway Defaults
// ============================================================================

/// Consecutive reassembly failures tolerated before a stream is abandoned.
pub const MAX_REASSEMBLY_RETRIES: u32 = 3;

/// Default pause after each outbound write (rate limit towards the bridge).
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 100;

/// Idle dequeue timeout of the sender loop.
pub const SENDER_POLL_INTERVAL_MS: u64 = 1000;

/// Default capacity of the outbound and inbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default delay between two requests of a round.
pub const DEFAULT_REQUEST_DELAY_MS: u64 = 500;

/// Default delay between two rounds.
pub const DEFAULT_ROUND_INTERVAL_MS: u64 = 1000;

/// Serial bridge default port.
pub const DEFAULT_BRIDGE_PORT: u16 = 8888;

/// Timestamp format carried in wire messages.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
