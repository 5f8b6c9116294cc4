//! # Modbus Codec
//!
//! CRC16 computation and read-request encoding for the RTU frames carried
//! through the serial bridge, plus the hex text form those frames take inside
//! wire messages.
//!
//! ## Request Frame
//!
//! | Bytes | Field | Encoding |
//! |-------|-------|----------|
//! | 0 | slave address | u8 |
//! | 1 | function code | u8 |
//! | 2..4 | start address | big-endian u16 |
//! | 4..6 | quantity | big-endian u16 |
//! | 6..8 | CRC16 | little-endian u16 |

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};

use crate::constants::{
    CRC_LEN, FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS,
    FC_READ_INPUT_REGISTERS, REQUEST_FRAME_LEN,
};
use crate::error::{GatewayError, GatewayResult};

/// CRC-16/MODBUS: reflected polynomial 0xA001, initial value 0xFFFF.
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus codec for request encoding and CRC handling.
pub struct ModbusCodec;

/// Configured, not yet validated form of a poll request.
///
/// Fields are wide integers as they appear in the command list; range checks
/// happen when the descriptor is turned into a [`ModbusRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Channel (serial line) the request is addressed to, e.g. `"COM5"`.
    pub serial: String,
    #[serde(alias = "slave_adress")]
    pub slave_address: u32,
    #[serde(default = "default_function_code")]
    pub function_code: u32,
    pub start_address: u32,
    pub quantity: u32,
}

fn default_function_code() -> u32 {
    u32::from(FC_READ_HOLDING_REGISTERS)
}

impl RequestDescriptor {
    pub fn new(
        serial: impl Into<String>,
        slave_address: u32,
        function_code: u32,
        start_address: u32,
        quantity: u32,
    ) -> Self {
        Self {
            serial: serial.into(),
            slave_address,
            function_code,
            start_address,
            quantity,
        }
    }

    /// Whether the function code is one of the read functions, whose
    /// responses carry a byte count.
    pub fn is_read(&self) -> bool {
        [
            FC_READ_COILS,
            FC_READ_DISCRETE_INPUTS,
            FC_READ_HOLDING_REGISTERS,
            FC_READ_INPUT_REGISTERS,
        ]
        .iter()
        .any(|&code| u32::from(code) == self.function_code)
    }
}

/// A validated read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    channel: String,
    slave_address: u8,
    function_code: u8,
    start_address: u16,
    quantity: u16,
}

impl ModbusRequest {
    /// Build a request, rejecting any field outside its wire range.
    pub fn new(
        channel: impl Into<String>,
        slave_address: u32,
        function_code: u32,
        start_address: u32,
        quantity: u32,
    ) -> GatewayResult<Self> {
        let slave_address = u8::try_from(slave_address).map_err(|_| {
            GatewayError::encoding(format!(
                "slave address {} exceeds 0xFF",
                slave_address
            ))
        })?;
        let function_code = u8::try_from(function_code).map_err(|_| {
            GatewayError::encoding(format!(
                "function code {} exceeds 0xFF",
                function_code
            ))
        })?;
        let start_address = u16::try_from(start_address).map_err(|_| {
            GatewayError::encoding(format!(
                "start address {} exceeds 0xFFFF",
                start_address
            ))
        })?;
        let quantity = u16::try_from(quantity).map_err(|_| {
            GatewayError::encoding(format!("quantity {} exceeds 0xFFFF", quantity))
        })?;

        Ok(Self {
            channel: channel.into(),
            slave_address,
            function_code,
            start_address,
            quantity,
        })
    }

    #[inline]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[inline]
    pub fn slave_address(&self) -> u8 {
        self.slave_address
    }

    #[inline]
    pub fn function_code(&self) -> u8 {
        self.function_code
    }

    #[inline]
    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    #[inline]
    pub fn quantity(&self) -> u16 {
        self.quantity
    }
}

impl TryFrom<&RequestDescriptor> for ModbusRequest {
    type Error = GatewayError;

    fn try_from(descriptor: &RequestDescriptor) -> GatewayResult<Self> {
        ModbusRequest::new(
            descriptor.serial.clone(),
            descriptor.slave_address,
            descriptor.function_code,
            descriptor.start_address,
            descriptor.quantity,
        )
    }
}

impl ModbusCodec {
    /// Compute the Modbus CRC16 of `data`, returned in wire (little-endian) order.
    ///
    /// ```rust
    /// use hoodlink::ModbusCodec;
    ///
    /// assert_eq!(ModbusCodec::compute_crc16(&[]), [0xFF, 0xFF]);
    /// assert_eq!(
    ///     ModbusCodec::compute_crc16(&[0x01, 0x03, 0x00, 0x02, 0x00, 0x1D]),
    ///     [0x24, 0x03]
    /// );
    /// ```
    #[inline]
    pub fn compute_crc16(data: &[u8]) -> [u8; 2] {
        CRC_MODBUS.checksum(data).to_le_bytes()
    }

    /// Check the trailing two bytes of `frame` against the CRC of the rest.
    pub fn verify_crc16(frame: &[u8]) -> bool {
        if frame.len() < CRC_LEN {
            return false;
        }
        let (body, crc) = frame.split_at(frame.len() - CRC_LEN);
        Self::compute_crc16(body) == [crc[0], crc[1]]
    }

    /// Encode a validated request into its 8-byte wire form.
    pub fn build_request(request: &ModbusRequest) -> [u8; REQUEST_FRAME_LEN] {
        let mut frame = [0u8; REQUEST_FRAME_LEN];
        frame[0] = request.slave_address;
        frame[1] = request.function_code;
        frame[2..4].copy_from_slice(&request.start_address.to_be_bytes());
        frame[4..6].copy_from_slice(&request.quantity.to_be_bytes());
        let crc = Self::compute_crc16(&frame[..6]);
        frame[6..].copy_from_slice(&crc);
        frame
    }

    /// Validate and encode a configured descriptor.
    pub fn encode_descriptor(
        descriptor: &RequestDescriptor,
    ) -> GatewayResult<[u8; REQUEST_FRAME_LEN]> {
        let request = ModbusRequest::try_from(descriptor)?;
        Ok(Self::build_request(&request))
    }
}

// ============================================================================
// Hex text form
// ============================================================================

/// Format bytes as space-separated uppercase pairs (`"01 03 00 02"`).
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a hex string, spaced or not, in either case.
pub fn parse_hex(text: &str) -> GatewayResult<Vec<u8>> {
    let digits: String = text.split_whitespace().collect();
    hex::decode(&digits)
        .map_err(|e| GatewayError::decode(format!("invalid hex {:?}: {}", text, e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Bitwise reference of the Modbus CRC, used to cross-check the table-driven crate.
    fn reference_crc(data: &[u8]) -> [u8; 2] {
        let mut crc: u16 = 0xFFFF;
        for &byte in data {
            crc ^= u16::from(byte);
            for _ in 0..8 {
                if crc & 0x0001 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc.to_le_bytes()
    }

    #[test]
    fn test_crc_empty_input() {
        assert_eq!(ModbusCodec::compute_crc16(&[]), [0xFF, 0xFF]);
    }

    #[test]
    fn test_crc_known_vector() {
        let data = [0x01, 0x03, 0x00, 0x02, 0x00, 0x1D];
        assert_eq!(ModbusCodec::compute_crc16(&data), [0x24, 0x03]);
        // Stable under recomputation
        assert_eq!(
            ModbusCodec::compute_crc16(&data),
            ModbusCodec::compute_crc16(&data)
        );
    }

    #[test]
    fn test_build_request() {
        let request = ModbusRequest::new("COM5", 1, 3, 2, 4).unwrap();
        let frame = ModbusCodec::build_request(&request);
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x02, 0x00, 0x04, 0xE5, 0xC9]);
        assert_eq!(format_hex(&frame), "01 03 00 02 00 04 E5 C9");
    }

    #[test]
    fn test_build_request_big_endian_fields() {
        let request = ModbusRequest::new("COM6", 0x1F, 3, 0x1234, 0x00AB).unwrap();
        let frame = ModbusCodec::build_request(&request);
        assert_eq!(&frame[..6], &[0x1F, 0x03, 0x12, 0x34, 0x00, 0xAB]);
        assert!(ModbusCodec::verify_crc16(&frame));
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        for descriptor in [
            RequestDescriptor::new("COM5", 0x100, 3, 0, 1),
            RequestDescriptor::new("COM5", 1, 0x100, 0, 1),
            RequestDescriptor::new("COM5", 1, 3, 0x1_0000, 1),
            RequestDescriptor::new("COM5", 1, 3, 0, 0x1_0000),
        ] {
            let err = ModbusCodec::encode_descriptor(&descriptor).unwrap_err();
            assert!(matches!(err, GatewayError::Encoding { .. }), "{:?}", err);
        }
    }

    #[test]
    fn test_verify_crc_rejects_tampering() {
        let request = ModbusRequest::new("COM5", 1, 3, 2, 4).unwrap();
        let mut frame = ModbusCodec::build_request(&request);
        assert!(ModbusCodec::verify_crc16(&frame));
        frame[3] ^= 0x01;
        assert!(!ModbusCodec::verify_crc16(&frame));
        assert!(!ModbusCodec::verify_crc16(&[0x01]));
    }

    #[test]
    fn test_descriptor_accepts_legacy_key() {
        let json = r#"{"serial":"COM5","slave_adress":1,"function_code":3,"start_address":2,"quantity":4}"#;
        let descriptor: RequestDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor, RequestDescriptor::new("COM5", 1, 3, 2, 4));
    }

    #[test]
    fn test_read_functions() {
        for code in 1..=4 {
            assert!(RequestDescriptor::new("COM5", 1, code, 0, 1).is_read());
        }
        assert!(!RequestDescriptor::new("COM5", 1, 0x06, 0, 1).is_read());
        assert!(!RequestDescriptor::new("COM5", 1, 0x103, 0, 1).is_read());
    }

    #[test]
    fn test_descriptor_defaults_to_holding_registers() {
        let json = r#"{"serial":"COM5","slave_address":31,"start_address":19,"quantity":10}"#;
        let descriptor: RequestDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.function_code, u32::from(FC_READ_HOLDING_REGISTERS));
    }

    #[test]
    fn test_parse_hex_forms() {
        assert_eq!(parse_hex("01 03 0a").unwrap(), vec![0x01, 0x03, 0x0A]);
        assert_eq!(parse_hex("01030A").unwrap(), vec![0x01, 0x03, 0x0A]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert!(parse_hex("01 0").is_err());
        assert!(parse_hex("0G").is_err());
        assert_eq!(parse_hex(" 91 03\t04\n").unwrap(), vec![0x91, 0x03, 0x04]);
        let err = parse_hex("01 0").unwrap_err();
        assert!(matches!(err, GatewayError::Decode { .. }), "{:?}", err);
    }

    #[test]
    fn test_format_hex_is_spaced_uppercase() {
        assert_eq!(format_hex(&[0x0a, 0xff, 0x00]), "0A FF 00");
        assert_eq!(format_hex(&[]), "");
        let bytes = [0x91, 0x03, 0x04, 0x01, 0xC7, 0x00, 0xE7];
        assert_eq!(parse_hex(&format_hex(&bytes)).unwrap(), bytes);
    }

    proptest! {
        #[test]
        fn prop_crc_matches_bitwise_reference(data in proptest::collection::vec(any::<u8>(), 0..300)) {
            prop_assert_eq!(ModbusCodec::compute_crc16(&data), reference_crc(&data));
        }

        #[test]
        fn prop_built_requests_carry_valid_crc(
            slave in 0u32..=0xFF,
            function in 0u32..=0xFF,
            start in 0u32..=0xFFFF,
            quantity in 0u32..=0xFFFF,
        ) {
            let descriptor = RequestDescriptor::new("COM1", slave, function, start, quantity);
            let frame = ModbusCodec::encode_descriptor(&descriptor).unwrap();
            prop_assert!(ModbusCodec::verify_crc16(&frame));
            prop_assert_eq!(reference_crc(&frame[..6]), [frame[6], frame[7]]);
        }

        #[test]
        fn prop_oversized_slave_always_fails(slave in 0x100u32..=u32::MAX) {
            let descriptor = RequestDescriptor::new("COM1", slave, 3, 0, 1);
            prop_assert!(
                matches!(
                    ModbusCodec::encode_descriptor(&descriptor),
                    Err(GatewayError::Encoding { .. })
                ),
                "expected encoding error"
            );
        }
    }
}
