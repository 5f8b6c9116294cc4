//! Wire messages exchanged with the serial bridge
//!
//! Every message is a UTF-8 JSON value written to the socket with no
//! delimiter, so the receiving side has to split the stream itself
//! ([`JsonStreamSplitter`]).
//!
//! | Direction | Shape |
//! |-----------|-------|
//! | collector → bridge | `[{name, description, baudrate, timeout?}]` (once, after connect) |
//! | collector → bridge | `{serial, request, time}` |
//! | bridge → collector | `{status, serial, request, response, time}` |
//! | bridge → collector | `{status: "error", message}` |

use bytes::{Buf, BytesMut};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::format_hex;
use crate::constants::WIRE_TIME_FORMAT;
use crate::error::{GatewayError, GatewayResult};
use crate::frame::{ExceptionFrame, RawFrame};

/// Current local time in wire format.
pub fn wire_timestamp() -> String {
    Local::now().format(WIRE_TIME_FORMAT).to_string()
}

/// Serial line the bridge should open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub baudrate: u32,
    /// Read timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

/// A read request as sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequestMessage {
    pub serial: String,
    /// Hex text of the 8-byte request frame.
    pub request: String,
    pub time: String,
}

impl ReadRequestMessage {
    /// Wrap an encoded request frame, stamped with the current local time.
    pub fn new(serial: impl Into<String>, frame: &[u8]) -> Self {
        Self {
            serial: serial.into(),
            request: format_hex(frame),
            time: wire_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Bridge reply to a read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub status: ReplyStatus,
    pub serial: String,
    pub request: String,
    /// Hex text of the response frame; empty when the device did not answer.
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub time: String,
}

/// Bridge-side failure not tied to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeError {
    pub status: ReplyStatus,
    pub message: String,
}

/// Everything the receive loop can hand to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A `{status, serial, request, response, time}` reply.
    Response(ReadResponse),
    /// A `{status: "error", message}` notice.
    Error(BridgeError),
    /// A frame reassembled from a raw byte stream.
    Frame { channel: String, frame: RawFrame },
    /// A Modbus exception response from a raw byte stream.
    Exception {
        channel: String,
        exception: ExceptionFrame,
    },
    /// Any other JSON value.
    Other(Value),
}

impl InboundMessage {
    /// Classify a JSON value received from the bridge.
    pub fn from_value(value: Value) -> Self {
        if value.get("response").is_some() {
            if let Ok(response) = serde_json::from_value::<ReadResponse>(value.clone()) {
                return InboundMessage::Response(response);
            }
        }
        if value.get("message").is_some() {
            if let Ok(error) = serde_json::from_value::<BridgeError>(value.clone()) {
                return InboundMessage::Error(error);
            }
        }
        InboundMessage::Other(value)
    }
}

/// Splits an undelimited stream of concatenated JSON values.
///
/// Bytes may arrive in arbitrary chunks; a value is only returned once it is
/// complete. Unparseable input is skipped up to the next `{` or `[`.
#[derive(Debug, Default)]
pub struct JsonStreamSplitter {
    buffer: BytesMut,
}

impl JsonStreamSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete value, `Ok(None)` if more bytes are needed.
    pub fn next_value(&mut self) -> GatewayResult<Option<Value>> {
        let (result, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<Value>();
            let result = stream.next();
            (result, stream.byte_offset())
        };

        match result {
            None => {
                // Only whitespace left
                self.buffer.clear();
                Ok(None)
            }
            Some(Ok(value)) => {
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.resync();
                Err(GatewayError::decode(format!("malformed JSON from bridge: {}", e)))
            }
        }
    }

    /// Drop bytes up to the next plausible start of a value.
    fn resync(&mut self) {
        let next_start = self
            .buffer
            .iter()
            .skip(1)
            .position(|&b| b == b'{' || b == b'[')
            .map(|pos| pos + 1);
        match next_start {
            Some(pos) => self.buffer.advance(pos),
            None => self.buffer.clear(),
        }
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_message_shape() {
        let message = ReadRequestMessage::new(
            "COM5",
            &[0x01, 0x03, 0x00, 0x02, 0x00, 0x04, 0xE5, 0xC9],
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["serial"], "COM5");
        assert_eq!(value["request"], "01 03 00 02 00 04 E5 C9");
        let time = value["time"].as_str().unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(time, WIRE_TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_channel_descriptor_omits_missing_timeout() {
        let descriptor = ChannelDescriptor {
            name: "COM5".into(),
            description: "hoods, floor 3".into(),
            baudrate: 9600,
            timeout: None,
        };
        let value = serde_json::to_value(vec![descriptor]).unwrap();
        assert_eq!(
            value,
            json!([{"name": "COM5", "description": "hoods, floor 3", "baudrate": 9600}])
        );
    }

    #[test]
    fn test_classify_inbound_values() {
        let response = json!({
            "status": "success",
            "serial": "COM5",
            "request": "01 03 00 02 00 04 E5 C9",
            "response": "01 03 02 00 01 79 84",
            "time": "2024-05-01 10:00:00"
        });
        match InboundMessage::from_value(response) {
            InboundMessage::Response(r) => {
                assert_eq!(r.status, ReplyStatus::Success);
                assert_eq!(r.serial, "COM5");
            }
            other => panic!("unexpected {:?}", other),
        }

        let error = json!({"status": "error", "message": "COM9 not open"});
        assert!(matches!(
            InboundMessage::from_value(error),
            InboundMessage::Error(BridgeError { ref message, .. }) if message == "COM9 not open"
        ));

        let other = json!({"hello": 1});
        assert!(matches!(
            InboundMessage::from_value(other),
            InboundMessage::Other(_)
        ));
    }

    #[test]
    fn test_splitter_handles_concatenated_and_partial_values() {
        let mut splitter = JsonStreamSplitter::new();
        splitter.push(br#"{"a":1}{"b":"#);

        assert_eq!(splitter.next_value().unwrap(), Some(json!({"a": 1})));
        assert_eq!(splitter.next_value().unwrap(), None);

        splitter.push(br#"[2, 3]} "#);
        // `{"b":[2, 3]}` is now complete
        assert_eq!(splitter.next_value().unwrap(), Some(json!({"b": [2, 3]})));
        assert_eq!(splitter.next_value().unwrap(), None);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_splitter_byte_by_byte() {
        let text = br#"{"status":"error","message":"x"} {"serial":"COM5"}"#;
        let mut splitter = JsonStreamSplitter::new();
        let mut values = Vec::new();
        for byte in text.iter() {
            splitter.push(std::slice::from_ref(byte));
            while let Some(value) = splitter.next_value().unwrap() {
                values.push(value);
            }
        }
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["serial"], "COM5");
    }

    #[test]
    fn test_splitter_skips_garbage() {
        let mut splitter = JsonStreamSplitter::new();
        splitter.push(br#"xx}{"ok":true}"#);
        assert!(splitter.next_value().is_err());
        assert_eq!(splitter.next_value().unwrap(), Some(json!({"ok": true})));
    }
}
