//! Response frame decoding into device fields.
//!
//! A response is attributed to a device by its first byte and the channel it
//! arrived on, never by its position in the polling round.
//!
//! A pressure gauge frame carries one register per room and is fanned out:
//! each room's `压差` is merged into that room's state separately.

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, warn};

use crate::codec::parse_hex;
use crate::constants::RESPONSE_HEADER_LEN;
use crate::field::{room_pressure, FieldReading};
use crate::frame::RawFrame;
use crate::registry::{DeviceClass, DeviceRecord, DeviceRegistry};
use crate::store::{DeviceKey, StateStore};

/// What happened to one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Fields were merged into the device's state. For a pressure gauge,
    /// `fields` counts the rooms updated.
    Applied {
        class: DeviceClass,
        name: String,
        fields: usize,
    },
    /// No device is configured for this id on this channel.
    UnknownDevice { channel: String, device_id: u8 },
    /// The payload ends before the last field of the device's table.
    ShortFrame { needed: usize, available: usize },
    /// The response text or bytes are not a frame at all.
    Invalid { reason: String },
}

impl DecodeOutcome {
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, DecodeOutcome::Applied { .. })
    }
}

/// Decodes responses with the registry and writes them to the store.
#[derive(Debug, Clone)]
pub struct FieldDecoder {
    registry: Arc<DeviceRegistry>,
    store: Arc<StateStore>,
}

impl FieldDecoder {
    pub fn new(registry: Arc<DeviceRegistry>, store: Arc<StateStore>) -> Self {
        Self { registry, store }
    }

    /// Decode a response given as hex text, as carried in bridge replies.
    pub fn decode(&self, channel: &str, response_hex: &str) -> DecodeOutcome {
        match parse_hex(response_hex) {
            Ok(bytes) => self.decode_bytes(channel, &bytes),
            Err(e) => {
                warn!("Dropping response from {}: {}", channel, e);
                DecodeOutcome::Invalid {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Decode a reassembled frame.
    pub fn decode_frame(&self, channel: &str, frame: &RawFrame) -> DecodeOutcome {
        self.decode_bytes(channel, frame.as_bytes())
    }

    /// Decode raw response bytes: header, payload, then CRC (if present).
    pub fn decode_bytes(&self, channel: &str, bytes: &[u8]) -> DecodeOutcome {
        let Some(&device_id) = bytes.first() else {
            warn!("Dropping empty response from {}", channel);
            return DecodeOutcome::Invalid {
                reason: "empty response".to_string(),
            };
        };

        let Some(record) = self.registry.resolve(channel, device_id) else {
            warn!("Unknown device {:02} on {}, frame dropped", device_id, channel);
            return DecodeOutcome::UnknownDevice {
                channel: channel.to_string(),
                device_id,
            };
        };

        let payload = payload_of(bytes);
        match record.class {
            DeviceClass::PressureGauge => self.fan_out_pressure(record, payload),
            _ => self.apply_own_fields(record, payload),
        }
    }

    fn apply_own_fields(&self, record: &DeviceRecord, payload: &[u8]) -> DecodeOutcome {
        let needed = record.class.payload_extent();
        if payload.len() < needed {
            warn!(
                "Short frame from {} ({}): {} payload bytes, {} needed",
                record.name,
                record.channel,
                payload.len(),
                needed
            );
            return DecodeOutcome::ShortFrame {
                needed,
                available: payload.len(),
            };
        }

        let readings: Vec<_> = record
            .class
            .fields()
            .iter()
            .filter_map(|spec| spec.read(payload).map(|value| spec.reading(value)))
            .collect();
        let fields = readings.len();

        let key = DeviceKey::new(record.class, record.name.clone());
        if !self.store.apply(&key, readings, Local::now()) {
            // Registry and store are built from the same records
            warn!("Device {} missing from the state store", record.name);
            return DecodeOutcome::UnknownDevice {
                channel: record.channel.clone(),
                device_id: record.id.0,
            };
        }

        debug!("Decoded {} field(s) for {} ({})", fields, record.name, record.class);
        DecodeOutcome::Applied {
            class: record.class,
            name: record.name.clone(),
            fields,
        }
    }

    /// Rooms whose register lies beyond the payload keep their last value.
    fn fan_out_pressure(&self, gauge: &DeviceRecord, payload: &[u8]) -> DecodeOutcome {
        let readings: Vec<(&String, FieldReading)> = gauge
            .rooms
            .iter()
            .enumerate()
            .map_while(|(index, room)| {
                let spec = room_pressure(index);
                spec.read(payload).map(|value| (room, spec.reading(value)))
            })
            .collect();

        if readings.is_empty() {
            warn!(
                "Short frame from {} ({}): {} payload bytes, no room register",
                gauge.name,
                gauge.channel,
                payload.len()
            );
            return DecodeOutcome::ShortFrame {
                needed: room_pressure(0).end(),
                available: payload.len(),
            };
        }
        if readings.len() < gauge.rooms.len() {
            warn!(
                "Frame from {} covers {} of {} room(s)",
                gauge.name,
                readings.len(),
                gauge.rooms.len()
            );
        }

        let decoded_at = Local::now();
        let mut rooms = 0;
        for (room, reading) in readings {
            let key = DeviceKey::new(DeviceClass::CleanRoom, room.as_str());
            if self.store.apply(&key, vec![reading], decoded_at) {
                rooms += 1;
            } else {
                warn!("Room {} of {} missing from the state store", room, gauge.name);
            }
        }

        debug!("Pressure of {} room(s) updated from {}", rooms, gauge.name);
        DecodeOutcome::Applied {
            class: gauge.class,
            name: gauge.name.clone(),
            fields: rooms,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
}

/// Payload bytes: after the header, bounded by the byte-count field and the
/// end of the data.
fn payload_of(bytes: &[u8]) -> &[u8] {
    if bytes.len() < RESPONSE_HEADER_LEN {
        return &[];
    }
    let declared = bytes[2] as usize;
    let end = (RESPONSE_HEADER_LEN + declared).min(bytes.len());
    &bytes[RESPONSE_HEADER_LEN..end]
}
