//! Device registry
//!
//! Maps `(channel, device id)` to the configured device record. The device id
//! is the first byte of a response frame, written as a two-digit decimal in
//! configuration (`1` → `"01"`).
//!
//! A pressure gauge reports the differential pressure of several clean rooms
//! in one frame. Its entry lists those rooms by name, in register order:
//!
//! ```yaml
//! COM6:
//!   "88": { name: 压差计, class: pressure_gauge, rooms: [更衣室, 缓冲间] }
//!   "145": { name: 更衣室, class: clean_room }
//!   "146": { name: 缓冲间, class: clean_room }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::field::{self, FieldSpec};

/// Kind of device, which selects the field table used to decode its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    VentilationHood,
    ExhaustFan,
    CleanRoom,
    /// Multi-room differential pressure transmitter.
    PressureGauge,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 4] = [
        DeviceClass::VentilationHood,
        DeviceClass::ExhaustFan,
        DeviceClass::CleanRoom,
        DeviceClass::PressureGauge,
    ];

    /// Category label used as the top-level key of store snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceClass::VentilationHood => "通风柜",
            DeviceClass::ExhaustFan => "排风机",
            DeviceClass::CleanRoom => "洁净室",
            DeviceClass::PressureGauge => "压差计",
        }
    }

    /// Whether devices of this class keep their own state. A pressure gauge
    /// only writes into its rooms.
    #[inline]
    pub fn has_state(&self) -> bool {
        !matches!(self, DeviceClass::PressureGauge)
    }

    #[inline]
    pub fn fields(&self) -> &'static [FieldSpec] {
        field::layout(*self)
    }

    /// Minimum payload length needed to decode every field.
    #[inline]
    pub fn payload_extent(&self) -> usize {
        field::extent(*self)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Modbus device id, displayed as two decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u8);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = GatewayError;

    fn from_str(s: &str) -> GatewayResult<Self> {
        s.trim()
            .parse::<u8>()
            .map(DeviceId)
            .map_err(|_| GatewayError::config(format!("device id {:?} is not a number 0-255", s)))
    }
}

/// Device entry as written in configuration: a bare display name, or a name
/// with an explicit class.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DeviceEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        class: DeviceClass,
        #[serde(default)]
        rooms: Vec<String>,
    },
}

impl DeviceEntry {
    pub fn name(&self) -> &str {
        match self {
            DeviceEntry::Name(name) => name,
            DeviceEntry::Detailed { name, .. } => name,
        }
    }

    pub fn class(&self) -> DeviceClass {
        match self {
            DeviceEntry::Name(_) => DeviceClass::default(),
            DeviceEntry::Detailed { class, .. } => *class,
        }
    }

    pub fn rooms(&self) -> &[String] {
        match self {
            DeviceEntry::Name(_) => &[],
            DeviceEntry::Detailed { rooms, .. } => rooms,
        }
    }
}

/// `devices` configuration section: channel → id → entry.
pub type DeviceTable = BTreeMap<String, BTreeMap<String, DeviceEntry>>;

/// A configured device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub channel: String,
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    /// Clean rooms fed by a pressure gauge, in register order.
    pub rooms: Vec<String>,
}

impl DeviceRecord {
    pub fn new(
        channel: impl Into<String>,
        id: DeviceId,
        name: impl Into<String>,
        class: DeviceClass,
    ) -> Self {
        Self {
            channel: channel.into(),
            id,
            name: name.into(),
            class,
            rooms: Vec::new(),
        }
    }

    pub fn with_rooms(mut self, rooms: Vec<String>) -> Self {
        self.rooms = rooms;
        self
    }
}

/// Immutable `(channel, device id)` → [`DeviceRecord`] mapping.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    channels: BTreeMap<String, BTreeMap<u8, DeviceRecord>>,
}

impl DeviceRegistry {
    /// Build the registry from the `devices` section.
    ///
    /// Rejects non-numeric ids, ids configured twice on one channel (`"1"` and
    /// `"01"`), display names used twice within a class, and pressure gauges
    /// whose rooms are not configured clean rooms.
    pub fn from_config(devices: &DeviceTable) -> GatewayResult<Self> {
        let mut registry = Self::default();
        for (channel, entries) in devices {
            for (key, entry) in entries {
                let id: DeviceId = key.parse()?;
                let record = DeviceRecord::new(channel.as_str(), id, entry.name(), entry.class())
                    .with_rooms(entry.rooms().to_vec());
                registry.insert(record)?;
            }
        }
        registry.check_rooms()?;
        debug!(
            "Device registry built: {} device(s) on {} channel(s)",
            registry.len(),
            registry.channels.len()
        );
        Ok(registry)
    }

    /// Add one record.
    ///
    /// Room references of pressure gauges are checked by [`check_rooms`],
    /// since the rooms may be inserted later.
    ///
    /// [`check_rooms`]: DeviceRegistry::check_rooms
    pub fn insert(&mut self, record: DeviceRecord) -> GatewayResult<()> {
        match (record.class, record.rooms.is_empty()) {
            (DeviceClass::PressureGauge, true) => {
                return Err(GatewayError::config(format!(
                    "pressure gauge {:?} lists no rooms",
                    record.name
                )));
            }
            (DeviceClass::PressureGauge, false) => {}
            (class, false) => {
                return Err(GatewayError::config(format!(
                    "rooms are only valid for a pressure gauge, not {} {:?}",
                    class, record.name
                )));
            }
            (_, true) => {}
        }
        if self
            .records()
            .any(|r| r.class == record.class && r.name == record.name)
        {
            return Err(GatewayError::config(format!(
                "device name {:?} configured twice for {}",
                record.name, record.class
            )));
        }
        let channel = self.channels.entry(record.channel.clone()).or_default();
        if channel.contains_key(&record.id.0) {
            return Err(GatewayError::config(format!(
                "device {} configured twice on {}",
                record.id, record.channel
            )));
        }
        channel.insert(record.id.0, record);
        Ok(())
    }

    /// Verify every pressure gauge room names a configured clean room.
    pub fn check_rooms(&self) -> GatewayResult<()> {
        for gauge in self
            .records()
            .filter(|r| r.class == DeviceClass::PressureGauge)
        {
            for room in &gauge.rooms {
                let known = self
                    .records()
                    .any(|r| r.class == DeviceClass::CleanRoom && &r.name == room);
                if !known {
                    return Err(GatewayError::config(format!(
                        "pressure gauge {:?} feeds unknown clean room {:?}",
                        gauge.name, room
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up the device that answered on `channel` with `device_id`.
    pub fn resolve(&self, channel: &str, device_id: u8) -> Option<&DeviceRecord> {
        self.channels.get(channel)?.get(&device_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.channels.values().flat_map(|devices| devices.values())
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
