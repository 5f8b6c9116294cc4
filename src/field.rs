//! # Field Tables
//!
//! Fixed-offset field layouts for each [`DeviceClass`]. Offsets are relative
//! to the first payload byte (after the 3-byte response header); every field
//! is one big-endian 16-bit register.
//!
//! ## Ventilation hood
//!
//! | Field | Offset | Kind | Unit |
//! |-------|--------|------|------|
//! | 状态 | 0 | flag | |
//! | 开度 | 6 | flag (hidden) | |
//! | 报警 | 10 | raw | |
//! | 高度 | 12 | raw | mm |
//! | 阀门开度 | 14 | raw | % |
//! | 面风速 | 16 | raw × 0.01 | m/s |
//! | 排风速 | 18 | raw | m³/h |
//!
//! ## Exhaust fan
//!
//! | Field | Offset | Kind | Unit |
//! |-------|--------|------|------|
//! | 运行状态 | 4 | flag | |
//! | 排风频率 | 6 | raw | Hz |
//! | 排风转速 | 22 | raw | r/min |
//! | 管道压力 | 26 | raw | Pa |
//! | 管道压力设定 | 30 | raw | Pa |
//!
//! ## Clean room
//!
//! Each room has its own temperature/humidity sensor:
//!
//! | Field | Offset | Kind | Unit |
//! |-------|--------|------|------|
//! | 湿度 | 0 | raw ÷ 10 | % |
//! | 温度 | 2 | raw ÷ 10 | ℃ |
//!
//! ## Pressure gauge
//!
//! One register per configured room, in configuration order, each stored as
//! that room's `压差` field:
//!
//! | Field | Offset | Kind | Unit |
//! |-------|--------|------|------|
//! | 压差 | 2 × room index | 4-20 mA loop over -60..60 | Pa |

use std::fmt;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::registry::DeviceClass;

/// Decoded value of one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Integer(i64),
    Decimal(f64),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Flag(v) => f64::from(u8::from(*v)),
            FieldValue::Integer(v) => *v as f64,
            FieldValue::Decimal(v) => *v,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Flag(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Decimal(v) => write!(f, "{}", v),
        }
    }
}

/// How a register is turned into a [`FieldValue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Non-zero is `true`.
    Flag,
    /// Register value as an integer.
    Raw,
    /// `raw * factor`, rounded to `decimals`.
    Scaled { factor: f64, decimals: u32 },
    /// 4-20 mA current loop (`raw / 150` mA) mapped linearly onto `min..max`.
    CurrentLoop { min: f64, max: f64, decimals: u32 },
}

/// One entry of a field table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
    pub unit: &'static str,
    pub display: bool,
}

impl FieldSpec {
    const fn new(name: &'static str, offset: usize, kind: FieldKind, unit: &'static str) -> Self {
        Self {
            name,
            offset,
            kind,
            unit,
            display: true,
        }
    }

    const fn hidden(self) -> Self {
        Self {
            display: false,
            ..self
        }
    }

    /// Bytes this field occupies at the end of the payload.
    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + 2
    }

    /// Decode this field from `payload`, `None` if the payload is too short.
    pub fn read(&self, payload: &[u8]) -> Option<FieldValue> {
        let bytes = payload.get(self.offset..self.end())?;
        let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
        Some(self.kind.convert(raw))
    }

    /// Field in its power-on state: `false` or zero.
    pub fn zero(&self) -> FieldReading {
        let value = match self.kind {
            FieldKind::Flag => FieldValue::Flag(false),
            FieldKind::Raw => FieldValue::Integer(0),
            FieldKind::Scaled { .. } | FieldKind::CurrentLoop { .. } => FieldValue::Decimal(0.0),
        };
        self.reading(value)
    }

    pub fn reading(&self, value: FieldValue) -> FieldReading {
        FieldReading {
            name: self.name,
            value,
            unit: self.unit,
            display: self.display,
        }
    }
}

impl FieldKind {
    pub fn convert(&self, raw: u16) -> FieldValue {
        match *self {
            FieldKind::Flag => FieldValue::Flag(raw != 0),
            FieldKind::Raw => FieldValue::Integer(i64::from(raw)),
            FieldKind::Scaled { factor, decimals } => {
                FieldValue::Decimal(round_to(f64::from(raw) * factor, decimals))
            }
            FieldKind::CurrentLoop { min, max, decimals } => {
                let current_ma = f64::from(raw) / 150.0;
                let value = (current_ma - 4.0) * (max - min) / 16.0 + min;
                FieldValue::Decimal(round_to(value, decimals))
            }
        }
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() / scale
}

static VENTILATION_HOOD: [FieldSpec; 7] = [
    FieldSpec::new("状态", 0, FieldKind::Flag, " "),
    FieldSpec::new("开度", 6, FieldKind::Flag, " ").hidden(),
    FieldSpec::new("报警", 10, FieldKind::Raw, " "),
    FieldSpec::new("高度", 12, FieldKind::Raw, "mm"),
    FieldSpec::new("阀门开度", 14, FieldKind::Raw, "%"),
    FieldSpec::new(
        "面风速",
        16,
        FieldKind::Scaled {
            factor: 0.01,
            decimals: 2,
        },
        "m/s",
    ),
    FieldSpec::new("排风速", 18, FieldKind::Raw, "m³/h"),
];

static EXHAUST_FAN: [FieldSpec; 5] = [
    FieldSpec::new("运行状态", 4, FieldKind::Flag, " "),
    FieldSpec::new("排风频率", 6, FieldKind::Raw, "Hz"),
    FieldSpec::new("排风转速", 22, FieldKind::Raw, "r/min"),
    FieldSpec::new("管道压力", 26, FieldKind::Raw, "Pa"),
    FieldSpec::new("管道压力设定", 30, FieldKind::Raw, "Pa"),
];

static CLEAN_ROOM: [FieldSpec; 2] = [
    FieldSpec::new(
        "湿度",
        0,
        FieldKind::Scaled {
            factor: 0.1,
            decimals: 1,
        },
        "%",
    ),
    FieldSpec::new(
        "温度",
        2,
        FieldKind::Scaled {
            factor: 0.1,
            decimals: 1,
        },
        "℃",
    ),
];

/// Room pressure as reported by the pressure gauge, first room's register.
static ROOM_PRESSURE: FieldSpec = FieldSpec::new(
    "压差",
    0,
    FieldKind::CurrentLoop {
        min: -60.0,
        max: 60.0,
        decimals: 1,
    },
    "Pa",
);

/// Fields decoded from a device's own response frame, in display order.
///
/// Empty for the pressure gauge, whose registers belong to other devices.
pub fn layout(class: DeviceClass) -> &'static [FieldSpec] {
    match class {
        DeviceClass::VentilationHood => &VENTILATION_HOOD,
        DeviceClass::ExhaustFan => &EXHAUST_FAN,
        DeviceClass::CleanRoom => &CLEAN_ROOM,
        DeviceClass::PressureGauge => &[],
    }
}

/// Payload length needed to decode every field of `class`.
pub fn extent(class: DeviceClass) -> usize {
    layout(class).iter().map(FieldSpec::end).max().unwrap_or(0)
}

/// Fields kept in the state store for `class`: its own layout plus fields fed
/// by other devices.
pub fn stored_fields(class: DeviceClass) -> impl Iterator<Item = &'static FieldSpec> {
    let fed = match class {
        DeviceClass::CleanRoom => Some(&ROOM_PRESSURE),
        _ => None,
    };
    layout(class).iter().chain(fed)
}

/// Pressure register of the `index`-th room in a gauge response.
pub fn room_pressure(index: usize) -> FieldSpec {
    FieldSpec {
        offset: index * 2,
        ..ROOM_PRESSURE
    }
}

/// A decoded field together with its presentation attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldReading {
    pub name: &'static str,
    pub value: FieldValue,
    pub unit: &'static str,
    pub display: bool,
}

impl Serialize for FieldReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FieldReading", 3)?;
        state.serialize_field("value", &self.value)?;
        state.serialize_field("unit", self.unit)?;
        state.serialize_field("display", &self.display)?;
        state.end()
    }
}

/// Ordered field name → reading map of one device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap(Vec<FieldReading>);

impl FieldMap {
    /// All fields of `class` at their zero values.
    pub fn seeded(class: DeviceClass) -> Self {
        Self(stored_fields(class).map(FieldSpec::zero).collect())
    }

    /// Replace readings field by field; unknown names are appended.
    pub fn merge(&mut self, readings: impl IntoIterator<Item = FieldReading>) {
        for reading in readings {
            match self.0.iter_mut().find(|r| r.name == reading.name) {
                Some(slot) => *slot = reading,
                None => self.0.push(reading),
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldReading> {
        self.0.iter().find(|r| r.name == name)
    }

    pub fn value(&self, name: &str) -> Option<FieldValue> {
        self.get(name).map(|r| r.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldReading> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for reading in &self.0 {
            map.serialize_entry(reading.name, reading)?;
        }
        map.end()
    }
}
