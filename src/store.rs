//! # Device State Store
//!
//! Latest decoded values of every configured device.
//!
//! The device map is built once from the registry and never changes shape, so
//! lookups need no lock. Each device has its own mutex, held only for the
//! field merge or the copy taken by a reader. Updates to different devices
//! never contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

use crate::field::{FieldMap, FieldReading};
use crate::registry::{DeviceClass, DeviceRegistry};

/// Identity of a device state: class and display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub class: DeviceClass,
    pub name: String,
}

impl DeviceKey {
    pub fn new(class: DeviceClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }
}

/// Mutable state of one device.
#[derive(Debug, Clone)]
struct DeviceState {
    fields: FieldMap,
    updated_at: Option<DateTime<Local>>,
}

/// Copy of one device's state handed to readers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub fields: FieldMap,
    /// When the last frame for this device was decoded; `None` while seeded.
    pub updated_at: Option<DateTime<Local>>,
}

impl Serialize for DeviceSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// Category label → display name → fields.
pub type StoreSnapshot = BTreeMap<&'static str, BTreeMap<String, DeviceSnapshot>>;

/// Concurrent per-device latest-value cache.
#[derive(Debug)]
pub struct StateStore {
    registry: Arc<DeviceRegistry>,
    devices: HashMap<DeviceKey, Mutex<DeviceState>>,
}

impl StateStore {
    /// Seed every registered device with zero/false values.
    ///
    /// Pressure gauges get no entry; their readings land on their rooms.
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        let devices = registry
            .records()
            .filter(|record| record.class.has_state())
            .map(|record| {
                (
                    DeviceKey::new(record.class, record.name.clone()),
                    Mutex::new(DeviceState {
                        fields: FieldMap::seeded(record.class),
                        updated_at: None,
                    }),
                )
            })
            .collect();
        Self { registry, devices }
    }

    /// Merge decoded readings into a device. Returns `false` for an unknown device.
    pub fn apply(
        &self,
        key: &DeviceKey,
        readings: Vec<FieldReading>,
        decoded_at: DateTime<Local>,
    ) -> bool {
        let Some(slot) = self.devices.get(key) else {
            return false;
        };
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        state.fields.merge(readings);
        state.updated_at = Some(decoded_at);
        true
    }

    /// Copy of one device's state.
    pub fn get(&self, class: DeviceClass, name: &str) -> Option<DeviceSnapshot> {
        let key = DeviceKey::new(class, name);
        self.devices.get(&key).map(snapshot)
    }

    /// Copy of the state of the device configured as `device_id` on `channel`.
    pub fn get_by_channel_and_id(&self, channel: &str, device_id: u8) -> Option<DeviceSnapshot> {
        let record = self.registry.resolve(channel, device_id)?;
        self.get(record.class, &record.name)
    }

    /// Copy of every device, grouped by category label.
    ///
    /// Devices are copied one at a time; the result is not a single atomic
    /// cut across devices.
    pub fn get_all(&self) -> StoreSnapshot {
        let mut all = StoreSnapshot::new();
        for class in DeviceClass::ALL.into_iter().filter(DeviceClass::has_state) {
            all.entry(class.label()).or_default();
        }
        for (key, slot) in &self.devices {
            all.entry(key.class.label())
                .or_default()
                .insert(key.name.clone(), snapshot(slot));
        }
        all
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}

fn snapshot(slot: &Mutex<DeviceState>) -> DeviceSnapshot {
    let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
    DeviceSnapshot {
        fields: state.fields.clone(),
        updated_at: state.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{layout, FieldValue};
    use crate::registry::{DeviceId, DeviceRecord};

    fn registry() -> Arc<DeviceRegistry> {
        let mut registry = DeviceRegistry::default();
        for (channel, id, name, class) in [
            ("COM5", 1, "301通风柜", DeviceClass::VentilationHood),
            ("COM5", 2, "302通风柜", DeviceClass::VentilationHood),
            ("COM6", 2, "排风机", DeviceClass::ExhaustFan),
        ] {
            registry
                .insert(DeviceRecord::new(channel, DeviceId(id), name, class))
                .unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn test_devices_are_seeded() {
        let store = StateStore::new(registry());
        assert_eq!(store.len(), 3);

        let hood = store.get(DeviceClass::VentilationHood, "301通风柜").unwrap();
        assert_eq!(hood.fields.value("状态"), Some(FieldValue::Flag(false)));
        assert_eq!(hood.fields.value("高度"), Some(FieldValue::Integer(0)));
        assert!(hood.updated_at.is_none());

        let all = store.get_all();
        assert_eq!(all["通风柜"].len(), 2);
        assert_eq!(all["排风机"].len(), 1);
        assert!(all["洁净室"].is_empty());
        assert!(!all.contains_key("压差计"));
    }

    #[test]
    fn test_apply_and_lookup_by_channel() {
        let store = StateStore::new(registry());
        let hood = layout(DeviceClass::VentilationHood);
        let key = DeviceKey::new(DeviceClass::VentilationHood, "302通风柜");

        assert!(store.apply(
            &key,
            vec![hood[3].reading(FieldValue::Integer(88))],
            Local::now()
        ));

        let snapshot = store.get_by_channel_and_id("COM5", 2).unwrap();
        assert_eq!(snapshot.fields.value("高度"), Some(FieldValue::Integer(88)));
        assert!(snapshot.updated_at.is_some());

        assert!(store.get_by_channel_and_id("COM5", 9).is_none());
        assert!(!store.apply(
            &DeviceKey::new(DeviceClass::CleanRoom, "nowhere"),
            Vec::new(),
            Local::now()
        ));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = StateStore::new(registry());
        let before = store.get(DeviceClass::ExhaustFan, "排风机").unwrap();

        let fan = layout(DeviceClass::ExhaustFan);
        store.apply(
            &DeviceKey::new(DeviceClass::ExhaustFan, "排风机"),
            vec![fan[1].reading(FieldValue::Integer(50))],
            Local::now(),
        );

        assert_eq!(before.fields.value("排风频率"), Some(FieldValue::Integer(0)));
        let after = store.get(DeviceClass::ExhaustFan, "排风机").unwrap();
        assert_eq!(after.fields.value("排风频率"), Some(FieldValue::Integer(50)));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let store = StateStore::new(registry());
        let json = serde_json::to_value(store.get_all()).unwrap();
        assert_eq!(json["通风柜"]["301通风柜"]["高度"]["unit"], "mm");
        assert_eq!(json["通风柜"]["301通风柜"]["开度"]["display"], false);
        assert_eq!(json["排风机"]["排风机"]["运行状态"]["value"], false);
    }

    #[test]
    fn test_concurrent_updates_on_distinct_devices() {
        let store = Arc::new(StateStore::new(registry()));
        let hood = layout(DeviceClass::VentilationHood);

        let handles: Vec<_> = ["301通风柜", "302通风柜"]
            .into_iter()
            .map(|name| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let key = DeviceKey::new(DeviceClass::VentilationHood, name);
                    for i in 0..500 {
                        store.apply(&key, vec![hood[3].reading(FieldValue::Integer(i))], Local::now());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for name in ["301通风柜", "302通风柜"] {
            let snapshot = store.get(DeviceClass::VentilationHood, name).unwrap();
            assert_eq!(snapshot.fields.value("高度"), Some(FieldValue::Integer(499)));
        }
    }

    #[test]
    fn test_same_device_updates_never_interleave() {
        let store = Arc::new(StateStore::new(registry()));
        let hood = layout(DeviceClass::VentilationHood);
        let key = DeviceKey::new(DeviceClass::VentilationHood, "301通风柜");

        let writers: Vec<_> = [1i64, 2i64]
            .into_iter()
            .map(|marker| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let readings = [2usize, 3, 4, 6]
                            .iter()
                            .map(|&i| hood[i].reading(FieldValue::Integer(marker)))
                            .collect();
                        store.apply(&key, readings, Local::now());
                    }
                })
            })
            .collect();

        let reader = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let snapshot = store.get(DeviceClass::VentilationHood, "301通风柜").unwrap();
                    let values: Vec<_> = ["报警", "高度", "阀门开度", "排风速"]
                        .iter()
                        .map(|name| snapshot.fields.value(name))
                        .collect();
                    assert!(values.windows(2).all(|w| w[0] == w[1]), "{:?}", values);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
    }
}
