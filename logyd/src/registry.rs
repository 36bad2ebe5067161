//! The in-memory topology of receivers and their paired devices.
//!
//! The whole topology sits behind a single [`RwLock`], so a reader never sees
//! a device halfway through an update. Reads hand out clones.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use hidpp::{
    feature::unified_battery::BatteryInfo,
    receiver::bolt::{BoltDeviceKind, FirmwareVersion},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    pairing::PairingView,
    settings::{Setting, SettingValue},
    store::StoreEntry,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Unreachable,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReceiverEntry {
    /// The unique ID reported by the receiver.
    pub id: String,

    /// The HID node the receiver was last seen at.
    pub path: String,

    pub vendor_id: u16,
    pub product_id: u16,

    #[serde(default)]
    pub firmware: Option<FirmwareVersion>,

    pub max_slots: u8,
    pub online: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing: Option<PairingView>,
}

/// A feature as listed in a device's feature table.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub index: u8,
    pub id: u16,
    pub name: String,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// The ID of the owning receiver.
    pub receiver: String,

    pub slot: u8,

    /// The stable identity settings are keyed by.
    pub identity: String,

    pub name: String,
    pub codename: String,
    pub kind: BoltDeviceKind,
    pub wpid: u16,
    pub state: ConnectionState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryInfo>,

    #[serde(default)]
    pub features: Vec<FeatureSummary>,

    #[serde(default)]
    pub settings: BTreeMap<Setting, SettingValue>,

    /// Set if the stored settings were made for a different product.
    #[serde(default)]
    pub config_mismatch: bool,

    /// Consecutive requests the device left unanswered.
    #[serde(skip)]
    pub misses: u32,
}

/// A change to the state of a device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StateUpdate {
    /// The device answered or sent something.
    Activity,

    /// A request to the device went unanswered.
    Miss,

    /// The receiver reported the link to the device as lost.
    Detached,

    Battery(BatteryInfo),
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub receivers: Vec<ReceiverSnapshot>,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ReceiverSnapshot {
    #[serde(flatten)]
    pub receiver: ReceiverEntry,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Default)]
struct Topology {
    receivers: BTreeMap<String, ReceiverEntry>,

    /// Keyed by receiver ID and slot, which keeps slots unique per receiver.
    devices: BTreeMap<(String, u8), DeviceEntry>,

    /// Stored configuration by device identity.
    configs: HashMap<String, StoreEntry>,

    /// The lease of the session that last registered each receiver.
    leases: HashMap<String, u64>,
    next_lease: u64,
}

pub struct Registry {
    grace_misses: u32,
    inner: RwLock<Topology>,
}

impl Registry {
    pub fn new(grace_misses: u32) -> Self {
        Self {
            grace_misses: grace_misses.max(1),
            inner: RwLock::new(Topology::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Topology> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Topology> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replaces all known stored configurations.
    pub fn set_configs(&self, configs: impl IntoIterator<Item = (String, StoreEntry)>) {
        self.write().configs = configs.into_iter().collect();
    }

    pub fn config(&self, identity: &str) -> Option<StoreEntry> {
        self.read().configs.get(identity).cloned()
    }

    /// Adds or refreshes a receiver. A receiver with a known ID keeps its
    /// devices until they are rediscovered.
    ///
    /// Returns the lease the caller removes the receiver with. Registering
    /// the receiver again invalidates earlier leases.
    pub fn upsert_receiver(&self, entry: ReceiverEntry) -> u64 {
        let mut topology = self.write();
        topology.next_lease += 1;
        let lease = topology.next_lease;

        topology.leases.insert(entry.id.clone(), lease);
        topology.receivers.insert(entry.id.clone(), entry);
        lease
    }

    pub fn receiver(&self, id: &str) -> Option<ReceiverEntry> {
        self.read().receivers.get(id).cloned()
    }

    /// Marks a receiver offline and all of its devices unreachable.
    ///
    /// Stored configuration is left untouched. Nothing happens if the
    /// receiver was registered again since `lease` was handed out; returns
    /// whether the receiver was removed.
    pub fn remove(&self, receiver: &str, lease: u64) -> bool {
        let mut topology = self.write();
        if topology.leases.get(receiver) != Some(&lease) {
            return false;
        }
        topology.leases.remove(receiver);

        if let Some(entry) = topology.receivers.get_mut(receiver) {
            entry.online = false;
            entry.pairing = None;
        }

        for device in devices_of(&mut topology.devices, receiver) {
            device.state = ConnectionState::Unreachable;
        }
        true
    }

    /// Replaces the devices of a receiver with a freshly discovered set.
    pub fn replace_devices(&self, receiver: &str, devices: Vec<DeviceEntry>) {
        let mut topology = self.write();
        topology.devices.retain(|(id, _), _| id != receiver);

        for device in devices {
            topology
                .devices
                .insert((device.receiver.clone(), device.slot), device);
        }
    }

    /// Adds a device, replacing whatever occupied its slot before.
    pub fn insert_device(&self, device: DeviceEntry) {
        self.write()
            .devices
            .insert((device.receiver.clone(), device.slot), device);
    }

    pub fn remove_device(&self, receiver: &str, slot: u8) -> Option<DeviceEntry> {
        self.write().devices.remove(&(receiver.to_string(), slot))
    }

    pub fn device(&self, receiver: &str, slot: u8) -> Option<DeviceEntry> {
        self.read().devices.get(&(receiver.to_string(), slot)).cloned()
    }

    /// Finds a device by its identity across all receivers.
    pub fn find_device(&self, identity: &str) -> Option<DeviceEntry> {
        self.read()
            .devices
            .values()
            .find(|device| device.identity == identity)
            .cloned()
    }

    pub fn devices(&self, receiver: &str) -> Vec<DeviceEntry> {
        self.read()
            .devices
            .values()
            .filter(|device| device.receiver == receiver)
            .cloned()
            .collect()
    }

    /// Applies a state update to a device.
    ///
    /// Returns the previous and the new connection state, or [`None`] if the
    /// device is unknown.
    pub fn update_state(
        &self,
        receiver: &str,
        slot: u8,
        update: StateUpdate,
    ) -> Option<(ConnectionState, ConnectionState)> {
        let mut topology = self.write();
        let device = topology.devices.get_mut(&(receiver.to_string(), slot))?;
        let before = device.state;

        match update {
            StateUpdate::Activity => {
                device.misses = 0;
                device.state = ConnectionState::Connected;
            },
            StateUpdate::Battery(info) => {
                device.battery = Some(info);
                device.misses = 0;
                device.state = ConnectionState::Connected;
            },
            StateUpdate::Miss => {
                device.misses = device.misses.saturating_add(1);
                if device.state == ConnectionState::Connected && device.misses >= self.grace_misses {
                    device.state = ConnectionState::Unreachable;
                }
            },
            StateUpdate::Detached => {
                device.misses = 0;
                device.state = ConnectionState::Disconnected;
            },
        }

        if before != device.state {
            info!(
                receiver,
                slot,
                identity = %device.identity,
                "device is now {:?}",
                device.state
            );
        }

        Some((before, device.state))
    }

    pub fn set_pairing(&self, receiver: &str, pairing: Option<PairingView>) {
        if let Some(entry) = self.write().receivers.get_mut(receiver) {
            entry.pairing = pairing;
        }
    }

    /// Records a changed setting on the device and in its stored entry.
    ///
    /// Returns the stored entry to persist.
    pub fn set_setting(
        &self,
        device: &DeviceEntry,
        setting: Setting,
        value: SettingValue,
    ) -> StoreEntry {
        let mut topology = self.write();

        if let Some(entry) = topology
            .devices
            .get_mut(&(device.receiver.clone(), device.slot))
        {
            entry.settings.insert(setting, value);
            entry.config_mismatch = false;
        }

        let config = topology
            .configs
            .entry(device.identity.clone())
            .or_insert_with(|| StoreEntry {
                name: device.name.clone(),
                wpid: device.wpid,
                settings: BTreeMap::new(),
            });

        // Configuring a mismatched device adopts the stored entry for it.
        if config.wpid != device.wpid {
            config.wpid = device.wpid;
            config.settings.clear();
        }
        config.settings.insert(setting, value);

        config.clone()
    }

    /// Attaches the stored configuration to a device about to be registered.
    ///
    /// Returns the entry to persist if the device was new to the store or its
    /// name changed. A stored entry made for another product is left alone
    /// and flags the device instead.
    pub fn reconcile(&self, device: &mut DeviceEntry) -> Option<StoreEntry> {
        let mut topology = self.write();

        match topology.configs.get_mut(&device.identity) {
            Some(config) if config.wpid != device.wpid => {
                warn!(
                    identity = %device.identity,
                    stored = format_args!("{:#06x}", config.wpid),
                    found = format_args!("{:#06x}", device.wpid),
                    "stored settings belong to a different product, not applying them"
                );
                device.config_mismatch = true;
                device.settings.clear();
                None
            },
            Some(config) => {
                device.config_mismatch = false;
                device.settings = config.settings.clone();

                if config.name != device.name && !device.name.is_empty() {
                    config.name = device.name.clone();
                    return Some(config.clone());
                }
                None
            },
            None => {
                let config = StoreEntry {
                    name: device.name.clone(),
                    wpid: device.wpid,
                    settings: BTreeMap::new(),
                };
                topology
                    .configs
                    .insert(device.identity.clone(), config.clone());
                Some(config)
            },
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let topology = self.read();

        Snapshot {
            receivers: topology
                .receivers
                .values()
                .map(|receiver| ReceiverSnapshot {
                    receiver: receiver.clone(),
                    devices: topology
                        .devices
                        .values()
                        .filter(|device| device.receiver == receiver.id)
                        .cloned()
                        .collect(),
                })
                .collect(),
        }
    }
}

fn devices_of<'a>(
    devices: &'a mut BTreeMap<(String, u8), DeviceEntry>,
    receiver: &'a str,
) -> impl Iterator<Item = &'a mut DeviceEntry> {
    devices
        .values_mut()
        .filter(move |device| device.receiver == receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RatchetMode;

    fn device(receiver: &str, slot: u8, identity: &str) -> DeviceEntry {
        DeviceEntry {
            receiver: receiver.to_string(),
            slot,
            identity: identity.to_string(),
            name: "MX Master 3S B".to_string(),
            codename: "MX Master 3S".to_string(),
            kind: BoltDeviceKind::Mouse,
            wpid: 0xb034,
            state: ConnectionState::Connected,
            battery: None,
            features: Vec::new(),
            settings: BTreeMap::new(),
            config_mismatch: false,
            misses: 0,
        }
    }

    fn receiver(id: &str) -> ReceiverEntry {
        ReceiverEntry {
            id: id.to_string(),
            path: "/dev/hidraw3".to_string(),
            vendor_id: 0x046d,
            product_id: 0xc548,
            firmware: None,
            max_slots: 6,
            online: true,
            pairing: None,
        }
    }

    #[test]
    fn misses_make_devices_unreachable_until_they_speak_again() {
        let registry = Registry::new(3);
        registry.upsert_receiver(receiver("R1"));
        registry.insert_device(device("R1", 1, "4A1B2C01"));

        for _ in 0..2 {
            registry.update_state("R1", 1, StateUpdate::Miss);
        }
        assert_eq!(registry.device("R1", 1).unwrap().state, ConnectionState::Connected);

        let (before, after) = registry.update_state("R1", 1, StateUpdate::Miss).unwrap();
        assert_eq!((before, after), (ConnectionState::Connected, ConnectionState::Unreachable));

        registry.update_state("R1", 1, StateUpdate::Activity);
        let device = registry.device("R1", 1).unwrap();
        assert_eq!(device.state, ConnectionState::Connected);
        assert_eq!(device.misses, 0);

        registry.update_state("R1", 1, StateUpdate::Detached);
        registry.update_state("R1", 1, StateUpdate::Miss);
        registry.update_state("R1", 1, StateUpdate::Miss);
        registry.update_state("R1", 1, StateUpdate::Miss);
        assert_eq!(registry.device("R1", 1).unwrap().state, ConnectionState::Disconnected);

        assert!(registry.update_state("R1", 4, StateUpdate::Activity).is_none());
    }

    #[test]
    fn removing_a_receiver_keeps_its_devices_as_unreachable() {
        let registry = Registry::new(3);
        let lease = registry.upsert_receiver(receiver("R1"));
        registry.replace_devices("R1", vec![device("R1", 1, "A"), device("R1", 2, "B")]);

        assert!(registry.remove("R1", lease));

        let snapshot = registry.snapshot();
        assert!(!snapshot.receivers[0].receiver.online);
        assert!(
            snapshot.receivers[0]
                .devices
                .iter()
                .all(|device| device.state == ConnectionState::Unreachable)
        );
    }

    #[test]
    fn stale_leases_leave_a_reopened_receiver_alone() {
        let registry = Registry::new(3);
        let old = registry.upsert_receiver(receiver("R1"));
        let mut reopened = receiver("R1");
        reopened.path = "/dev/hidraw5".to_string();
        let new = registry.upsert_receiver(reopened);
        registry.insert_device(device("R1", 1, "A"));

        assert!(!registry.remove("R1", old));
        let entry = registry.receiver("R1").unwrap();
        assert!(entry.online);
        assert_eq!(entry.path, "/dev/hidraw5");
        assert_eq!(registry.device("R1", 1).unwrap().state, ConnectionState::Connected);

        assert!(registry.remove("R1", new));
        assert!(!registry.receiver("R1").unwrap().online);
        assert!(!registry.remove("R1", new));
    }

    #[test]
    fn slots_stay_unique_per_receiver() {
        let registry = Registry::new(3);
        registry.insert_device(device("R1", 1, "A"));
        registry.insert_device(device("R1", 1, "B"));
        registry.insert_device(device("R2", 1, "C"));

        assert_eq!(registry.devices("R1").len(), 1);
        assert_eq!(registry.device("R1", 1).unwrap().identity, "B");
        assert!(registry.find_device("A").is_none());
        assert_eq!(registry.find_device("C").unwrap().receiver, "R2");
    }

    #[test]
    fn reconcile_flags_foreign_products() {
        let registry = Registry::new(3);
        let settings = BTreeMap::from([(
            Setting::SmartShiftMode,
            SettingValue::Mode(RatchetMode::Freespin),
        )]);
        registry.set_configs([
            ("A".to_string(), StoreEntry {
                name: "MX Master 3S B".to_string(),
                wpid: 0xb034,
                settings: settings.clone(),
            }),
            ("B".to_string(), StoreEntry {
                name: "Other".to_string(),
                wpid: 0x4082,
                settings: settings.clone(),
            }),
        ]);

        let mut known = device("R1", 1, "A");
        assert_eq!(registry.reconcile(&mut known), None);
        assert_eq!(known.settings, settings);

        let mut foreign = device("R1", 2, "B");
        assert_eq!(registry.reconcile(&mut foreign), None);
        assert!(foreign.config_mismatch);
        assert!(foreign.settings.is_empty());
        assert_eq!(registry.config("B").unwrap().wpid, 0x4082);

        let mut fresh = device("R1", 3, "C");
        let created = registry.reconcile(&mut fresh).unwrap();
        assert_eq!(created.wpid, 0xb034);
        assert!(created.settings.is_empty());
    }
}
