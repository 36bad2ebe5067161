//! Implements peripheral devices connected to HID++ channels.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    channel::{ChannelError, HidppChannel},
    feature::{
        CreatableFeature,
        Feature,
        FeatureType,
        feature_set::FeatureSetFeature,
        registry,
        root::RootFeature,
    },
    protocol::{self, ProtocolVersion},
};

/// One entry of a device's feature table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureTableEntry {
    pub id: u16,
    pub typ: FeatureType,
    pub version: u8,
}

/// Maps feature indices of a device to the features living there, and back.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct FeatureTable {
    by_index: BTreeMap<u8, FeatureTableEntry>,
    by_id: HashMap<u16, u8>,
}

impl FeatureTable {
    pub fn insert(&mut self, index: u8, entry: FeatureTableEntry) {
        self.by_id.insert(entry.id, index);
        self.by_index.insert(index, entry);
    }

    /// The index the feature with the given ID lives at.
    pub fn index_of(&self, id: u16) -> Option<u8> {
        self.by_id.get(&id).copied()
    }

    /// The ID of the feature living at `index`.
    pub fn id_at(&self, index: u8) -> Option<u16> {
        self.by_index.get(&index).map(|entry| entry.id)
    }

    /// Iterates the table in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &FeatureTableEntry)> {
        self.by_index.iter().map(|(&index, entry)| (index, entry))
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

/// Represents a single HID++ device connected to a [`HidppChannel`].
///
/// This is used only for peripheral devices and not receivers. The feature
/// table is read on first use and cached for the lifetime of the value.
#[derive(Clone)]
pub struct Device {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    root: RootFeature,

    /// The initialized implementation of features the device supports.
    features: HashMap<TypeId, Arc<dyn Feature>>,

    /// The feature table, once it was read.
    table: Option<FeatureTable>,

    /// The index of the device on the HID++ channel.
    pub device_index: u8,

    /// The supported protocol version reported by the device.
    pub protocol_version: ProtocolVersion,
}

impl Device {
    /// Tries to initialize a device on a HID++ channel.
    ///
    /// This will automatically ping the device to determine the protocol
    /// version it supports via [`protocol::determine_version`].
    ///
    /// Returns [`DeviceError::DeviceNotFound`] if the device did not answer
    /// the ping in a meaningful way.
    ///
    /// Returns [`DeviceError::UnsupportedProtocolVersion`] if the device only
    /// supports [`ProtocolVersion::V10`].
    pub async fn new(chan: Arc<HidppChannel>, device_index: u8) -> Result<Self, DeviceError> {
        let version = protocol::determine_version(&chan, device_index)
            .await?
            .ok_or(DeviceError::DeviceNotFound)?;

        if version == ProtocolVersion::V10 {
            return Err(DeviceError::UnsupportedProtocolVersion);
        }

        Ok(Self {
            root: RootFeature::new(Arc::clone(&chan), device_index, 0),
            chan,
            features: HashMap::new(),
            table: None,
            device_index,
            protocol_version: version,
        })
    }

    /// The root feature every HID++2.0 device supports.
    pub fn root(&self) -> &RootFeature {
        &self.root
    }

    pub fn channel(&self) -> &Arc<HidppChannel> {
        &self.chan
    }

    /// The cached feature table, if [`Self::enumerate_features`] already ran.
    pub fn feature_table(&self) -> Option<&FeatureTable> {
        self.table.as_ref()
    }

    /// Adds a new feature implementation to the list of available features.
    /// This will override an existing implementation of the same type.
    /// The caller is responsible for making sure the device actually supports
    /// the feature.
    pub fn add_feature<F: CreatableFeature>(&mut self, feature_index: u8) -> Arc<F> {
        let feature = Arc::new(F::new(
            Arc::clone(&self.chan),
            self.device_index,
            feature_index,
        ));

        self.features
            .insert(TypeId::of::<F>(), Arc::clone(&feature) as Arc<dyn Feature>);

        feature
    }

    /// Checks whether a specific feature implementation is provided by the
    /// device.
    pub fn provides_feature<F: Feature>(&self) -> bool {
        self.features.contains_key(&TypeId::of::<F>())
    }

    /// Tries to retrieve a feature implementation from the device.
    ///
    /// Returns [`None`] if the requested feature implementation is not
    /// provided.
    pub fn get_feature<F: Feature>(&self) -> Option<Arc<F>> {
        self.features
            .get(&TypeId::of::<F>())
            .cloned()
            .and_then(|feat| (feat as Arc<dyn Any + Send + Sync>).downcast::<F>().ok())
    }

    /// Reads the feature table of the device and adds implementations for
    /// every feature found in [`registry`].
    ///
    /// The table is only read once. Devices lacking [`FeatureSetFeature`] are
    /// probed for every implemented feature using the root feature instead.
    pub async fn enumerate_features(&mut self) -> Result<&FeatureTable, DeviceError> {
        if self.table.is_none() {
            let table = match self.root.get_feature(FeatureSetFeature::ID).await? {
                Some(info) => {
                    let feature_set = FeatureSetFeature::new(
                        Arc::clone(&self.chan),
                        self.device_index,
                        info.index,
                    );
                    let count = feature_set.count().await?;

                    let mut table = FeatureTable::default();
                    for index in 1..=count {
                        let entry = feature_set.get_feature(index).await?;
                        table.insert(index, FeatureTableEntry {
                            id: entry.id,
                            typ: entry.typ,
                            version: entry.version,
                        });
                    }
                    table
                },
                None => self.probe_features().await?,
            };

            debug!(
                device_index = self.device_index,
                count = table.len(),
                "read feature table"
            );

            for (index, entry) in table.iter() {
                for implementation in registry::lookup_version(entry.id, entry.version) {
                    let (type_id, instance) =
                        (implementation.producer)(Arc::clone(&self.chan), self.device_index, index);
                    self.features.insert(type_id, instance);
                }
            }

            self.table = Some(table);
        }

        Ok(self.table.get_or_insert_default())
    }

    async fn probe_features(&self) -> Result<FeatureTable, DeviceError> {
        let mut table = FeatureTable::default();

        for id in registry::implemented_ids() {
            if id == RootFeature::ID {
                continue;
            }

            if let Some(info) = self.root.get_feature(id).await? {
                table.insert(info.index, FeatureTableEntry {
                    id,
                    typ: info.typ,
                    version: info.version,
                });
            }
        }

        Ok(table)
    }
}

/// Represents a device-specific error.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Indicates that the underlying [`HidppChannel`] returned an error.
    #[error("the HID++ channel returned an error")]
    Channel(#[from] ChannelError),

    /// Indicates that the specified device index points to no device.
    #[error("there is no device with the specified device index")]
    DeviceNotFound,

    /// Indicates that the addressed device does only support HID++1.0.
    #[error("the device does not support HID++2.0 or newer")]
    UnsupportedProtocolVersion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        feature::{smartshift::SmartShiftFeature, unified_battery::UnifiedBatteryFeature},
        testing::{LoopbackChannel, SimulatedDevice, SimulatedReceiver},
    };

    #[tokio::test]
    async fn feature_table_is_read_once_and_cached() {
        let sim = SimulatedReceiver::new();
        sim.add_device(SimulatedDevice::mouse(1));

        let (raw, handle) = LoopbackChannel::new();
        handle.set_responder(sim.responder());
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());

        let mut device = Device::new(Arc::clone(&chan), 1).await.unwrap();
        assert!(matches!(device.protocol_version, ProtocolVersion::V20 { protocol_num: 4, .. }));

        let battery_index = device
            .enumerate_features()
            .await
            .unwrap()
            .index_of(UnifiedBatteryFeature::ID);
        assert!(battery_index.is_some());
        assert!(device.provides_feature::<SmartShiftFeature>());

        let writes = handle.written().len();
        device.enumerate_features().await.unwrap();
        assert_eq!(handle.written().len(), writes);

        let table = device.feature_table().unwrap();
        assert_eq!(table.id_at(battery_index.unwrap()), Some(UnifiedBatteryFeature::ID));
    }

    #[tokio::test]
    async fn missing_device_is_unreachable() {
        let sim = SimulatedReceiver::new();

        let (raw, handle) = LoopbackChannel::new();
        handle.set_responder(sim.responder());
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());

        let err = Device::new(chan, 3).await.err().unwrap();
        assert!(matches!(err, DeviceError::Channel(ChannelError::DeviceUnreachable)));
    }
}
