//! Maintains a registry of well-known HID++2.0 features and their default
//! implementations.

use std::{
    any::TypeId,
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
};

use lazy_static::lazy_static;

use super::Feature;
use crate::{
    channel::HidppChannel,
    feature::{
        CreatableFeature,
        device_type_and_name::DeviceTypeAndNameFeature,
        feature_set::FeatureSetFeature,
        hires_wheel::HiResWheelFeature,
        root::RootFeature,
        smartshift::SmartShiftFeature,
        unified_battery::UnifiedBatteryFeature,
        wireless_device_status::WirelessDeviceStatusFeature,
    },
};

/// Represents a function that creates a new dynamically sized feature
/// implementation.
pub type FeatureImplProducer =
    fn(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> (TypeId, Arc<dyn Feature>);

/// Represents a known feature implementation starting from a specific feature
/// version.
#[derive(Clone, Copy, Debug)]
pub struct FeatureVersion {
    /// The minimum feature version the implementation supports.
    pub starting_version: u8,

    /// A pointer to a function producing the feature implementation.
    pub producer: FeatureImplProducer,
}

/// Represents a known HID++2.0 device feature.
///
/// Two entries are equal if they describe the same feature ID.
#[derive(Clone, Copy, Debug)]
pub struct KnownFeature {
    pub id: u16,

    /// The name of the feature.
    pub name: &'static str,

    /// A list of concrete implementations of the feature, each supporting the
    /// feature starting from a specific version.
    pub versions: &'static [FeatureVersion],
}

impl PartialEq for KnownFeature {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KnownFeature {}

impl Hash for KnownFeature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Looks up a feature by its ID.
pub fn lookup(feature_id: u16) -> Option<KnownFeature> {
    KNOWN_FEATURES.get(&feature_id).copied()
}

/// A printable name for a feature ID, falling back to its hex value.
pub fn display_name(feature_id: u16) -> String {
    lookup(feature_id).map_or_else(|| format!("{feature_id:#06x}"), |feat| feat.name.to_string())
}

/// Looks up all implementations supporting a specific feature ID and version
/// combination.
pub fn lookup_version(feature_id: u16, feature_version: u8) -> Vec<FeatureVersion> {
    lookup(feature_id)
        .map(|feat| {
            feat.versions
                .iter()
                .filter(|&ver| ver.starting_version <= feature_version)
                .copied()
                .collect()
        })
        .unwrap_or_default()
}

/// The IDs of all features that come with an implementation.
pub fn implemented_ids() -> Vec<u16> {
    let mut ids: Vec<u16> = KNOWN_FEATURES
        .iter()
        .filter(|(_, feat)| !feat.versions.is_empty())
        .map(|(&id, _)| id)
        .collect();
    ids.sort_unstable();
    ids
}

/// Creates a new feature with a dynamic return type.
fn new_dyn<F: CreatableFeature>(
    chan: Arc<HidppChannel>,
    device_index: u8,
    feature_index: u8,
) -> (TypeId, Arc<dyn Feature>) {
    (
        TypeId::of::<F>(),
        Arc::new(F::new(chan, device_index, feature_index)),
    )
}

macro_rules! implemented {
    ($name:literal, $feature:ty) => {
        KnownFeature {
            id: <$feature>::ID,
            name: $name,
            versions: &[FeatureVersion {
                starting_version: <$feature>::STARTING_VERSION,
                producer: new_dyn::<$feature>,
            }],
        }
    };
}

macro_rules! named {
    ($id:literal, $name:literal) => {
        KnownFeature {
            id: $id,
            name: $name,
            versions: &[],
        }
    };
}

lazy_static! {
    static ref KNOWN_FEATURES: HashMap<u16, KnownFeature> = [
        implemented!("Root", RootFeature),
        implemented!("FeatureSet", FeatureSetFeature),
        named!(0x0002, "FeatureInfo"),
        named!(0x0003, "DeviceInformation"),
        named!(0x0004, "UnitId"),
        implemented!("DeviceTypeAndName", DeviceTypeAndNameFeature),
        named!(0x0007, "DeviceFriendlyName"),
        named!(0x0020, "ConfigChange"),
        named!(0x00c2, "DfuControlSigned"),
        named!(0x00d0, "Dfu"),
        named!(0x1000, "BatteryStatus"),
        named!(0x1001, "BatteryVoltage"),
        implemented!("UnifiedBattery", UnifiedBatteryFeature),
        named!(0x1814, "ChangeHost"),
        named!(0x1815, "HostsInfo"),
        named!(0x1982, "Backlight2"),
        named!(0x1b04, "ReprogControls5"),
        named!(0x1c00, "PersistentRemappableAction"),
        implemented!("WirelessDeviceStatus", WirelessDeviceStatusFeature),
        named!(0x1f20, "AdcMeasurement"),
        named!(0x2100, "VerticalScrolling"),
        implemented!("SmartShiftWheel", SmartShiftFeature),
        named!(0x2111, "SmartShiftWheelEnhanced"),
        named!(0x2120, "HighResolutionScrolling"),
        implemented!("HiResWheel", HiResWheelFeature),
        named!(0x2150, "Thumbwheel"),
        named!(0x2201, "AdjustableDpi"),
        named!(0x2202, "ExtendedAdjustableDpi"),
        named!(0x2250, "XyStats"),
        named!(0x40a3, "FnInversionForMultiHostDevices"),
        named!(0x4220, "LockKeyState"),
        named!(0x4521, "DisableKeys"),
        named!(0x4531, "MultiPlatform"),
        named!(0x6501, "Gestures2"),
        named!(0x8060, "AdjustableReportRate"),
    ]
    .into_iter()
    .map(|feature| (feature.id, feature))
    .collect();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implemented_features_have_producers() {
        assert_eq!(lookup_version(SmartShiftFeature::ID, 0).len(), 1);
        assert!(lookup_version(0x2150, 3).is_empty());
        assert!(lookup_version(0x9999, 0).is_empty());
    }

    #[test]
    fn known_features_are_keyed_by_id() {
        let smartshift = lookup(SmartShiftFeature::ID).unwrap();
        assert_eq!(smartshift.id, SmartShiftFeature::ID);
        assert_eq!(lookup(SmartShiftFeature::ID), Some(smartshift));
        assert_ne!(lookup(HiResWheelFeature::ID), Some(smartshift));

        let features: std::collections::HashSet<KnownFeature> =
            [smartshift, smartshift, lookup(0x2150).unwrap()].into_iter().collect();
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn unknown_features_print_as_hex() {
        assert_eq!(display_name(0x1004), "UnifiedBattery");
        assert_eq!(display_name(0x9999), "0x9999");
    }
}
