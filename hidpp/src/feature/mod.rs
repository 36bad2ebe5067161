//! Specific device feature implementations.

use std::{any::Any, sync::Arc};

use crate::{channel::HidppChannel, nibble::U4};

pub mod device_type_and_name;
pub mod feature_set;
pub mod hires_wheel;
pub mod registry;
pub mod root;
pub mod smartshift;
pub mod unified_battery;
pub mod wireless_device_status;

/// Represents a concrete implementation of a HID++2.0 device feature.
pub trait Feature: Any + Send + Sync {}

/// Represents a [`Feature`] that can be instantiated automatically.
pub trait CreatableFeature: Feature {
    /// The protocol ID of the implemented feature.
    const ID: u16;

    /// The version of the feature the implementation starts to support.
    const STARTING_VERSION: u8;

    /// Creates a new instance of the feature implementation.
    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self;
}

/// Represents a [`Feature`] whose device broadcasts events.
///
/// Events arrive as notifications with a software ID of zero, carrying the
/// event number in place of the function ID. Parsing is independent of any
/// feature instance, so notifications can be decoded by whoever reads them
/// from the channel.
pub trait NotifyingFeature: CreatableFeature {
    /// The event type emitted by the feature.
    type Event;

    /// Decodes an event notification. Returns [`None`] for unknown events or
    /// malformed payloads.
    fn parse_event(event: U4, payload: &[u8]) -> Option<Self::Event>;
}

/// A bitfield describing some properties of a feature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureType {
    /// An obsolete feature is a feature that has been replaced by a newer one,
    /// but is advertised in order for older SWs to still be able to support the
    /// feature (in case the old SW does not know yet the newer one).
    pub obsolete: bool,

    /// A SW hidden feature is a feature that should not be known/managed/used
    /// by end user configuration SW. The host should ignore this type of
    /// features.
    pub hidden: bool,

    /// A hidden feature that has been disabled for user software. Used for
    /// internal testing and manufacturing.
    pub engineering: bool,

    /// A manufacturing feature that can be permanently deactivated.
    pub manufacturing_deactivatable: bool,

    /// A compliance feature that can be permanently deactivated.
    pub compliance_deactivatable: bool,
}

impl From<u8> for FeatureType {
    fn from(value: u8) -> Self {
        Self {
            obsolete: value & (1 << 7) != 0,
            hidden: value & (1 << 6) != 0,
            engineering: value & (1 << 5) != 0,
            manufacturing_deactivatable: value & (1 << 4) != 0,
            compliance_deactivatable: value & (1 << 3) != 0,
        }
    }
}

impl From<FeatureType> for u8 {
    fn from(value: FeatureType) -> Self {
        [
            (value.obsolete, 7),
            (value.hidden, 6),
            (value.engineering, 5),
            (value.manufacturing_deactivatable, 4),
            (value.compliance_deactivatable, 3),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |raw, (_, bit)| raw | 1 << bit)
    }
}

#[cfg(test)]
mod tests {
    use super::FeatureType;

    #[test]
    fn feature_type_bits_survive_conversion() {
        let typ = FeatureType::from(0b1010_0000);
        assert!(typ.obsolete);
        assert!(typ.engineering);
        assert!(!typ.hidden);
        assert_eq!(u8::from(typ), 0b1010_0000);
    }
}
