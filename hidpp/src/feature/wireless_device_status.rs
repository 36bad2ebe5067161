//! Implements the `WirelessDeviceStatus` feature (ID `0x1d4b`) which only
//! broadcasts an event whenever a device (re)connects.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    channel::HidppChannel,
    feature::{CreatableFeature, Feature, NotifyingFeature},
    nibble::U4,
};

/// Implements the `WirelessDeviceStatus` / `0x1d4b` feature.
///
/// The feature has no functions. Volatile settings are lost whenever a device
/// broadcasts a [`WirelessDeviceStatus::Reconnection`].
#[derive(Clone)]
pub struct WirelessDeviceStatusFeature {
    feature_index: u8,
}

impl CreatableFeature for WirelessDeviceStatusFeature {
    const ID: u16 = 0x1d4b;
    const STARTING_VERSION: u8 = 0;

    fn new(_: Arc<HidppChannel>, _: u8, feature_index: u8) -> Self {
        Self {
            feature_index,
        }
    }
}

impl Feature for WirelessDeviceStatusFeature {
}

impl NotifyingFeature for WirelessDeviceStatusFeature {
    type Event = WirelessDeviceStatusEvent;

    fn parse_event(event: U4, payload: &[u8]) -> Option<WirelessDeviceStatusEvent> {
        if event.to_lo() != 0 {
            return None;
        }

        let [status, request, reason, ..] = *payload else {
            return None;
        };

        Some(WirelessDeviceStatusEvent::StatusBroadcast(WirelessDeviceStatusBroadcast {
            status: WirelessDeviceStatus::try_from(status).ok()?,
            request: WirelessDeviceStatusRequest::try_from(request).ok()?,
            reason: WirelessDeviceStatusReason::try_from(reason).ok()?,
        }))
    }
}

impl WirelessDeviceStatusFeature {
    /// The index of the feature in the device's feature table.
    pub fn feature_index(&self) -> u8 {
        self.feature_index
    }
}

/// Represents an event emitted by the [`WirelessDeviceStatusFeature`]
/// feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum WirelessDeviceStatusEvent {
    /// Is emitted whenever a device (re)connects to the host.
    StatusBroadcast(WirelessDeviceStatusBroadcast),
}

/// Represents the data of the [`WirelessDeviceStatusEvent::StatusBroadcast`]
/// event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct WirelessDeviceStatusBroadcast {
    /// The status the device reports to be in.
    pub status: WirelessDeviceStatus,

    /// The request the devices expresses towards the host.
    pub request: WirelessDeviceStatusRequest,

    /// The reason for the status broadcast.
    pub reason: WirelessDeviceStatusReason,
}

impl WirelessDeviceStatusBroadcast {
    /// Whether the device lost its volatile configuration and expects the
    /// host to restore it.
    pub fn needs_reconfiguration(&self) -> bool {
        self.status == WirelessDeviceStatus::Reconnection
            || self.request == WirelessDeviceStatusRequest::SoftwareReconfigurationNeeded
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum WirelessDeviceStatus {
    Unknown = 0x00,
    Reconnection = 0x01,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum WirelessDeviceStatusRequest {
    NoRequest = 0x00,
    SoftwareReconfigurationNeeded = 0x01,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum WirelessDeviceStatusReason {
    Unknown = 0x00,
    PowerSwitchActivated = 0x01,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnection_asks_for_reconfiguration() {
        let Some(WirelessDeviceStatusEvent::StatusBroadcast(broadcast)) =
            WirelessDeviceStatusFeature::parse_event(U4::from_lo(0), &[0x01, 0x01, 0x00])
        else {
            panic!("expected a status broadcast");
        };

        assert!(broadcast.needs_reconfiguration());
        assert_eq!(broadcast.reason, WirelessDeviceStatusReason::Unknown);
    }
}
