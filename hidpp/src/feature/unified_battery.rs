//! Implements the `UnifiedBattery` feature (ID `0x1004`) that provides
//! information about the battery status of the device.

use std::{collections::HashSet, sync::Arc};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    channel::{ChannelError, HidppChannel, ProtocolError},
    feature::{CreatableFeature, Feature, NotifyingFeature},
    nibble::U4,
};

/// Implements the `UnifiedBattery` / `0x1004` feature.
#[derive(Clone)]
pub struct UnifiedBatteryFeature {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,
}

impl CreatableFeature for UnifiedBatteryFeature {
    const ID: u16 = 0x1004;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
        }
    }
}

impl Feature for UnifiedBatteryFeature {
}

impl NotifyingFeature for UnifiedBatteryFeature {
    type Event = BatteryEvent;

    fn parse_event(event: U4, payload: &[u8]) -> Option<BatteryEvent> {
        if event.to_lo() != 0 {
            return None;
        }

        BatteryInfo::parse(payload).map(BatteryEvent::InfoUpdate)
    }
}

impl UnifiedBatteryFeature {
    /// Retrieves the capabilities of this feature and the battery in general.
    pub async fn get_battery_capabilities(&self) -> Result<BatteryCapabilities, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 0, &[])
            .await?;

        let payload = response.payload();
        Ok(BatteryCapabilities::from([payload[0], payload[1]]))
    }

    /// Retrieves the current information about the battery status.
    pub async fn get_battery_info(&self) -> Result<BatteryInfo, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 1, &[])
            .await?;

        BatteryInfo::parse(response.payload()).ok_or(ProtocolError::UnsupportedResponse.into())
    }
}

/// Represents the capabilites of this feature and the battery itself.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BatteryCapabilities {
    /// All [`BatteryLevel`] variants the feature supports and reports.
    pub reported_levels: HashSet<BatteryLevel>,

    /// Whether the battery is rechargeable.
    pub rechargeable: bool,

    /// Whether the device supports reporting the current battery charge
    /// percentage in [`BatteryInfo::charging_percentage`].
    pub percentage: bool,
}

impl From<[u8; 2]> for BatteryCapabilities {
    fn from(value: [u8; 2]) -> Self {
        let reported_levels = [
            BatteryLevel::Critical,
            BatteryLevel::Low,
            BatteryLevel::Good,
            BatteryLevel::Full,
        ]
        .into_iter()
        .filter(|&level| value[0] & u8::from(level) != 0)
        .collect();

        Self {
            reported_levels,
            rechargeable: value[1] & 1 != 0,
            percentage: value[1] & (1 << 1) != 0,
        }
    }
}

/// Represents information about the current battery charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BatteryInfo {
    /// The current charge of the battery in percent.
    ///
    /// If [`BatteryCapabilities::percentage`] is set to `false`, this is always
    /// zero.
    pub charging_percentage: u8,

    /// The current (approximate) level of the battery.
    pub level: BatteryLevel,

    /// The current charging status of the battery.
    pub status: BatteryStatus,
}

impl BatteryInfo {
    /// Decodes the layout shared by the info response and the info event.
    fn parse(payload: &[u8]) -> Option<Self> {
        let [percentage, level, status, ..] = *payload else {
            return None;
        };

        Some(Self {
            charging_percentage: percentage,
            level: BatteryLevel::try_from(level).ok()?,
            status: BatteryStatus::try_from(status).ok()?,
        })
    }
}

/// Represents an approximate level of the battery charge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BatteryLevel {
    Critical = 1,
    Low = 1 << 1,
    Good = 1 << 2,
    Full = 1 << 3,
}

/// Represents the charging status of the battery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BatteryStatus {
    Discharging = 0,
    Charging = 1,
    ChargingSlow = 2,
    Full = 3,
    Error = 4,
}

/// Represents an event emitted by the [`UnifiedBatteryFeature`] feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum BatteryEvent {
    /// Is emitted whenever the battery information changes.
    InfoUpdate(BatteryInfo),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_info_update() {
        let event = UnifiedBatteryFeature::parse_event(U4::from_lo(0), &[0x32, 0x04, 0x01, 0x00]);
        assert_eq!(
            event,
            Some(BatteryEvent::InfoUpdate(BatteryInfo {
                charging_percentage: 50,
                level: BatteryLevel::Good,
                status: BatteryStatus::Charging,
            }))
        );

        assert_eq!(UnifiedBatteryFeature::parse_event(U4::from_lo(1), &[0x32, 0x04, 0x01]), None);
        assert_eq!(UnifiedBatteryFeature::parse_event(U4::from_lo(0), &[0x32, 0x05, 0x01]), None);
    }

    #[test]
    fn capabilities_from_bitfield() {
        let caps = BatteryCapabilities::from([0b0000_1101, 0b10]);
        assert_eq!(caps.reported_levels.len(), 3);
        assert!(!caps.reported_levels.contains(&BatteryLevel::Low));
        assert!(caps.percentage);
        assert!(!caps.rechargeable);
    }
}
