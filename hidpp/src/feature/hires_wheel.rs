//! Implements the `HiResWheel` feature (ID `0x2121`) controlling resolution
//! and direction of the scroll wheel.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    channel::{ChannelError, HidppChannel, ProtocolError},
    feature::{CreatableFeature, Feature, NotifyingFeature},
    nibble::U4,
};

/// Implements the `HiResWheel` / `0x2121` feature.
///
/// The analytics part of the feature is not implemented here as its data
/// structure lacks any documentation.
#[derive(Clone)]
pub struct HiResWheelFeature {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,
}

impl CreatableFeature for HiResWheelFeature {
    const ID: u16 = 0x2121;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
        }
    }
}

impl Feature for HiResWheelFeature {
}

impl NotifyingFeature for HiResWheelFeature {
    type Event = HiResWheelEvent;

    fn parse_event(event: U4, payload: &[u8]) -> Option<HiResWheelEvent> {
        match event.to_lo() {
            0 => {
                let [flags, hi, lo, ..] = *payload else {
                    return None;
                };

                Some(HiResWheelEvent::WheelMovement(WheelMovementData {
                    resolution: WheelResolution::try_from((flags & (1 << 4)) >> 4).ok()?,
                    periods: U4::from_lo(flags),
                    delta_vertical: i16::from_be_bytes([hi, lo]),
                }))
            },
            1 => WheelRatchetState::try_from(*payload.first()? & 1)
                .ok()
                .map(HiResWheelEvent::RatchetSwitch),
            _ => None,
        }
    }
}

impl HiResWheelFeature {
    /// Retrieves the capabilities of the hi-res wheel and this feature.
    pub async fn get_wheel_capabilities(&self) -> Result<WheelCapabilities, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 0, &[])
            .await?;

        let payload = response.payload();

        Ok(WheelCapabilities {
            multiplier: payload[0],
            has_invert: payload[1] & (1 << 3) != 0,
            has_switch: payload[1] & (1 << 2) != 0,
        })
    }

    /// Retrieves the current mode of the hi-res wheel.
    pub async fn get_wheel_mode(&self) -> Result<WheelModeSettings, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 1, &[])
            .await?;

        WheelModeSettings::from_bits(response.payload()[0])
    }

    /// Sets the mode of the hi-res wheel and returns the mode the device
    /// reports afterwards.
    pub async fn set_wheel_mode(&self, mode: WheelModeSettings) -> Result<WheelModeSettings, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 2, &[mode.to_bits()])
            .await?;

        WheelModeSettings::from_bits(response.payload()[0])
    }
}

/// Represents the capabilities of the hi-res wheel as reported by
/// [`HiResWheelFeature::get_wheel_capabilities`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct WheelCapabilities {
    /// The report multiplier for the high-resolution mode.
    pub multiplier: u8,

    /// Whether the device supports inverting the scrolling direction.
    pub has_invert: bool,

    /// Whether the device has a switch to control the ratchet mode.
    pub has_switch: bool,
}

/// Represents the mode byte of the hi-res wheel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WheelModeSettings {
    /// Whether the scrolling direction is inverted.
    pub inverted: bool,

    pub resolution: WheelResolution,

    /// Whether wheel events are sent as HID or diverted to HID++.
    pub target: WheelEventTarget,
}

impl WheelModeSettings {
    fn from_bits(bits: u8) -> Result<Self, ChannelError> {
        Ok(Self {
            inverted: bits & (1 << 2) != 0,
            resolution: WheelResolution::try_from((bits & (1 << 1)) >> 1)
                .map_err(|_| ProtocolError::UnsupportedResponse)?,
            target: WheelEventTarget::try_from(bits & 1)
                .map_err(|_| ProtocolError::UnsupportedResponse)?,
        })
    }

    fn to_bits(self) -> u8 {
        let mut bits = u8::from(self.resolution) << 1 | u8::from(self.target);
        if self.inverted {
            bits |= 1 << 2;
        }
        bits
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum WheelResolution {
    Low = 0,
    High = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum WheelEventTarget {
    Hid = 0,
    Hidpp = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum WheelRatchetState {
    Freespin = 0,
    Ratchet = 1,
}

/// Represents the data of the [`HiResWheelEvent::WheelMovement`] event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub struct WheelMovementData {
    pub resolution: WheelResolution,

    /// The amount of sampling periods combined in this event.
    pub periods: U4,

    pub delta_vertical: i16,
}

/// Represents an event emitted by the [`HiResWheelFeature`] feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HiResWheelEvent {
    /// Is emitted for wheel movement while the wheel is diverted to HID++.
    WheelMovement(WheelMovementData),

    /// Is emitted whenever the ratchet switch changes its state.
    RatchetSwitch(WheelRatchetState),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bits_roundtrip_through_device_layout() {
        let mode = WheelModeSettings {
            inverted: true,
            resolution: WheelResolution::High,
            target: WheelEventTarget::Hid,
        };
        assert_eq!(mode.to_bits(), 0b110);
        assert_eq!(WheelModeSettings::from_bits(0b110).unwrap(), mode);
    }

    #[test]
    fn parses_ratchet_switch() {
        assert_eq!(
            HiResWheelFeature::parse_event(U4::from_lo(1), &[0x01]),
            Some(HiResWheelEvent::RatchetSwitch(WheelRatchetState::Ratchet))
        );
        assert_eq!(HiResWheelFeature::parse_event(U4::from_lo(1), &[]), None);
    }
}
