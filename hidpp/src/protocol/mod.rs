//! Implements the protocol-specific parts of HID++.

use crate::{
    channel::{ChannelError, HidppChannel, ProtocolError},
    nibble::U4,
};

pub mod v10;
pub mod v20;

/// Represents the protocol version a device supports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolVersion {
    /// The older HID++1.0 protocol. Mostly used for receivers.
    V10,

    /// All newer protocols starting from HID+2.0.
    ///
    /// Traditionally, the version was split into a major and a minor version,
    /// defining the concrete protocol version. These two values were later
    /// redefined to serve the purpose of indicating which host software to
    /// target.
    V20 {
        /// The protocol number is a field that hints the host software if it
        /// should support the device.
        ///
        /// `protocol_num = 2` : Intended target SW is Logitech SetPoint\
        /// `protocol_num = 3` : Intended OEM SW described in `target_sw` field\
        /// `protocol_num = 4` : Intended target SW described in `target_sw`
        /// field
        protocol_num: u8,

        /// When `protocol_num >= 3` this field further hints at which software
        /// should support the device. Otherwise the value is zero.
        target_sw: u8,
    },
}

/// The data byte echoed by a ping sent from [`determine_version`].
const PING_DATA: u8 = 0x5a;

/// Tries to determine the protocol version of a specific device.
///
/// Returns `Ok(None)` if the device answered, but not in a way that allows
/// telling its version. If nothing is paired at the index or the device is
/// asleep, [`ChannelError::DeviceUnreachable`] is returned.
pub async fn determine_version(
    chan: &HidppChannel,
    device_index: u8,
) -> Result<Option<ProtocolVersion>, ChannelError> {
    // A HID++2.0 ping (feature index 0x00, function 0x01) is answered with the
    // protocol version by devices supporting it. HID++1.0 devices interpret
    // 0x00 as a sub ID and reject it as invalid.
    let result = chan
        .send_request(
            device_index,
            0x00,
            U4::from_lo(0x1),
            &[0x00, 0x00, PING_DATA],
            chan.timeout(),
        )
        .await;

    match result {
        Ok(response) => {
            let payload = response.payload();
            if payload[2] != PING_DATA {
                return Ok(None);
            }

            Ok(Some(ProtocolVersion::V20 {
                protocol_num: payload[0],
                target_sw: payload[1],
            }))
        },
        Err(ChannelError::Protocol(ProtocolError::Hidpp10(v10::ErrorType::InvalidSubId))) => {
            Ok(Some(ProtocolVersion::V10))
        },
        Err(ChannelError::Protocol(_)) => Ok(None),
        Err(err) => Err(err),
    }
}
