//! Implements functionality specific to HID++2.0.
//!
//! HID++2.0 messages address features: byte 2 of a frame is the index of the
//! feature in the device's feature table, byte 3 combines the function ID
//! (high nibble) with the software ID (low nibble).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    channel::{ChannelError, HidppChannel},
    frame::Frame,
    nibble::U4,
};

/// Represents the error codes a HID++2.0 device answers with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    NoError = 0x00,
    Unknown = 0x01,
    InvalidArgument = 0x02,
    OutOfRange = 0x03,
    HardwareError = 0x04,
    LogitechInternal = 0x05,
    InvalidFeatureIndex = 0x06,
    InvalidFunctionId = 0x07,
    Busy = 0x08,
    Unsupported = 0x09,
}

impl HidppChannel {
    /// Calls a function of a HID++2.0 feature using the channel's default
    /// timeout.
    pub async fn send_v20(
        &self,
        device_index: u8,
        feature_index: u8,
        function_id: u8,
        params: &[u8],
    ) -> Result<Frame, ChannelError> {
        self.send_request(
            device_index,
            feature_index,
            U4::from_lo(function_id),
            params,
            self.timeout(),
        )
        .await
    }
}
