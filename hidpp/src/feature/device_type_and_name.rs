//! Implements the DeviceTypeAndName feature (ID `0x0005`) providing the
//! marketing name and type of a device.

use std::sync::Arc;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    channel::{ChannelError, HidppChannel, ProtocolError},
    feature::{CreatableFeature, Feature},
};

/// Implements the `DeviceTypeAndName` / `0x0005` feature.
#[derive(Clone)]
pub struct DeviceTypeAndNameFeature {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,
}

impl CreatableFeature for DeviceTypeAndNameFeature {
    const ID: u16 = 0x0005;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<HidppChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
        }
    }
}

impl Feature for DeviceTypeAndNameFeature {
}

impl DeviceTypeAndNameFeature {
    /// Retrieves the amount of characters in the marketing name of the device.
    pub async fn get_device_name_count(&self) -> Result<u8, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 0, &[])
            .await?;

        Ok(response.payload()[0])
    }

    /// Retrieves a chunk of characters of the marketing name of the device,
    /// starting at a specific index (inclusive).
    ///
    /// Depending on the device and channel capabilities, this function will
    /// return at most 3 or 16 characters of the device name.
    pub async fn get_device_name(&self, index: u8) -> Result<Vec<u8>, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 1, &[index])
            .await?;

        Ok(response.payload().to_vec())
    }

    /// Retrieves the whole marketing name of the device by first calling
    /// [`Self::get_device_name_count`] once and then repeatedly calling
    /// [`Self::get_device_name`] until all characters were received.
    pub async fn get_whole_device_name(&self) -> Result<String, ChannelError> {
        let count = self.get_device_name_count().await? as usize;
        let mut raw = Vec::with_capacity(count);

        while raw.len() < count {
            let part = self.get_device_name(raw.len() as u8).await?;
            let take = part.len().min(count - raw.len());
            raw.extend_from_slice(&part[..take]);
        }

        let name = String::from_utf8(raw).map_err(|_| ProtocolError::UnsupportedResponse)?;
        Ok(name.trim_end_matches('\0').to_string())
    }

    /// Retrieves the marketing type of the device.
    pub async fn get_device_type(&self) -> Result<DeviceType, ChannelError> {
        let response = self
            .chan
            .send_v20(self.device_index, self.feature_index, 2, &[])
            .await?;

        DeviceType::try_from(response.payload()[0])
            .map_err(|_| ProtocolError::UnsupportedResponse.into())
    }
}

/// Represents the type of a HID++2.0 device as returned by the
/// [`DeviceTypeAndNameFeature`] feature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum DeviceType {
    Keyboard = 0,
    RemoteControl = 1,
    Numpad = 2,
    Mouse = 3,
    Trackpad = 4,
    Trackball = 5,
    Presenter = 6,
    Receiver = 7,
    Headset = 8,
    Webcam = 9,
    SteeringWheel = 10,
    Joystick = 11,
    Gamepad = 12,
    Dock = 13,
    Speaker = 14,
    Microphone = 15,
    IlluminationLight = 16,
    ProgrammableController = 17,
    CarSimPedals = 18,
    Adapter = 19,
}
