//! Implements the Logi Bolt receiver.
//!
//! Bolt can be seen as a successor to the Unifying receiver. Both of them
//! support up to 6 paired devices, but Bolt uses BTLE technology and introduces
//! so-called passkeys for authenticating devices before pairing them.
//!
//! There is little to no public documentation about what registers Bolt
//! supports (and they seem to differ quite substantially from registers
//! supported by Unifying and other receivers), so this implementation is based
//! largely on information gathered by looking at other codebases (primarily
//! Solaar) and searching registers by fuzzing them.

use std::{fmt, sync::Arc};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{RECEIVER_DEVICE_INDEX, ReceiverError};
use crate::{
    channel::{HidppChannel, ProtocolError},
    frame::Frame,
    protocol::v10,
};

/// Contains all known USB vendor and product ID pairs representing Bolt
/// receivers.
pub const BOLT_VPID_PAIRS: &[(u16, u16)] = &[(0x046d, 0xc548)];

/// The amount of pairing slots of a Bolt receiver, numbered from 1.
pub const BOLT_MAX_DEVICES: u8 = 6;

/// Represents the known registers of the Bolt receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BoltRegister {
    /// Provides information about the amount of currently paired devices.
    ///
    /// This count is exposed by [`BoltReceiver::count_pairings`].
    Connections = 0x02,

    /// Provides information about the receiver and paired devices. It uses
    /// sub-registers, as defined in [`BoltInfoSubRegister`], to differentiate
    /// between different kinds of information.
    ReceiverInfo = 0xb5,

    /// Provides support for discovering devices that are ready to pair.
    DeviceDiscovery = 0xc0,

    /// Provides pairing and unpairing support.
    Pairing = 0xc1,

    /// Provides the firmware version, split across two sub-registers.
    ///
    /// Exposed by [`BoltReceiver::get_firmware_version`].
    Firmware = 0xf1,

    /// Provides the unique ID of the receiver.
    ///
    /// Exposed by [`BoltReceiver::get_unique_id`].
    UniqueId = 0xfb,
}

/// Represents the known sub-registers of the [`BoltRegister::ReceiverInfo`]
/// register.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BoltInfoSubRegister {
    /// Provides information about a specific paired device.
    ///
    /// Exposed by [`BoltReceiver::get_device_pairing_information`].
    DevicePairingInformation = 0x50, // 0x5N with N = device index

    /// Provides the name of a paired device.
    ///
    /// Exposed by [`BoltReceiver::get_device_codename`].
    DeviceCodename = 0x60, // 0x6N with N = device index
}

/// Sub-commands written to [`BoltRegister::DeviceDiscovery`].
const DISCOVERY_OPEN: u8 = 0x01;
const DISCOVERY_CLOSE: u8 = 0x02;

/// Sub-commands written to [`BoltRegister::Pairing`].
const PAIRING_PAIR: u8 = 0x01;
const PAIRING_UNPAIR: u8 = 0x03;

/// Implements the Bolt wireless receiver.
///
/// The receiver does not read from the channel itself. Notifications arrive
/// through [`HidppChannel::listen`] and are decoded with [`BoltEvent::parse`].
#[derive(Clone)]
pub struct BoltReceiver {
    /// The underlying HID++ channel.
    chan: Arc<HidppChannel>,
}

impl BoltReceiver {
    /// Tries to initialize a new [`BoltReceiver`] from a HID++ channel.
    ///
    /// If the vendor and product IDs don't match the ones of any known Bolt
    /// receiver, this function will return [`ReceiverError::UnknownReceiver`].
    pub fn new(chan: Arc<HidppChannel>) -> Result<Self, ReceiverError> {
        if !BOLT_VPID_PAIRS.contains(&(chan.vendor_id, chan.product_id)) {
            return Err(ReceiverError::UnknownReceiver);
        }

        Ok(BoltReceiver {
            chan,
        })
    }

    pub fn channel(&self) -> &Arc<HidppChannel> {
        &self.chan
    }

    /// Counts the amount of devices currently paired to this receiver. The
    /// devices don't have to be online to be included here as pairings are
    /// persistent.
    pub async fn count_pairings(&self) -> Result<u8, ReceiverError> {
        let response = self
            .chan
            .read_register(
                RECEIVER_DEVICE_INDEX,
                BoltRegister::Connections.into(),
                [0u8; 3],
            )
            .await?;

        Ok(response[1])
    }

    /// Provides the unique ID of the receiver.
    pub async fn get_unique_id(&self) -> Result<String, ReceiverError> {
        let response = self
            .chan
            .read_long_register(
                RECEIVER_DEVICE_INDEX,
                BoltRegister::UniqueId.into(),
                [0u8; 3],
            )
            .await?;

        Ok(str::from_utf8(&response)
            .map_err(|_| ProtocolError::UnsupportedResponse)?
            .trim_end_matches('\0')
            .to_string())
    }

    /// Reads the firmware version of the receiver.
    pub async fn get_firmware_version(&self) -> Result<FirmwareVersion, ReceiverError> {
        let version = self
            .chan
            .read_register(RECEIVER_DEVICE_INDEX, BoltRegister::Firmware.into(), [
                0x01, 0x00, 0x00,
            ])
            .await?;
        let build = self
            .chan
            .read_register(RECEIVER_DEVICE_INDEX, BoltRegister::Firmware.into(), [
                0x02, 0x00, 0x00,
            ])
            .await?;

        Ok(FirmwareVersion {
            major: version[1],
            minor: version[2],
            build: u16::from_be_bytes([build[1], build[2]]),
        })
    }

    /// Provides the pairing information of a specific paired device.
    pub async fn get_device_pairing_information(
        &self,
        device_index: u8,
    ) -> Result<BoltDevicePairingInformation, ReceiverError> {
        let response = self
            .chan
            .read_long_register(RECEIVER_DEVICE_INDEX, BoltRegister::ReceiverInfo.into(), [
                u8::from(BoltInfoSubRegister::DevicePairingInformation) + (device_index & 0x0f),
                0x00,
                0x00,
            ])
            .await?;

        Ok(BoltDevicePairingInformation {
            wpid: u16::from_le_bytes([response[2], response[3]]),
            kind: BoltDeviceKind::try_from(response[1] & 0x0f)
                .map_err(|_| ProtocolError::UnsupportedResponse)?,
            encrypted: response[1] & (1 << 5) != 0,
            online: response[1] & (1 << 6) == 0,
            unit_id: [response[4], response[5], response[6], response[7]],
        })
    }

    /// Provides the codename of a specific paired device.
    pub async fn get_device_codename(&self, device_index: u8) -> Result<String, ReceiverError> {
        // Names longer than 13 characters would need further reads with a
        // different second parameter byte.
        let response = self
            .chan
            .read_long_register(RECEIVER_DEVICE_INDEX, BoltRegister::ReceiverInfo.into(), [
                u8::from(BoltInfoSubRegister::DeviceCodename) + (device_index & 0x0f),
                0x01,
                0x00,
            ])
            .await?;

        let end_idx = (3 + response[2] as usize).min(response.len());
        Ok(str::from_utf8(&response[3..end_idx])
            .map_err(|_| ProtocolError::UnsupportedResponse)?
            .to_string())
    }

    /// Unpairs a device from the receiver by its index.
    pub async fn unpair_device(&self, device_index: u8) -> Result<(), ReceiverError> {
        let mut payload = [0u8; 16];
        payload[0] = PAIRING_UNPAIR;
        payload[1] = device_index;

        self.chan
            .write_long_register(RECEIVER_DEVICE_INDEX, BoltRegister::Pairing.into(), payload)
            .await?;

        Ok(())
    }

    /// Starts the pairing process for a new device.
    ///
    /// The required `address` and `authentication` values are usually
    /// discovered from the [`BoltEvent::DeviceDiscoveryDeviceDetails`]
    /// event which is emitted regularly when actively discovering available
    /// devices ([`Self::discover_devices`]).
    ///
    /// `entropy` specifies how complex the authentication passkey should be.
    /// For mice this defines the amount of keypresses (left or right) the user
    /// has to perform. Not all values seem to be supported.
    pub async fn pair_device(
        &self,
        slot: u8,
        address: [u8; 6],
        authentication: u8,
        entropy: u8,
    ) -> Result<(), ReceiverError> {
        let mut payload = [0u8; 16];
        payload[0] = PAIRING_PAIR;
        payload[1] = slot;
        payload[2..=7].copy_from_slice(&address);
        payload[8] = authentication;
        payload[9] = entropy;

        self.chan
            .write_long_register(RECEIVER_DEVICE_INDEX, BoltRegister::Pairing.into(), payload)
            .await?;

        Ok(())
    }

    /// Opens the pairing lock and starts device discovery for `timeout` seconds
    /// ([`None`] = default, seems to be 30s). The maximum supported value is
    /// 60s.
    ///
    /// While device discovery is enabled,
    /// [`BoltEvent::DeviceDiscoveryDeviceDetails`] and
    /// [`BoltEvent::DeviceDiscoveryDeviceName`] events are emitted for every
    /// discovered device.
    pub async fn discover_devices(&self, timeout: Option<u8>) -> Result<(), ReceiverError> {
        self.chan
            .write_register(
                RECEIVER_DEVICE_INDEX,
                BoltRegister::DeviceDiscovery.into(),
                [timeout.unwrap_or(0x00), DISCOVERY_OPEN, 0x00],
            )
            .await?;

        Ok(())
    }

    /// Cancels the device discovery process and closes the pairing lock.
    pub async fn cancel_device_discovery(&self) -> Result<(), ReceiverError> {
        self.chan
            .write_register(
                RECEIVER_DEVICE_INDEX,
                BoltRegister::DeviceDiscovery.into(),
                [0x00, DISCOVERY_CLOSE, 0x00],
            )
            .await?;

        Ok(())
    }
}

/// The firmware version of a receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}.B{:04X}", self.major, self.minor, self.build)
    }
}

/// Represents some information about a specific device pairing as returned by
/// [`BoltReceiver::get_device_pairing_information`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltDevicePairingInformation {
    /// The wireless product ID of the device.
    pub wpid: u16,

    /// The kind of the device.
    pub kind: BoltDeviceKind,

    /// Whether the link to the device is encrypted.
    pub encrypted: bool,

    /// Whether the device is online/reachable.
    pub online: bool,

    /// The unit ID of the device.
    pub unit_id: [u8; 4],
}

/// Represents the kind of a device paired with a Bolt receiver.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BoltDeviceKind {
    Unknown = 0x00,
    Keyboard = 0x01,
    Mouse = 0x02,
    Numpad = 0x03,
    Presenter = 0x04,
    Remote = 0x07,
    Trackball = 0x08,
    Touchpad = 0x09,
    Tablet = 0x0a,
    Gamepad = 0x0b,
    Joystick = 0x0c,
    Headset = 0x0d,
}

/// Represents an event emitted by a Bolt receiver.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum BoltEvent {
    /// Is emitted whenever a device connects to or disconnects from the
    /// receiver.
    DeviceConnection(BoltDeviceConnection),

    /// Is emitted whenever the device discovery status changes.
    DeviceDiscoveryStatus(BoltDeviceDiscoveryStatus),

    /// Is emitted many times for every device discovered using
    /// [`BoltReceiver::discover_devices`].
    ///
    /// This event contains device details, including its address required to
    /// start pairing. The [`BoltEvent::DeviceDiscoveryDeviceName`] event will
    /// also be emitted and contains the device name.
    DeviceDiscoveryDeviceDetails(BoltDeviceDiscoveryDeviceDetails),

    /// Is emitted many times for every device discovered using
    /// [`BoltReceiver::discover_devices`].
    ///
    /// This event only contains the device name. Device details will be
    /// provided using the [`BoltEvent::DeviceDiscoveryDeviceDetails`] event.
    DeviceDiscoveryDeviceName(BoltDeviceDiscoveryDeviceName),

    /// Is emitted whenever the status of a pairing process changes.
    PairingStatus(BoltPairingStatus),

    /// Is emitted once the receiver requests a passkey to be entered on a
    /// device that should be paired to it.
    PairingPasskeyRequest(BoltPairingPasskeyRequest),

    /// Is emitted for every keypress a user performs while entering a pairing
    /// passkey.
    PairingPasskeyPressed(BoltPairingPasskeyPressed),
}

impl BoltEvent {
    /// Decodes a notification sent by a Bolt receiver.
    ///
    /// Returns [`None`] for frames that are no Bolt notification or whose
    /// payload cannot be interpreted.
    pub fn parse(frame: &Frame) -> Option<Self> {
        let header = frame.header();
        let payload = v10::extend_payload(frame);

        if header.device_index != RECEIVER_DEVICE_INDEX && header.feature_index != 0x41 {
            return None;
        }

        let address = |start: usize| -> [u8; 6] {
            let mut address = [0u8; 6];
            address.copy_from_slice(&payload[start..start + 6]);
            address
        };

        match header.feature_index {
            // Device connection
            0x41 => Some(BoltEvent::DeviceConnection(BoltDeviceConnection {
                index: header.device_index,
                kind: BoltDeviceKind::try_from(payload[1] & 0x0f).ok()?,
                encrypted: payload[1] & (1 << 5) != 0,
                online: payload[1] & (1 << 6) == 0,
                wpid: u16::from_le_bytes([payload[2], payload[3]]),
            })),
            // Device discovery
            0x4f => {
                let counter = u16::from_le_bytes([payload[0], payload[1]]);

                match payload[2] {
                    // Device data
                    0 => Some(BoltEvent::DeviceDiscoveryDeviceDetails(
                        BoltDeviceDiscoveryDeviceDetails {
                            counter,
                            kind: BoltDeviceKind::try_from(payload[4] & 0x0f).ok()?,
                            wpid: u16::from_le_bytes([payload[5], payload[6]]),
                            address: address(7),
                            authentication: payload[15],
                        },
                    )),
                    // Device name
                    1 => {
                        let end = (4 + payload[3] as usize).min(payload.len());
                        let name = str::from_utf8(&payload[4..end]).ok()?;

                        Some(BoltEvent::DeviceDiscoveryDeviceName(
                            BoltDeviceDiscoveryDeviceName {
                                counter,
                                name: name.to_string(),
                            },
                        ))
                    },
                    _ => None,
                }
            },
            // Device discovery status
            0x53 => Some(BoltEvent::DeviceDiscoveryStatus(BoltDeviceDiscoveryStatus {
                discovery_enabled: payload[0] == 0x00,
            })),
            // Pairing status
            0x54 => {
                let pairing_error = match payload[1] {
                    0x00 => None,
                    code => Some(BoltPairingError::try_from(code).unwrap_or(BoltPairingError::Failed)),
                };

                Some(BoltEvent::PairingStatus(BoltPairingStatus {
                    device_address: address(2),
                    pairing_error,
                    slot: (payload[8] != 0x00).then_some(payload[8]),
                }))
            },
            // Passkey request
            0x4d => {
                let passkey = str::from_utf8(&payload[1..=6]).ok()?;

                Some(BoltEvent::PairingPasskeyRequest(BoltPairingPasskeyRequest {
                    device_address: address(7),
                    passkey: passkey.to_string(),
                }))
            },
            // Passkey pressed
            0x4e => Some(BoltEvent::PairingPasskeyPressed(BoltPairingPasskeyPressed {
                device_address: address(1),
                press_type: BoltPairingPasskeyPressType::try_from(payload[0]).ok()?,
            })),
            _ => None,
        }
    }
}

/// Represents the data of the [`BoltEvent::DeviceConnection`] event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltDeviceConnection {
    /// The index of the device used to communicate with it.
    pub index: u8,

    /// The kind of the device.
    pub kind: BoltDeviceKind,

    /// Whether the link to the device is encrypted.
    pub encrypted: bool,

    /// Whether the device is online/reachable.
    pub online: bool,

    /// The wireless product ID of the device.
    pub wpid: u16,
}

/// Represents the data of the [`BoltEvent::DeviceDiscoveryStatus`] event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltDeviceDiscoveryStatus {
    /// Whether device discovery is enabled.
    pub discovery_enabled: bool,
}

/// Represents the data of the [`BoltEvent::DeviceDiscoveryDeviceDetails`]
/// event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltDeviceDiscoveryDeviceDetails {
    /// The incrementing event counter. This can be used to map
    /// [`BoltEvent::DeviceDiscoveryDeviceDetails`] and
    /// [`BoltEvent::DeviceDiscoveryDeviceName`] events.
    pub counter: u16,

    /// The kind of the discovered device.
    pub kind: BoltDeviceKind,

    /// The wireless product ID of the device.
    pub wpid: u16,

    /// The address of the device required to pair it using
    /// [`BoltReceiver::pair_device`].
    ///
    /// This can also be used as the unique device identifier when collecting
    /// discovered devices.
    pub address: [u8; 6],

    /// The authentication type(s) the device supports. Unfortunately, there is
    /// not much information about this value and whether it is a single value
    /// or a bitfield.
    pub authentication: u8,
}

/// Represents the data of the [`BoltEvent::DeviceDiscoveryDeviceName`] event.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltDeviceDiscoveryDeviceName {
    /// The incrementing event counter. This can be used to map
    /// [`BoltEvent::DeviceDiscoveryDeviceDetails`] and
    /// [`BoltEvent::DeviceDiscoveryDeviceName`] events.
    pub counter: u16,

    /// The name of the discovered device.
    pub name: String,
}

/// Represents the data of the [`BoltEvent::PairingStatus`] event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltPairingStatus {
    /// The address of the device.
    pub device_address: [u8; 6],

    /// The error that occurred while trying to pair the device.
    pub pairing_error: Option<BoltPairingError>,

    /// The slot of the newly paired device.
    pub slot: Option<u8>,
}

/// Represents an error that occurred while pairing a device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BoltPairingError {
    DeviceTimeout = 0x01,
    Failed = 0x02,
}

/// Represents the data of the [`BoltEvent::PairingPasskeyRequest`] event.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltPairingPasskeyRequest {
    /// The address of the device.
    pub device_address: [u8; 6],

    /// The passkey the user has to enter in order to pair the device.
    ///
    /// Depending on the device and authentication type, this value has
    /// different implications.
    ///
    /// For mice, this value will be a valid 6-digit number. After parsing this
    /// into an integer, the (least significant) bits represent the sequence
    /// of mouse presses (`0` = left, `1` = right) the user has to perform,
    /// with an additional press of both mouse buttons simultaneously.\
    /// The amount of bits significant to this equals to the `entropy` passed to
    /// [`BoltReceiver::pair_device`].
    pub passkey: String,
}

/// Represents the data of the [`BoltEvent::PairingPasskeyPressed`] event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct BoltPairingPasskeyPressed {
    /// The address of the device.
    pub device_address: [u8; 6],

    /// The type of the keypress the user performed.
    ///
    /// Every passkey sequence starts with an event where this value is set to
    /// [`BoltPairingPasskeyPressType::Initialization`]. Each time the user
    /// presses a key, an event with a press type of
    /// [`BoltPairingPasskeyPressType::Keypress`] is emitted. Once the user
    /// submits their passkey, this value will be
    /// [`BoltPairingPasskeyPressType::Submit`].
    pub press_type: BoltPairingPasskeyPressType,
}

/// The type of a passkey keypress as included in the
/// [`BoltPairingPasskeyPressed`] event data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum BoltPairingPasskeyPressType {
    Initialization = 0x00,
    Keypress = 0x01,
    Submit = 0x04,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoopbackChannel, SimulatedDevice, SimulatedReceiver};

    fn decode(raw: Vec<u8>) -> Frame {
        Frame::decode(&raw).unwrap()
    }

    #[test]
    fn parses_device_connection() {
        let mouse = SimulatedDevice::mouse(2);
        let event = BoltEvent::parse(&decode(SimulatedReceiver::connection(&mouse, false)));

        let Some(BoltEvent::DeviceConnection(connection)) = event else {
            panic!("expected a connection event, got {event:?}");
        };
        assert_eq!(connection.index, 2);
        assert_eq!(connection.kind, BoltDeviceKind::Mouse);
        assert_eq!(connection.wpid, 0xb034);
        assert!(!connection.online);
    }

    #[test]
    fn parses_discovery_and_pairing_notifications() {
        let mouse = SimulatedDevice::mouse(1);

        let Some(BoltEvent::DeviceDiscoveryDeviceDetails(details)) =
            BoltEvent::parse(&decode(SimulatedReceiver::discovery_details(7, &mouse, 0x02)))
        else {
            panic!("expected discovery details");
        };
        assert_eq!(details.counter, 7);
        assert_eq!(details.address, mouse.address);
        assert_eq!(details.authentication, 0x02);

        let Some(BoltEvent::DeviceDiscoveryDeviceName(name)) =
            BoltEvent::parse(&decode(SimulatedReceiver::discovery_name(7, "MX Master 3S")))
        else {
            panic!("expected a discovery name");
        };
        assert_eq!(name.name, "MX Master 3S");

        let Some(BoltEvent::PairingStatus(status)) =
            BoltEvent::parse(&decode(SimulatedReceiver::pairing_status(mouse.address, 0, 3)))
        else {
            panic!("expected a pairing status");
        };
        assert_eq!(status.slot, Some(3));
        assert_eq!(status.pairing_error, None);

        let Some(BoltEvent::PairingPasskeyRequest(request)) =
            BoltEvent::parse(&decode(SimulatedReceiver::passkey_request(mouse.address, "012345")))
        else {
            panic!("expected a passkey request");
        };
        assert_eq!(request.passkey, "012345");
        assert_eq!(request.device_address, mouse.address);
    }

    #[test]
    fn ignores_device_feature_events() {
        let mouse = SimulatedDevice::mouse(1);
        let frame = decode(SimulatedReceiver::feature_event(&mouse, 0x1004, 0, &[50, 4, 0]));
        assert_eq!(BoltEvent::parse(&frame), None);
    }

    #[tokio::test]
    async fn reads_pairings_from_registers() {
        let sim = SimulatedReceiver::new();
        sim.add_device(SimulatedDevice::mouse(1));
        sim.add_device(SimulatedDevice::keyboard(2));

        let (raw, handle) = LoopbackChannel::new();
        handle.set_responder(sim.responder());
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());
        let bolt = BoltReceiver::new(chan).unwrap();

        assert_eq!(bolt.count_pairings().await.unwrap(), 2);
        assert_eq!(bolt.get_unique_id().await.unwrap(), sim.unique_id());
        assert_eq!(bolt.get_firmware_version().await.unwrap().to_string(), "04.02.B0017");

        let info = bolt.get_device_pairing_information(2).await.unwrap();
        assert_eq!(info.kind, BoltDeviceKind::Keyboard);
        assert_eq!(info.wpid, 0xb35b);
        assert!(info.online);
        assert_eq!(bolt.get_device_codename(1).await.unwrap(), "MX Master 3S");

        assert!(bolt.get_device_pairing_information(4).await.is_err());

        bolt.unpair_device(2).await.unwrap();
        assert_eq!(bolt.count_pairings().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_foreign_receivers() {
        let (raw, _handle) = LoopbackChannel::with_ids(0x046d, 0xc52b, "/dev/hidraw-unifying");
        let chan = Arc::new(HidppChannel::from_raw_channel(raw).await.unwrap());
        assert!(matches!(BoltReceiver::new(chan), Err(ReceiverError::UnknownReceiver)));
    }
}
