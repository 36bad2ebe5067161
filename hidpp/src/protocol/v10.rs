//! Implements functionality specific to HID++1.0.
//!
//! HID++1.0 is mostly used by receivers. Its messages address registers: byte
//! 2 of a frame is the sub ID (the kind of access), byte 3 the register
//! address.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    channel::{ChannelError, HidppChannel, ProtocolError},
    frame::{Frame, FrameHeader, HEADER_LENGTH, ReportKind, VERY_LONG_REPORT_LENGTH},
};

/// Represents a globally defined sub ID of a HID++1.0 message.
///
/// This enum only includes sub IDs that are defined globally across all
/// devices. Receivers define additional sub IDs for their notifications.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum MessageType {
    /// Used to set a 3-byte register value.
    SetRegister = 0x80,

    /// Used to retrieve a 3-byte register value.
    GetRegister = 0x81,

    /// Used to set a 16-byte register value.
    SetLongRegister = 0x82,

    /// Used to retrieve a 16-byte register value.
    GetLongRegister = 0x83,

    /// Used to indicate an error response. The error code included in the
    /// message can be mapped using [`ErrorType::try_from`].
    Error = 0x8f,
}

/// Whether a sub ID denotes a register access request or response.
pub fn is_register_access(sub_id: u8) -> bool {
    (u8::from(MessageType::SetRegister)..=u8::from(MessageType::GetLongRegister)).contains(&sub_id)
}

/// Represents the type of an error a HID++1.0 device returns as part of a
/// message with the [`MessageType::Error`] type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    /// No error.
    Success = 0x00,

    /// The sub ID of a sent message is invalid.
    InvalidSubId = 0x01,

    /// The address included in a sent message is invalid.
    InvalidAddress = 0x02,

    /// The value included in a sent message is invalid.
    InvalidValue = 0x03,

    /// A connection request failed on the receiver's side.
    ConnectFail = 0x04,

    /// The receiver indicates that too many devices are connected to it.
    TooManyDevices = 0x05,

    /// The receiver indicates that something already exists.
    AlreadyExists = 0x06,

    /// The receiver is currently handling a downstream (to device) message and
    /// cannot process a second one.
    Busy = 0x07,

    /// Trying to send a message to a device index where there is no device
    /// paired.
    UnknownDevice = 0x08,

    /// The addressed device is in disconnected mode and cannot receive
    /// commands until the user interacts with it.
    ResourceError = 0x09,

    /// A sent request is not available in the current context.
    RequestUnavailable = 0x0a,

    /// A request parameter has an unsupported value.
    InvalidParamValue = 0x0b,

    /// The PIN code a device was wrong.
    WrongPinCode = 0x0c,
}

/// Returns the HID++1.0 view of a frame's payload: everything after the sub
/// ID, starting with the register address byte, padded with zeroes.
pub fn extend_payload(frame: &Frame) -> [u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH + 1] {
    let mut data = [0u8; VERY_LONG_REPORT_LENGTH - HEADER_LENGTH + 1];
    data[0] = frame.header().function_and_sw_id;
    let payload = frame.payload();
    data[1..=payload.len()].copy_from_slice(payload);
    data
}

impl HidppChannel {
    async fn access_register(
        &self,
        kind: ReportKind,
        device_index: u8,
        sub_id: MessageType,
        register: u8,
        params: &[u8],
    ) -> Result<Frame, ChannelError> {
        let header = FrameHeader {
            device_index,
            feature_index: sub_id.into(),
            function_and_sw_id: register,
        };

        self.send(Frame::new(kind, header, params), self.timeout())
            .await
    }

    /// Reads a short (3-byte) register.
    pub async fn read_register(
        &self,
        device_index: u8,
        register: u8,
        params: [u8; 3],
    ) -> Result<[u8; 3], ChannelError> {
        let response = self
            .access_register(
                ReportKind::Short,
                device_index,
                MessageType::GetRegister,
                register,
                &params,
            )
            .await?;

        response.payload()[..3]
            .try_into()
            .map_err(|_| ProtocolError::UnsupportedResponse.into())
    }

    /// Writes a short (3-byte) register.
    pub async fn write_register(
        &self,
        device_index: u8,
        register: u8,
        value: [u8; 3],
    ) -> Result<(), ChannelError> {
        self.access_register(
            ReportKind::Short,
            device_index,
            MessageType::SetRegister,
            register,
            &value,
        )
        .await?;

        Ok(())
    }

    /// Reads a long (16-byte) register. The request itself is short and
    /// carries `params` to select a sub-register.
    pub async fn read_long_register(
        &self,
        device_index: u8,
        register: u8,
        params: [u8; 3],
    ) -> Result<[u8; 16], ChannelError> {
        let response = self
            .access_register(
                ReportKind::Short,
                device_index,
                MessageType::GetLongRegister,
                register,
                &params,
            )
            .await?;

        if response.kind() == ReportKind::Short {
            return Err(ProtocolError::UnsupportedResponse.into());
        }

        response.payload()[..16]
            .try_into()
            .map_err(|_| ProtocolError::UnsupportedResponse.into())
    }

    /// Writes a long (16-byte) register.
    pub async fn write_long_register(
        &self,
        device_index: u8,
        register: u8,
        value: [u8; 16],
    ) -> Result<(), ChannelError> {
        self.access_register(
            ReportKind::Long,
            device_index,
            MessageType::SetLongRegister,
            register,
            &value,
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_access_range() {
        assert!(is_register_access(0x80));
        assert!(is_register_access(0x83));
        assert!(!is_register_access(0x8f));
        assert!(!is_register_access(0x41));
    }

    #[test]
    fn payload_view_starts_at_address_byte() {
        let frame = Frame::decode(&[0x10, 0x02, 0x41, 0x10, 0x62, 0x82, 0x40]).unwrap();
        let payload = extend_payload(&frame);
        assert_eq!(&payload[..4], &[0x10, 0x62, 0x82, 0x40]);
        assert_eq!(payload[4], 0);
    }
}
