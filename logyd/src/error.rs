//! The error type of the daemon and the kinds it is reported as.

use hidpp::{
    channel::ChannelError,
    device::DeviceError,
    frame::FrameError,
    receiver::ReceiverError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// The kind of a [`DaemonError`] as reported to clients.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    FrameError,
    Timeout,
    DeviceUnreachable,
    ProtocolError,
    AlreadyPairing,
    DeviceNotFound,
    Busy,
    Cancelled,
    IoError,
    InvalidSetting,
    ReceiverNotFound,
}

/// Represents an error returned by the daemon core.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("a report could not be decoded")]
    Frame(#[from] FrameError),

    #[error("the device did not answer in time")]
    Timeout,

    #[error("the device is unreachable")]
    DeviceUnreachable,

    #[error("the device answered unexpectedly: {0}")]
    Protocol(String),

    #[error("receiver {0} is already pairing")]
    AlreadyPairing(String),

    #[error("no device {0} is paired")]
    DeviceNotFound(String),

    #[error("the device is busy")]
    Busy,

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("the HID++ channel failed")]
    Channel(#[source] ChannelError),

    #[error("could not access the configuration store")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("no receiver {0} is connected")]
    ReceiverNotFound(String),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Frame(_) => ErrorKind::FrameError,
            Self::Timeout => ErrorKind::Timeout,
            Self::DeviceUnreachable => ErrorKind::DeviceUnreachable,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::AlreadyPairing(_) => ErrorKind::AlreadyPairing,
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::Busy => ErrorKind::Busy,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Channel(_) | Self::Store(_) | Self::Io(_) => ErrorKind::IoError,
            Self::InvalidSetting(_) => ErrorKind::InvalidSetting,
            Self::ReceiverNotFound(_) => ErrorKind::ReceiverNotFound,
        }
    }

    /// Whether the error means a device did not respond, which counts
    /// against its connection state.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Timeout | Self::DeviceUnreachable)
    }
}

impl From<ChannelError> for DaemonError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout => Self::Timeout,
            ChannelError::DeviceUnreachable => Self::DeviceUnreachable,
            ChannelError::Busy => Self::Busy,
            ChannelError::Cancelled => Self::Cancelled,
            ChannelError::Protocol(err) => Self::Protocol(err.to_string()),
            other => Self::Channel(other),
        }
    }
}

impl From<ReceiverError> for DaemonError {
    fn from(err: ReceiverError) -> Self {
        match err {
            ReceiverError::Channel(err) => err.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<DeviceError> for DaemonError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Channel(err) => err.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use hidpp::{channel::ProtocolError, protocol::v20};

    use super::*;

    #[test]
    fn channel_errors_keep_their_kind() {
        assert_eq!(DaemonError::from(ChannelError::Timeout).kind(), ErrorKind::Timeout);
        assert_eq!(DaemonError::from(ChannelError::Busy).kind(), ErrorKind::Busy);

        let protocol = DaemonError::from(ChannelError::Protocol(ProtocolError::Hidpp20(
            v20::ErrorType::InvalidArgument,
        )));
        assert_eq!(protocol.kind(), ErrorKind::ProtocolError);
        assert!(!protocol.is_miss());

        let unreachable = DaemonError::from(ReceiverError::Channel(ChannelError::DeviceUnreachable));
        assert!(unreachable.is_miss());
    }

    #[test]
    fn kinds_serialize_in_kebab_case() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::AlreadyPairing).unwrap(),
            "\"already-pairing\""
        );
    }
}
