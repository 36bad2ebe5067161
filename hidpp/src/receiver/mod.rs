//! Implements the different HID++ wireless receivers, including pairing.

use std::sync::Arc;

use thiserror::Error;

use crate::channel::{ChannelError, HidppChannel};
pub use crate::frame::RECEIVER_DEVICE_INDEX;

pub mod bolt;

/// Represents a supported receiver detected on a HID++ channel.
#[derive(Clone)]
#[non_exhaustive]
pub enum Receiver {
    Bolt(bolt::BoltReceiver),
}

/// Tries to identify the receiver behind a HID++ channel by its vendor and
/// product IDs.
///
/// Returns [`None`] if the channel does not belong to a supported receiver.
pub fn detect(chan: Arc<HidppChannel>) -> Option<Receiver> {
    bolt::BoltReceiver::new(chan).ok().map(Receiver::Bolt)
}

/// Whether a vendor and product ID pair belongs to a supported receiver.
pub fn is_supported(vendor_id: u16, product_id: u16) -> bool {
    bolt::BOLT_VPID_PAIRS.contains(&(vendor_id, product_id))
}

/// Represents an error returned by a receiver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReceiverError {
    /// Indicates that no supported receiver could be identified on a HID++
    /// channel.
    #[error("no (supported) receiver could be found")]
    UnknownReceiver,

    /// Indicates that a register access failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl From<crate::channel::ProtocolError> for ReceiverError {
    fn from(err: crate::channel::ProtocolError) -> Self {
        Self::Channel(err.into())
    }
}
