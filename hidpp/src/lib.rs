//! An implementation of Logitech's HID++ protocol, as spoken by wireless
//! receivers and the devices paired to them.
//!
//! The crate is layered bottom-up:
//!
//! - [`frame`] encodes and decodes the raw short, long and very long reports.
//! - [`channel`] runs a session on top of any [`channel::RawHidChannel`]:
//!   it correlates requests with responses and publishes everything else as
//!   notifications.
//! - [`protocol`] gives frames their HID++1.0 (register) and HID++2.0
//!   (feature) meaning.
//! - [`receiver`] and [`device`] build on that to manage receivers, their
//!   pairings and the features of paired devices.
//!
//! Logitech provided a [public Google Drive folder](https://drive.google.com/drive/folders/0BxbRzx7vEV7eWmgwazJ3NUFfQ28)
//! with documentation on HID++ and several device features. The
//! [Solaar](https://github.com/pwr-Solaar/Solaar) project was a great help for
//! the undocumented receiver registers.
//!
//! # Quickstart
//!
//! This crate implements the HID++ protocol, not the underlying HID
//! communication. Bridge your HID implementation by implementing
//! [`channel::RawHidChannel`]; its async methods use [`mod@async_trait`],
//! which is re-exported for annotating your implementing type.
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use hidpp::{
//!     channel::{HidppChannel, SessionEvent},
//!     device::Device,
//!     feature::unified_battery::UnifiedBatteryFeature,
//!     receiver::{self, Receiver, bolt::BoltEvent},
//! };
//!
//! let channel = Arc::new(HidppChannel::from_raw_channel(my_hid_channel).await?);
//! let events = channel.listen();
//!
//! let Some(Receiver::Bolt(bolt)) = receiver::detect(Arc::clone(&channel)) else {
//!     panic!("no Bolt receiver");
//! };
//! println!("{} devices paired", bolt.count_pairings().await?);
//!
//! let mut device = Device::new(Arc::clone(&channel), 0x01).await?;
//! device.enumerate_features().await?;
//! if let Some(battery) = device.get_feature::<UnifiedBatteryFeature>() {
//!     println!("{:?}", battery.get_battery_info().await?);
//! }
//!
//! while let Ok(SessionEvent::Notification(frame)) = events.recv_async().await {
//!     if let Some(event) = BoltEvent::parse(&frame) {
//!         println!("{event:?}");
//!     }
//! }
//! ```

pub use async_trait::async_trait;

pub mod channel;
pub mod device;
mod event;
pub mod feature;
pub mod frame;
pub mod nibble;
pub mod protocol;
pub mod receiver;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
