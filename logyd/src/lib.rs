//! A headless daemon managing Logitech Bolt receivers and the devices paired
//! to them.
//!
//! The daemon keeps a [`registry`] of receivers and devices, persists device
//! settings in a [`store`] and reapplies them whenever a device reconnects.
//! Clients talk to it over the newline-delimited JSON protocol in [`ipc`].

pub mod cli;
pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod pairing;
pub mod registry;
pub mod session;
pub mod settings;
pub mod store;
pub mod transport;
