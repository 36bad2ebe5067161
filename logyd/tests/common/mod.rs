#![allow(dead_code)]

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use hidpp::{
    channel::{ChannelError, HidppChannel, TransportError},
    frame::RECEIVER_DEVICE_INDEX,
    receiver::bolt::{BOLT_VPID_PAIRS, BoltRegister},
    testing::{LoopbackChannel, LoopbackHandle, SimulatedDevice, SimulatedReceiver},
};
use logyd::{
    config::DaemonConfig,
    daemon::Daemon,
    dispatcher::Dispatcher,
    registry::DeviceEntry,
    transport::{NodeInfo, NodeSource},
};
use tempfile::TempDir;

pub const NODE: &str = "/dev/hidraw-bolt";

/// A single simulated receiver plugged in at [`NODE`].
pub struct SimulatedSource {
    handle: LoopbackHandle,
}

impl SimulatedSource {
    pub fn new(handle: LoopbackHandle) -> Self {
        Self {
            handle,
        }
    }
}

#[async_trait]
impl NodeSource for SimulatedSource {
    async fn scan(&self) -> Result<Vec<NodeInfo>, TransportError> {
        let (vendor_id, product_id) = BOLT_VPID_PAIRS[0];
        Ok(vec![NodeInfo {
            path: self.handle.path().to_string(),
            vendor_id,
            product_id,
        }])
    }

    async fn open(&self, path: &str, poll_interval: Duration) -> Result<HidppChannel, ChannelError> {
        if path != self.handle.path() {
            return Err(TransportError::from(io::Error::from(io::ErrorKind::NotFound)).into());
        }

        HidppChannel::from_raw_channel_with(self.handle.reconnect(), poll_interval).await
    }
}

pub fn config(state: &TempDir) -> DaemonConfig {
    DaemonConfig {
        socket_path: state.path().join("logyd.sock"),
        state_dir: state.path().join("devices"),
        request_timeout_ms: 500,
        poll_interval_ms: 10,
        grace_misses: 3,
        pairing_timeout_secs: 30,
        ..DaemonConfig::default()
    }
}

pub struct Harness {
    pub daemon: Arc<Daemon>,
    pub sim: SimulatedReceiver,
    pub handle: LoopbackHandle,
    pub state: TempDir,
}

impl Harness {
    /// Starts a daemon with a receiver the given devices are paired to.
    pub async fn start(devices: impl IntoIterator<Item = SimulatedDevice>) -> Self {
        let state = tempfile::tempdir().unwrap();
        Self::start_in(state, devices).await
    }

    /// Like [`Self::start`], reusing the state of an earlier daemon.
    pub async fn start_in(state: TempDir, devices: impl IntoIterator<Item = SimulatedDevice>) -> Self {
        let sim = SimulatedReceiver::new();
        for device in devices {
            sim.add_device(device);
        }

        let (vendor_id, product_id) = BOLT_VPID_PAIRS[0];
        let (_raw, handle) = LoopbackChannel::with_ids(vendor_id, product_id, NODE);
        handle.set_responder(sim.responder());

        let source = Arc::new(SimulatedSource::new(handle.clone()));
        let daemon = Arc::new(Daemon::new(config(&state), source, None).unwrap());
        daemon.on_start().await.unwrap();

        Self {
            daemon,
            sim,
            handle,
            state,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(self.daemon.dispatcher())
    }

    pub fn receiver_id(&self) -> String {
        self.sim.unique_id()
    }

    pub fn device(&self, identity: &str) -> DeviceEntry {
        self.daemon
            .dispatcher()
            .registry()
            .find_device(identity)
            .unwrap()
    }

    /// How often the pairing lock was closed.
    pub fn close_lock_count(&self) -> usize {
        self.handle
            .written_frames()
            .iter()
            .filter(|frame| {
                let header = frame.header();
                header.device_index == RECEIVER_DEVICE_INDEX
                    && header.feature_index == 0x80
                    && header.function_and_sw_id == u8::from(BoltRegister::DeviceDiscovery)
                    && frame.payload().get(1) == Some(&0x02)
            })
            .count()
    }
}
