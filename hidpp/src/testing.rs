//! In-memory stand-ins for HID hardware.
//!
//! [`LoopbackChannel`] implements [`RawHidChannel`] on top of a queue. Every
//! written report is recorded and optionally answered by a [`Responder`].
//! [`SimulatedReceiver`] is a responder behaving like a Bolt receiver with a
//! set of paired devices.

use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    channel::{RawHidChannel, TransportError},
    frame::{
        Frame,
        FrameHeader,
        HIDPP10_ERROR_SUB_ID,
        HIDPP20_ERROR_FEATURE_INDEX,
        LONG_REPORT_LENGTH,
        RECEIVER_DEVICE_INDEX,
        ReportKind,
        SHORT_REPORT_LENGTH,
    },
    nibble::U4,
    protocol::{v10, v20},
    receiver::bolt::{BOLT_VPID_PAIRS, BoltDeviceKind, BoltRegister},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type ResponderFn = dyn Fn(&Frame) -> Vec<Vec<u8>> + Send + Sync;

/// Answers written frames with raw reports.
#[derive(Clone)]
pub struct Responder(Arc<ResponderFn>);

impl Responder {
    pub fn new(f: impl Fn(&Frame) -> Vec<Vec<u8>> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

enum Inbound {
    Report(Vec<u8>),
    Disconnect,
}

/// One connection of the loopback. Reconnecting creates a new link while the
/// write log and responder are shared.
struct Link {
    tx: flume::Sender<Inbound>,
    rx: flume::Receiver<Inbound>,
    disconnected: Mutex<bool>,
}

impl Link {
    fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        Arc::new(Self {
            tx,
            rx,
            disconnected: Mutex::new(false),
        })
    }
}

struct Shared {
    link: Mutex<Arc<Link>>,
    written: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Option<Responder>>,
    vendor_id: u16,
    product_id: u16,
    path: String,
}

/// A raw HID channel backed by in-memory queues.
pub struct LoopbackChannel {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

/// Controls a [`LoopbackChannel`] from the test side.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
}

impl LoopbackChannel {
    /// Creates a loopback reporting the IDs of a Bolt receiver.
    pub fn new() -> (Self, LoopbackHandle) {
        let (vendor_id, product_id) = BOLT_VPID_PAIRS[0];
        Self::with_ids(vendor_id, product_id, "/dev/hidraw-loopback")
    }

    pub fn with_ids(vendor_id: u16, product_id: u16, path: &str) -> (Self, LoopbackHandle) {
        let link = Link::new();
        let shared = Arc::new(Shared {
            link: Mutex::new(Arc::clone(&link)),
            written: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            vendor_id,
            product_id,
            path: path.to_string(),
        });

        (
            Self {
                shared: Arc::clone(&shared),
                link,
            },
            LoopbackHandle {
                shared,
            },
        )
    }
}

impl LoopbackHandle {
    /// Sets the responder answering every subsequently written frame.
    pub fn set_responder(&self, responder: Responder) {
        *lock(&self.shared.responder) = Some(responder);
    }

    /// Queues a raw report as if the hardware sent it.
    pub fn inject(&self, report: Vec<u8>) {
        let _ = lock(&self.shared.link).tx.send(Inbound::Report(report));
    }

    /// All reports written so far, across reconnects.
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.written).clone()
    }

    /// All written reports that decode as HID++ frames.
    pub fn written_frames(&self) -> Vec<Frame> {
        self.written()
            .iter()
            .filter_map(|raw| Frame::decode(raw).ok())
            .collect()
    }

    /// Makes every further read and write of the current link fail.
    pub fn disconnect(&self) {
        let link = lock(&self.shared.link).clone();
        *lock(&link.disconnected) = true;
        let _ = link.tx.send(Inbound::Disconnect);
    }

    /// Creates a fresh channel for the same simulated hardware, as if its
    /// node was opened again.
    pub fn reconnect(&self) -> LoopbackChannel {
        let link = Link::new();
        *lock(&self.shared.link) = Arc::clone(&link);

        LoopbackChannel {
            shared: Arc::clone(&self.shared),
            link,
        }
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }
}

fn broken_pipe() -> TransportError {
    io::Error::new(io::ErrorKind::BrokenPipe, "loopback disconnected").into()
}

#[async_trait]
impl RawHidChannel for LoopbackChannel {
    fn vendor_id(&self) -> u16 {
        self.shared.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.shared.product_id
    }

    fn path(&self) -> String {
        self.shared.path.clone()
    }

    async fn write_report(&self, src: &[u8]) -> Result<usize, TransportError> {
        if *lock(&self.link.disconnected) {
            return Err(broken_pipe());
        }

        lock(&self.shared.written).push(src.to_vec());

        let responder = lock(&self.shared.responder).clone();
        if let (Some(responder), Ok(frame)) = (responder, Frame::decode(src)) {
            for report in (responder.0)(&frame) {
                let _ = self.link.tx.send(Inbound::Report(report));
            }
        }

        Ok(src.len())
    }

    async fn read_report(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if *lock(&self.link.disconnected) {
            return Err(broken_pipe());
        }

        match tokio::time::timeout(timeout, self.link.rx.recv_async()).await {
            Ok(Ok(Inbound::Report(report))) => {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                Ok(len)
            },
            Ok(Ok(Inbound::Disconnect)) | Ok(Err(_)) => Err(broken_pipe()),
            Err(_) => Ok(0),
        }
    }

    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)> {
        Some((true, true))
    }

    async fn get_report_descriptor(&self, _: &mut [u8]) -> Result<usize, TransportError> {
        Ok(0)
    }
}

/// A device paired to a [`SimulatedReceiver`].
#[derive(Clone, Debug)]
pub struct SimulatedDevice {
    pub slot: u8,
    pub kind: BoltDeviceKind,
    pub wpid: u16,
    pub unit_id: [u8; 4],
    pub address: [u8; 6],
    pub codename: String,
    pub name: String,

    /// Feature IDs, living at indices `1..`.
    pub features: Vec<u16>,

    pub battery_percentage: u8,
    pub online: bool,

    /// Whether requests to the device go unanswered.
    pub silent: bool,

    /// SmartShift mode, auto-disengage threshold and its default.
    pub smartshift: [u8; 3],
    pub hires_mode: u8,
}

impl SimulatedDevice {
    pub fn mouse(slot: u8) -> Self {
        Self {
            slot,
            kind: BoltDeviceKind::Mouse,
            wpid: 0xb034,
            unit_id: [0x4a, 0x1b, 0x2c, slot],
            address: [0xc0, 0xff, 0xee, 0x00, 0x00, slot],
            codename: "MX Master 3S".to_string(),
            name: "MX Master 3S B".to_string(),
            features: vec![0x0001, 0x0005, 0x1004, 0x1d4b, 0x2110, 0x2121],
            battery_percentage: 50,
            online: true,
            silent: false,
            smartshift: [0x02, 0x0a, 0x0a],
            hires_mode: 0x00,
        }
    }

    pub fn keyboard(slot: u8) -> Self {
        Self {
            slot,
            kind: BoltDeviceKind::Keyboard,
            wpid: 0xb35b,
            unit_id: [0x71, 0x02, 0x9e, slot],
            address: [0xd1, 0xce, 0x00, 0x00, 0x00, slot],
            codename: "MX Keys S".to_string(),
            name: "MX Keys S".to_string(),
            features: vec![0x0001, 0x0005, 0x1004, 0x1d4b],
            battery_percentage: 80,
            online: true,
            silent: false,
            smartshift: [0; 3],
            hires_mode: 0,
        }
    }

    /// The hex form of the unit ID, which is what identifies a Bolt device.
    pub fn serial(&self) -> String {
        self.unit_id.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn feature_index(&self, id: u16) -> Option<u8> {
        self.features
            .iter()
            .position(|&f| f == id)
            .map(|pos| pos as u8 + 1)
    }
}

/// A feature function call recorded by a [`SimulatedReceiver`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FeatureCall {
    pub slot: u8,
    pub feature_id: u16,
    pub function: u8,
    pub params: Vec<u8>,
}

struct SimState {
    unique_id: String,
    firmware: [u8; 4],
    devices: BTreeMap<u8, SimulatedDevice>,
    calls: Vec<FeatureCall>,
}

/// Answers requests the way a Bolt receiver and its paired devices do.
#[derive(Clone)]
pub struct SimulatedReceiver {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedReceiver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                unique_id: "5E3F8A21C0D4B967".to_string(),
                firmware: [0x04, 0x02, 0x00, 0x17],
                devices: BTreeMap::new(),
                calls: Vec::new(),
            })),
        }
    }

    pub fn unique_id(&self) -> String {
        lock(&self.state).unique_id.clone()
    }

    pub fn set_unique_id(&self, unique_id: &str) {
        lock(&self.state).unique_id = unique_id.to_string();
    }

    pub fn add_device(&self, device: SimulatedDevice) {
        lock(&self.state).devices.insert(device.slot, device);
    }

    pub fn remove_device(&self, slot: u8) -> Option<SimulatedDevice> {
        lock(&self.state).devices.remove(&slot)
    }

    pub fn device(&self, slot: u8) -> Option<SimulatedDevice> {
        lock(&self.state).devices.get(&slot).cloned()
    }

    /// Changes a paired device in place.
    pub fn update_device(&self, slot: u8, f: impl FnOnce(&mut SimulatedDevice)) {
        if let Some(device) = lock(&self.state).devices.get_mut(&slot) {
            f(device);
        }
    }

    /// Every feature function call that changed a setting.
    pub fn setting_calls(&self) -> Vec<FeatureCall> {
        lock(&self.state).calls.clone()
    }

    pub fn responder(&self) -> Responder {
        let sim = self.clone();
        Responder::new(move |request| sim.respond(request))
    }

    fn respond(&self, request: &Frame) -> Vec<Vec<u8>> {
        let header = request.header();

        if header.device_index == RECEIVER_DEVICE_INDEX {
            return vec![self.respond_register(request)];
        }

        let mut state = lock(&self.state);
        let Some(device) = state.devices.get(&header.device_index).cloned() else {
            return vec![hidpp10_error(header, v10::ErrorType::UnknownDevice)];
        };
        if device.silent {
            return Vec::new();
        }
        if !device.online {
            return vec![hidpp10_error(header, v10::ErrorType::ResourceError)];
        }

        let function = header.function_id().to_lo();
        let params = request.payload();

        if header.feature_index == 0x00 {
            return vec![match function {
                0 => {
                    let id = u16::from_be_bytes([params[0], params[1]]);
                    let index = if id == 0 { 0 } else { device.feature_index(id).unwrap_or(0) };
                    reply(request, &[index, 0x00, 0x00])
                },
                1 => reply(request, &[0x04, 0x05, params[2]]),
                _ => hidpp20_error(header, v20::ErrorType::InvalidFunctionId),
            }];
        }

        let Some(&feature_id) = device.features.get(header.feature_index as usize - 1) else {
            return vec![hidpp20_error(header, v20::ErrorType::InvalidFeatureIndex)];
        };

        let response = match (feature_id, function) {
            (0x0001, 0) => reply(request, &[device.features.len() as u8]),
            (0x0001, 1) => {
                let id = match params[0] {
                    0 => 0x0000,
                    index => device.features.get(index as usize - 1).copied().unwrap_or(0),
                };
                let [hi, lo] = id.to_be_bytes();
                reply(request, &[hi, lo, 0x00, 0x00])
            },
            (0x0005, 0) => reply(request, &[device.name.len() as u8]),
            (0x0005, 1) => {
                let start = (params[0] as usize).min(device.name.len());
                reply(request, &device.name.as_bytes()[start..])
            },
            (0x0005, 2) => reply(request, &[match device.kind {
                BoltDeviceKind::Keyboard => 0x00,
                _ => 0x03,
            }]),
            (0x1004, 0) => reply(request, &[0x0f, 0x02]),
            (0x1004, 1) => reply(request, &[device.battery_percentage, 0x04, 0x00]),
            (0x2110, 0) => reply(request, &device.smartshift),
            (0x2110, 1) => {
                let slot = device.slot;
                if let Some(device) = state.devices.get_mut(&slot) {
                    for (current, &new) in device.smartshift.iter_mut().zip(&params[..3]) {
                        if new != 0 {
                            *current = new;
                        }
                    }
                }
                state.calls.push(FeatureCall {
                    slot,
                    feature_id,
                    function,
                    params: params[..3].to_vec(),
                });
                reply(request, &params[..3])
            },
            (0x2121, 0) => reply(request, &[0x08, 0x0c]),
            (0x2121, 1) => reply(request, &[device.hires_mode]),
            (0x2121, 2) => {
                let slot = device.slot;
                if let Some(device) = state.devices.get_mut(&slot) {
                    device.hires_mode = params[0];
                }
                state.calls.push(FeatureCall {
                    slot,
                    feature_id,
                    function,
                    params: vec![params[0]],
                });
                reply(request, &[params[0]])
            },
            _ => hidpp20_error(header, v20::ErrorType::InvalidFunctionId),
        };

        vec![response]
    }

    fn respond_register(&self, request: &Frame) -> Vec<u8> {
        let header = request.header();
        let params = request.payload();
        let mut state = lock(&self.state);

        let Ok(register) = BoltRegister::try_from(header.function_and_sw_id) else {
            return hidpp10_error(header, v10::ErrorType::InvalidAddress);
        };

        match (header.feature_index, register) {
            (0x81, BoltRegister::Connections) => {
                reply(request, &[0x00, state.devices.len() as u8, 0x00])
            },
            (0x81, BoltRegister::Firmware) => {
                let fw = state.firmware;
                match params[0] {
                    0x01 => reply(request, &[0x01, fw[0], fw[1]]),
                    0x02 => reply(request, &[0x02, fw[2], fw[3]]),
                    _ => hidpp10_error(header, v10::ErrorType::InvalidValue),
                }
            },
            (0x80, BoltRegister::Connections | BoltRegister::DeviceDiscovery) => {
                reply(request, &[])
            },
            (0x83, BoltRegister::UniqueId) => {
                long_reply(request, state.unique_id.as_bytes())
            },
            (0x83, BoltRegister::ReceiverInfo) => {
                let slot = params[0] & 0x0f;
                let Some(device) = state.devices.get(&slot) else {
                    return hidpp10_error(header, v10::ErrorType::InvalidValue);
                };

                match params[0] & 0xf0 {
                    0x50 => {
                        let mut data = vec![params[0], u8::from(device.kind)];
                        if !device.online {
                            data[1] |= 1 << 6;
                        }
                        data.extend_from_slice(&device.wpid.to_le_bytes());
                        data.extend_from_slice(&device.unit_id);
                        long_reply(request, &data)
                    },
                    0x60 => {
                        let mut data = vec![params[0], 0x01, device.codename.len() as u8];
                        data.extend_from_slice(device.codename.as_bytes());
                        long_reply(request, &data)
                    },
                    _ => hidpp10_error(header, v10::ErrorType::InvalidValue),
                }
            },
            (0x82, BoltRegister::Pairing) => {
                if params[0] == 0x03 {
                    state.devices.remove(&params[1]);
                }
                reply(request, &[])
            },
            _ => hidpp10_error(header, v10::ErrorType::InvalidSubId),
        }
    }

    /// A connection notification for a paired device.
    pub fn connection(device: &SimulatedDevice, online: bool) -> Vec<u8> {
        let mut flags = u8::from(device.kind);
        if !online {
            flags |= 1 << 6;
        }
        let [lo, hi] = device.wpid.to_le_bytes();
        notification(device.slot, 0x41, &[0x10, flags, lo, hi])
    }

    /// A discovery notification carrying the details of a device ready to
    /// pair.
    pub fn discovery_details(counter: u16, device: &SimulatedDevice, authentication: u8) -> Vec<u8> {
        let mut data = [0u8; 16];
        data[..2].copy_from_slice(&counter.to_le_bytes());
        data[4] = device.kind.into();
        data[5..=6].copy_from_slice(&device.wpid.to_le_bytes());
        data[7..=12].copy_from_slice(&device.address);
        data[15] = authentication;
        notification(RECEIVER_DEVICE_INDEX, 0x4f, &data)
    }

    /// A discovery notification carrying the name of a device ready to pair.
    pub fn discovery_name(counter: u16, name: &str) -> Vec<u8> {
        let mut data = vec![0u8; 4];
        data[..2].copy_from_slice(&counter.to_le_bytes());
        data[2] = 0x01;
        data[3] = name.len() as u8;
        data.extend_from_slice(name.as_bytes());
        notification(RECEIVER_DEVICE_INDEX, 0x4f, &data)
    }

    pub fn discovery_status(enabled: bool) -> Vec<u8> {
        notification(RECEIVER_DEVICE_INDEX, 0x53, &[if enabled { 0x00 } else { 0x01 }])
    }

    /// A pairing status notification. A zero `error` reports success.
    pub fn pairing_status(address: [u8; 6], error: u8, slot: u8) -> Vec<u8> {
        let mut data = [0u8; 9];
        data[1] = error;
        data[2..=7].copy_from_slice(&address);
        data[8] = slot;
        notification(RECEIVER_DEVICE_INDEX, 0x54, &data)
    }

    pub fn passkey_request(address: [u8; 6], passkey: &str) -> Vec<u8> {
        let mut data = [0u8; 13];
        data[1..=6].copy_from_slice(&passkey.as_bytes()[..6]);
        data[7..=12].copy_from_slice(&address);
        notification(RECEIVER_DEVICE_INDEX, 0x4d, &data)
    }

    /// A HID++2.0 event broadcast by a device feature.
    pub fn feature_event(device: &SimulatedDevice, feature_id: u16, event: u8, payload: &[u8]) -> Vec<u8> {
        let index = device.feature_index(feature_id).unwrap_or(0xfe);
        let header = FrameHeader::v20(device.slot, index, U4::from_lo(event), U4::from_lo(0));
        Frame::new(ReportKind::Long, header, payload).encode()
    }
}

fn reply(request: &Frame, payload: &[u8]) -> Vec<u8> {
    let kind = if payload.len() <= SHORT_REPORT_LENGTH - 4 && request.kind() == ReportKind::Short {
        ReportKind::Short
    } else {
        ReportKind::Long
    };
    Frame::new(kind, request.header(), payload).encode()
}

fn long_reply(request: &Frame, payload: &[u8]) -> Vec<u8> {
    Frame::new(ReportKind::Long, request.header(), payload).encode()
}

/// Builds a HID++1.0 notification from its view starting at byte 3.
fn notification(device_index: u8, sub_id: u8, data: &[u8]) -> Vec<u8> {
    let kind = if data.len() <= SHORT_REPORT_LENGTH - 3 {
        ReportKind::Short
    } else {
        ReportKind::Long
    };

    let mut raw = vec![0u8; kind.length()];
    raw[0] = kind.report_id();
    raw[1] = device_index;
    raw[2] = sub_id;
    let len = data.len().min(LONG_REPORT_LENGTH - 3);
    raw[3..3 + len].copy_from_slice(&data[..len]);
    raw
}

fn hidpp10_error(origin: FrameHeader, code: v10::ErrorType) -> Vec<u8> {
    Frame::new(
        ReportKind::Short,
        FrameHeader {
            device_index: origin.device_index,
            feature_index: HIDPP10_ERROR_SUB_ID,
            function_and_sw_id: origin.feature_index,
        },
        &[origin.function_and_sw_id, code.into()],
    )
    .encode()
}

fn hidpp20_error(origin: FrameHeader, code: v20::ErrorType) -> Vec<u8> {
    Frame::new(
        ReportKind::Long,
        FrameHeader {
            device_index: origin.device_index,
            feature_index: HIDPP20_ERROR_FEATURE_INDEX,
            function_and_sw_id: origin.feature_index,
        },
        &[origin.function_and_sw_id, code.into()],
    )
    .encode()
}
