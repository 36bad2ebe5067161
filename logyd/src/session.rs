//! One opened receiver: its HID++ channel, the handles of its devices and the
//! worker routing its notifications.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use hidpp::{
    channel::{HidppChannel, SessionEvent},
    device::{Device, FeatureTable},
    feature::{
        CreatableFeature,
        NotifyingFeature,
        device_type_and_name::DeviceTypeAndNameFeature,
        hires_wheel::{HiResWheelEvent, HiResWheelFeature},
        registry::display_name,
        unified_battery::{BatteryEvent, UnifiedBatteryFeature},
        wireless_device_status::{WirelessDeviceStatusEvent, WirelessDeviceStatusFeature},
    },
    frame::Frame,
    receiver::{
        self,
        Receiver,
        bolt::{BOLT_MAX_DEVICES, BoltEvent, BoltReceiver},
    },
};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::{
    error::{DaemonError, ErrorKind},
    registry::{ConnectionState, DeviceEntry, FeatureSummary, ReceiverEntry, Registry, StateUpdate},
    settings::{self, Setting, SettingValue},
    store::{Store, StoreEntry},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ReceiverSession {
    id: String,

    /// Scopes registry removal to this session.
    lease: u64,

    chan: Arc<HidppChannel>,
    bolt: BoltReceiver,
    registry: Arc<Registry>,
    store: Arc<Store>,

    /// Opened devices by slot.
    devices: Mutex<HashMap<u8, Device>>,

    /// Feature tables by slot, used to route feature events.
    tables: Mutex<HashMap<u8, FeatureTable>>,

    /// Held by whatever drives a multi-step workflow on the receiver.
    section: tokio::sync::Mutex<()>,

    /// Set while a pairing attempt runs.
    pairing: Mutex<Option<PairingSlot>>,
}

struct PairingSlot {
    /// Taken once the attempt is cancelled.
    cancel: Option<oneshot::Sender<()>>,
}

impl ReceiverSession {
    /// Identifies the receiver behind `chan`, registers it and starts its
    /// worker.
    ///
    /// The devices are not discovered yet, see [`Self::discover`].
    pub async fn open(
        chan: HidppChannel,
        registry: Arc<Registry>,
        store: Arc<Store>,
    ) -> Result<Arc<Self>, DaemonError> {
        let chan = Arc::new(chan);
        let path = chan.path.clone();

        let bolt = match receiver::detect(Arc::clone(&chan)) {
            Some(Receiver::Bolt(bolt)) => bolt,
            _ => return Err(DaemonError::ReceiverNotFound(path)),
        };

        let events = chan.listen();
        let id = bolt.get_unique_id().await?;
        let firmware = match bolt.get_firmware_version().await {
            Ok(firmware) => Some(firmware),
            Err(err) => {
                warn!(receiver = %id, "could not read the firmware version: {err}");
                None
            },
        };

        let lease = registry.upsert_receiver(ReceiverEntry {
            id: id.clone(),
            path: path.clone(),
            vendor_id: chan.vendor_id,
            product_id: chan.product_id,
            firmware,
            max_slots: BOLT_MAX_DEVICES,
            online: true,
            pairing: None,
        });
        info!(receiver = %id, %path, "receiver opened");

        let session = Arc::new(Self {
            id,
            lease,
            chan,
            bolt,
            registry,
            store,
            devices: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            section: tokio::sync::Mutex::new(()),
            pairing: Mutex::new(None),
        });

        tokio::spawn(Arc::clone(&session).run(events));

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.chan.path
    }

    pub fn channel(&self) -> &Arc<HidppChannel> {
        &self.chan
    }

    pub fn bolt(&self) -> &BoltReceiver {
        &self.bolt
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn section(&self) -> &tokio::sync::Mutex<()> {
        &self.section
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    /// Closes the channel. Pending requests and the running pairing attempt
    /// fail with [`DaemonError::Cancelled`] and the worker stops.
    pub fn close(&self) {
        self.cancel_pairing();
        self.chan.close();
        self.registry.remove(&self.id, self.lease);
        debug!(receiver = %self.id, "receiver closed");
    }

    /// Reserves the receiver for a pairing attempt.
    ///
    /// Returns the receiver the attempt is cancelled through.
    pub fn begin_pairing(&self) -> Result<oneshot::Receiver<()>, DaemonError> {
        let mut pairing = lock(&self.pairing);
        if pairing.is_some() {
            return Err(DaemonError::AlreadyPairing(self.id.clone()));
        }

        let (tx, rx) = oneshot::channel();
        *pairing = Some(PairingSlot {
            cancel: Some(tx),
        });
        Ok(rx)
    }

    pub fn end_pairing(&self) {
        lock(&self.pairing).take();
    }

    /// Cancels the running pairing attempt. Returns whether there was one.
    ///
    /// The receiver stays reserved until the attempt has wound down.
    pub fn cancel_pairing(&self) -> bool {
        let mut pairing = lock(&self.pairing);
        let Some(slot) = pairing.as_mut() else {
            return false;
        };

        if let Some(tx) = slot.cancel.take() {
            // Fails only if the attempt ended on its own meanwhile.
            let _ = tx.send(());
        }
        true
    }

    /// Whether the device in `slot` has the feature backing `setting`.
    ///
    /// Returns [`None`] if the device was never opened.
    pub fn supports(&self, slot: u8, setting: Setting) -> Option<bool> {
        lock(&self.devices)
            .get(&slot)
            .map(|device| setting.is_supported(device))
    }

    /// Reads all paired devices, registers them and applies their stored
    /// settings.
    pub async fn discover(&self) -> Result<Vec<DeviceEntry>, DaemonError> {
        let count = self.bolt.count_pairings().await?;
        debug!(receiver = %self.id, count, "discovering paired devices");

        let mut found = Vec::with_capacity(count as usize);
        for slot in 1..=BOLT_MAX_DEVICES {
            if found.len() >= count as usize {
                break;
            }

            match self.describe_slot(slot).await {
                Ok(device) => found.push(device),
                Err(err) if err.kind() == ErrorKind::Cancelled => return Err(err),
                Err(err) => trace!(receiver = %self.id, slot, "slot is empty: {err}"),
            }
        }

        self.registry.replace_devices(&self.id, found.clone());

        for device in &found {
            if device.state == ConnectionState::Connected {
                self.apply_stored(device.slot).await;
            }
        }

        Ok(self.registry.devices(&self.id))
    }

    /// Reads the device in `slot` and registers it. Used for devices that
    /// appear after discovery.
    pub async fn adopt_device(&self, slot: u8) -> Result<DeviceEntry, DaemonError> {
        self.forget_device(slot);

        let device = self.describe_slot(slot).await?;
        self.registry.insert_device(device.clone());
        info!(receiver = %self.id, slot, identity = %device.identity, "device added");

        if device.state == ConnectionState::Connected {
            self.apply_stored(slot).await;
        }

        Ok(self.registry.device(&self.id, slot).unwrap_or(device))
    }

    /// Drops the handle of the device in `slot`.
    pub fn forget_device(&self, slot: u8) {
        lock(&self.devices).remove(&slot);
        lock(&self.tables).remove(&slot);
    }

    /// Writes a setting to the device in `slot`.
    pub async fn apply_setting(
        &self,
        slot: u8,
        setting: Setting,
        value: SettingValue,
    ) -> Result<(), DaemonError> {
        let result = async {
            let device = self.open_device(slot).await?;
            settings::apply(&device, setting, value).await
        }
        .await;

        self.track(slot, result)
    }

    /// Pings every device that is not known to be disconnected, counting
    /// unanswered pings as misses.
    ///
    /// Skipped while a workflow holds the receiver.
    pub async fn ping_devices(&self) {
        let Ok(_section) = self.section.try_lock() else {
            trace!(receiver = %self.id, "receiver is busy, not pinging");
            return;
        };

        for device in self.registry.devices(&self.id) {
            if device.state == ConnectionState::Disconnected {
                continue;
            }

            let result: Result<u8, DaemonError> = async {
                let handle = self.open_device(device.slot).await?;
                Ok(handle.root().ping(device.slot).await?)
            }
            .await;

            match self.track(device.slot, result) {
                Ok(echo) if echo != device.slot => {
                    debug!(receiver = %self.id, slot = device.slot, echo, "unexpected ping echo");
                },
                Ok(_) => {},
                Err(err) => debug!(receiver = %self.id, slot = device.slot, "ping failed: {err}"),
            }
        }
    }

    async fn describe_slot(&self, slot: u8) -> Result<DeviceEntry, DaemonError> {
        let info = self.bolt.get_device_pairing_information(slot).await?;
        let codename = match self.bolt.get_device_codename(slot).await {
            Ok(codename) => codename,
            Err(err) => {
                debug!(receiver = %self.id, slot, "could not read the codename: {err}");
                String::new()
            },
        };

        let identity = if info.unit_id == [0; 4] {
            format!("{}-{slot}", self.id)
        } else {
            info.unit_id.iter().map(|b| format!("{b:02X}")).collect()
        };

        let mut device = DeviceEntry {
            receiver: self.id.clone(),
            slot,
            identity,
            name: codename.clone(),
            codename,
            kind: info.kind,
            wpid: info.wpid,
            state: if info.online {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            battery: None,
            features: Vec::new(),
            settings: Default::default(),
            config_mismatch: false,
            misses: 0,
        };

        if info.online {
            if let Err(err) = self.probe(&mut device).await {
                if err.kind() == ErrorKind::Cancelled {
                    return Err(err);
                }
                warn!(receiver = %self.id, slot, "could not read the device: {err}");
                if err.is_miss() {
                    device.misses = 1;
                }
            }
        }

        if let Some(entry) = self.registry.reconcile(&mut device) {
            self.persist(&device.identity, &entry).await;
        }

        Ok(device)
    }

    /// Reads name, battery and features of an online device.
    async fn probe(&self, entry: &mut DeviceEntry) -> Result<(), DaemonError> {
        let device = self.open_device(entry.slot).await?;

        if let Some(table) = device.feature_table() {
            entry.features = table
                .iter()
                .map(|(index, feature)| FeatureSummary {
                    index,
                    id: feature.id,
                    name: display_name(feature.id),
                })
                .collect();
        }

        if let Some(feature) = device.get_feature::<DeviceTypeAndNameFeature>() {
            entry.name = feature.get_whole_device_name().await?;
        }

        if let Some(feature) = device.get_feature::<UnifiedBatteryFeature>() {
            entry.battery = Some(feature.get_battery_info().await?);
        }

        Ok(())
    }

    /// Returns the opened device in `slot`, opening it and reading its
    /// feature table on first use.
    async fn open_device(&self, slot: u8) -> Result<Device, DaemonError> {
        if let Some(device) = lock(&self.devices).get(&slot).cloned() {
            return Ok(device);
        }

        let mut device = Device::new(Arc::clone(&self.chan), slot).await?;
        let table = device.enumerate_features().await?.clone();

        lock(&self.tables).insert(slot, table);
        lock(&self.devices).insert(slot, device.clone());
        Ok(device)
    }

    /// Writes the stored settings of the device in `slot`, logging failures.
    async fn apply_stored(&self, slot: u8) {
        let Some(device) = self.registry.device(&self.id, slot) else {
            return;
        };
        if device.config_mismatch || device.settings.is_empty() {
            return;
        }

        let result = async {
            let handle = self.open_device(slot).await?;
            settings::apply_all(&handle, &device.settings).await
        }
        .await;

        match self.track(slot, result) {
            Ok(()) => debug!(receiver = %self.id, slot, "applied stored settings"),
            Err(err) => warn!(receiver = %self.id, slot, "could not apply stored settings: {err}"),
        }
    }

    /// Records the outcome of an exchange with the device in `slot`.
    fn track<T>(&self, slot: u8, result: Result<T, DaemonError>) -> Result<T, DaemonError> {
        match &result {
            Ok(_) => {
                self.registry.update_state(&self.id, slot, StateUpdate::Activity);
            },
            Err(err) if err.is_miss() => {
                self.registry.update_state(&self.id, slot, StateUpdate::Miss);
            },
            Err(_) => {},
        }
        result
    }

    async fn persist(&self, identity: &str, entry: &StoreEntry) {
        if let Err(err) = self.store.save(identity, entry).await {
            warn!(identity, "could not persist device metadata: {err}");
        }
    }

    async fn run(self: Arc<Self>, events: flume::Receiver<SessionEvent>) {
        while let Ok(event) = events.recv_async().await {
            match event {
                SessionEvent::Notification(frame) => self.route(frame),
                SessionEvent::TransportLost(reason) => {
                    warn!(receiver = %self.id, "receiver lost: {reason}");
                    self.cancel_pairing();
                    self.registry.remove(&self.id, self.lease);
                    break;
                },
            }
        }

        trace!(receiver = %self.id, "worker stopped");
    }

    /// Routes a notification. Follow-up I/O runs on its own task so the
    /// worker never waits on the channel it drains.
    fn route(self: &Arc<Self>, frame: Frame) {
        let header = frame.header();

        if frame.is_receiver_level() {
            // Pairing notifications are consumed by the pairing driver.
            trace!(receiver = %self.id, sub_id = header.feature_index, "receiver notification");
            return;
        }

        let slot = header.device_index;

        if let Some(BoltEvent::DeviceConnection(connection)) = BoltEvent::parse(&frame) {
            self.on_connection(slot, connection.online);
            return;
        }

        let feature_id = lock(&self.tables)
            .get(&slot)
            .and_then(|table| table.id_at(header.feature_index));
        let Some(feature_id) = feature_id else {
            trace!(receiver = %self.id, slot, index = header.feature_index, "event of an unknown feature");
            return;
        };

        let event = header.function_id();
        let payload = frame.payload();

        match feature_id {
            UnifiedBatteryFeature::ID => {
                if let Some(BatteryEvent::InfoUpdate(info)) =
                    UnifiedBatteryFeature::parse_event(event, payload)
                {
                    self.registry
                        .update_state(&self.id, slot, StateUpdate::Battery(info));
                    return;
                }
            },
            WirelessDeviceStatusFeature::ID => {
                if let Some(WirelessDeviceStatusEvent::StatusBroadcast(broadcast)) =
                    WirelessDeviceStatusFeature::parse_event(event, payload)
                {
                    if broadcast.needs_reconfiguration() {
                        debug!(receiver = %self.id, slot, "device asks to be reconfigured");
                        self.spawn_reapply(slot);
                    }
                }
            },
            HiResWheelFeature::ID => {
                if let Some(HiResWheelEvent::RatchetSwitch(state)) =
                    HiResWheelFeature::parse_event(event, payload)
                {
                    debug!(receiver = %self.id, slot, ?state, "ratchet switched");
                }
            },
            _ => {},
        }

        self.registry
            .update_state(&self.id, slot, StateUpdate::Activity);
    }

    fn on_connection(self: &Arc<Self>, slot: u8, online: bool) {
        if !online {
            self.registry
                .update_state(&self.id, slot, StateUpdate::Detached);
            return;
        }

        match self.registry.update_state(&self.id, slot, StateUpdate::Activity) {
            None => {
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    let _section = session.section.lock().await;
                    if session.registry.device(&session.id, slot).is_some() {
                        return;
                    }
                    if let Err(err) = session.adopt_device(slot).await {
                        warn!(receiver = %session.id, slot, "could not add device: {err}");
                    }
                });
            },
            Some((before, ConnectionState::Connected)) if before != ConnectionState::Connected => {
                // Devices with WirelessDeviceStatus announce when they need it.
                let announces = lock(&self.tables)
                    .get(&slot)
                    .is_some_and(|table| table.index_of(WirelessDeviceStatusFeature::ID).is_some());
                if !announces {
                    self.spawn_reapply(slot);
                }
            },
            Some(_) => {},
        }
    }

    fn spawn_reapply(self: &Arc<Self>, slot: u8) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _section = session.section.lock().await;
            session.apply_stored(slot).await;
        });
    }
}
