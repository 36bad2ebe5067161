//! Routes client commands to the receiver sessions, the registry and the
//! store.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::MAX_PAIRING_TIMEOUT_SECS,
    error::DaemonError,
    ipc::{Reply, Request, Response},
    pairing,
    registry::{ConnectionState, DeviceEntry, Registry, Snapshot},
    session::ReceiverSession,
    settings::{Setting, SettingValue},
    store::Store,
};

/// The result of a `configure` command.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ConfigureOutcome {
    pub device: DeviceEntry,

    /// Whether the device took the new value. Unset if it is disconnected or
    /// did not answer, in which case the value is applied on reconnect.
    pub applied: bool,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    store: Arc<Store>,
    pairing_timeout: Duration,

    /// Open receivers by ID.
    sessions: RwLock<BTreeMap<String, Arc<ReceiverSession>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, store: Arc<Store>, pairing_timeout: Duration) -> Self {
        Self {
            registry,
            store,
            pairing_timeout,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<ReceiverSession>>> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<ReceiverSession>>> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Adds an opened receiver. A previous session of the same receiver is
    /// closed.
    pub fn insert_session(&self, session: Arc<ReceiverSession>) {
        let previous = self.write().insert(session.id().to_string(), session);
        if let Some(previous) = previous {
            if !previous.is_closed() {
                warn!(receiver = previous.id(), "receiver opened twice, closing the older handle");
                previous.close();
            }
        }
    }

    /// Removes the session opened on the node at `path`.
    pub fn remove_session_at(&self, path: &str) -> Option<Arc<ReceiverSession>> {
        let mut sessions = self.write();
        let id = sessions
            .values()
            .find(|session| session.path() == path)
            .map(|session| session.id().to_string())?;
        sessions.remove(&id)
    }

    /// Removes all sessions.
    pub fn take_sessions(&self) -> Vec<Arc<ReceiverSession>> {
        std::mem::take(&mut *self.write()).into_values().collect()
    }

    pub fn sessions(&self) -> Vec<Arc<ReceiverSession>> {
        self.read().values().cloned().collect()
    }

    pub fn session(&self, receiver_id: &str) -> Result<Arc<ReceiverSession>, DaemonError> {
        self.read()
            .get(receiver_id)
            .filter(|session| !session.is_closed())
            .cloned()
            .ok_or_else(|| DaemonError::ReceiverNotFound(receiver_id.to_string()))
    }

    pub fn show(&self) -> Snapshot {
        self.registry.snapshot()
    }

    /// Persists a setting of a device and writes it to the device if it is
    /// connected.
    pub async fn configure(
        &self,
        device_id: &str,
        setting: Setting,
        value: SettingValue,
    ) -> Result<ConfigureOutcome, DaemonError> {
        setting.check(value)?;

        let device = self.find_device(device_id)?;
        let session = self.session(&device.receiver).ok();
        let _section = match &session {
            Some(session) => Some(session.section().lock().await),
            None => None,
        };

        if let Some(session) = &session {
            if session.supports(device.slot, setting) == Some(false) {
                return Err(DaemonError::InvalidSetting(format!(
                    "{} does not support {setting}",
                    device.identity
                )));
            }
        }

        let entry = self.registry.set_setting(&device, setting, value);
        let saved = self.store.save(&device.identity, &entry).await;

        let applied = match &session {
            Some(session) if device.state != ConnectionState::Disconnected => {
                match session.apply_setting(device.slot, setting, value).await {
                    Ok(()) => true,
                    Err(err) if err.is_miss() => {
                        warn!(identity = %device.identity, %setting, "device did not answer: {err}");
                        false
                    },
                    Err(err) => return Err(err),
                }
            },
            _ => false,
        };

        // The registry keeps the new value even if it could not be stored.
        saved?;

        info!(identity = %device.identity, %setting, %value, applied, "setting changed");
        Ok(ConfigureOutcome {
            device: self.find_device(device_id)?,
            applied,
        })
    }

    /// Pairs a new device to a receiver, blocking until the attempt ends.
    pub async fn pair(
        &self,
        receiver_id: &str,
        timeout: Option<Duration>,
    ) -> Result<DeviceEntry, DaemonError> {
        let timeout = timeout.unwrap_or(self.pairing_timeout);
        if timeout.is_zero() || timeout > Duration::from_secs(MAX_PAIRING_TIMEOUT_SECS) {
            return Err(DaemonError::InvalidSetting(format!(
                "the pairing timeout must be within 1..={MAX_PAIRING_TIMEOUT_SECS} seconds"
            )));
        }

        let session = self.session(receiver_id)?;
        let cancel = session.begin_pairing()?;

        let result = async {
            let _section = session.section().lock().await;
            pairing::run(&session, timeout, cancel).await
        }
        .await;

        session.end_pairing();
        result
    }

    /// Cancels the pairing attempt running on a receiver. Returns whether
    /// there was one.
    pub fn cancel_pair(&self, receiver_id: &str) -> Result<bool, DaemonError> {
        Ok(self.session(receiver_id)?.cancel_pairing())
    }

    /// Unpairs a device. Its stored settings are kept.
    pub async fn unpair(&self, device_id: &str) -> Result<DeviceEntry, DaemonError> {
        let device = self.find_device(device_id)?;
        let session = self.session(&device.receiver)?;
        let _section = session.section().lock().await;

        session.bolt().unpair_device(device.slot).await?;
        session.forget_device(device.slot);
        self.registry.remove_device(&device.receiver, device.slot);

        info!(receiver = %device.receiver, slot = device.slot, identity = %device.identity, "device unpaired");
        Ok(device)
    }

    pub async fn handle(&self, request: Request) -> Response {
        let result = match request {
            Request::Show => Ok(Reply::Snapshot(self.show())),
            Request::Configure {
                device,
                setting,
                value,
            } => match setting
                .parse::<Setting>()
                .and_then(|setting| Ok((setting, setting.parse_value(&value)?)))
            {
                Ok((setting, value)) => self
                    .configure(&device, setting, value)
                    .await
                    .map(Reply::Configured),
                Err(err) => Err(err),
            },
            Request::Pair {
                receiver,
                timeout_secs,
            } => self
                .pair(&receiver, timeout_secs.map(Duration::from_secs))
                .await
                .map(Reply::Paired),
            Request::CancelPair {
                receiver,
            } => self
                .cancel_pair(&receiver)
                .map(|cancelled| Reply::PairingCancelled {
                    cancelled,
                }),
            Request::Unpair {
                device,
            } => self.unpair(&device).await.map(Reply::Unpaired),
        };

        Response::from(result)
    }

    fn find_device(&self, device_id: &str) -> Result<DeviceEntry, DaemonError> {
        self.registry
            .find_device(device_id)
            .ok_or_else(|| DaemonError::DeviceNotFound(device_id.to_string()))
    }
}
