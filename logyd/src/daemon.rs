//! The daemon lifecycle: startup, shutdown, suspend, resume and hotplug.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use hidpp::channel::ChannelError;
use tokio::{
    signal::unix::{SignalKind, signal},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    config::DaemonConfig,
    dispatcher::Dispatcher,
    error::DaemonError,
    ipc,
    registry::Registry,
    session::ReceiverSession,
    store::Store,
    transport::NodeSource,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Hotplug {
    Arrived,
    Removed,
}

pub struct Daemon {
    config: DaemonConfig,
    source: Arc<dyn NodeSource>,
    dispatcher: Arc<Dispatcher>,

    /// The only node to use, if one was given.
    required: Option<String>,

    /// Receiver interfaces that do not speak HID++.
    ignored: Mutex<HashSet<String>>,

    /// Nodes to reopen on resume.
    suspended: Mutex<Option<Vec<String>>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        source: Arc<dyn NodeSource>,
        required: Option<String>,
    ) -> Result<Self, DaemonError> {
        let store = Arc::new(Store::open(&config.state_dir)?);
        let registry = Arc::new(Registry::new(config.grace_misses));
        let dispatcher = Arc::new(Dispatcher::new(registry, store, config.pairing_timeout()));

        Ok(Self {
            config,
            source,
            dispatcher,
            required,
            ignored: Mutex::new(HashSet::new()),
            suspended: Mutex::new(None),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Loads the stored settings and opens every receiver present.
    ///
    /// Fails only if the required receiver cannot be opened.
    pub async fn on_start(&self) -> Result<(), DaemonError> {
        let configs = self.dispatcher.store().load();
        self.dispatcher.registry().set_configs(configs);

        match &self.required {
            Some(path) => {
                if self.open(path).await?.is_none() {
                    return Err(DaemonError::ReceiverNotFound(path.clone()));
                }
            },
            None => self.rescan().await,
        }

        info!(receivers = self.dispatcher.sessions().len(), "daemon started");
        Ok(())
    }

    /// Closes every receiver. Pending requests fail with
    /// [`DaemonError::Cancelled`].
    pub async fn on_shutdown(&self) {
        for session in self.dispatcher.take_sessions() {
            session.close();
        }
        info!("daemon stopped");
    }

    /// Closes every receiver, remembering them for [`Self::on_resume`].
    pub async fn on_suspend(&self) {
        if self.is_suspended() {
            return;
        }

        let sessions = self.dispatcher.take_sessions();
        let paths = sessions
            .iter()
            .map(|session| session.path().to_string())
            .collect();

        for session in sessions {
            session.close();
        }

        *lock(&self.suspended) = Some(paths);
        info!("suspended");
    }

    /// Reopens the receivers closed by [`Self::on_suspend`] and rediscovers
    /// their devices.
    pub async fn on_resume(&self) {
        let Some(paths) = lock(&self.suspended).take() else {
            return;
        };

        for path in paths {
            if let Err(err) = self.open(&path).await {
                warn!(%path, "could not reopen receiver: {err}");
            }
        }

        if self.required.is_none() {
            self.rescan().await;
        }
        self.ping_devices().await;
        info!("resumed");
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.suspended).is_some()
    }

    pub async fn on_hotplug(&self, path: &str, event: Hotplug) {
        match event {
            Hotplug::Arrived => {
                if self.is_open(path) || lock(&self.ignored).contains(path) {
                    return;
                }
                if self.required.as_deref().is_some_and(|required| required != path) {
                    return;
                }

                info!(%path, "receiver arrived");
                if let Err(err) = self.open(path).await {
                    warn!(%path, "could not open receiver: {err}");
                }
            },
            Hotplug::Removed => {
                lock(&self.ignored).remove(path);

                if let Some(session) = self.dispatcher.remove_session_at(path) {
                    info!(%path, receiver = session.id(), "receiver removed");
                    session.close();
                }
            },
        }
    }

    /// Compares the present nodes with the open receivers and turns the
    /// difference into hotplug events.
    pub async fn rescan(&self) {
        let nodes = match self.source.scan().await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!("could not list HID nodes: {err}");
                return;
            },
        };
        let present: HashSet<String> = nodes.into_iter().map(|node| node.path).collect();

        for session in self.dispatcher.sessions() {
            if session.is_closed() || !present.contains(session.path()) {
                self.on_hotplug(session.path(), Hotplug::Removed).await;
            }
        }

        lock(&self.ignored).retain(|path| present.contains(path));

        for path in &present {
            self.on_hotplug(path, Hotplug::Arrived).await;
        }
    }

    /// Pings the devices of every open receiver so that silent devices
    /// become unreachable.
    pub async fn ping_devices(&self) {
        for session in self.dispatcher.sessions() {
            if !session.is_closed() {
                session.ping_devices().await;
            }
        }
    }

    fn is_open(&self, path: &str) -> bool {
        self.dispatcher
            .sessions()
            .iter()
            .any(|session| session.path() == path && !session.is_closed())
    }

    /// Opens the receiver at `path` and discovers its devices.
    ///
    /// Returns [`None`] if the node does not speak HID++.
    async fn open(&self, path: &str) -> Result<Option<Arc<ReceiverSession>>, DaemonError> {
        let chan = match self.source.open(path, self.config.poll_interval()).await {
            Ok(chan) => chan,
            Err(ChannelError::HidppNotSupported) => {
                debug!(%path, "node does not speak HID++");
                lock(&self.ignored).insert(path.to_string());
                return Ok(None);
            },
            Err(err) => return Err(err.into()),
        };
        chan.set_timeout(self.config.request_timeout());

        let session = ReceiverSession::open(
            chan,
            Arc::clone(self.dispatcher.registry()),
            Arc::clone(self.dispatcher.store()),
        )
        .await?;
        self.dispatcher.insert_session(Arc::clone(&session));

        let _section = session.section().lock().await;
        match session.discover().await {
            Ok(devices) => info!(receiver = session.id(), count = devices.len(), "discovered devices"),
            Err(err) => warn!(receiver = session.id(), "could not discover devices: {err}"),
        }

        Ok(Some(Arc::clone(&session)))
    }

    /// Runs the daemon until SIGINT or SIGTERM. SIGUSR1 and SIGUSR2 suspend
    /// and resume it.
    pub async fn run(self: Arc<Self>) -> Result<(), DaemonError> {
        self.on_start().await?;

        let server = ipc::serve(&self.config.socket_path, Arc::clone(&self.dispatcher))?;
        info!(socket = %self.config.socket_path.display(), "accepting commands");

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut suspend = signal(SignalKind::user_defined1())?;
        let mut resume = signal(SignalKind::user_defined2())?;

        let mut rescan = tokio::time::interval(self.config.rescan_interval());
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rescan.tick().await;

        loop {
            tokio::select! {
                _ = terminate.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                },
                _ = interrupt.recv() => {
                    info!("received SIGINT, shutting down");
                    break;
                },
                _ = suspend.recv() => self.on_suspend().await,
                _ = resume.recv() => self.on_resume().await,
                _ = rescan.tick(), if !self.is_suspended() => {
                    self.rescan().await;
                    self.ping_devices().await;
                },
            }
        }

        server.abort();
        self.on_shutdown().await;
        ipc::remove_socket(&self.config.socket_path);

        Ok(())
    }
}
