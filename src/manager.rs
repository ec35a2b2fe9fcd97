use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::journal::{FEED_CAPACITY, PortLog};
use crate::server::PortListener;

pub const DEFAULT_PORTS: [u16; 5] = [12345, 12346, 12347, 12348, 12349];

pub const STATE_FILE: &str = "estado_puertos.txt";

/// Called with `(port, running)` whenever a port comes up or goes down.
pub type Indicator = Arc<dyn Fn(u16, bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Every stop is followed by one delayed restart.
    AutoRestart,
    /// Stopped ports stay down.
    Permanent,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub data_dir: PathBuf,
    pub bind_host: IpAddr,
    pub ports: Vec<u16>,
    pub restart_delay: Duration,
    pub restart_policy: RestartPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("server_data"),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: DEFAULT_PORTS.to_vec(),
            restart_delay: Duration::from_secs(3),
            restart_policy: RestartPolicy::AutoRestart,
        }
    }
}

// a failed bind stays enabled so the watchdog retries it
#[derive(Default)]
struct PortSlot {
    enabled: bool,
    listener: Option<PortListener>,
}

struct Inner {
    config: ManagerConfig,
    slots: DashMap<u16, PortSlot>,
    feeds: DashMap<u16, broadcast::Sender<String>>,
    restarts: DashMap<u16, JoinHandle<()>>,
    operative: AtomicBool,
    indicator: Option<Indicator>,
}

#[derive(Clone)]
pub struct PortManager {
    inner: Arc<Inner>,
}

impl PortManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_indicator(config: ManagerConfig, indicator: Indicator) -> Self {
        Self::build(config, Some(indicator))
    }

    fn build(config: ManagerConfig, indicator: Option<Indicator>) -> Self {
        let slots = DashMap::new();
        for port in &config.ports {
            slots.insert(*port, PortSlot::default());
        }

        Self {
            inner: Arc::new(Inner {
                config,
                slots,
                feeds: DashMap::new(),
                restarts: DashMap::new(),
                operative: AtomicBool::new(true),
                indicator,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn is_operative(&self) -> bool {
        self.inner.operative.load(Ordering::SeqCst)
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.inner.slots.iter().map(|s| *s.key()).collect();
        ports.sort_unstable();
        ports
    }

    pub fn enabled_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .inner
            .slots
            .iter()
            .filter(|s| s.enabled)
            .map(|s| *s.key())
            .collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_enabled(&self, port: u16) -> bool {
        self.inner.slots.get(&port).is_some_and(|s| s.enabled)
    }

    pub fn is_running(&self, port: u16) -> bool {
        self.inner
            .slots
            .get(&port)
            .is_some_and(|s| s.listener.as_ref().is_some_and(PortListener::is_alive))
    }

    pub fn list_users(&self, port: u16) -> Vec<String> {
        self.inner
            .slots
            .get(&port)
            .and_then(|s| s.listener.as_ref().map(PortListener::users))
            .unwrap_or_default()
    }

    /// Operator log feed of a port. Survives listener restarts.
    pub fn subscribe_log(&self, port: u16) -> broadcast::Receiver<String> {
        self.feed(port).subscribe()
    }

    /// Publishes an operator line on a port's feed.
    pub fn log<S: Into<String>>(&self, port: u16, line: S) {
        let line = line.into();

        info!(port, "{line}");

        let _ = self.feed(port).send(line);
    }

    fn feed(&self, port: u16) -> broadcast::Sender<String> {
        self.inner
            .feeds
            .entry(port)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn indicate(&self, port: u16, running: bool) {
        if let Some(indicator) = &self.inner.indicator {
            indicator(port, running);
        }
    }

    pub fn start(&self, port: u16) -> Result<(), ControlError> {
        if !self.is_operative() {
            return Err(ControlError::Disposed);
        }

        if let Some((_, pending)) = self.inner.restarts.remove(&port) {
            pending.abort();
        }

        {
            let mut slot = self.inner.slots.entry(port).or_default();
            slot.enabled = true;

            if slot.listener.as_ref().is_some_and(PortListener::is_alive) {
                return Err(ControlError::AlreadyRunning(port));
            }

            // a dead accept loop is replaced, not kept
            slot.listener = None;

            let log = PortLog::new(port, &self.inner.config.data_dir, self.feed(port));
            let listener = PortListener::bind(self.inner.config.bind_host, port, log)?;

            slot.listener = Some(listener);
        }

        self.log(port, format!("Server started on port {port}"));
        self.indicate(port, true);

        Ok(())
    }

    /// Stops a port under the configured restart policy.
    pub async fn stop(&self, port: u16) -> Result<(), ControlError> {
        self.stop_with(port, self.inner.config.restart_policy).await
    }

    pub async fn stop_with(&self, port: u16, policy: RestartPolicy) -> Result<(), ControlError> {
        if !self.is_operative() {
            return Err(ControlError::Disposed);
        }

        let listener = self.inner.slots.get_mut(&port).and_then(|mut slot| {
            slot.enabled = false;
            slot.listener.take()
        });

        let Some(mut listener) = listener else {
            return Err(ControlError::NotRunning(port));
        };

        listener.shutdown().await;

        self.log(port, format!("Server stopped on port {port}"));
        self.indicate(port, false);

        if policy == RestartPolicy::AutoRestart {
            self.schedule_restart(port);
        }

        Ok(())
    }

    pub fn restart_pending(&self, port: u16) -> bool {
        self.inner.restarts.contains_key(&port)
    }

    fn schedule_restart(&self, port: u16) {
        let Entry::Vacant(vacant) = self.inner.restarts.entry(port) else {
            debug!(port, "restart already pending");
            return;
        };

        let delay = self.inner.config.restart_delay;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        self.log(port, format!("Restarting port {port} in {} ms", delay.as_millis()));

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let manager = PortManager { inner };

            manager.inner.restarts.remove(&port);

            match manager.start(port) {
                Ok(()) => manager.log(port, format!("Port {port} restarted automatically")),
                Err(ControlError::AlreadyRunning(_)) => debug!(port, "already running, restart skipped"),
                Err(e) => manager.log(port, format!("Automatic restart of port {port} failed: {e}")),
            }
        });

        vacant.insert(timer);
    }

    pub fn state_file(&self) -> PathBuf {
        self.inner.config.data_dir.join(STATE_FILE)
    }

    /// Writes the enabled ports as `PUERTO:<N>` lines.
    pub async fn save_state(&self) -> Result<(), ControlError> {
        let path = self.state_file();
        let fail = |source| ControlError::State {
            path: path.clone(),
            source,
        };

        let body: String = self
            .enabled_ports()
            .iter()
            .map(|port| format!("PUERTO:{port}\n"))
            .collect();

        tokio::fs::create_dir_all(&self.inner.config.data_dir)
            .await
            .map_err(fail)?;
        tokio::fs::write(&path, body).await.map_err(fail)?;

        Ok(())
    }

    /// Reads the desired-state file. `None` when it does not exist.
    pub async fn load_state(&self) -> Result<Option<Vec<u16>>, ControlError> {
        let path = self.state_file();

        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ControlError::State { path, source }),
        };

        let ports = body
            .lines()
            .filter_map(|line| line.trim().strip_prefix("PUERTO:"))
            .filter_map(|n| n.trim().parse::<u16>().ok())
            .collect();

        Ok(Some(ports))
    }

    /// Starts every port listed in the desired-state file and returns the
    /// ports that came up. `None` when there is no saved state.
    pub async fn restore_state(&self) -> Result<Option<Vec<u16>>, ControlError> {
        let Some(ports) = self.load_state().await? else {
            return Ok(None);
        };

        let mut started = Vec::new();
        for port in ports {
            match self.start(port) {
                Ok(()) => started.push(port),
                Err(ControlError::AlreadyRunning(_)) => started.push(port),
                Err(e) => {
                    warn!(port, error = %e, "could not restore port");
                    self.log(port, format!("Could not restore port {port}: {e}"));
                }
            }
        }

        Ok(Some(started))
    }

    /// Persists desired state, then stops everything without scheduling
    /// restarts. The manager rejects control calls afterwards.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        if !self.is_operative() {
            return Ok(());
        }

        let saved = self.save_state().await;

        self.inner.operative.store(false, Ordering::SeqCst);

        let pending: Vec<u16> = self.inner.restarts.iter().map(|r| *r.key()).collect();
        for port in pending {
            if let Some((_, timer)) = self.inner.restarts.remove(&port) {
                timer.abort();
            }
        }

        let mut listeners = Vec::new();
        for mut slot in self.inner.slots.iter_mut() {
            if let Some(listener) = slot.listener.take() {
                listeners.push(listener);
            }
        }

        for mut listener in listeners {
            listener.shutdown().await;
            self.indicate(listener.port(), false);
        }

        saved
    }
}
