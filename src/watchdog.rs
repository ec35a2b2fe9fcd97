use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::manager::PortManager;

/// Builds a replacement manager when the bound one cannot recover.
pub type ManagerFactory = Arc<dyn Fn() -> PortManager + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub probe_host: IpAddr,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            probe_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub alive: Vec<u16>,
    /// Restarted on the bound manager.
    pub restarted: Vec<u16>,
    /// Restarted on a freshly built manager, which is now bound.
    pub escalated: Vec<u16>,
    pub failed: Vec<u16>,
    /// The bound manager was disposed and got replaced before probing.
    pub recreated: bool,
}

pub struct Watchdog {
    config: WatchdogConfig,
    current: watch::Sender<PortManager>,
    factory: ManagerFactory,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, manager: PortManager, factory: ManagerFactory) -> Self {
        let (current, _) = watch::channel(manager);

        Self {
            config,
            current,
            factory,
        }
    }

    pub fn manager(&self) -> PortManager {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PortManager> {
        self.current.subscribe()
    }

    pub fn rebind(&self, manager: PortManager) {
        self.current.send_replace(manager);
    }

    /// True if something accepts a TCP connection on `port` in time.
    pub async fn probe(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.config.probe_host, port);

        matches!(
            tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    /// Probes every enabled port once. A dead port gets exactly one
    /// restart attempt, escalated to a fresh manager if the bound one
    /// refuses.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let mut manager = self.manager();

        if !manager.is_operative() {
            warn!("bound port manager is no longer operative, creating a new one");

            manager = (self.factory)();
            if let Err(e) = manager.restore_state().await {
                warn!(error = %e, "could not restore desired state on the new manager");
            }

            self.rebind(manager.clone());
            report.recreated = true;
        }

        for port in manager.enabled_ports() {
            if self.probe(port).await {
                debug!(port, "port is alive");
                report.alive.push(port);
                continue;
            }

            manager.log(port, format!("Port {port} is down. Trying to restart..."));

            let err = match manager.start(port) {
                Ok(()) => {
                    manager.log(port, format!("Port {port} restarted on the current manager"));
                    report.restarted.push(port);
                    continue;
                }
                Err(e) => e,
            };

            manager.log(port, format!("Error restarting port {port}: {err}"));

            let fresh = self.replace(&manager, port).await;

            match fresh.start(port) {
                Ok(()) => {
                    info!(port, "port restarted on a new manager");
                    fresh.log(port, format!("Port {port} restarted on a new manager"));
                    report.escalated.push(port);
                }
                Err(e) => {
                    // stays enabled on the new manager, retried next cycle
                    warn!(port, error = %e, "could not restart port on a new manager");
                    fresh.log(port, format!("Could not restart port {port} on a new manager: {e}"));
                    report.failed.push(port);
                }
            }

            manager = fresh;
        }

        report
    }

    /// Shuts `old` down and binds a fresh manager that carries every port
    /// `old` had enabled, except `escalated`, which the caller starts.
    async fn replace(&self, old: &PortManager, escalated: u16) -> PortManager {
        let carried = old.enabled_ports();

        if let Err(e) = old.shutdown().await {
            warn!(error = %e, "could not save state of the replaced manager");
        }

        let fresh = (self.factory)();
        for port in carried.into_iter().filter(|p| *p != escalated) {
            if let Err(e) = fresh.start(port) {
                warn!(port, error = %e, "could not carry port over to the new manager");
            }
        }

        self.rebind(fresh.clone());
        fresh
    }

    /// Runs probe cycles every interval until `stop` turns true or its
    /// sender goes away.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    debug!(?report, "watchdog cycle finished");
                }
            }
        }

        info!("watchdog stopped");
    }
}
