use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::client::ClientConfig;
use crate::error::ConfigError;
use crate::manager::{DEFAULT_PORTS, ManagerConfig, RestartPolicy};
use crate::watchdog::WatchdogConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,      // e.g. "server_data"
    pub bind_host: IpAddr,      // e.g. "0.0.0.0"
    pub ports: Vec<u16>,
    pub restart_delay_ms: u64,
    pub auto_restart: bool,
    pub watchdog: WatchdogSection,
    pub client: ClientSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub probe_host: IpAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub host: String,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("server_data"),
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: DEFAULT_PORTS.to_vec(),
            restart_delay_ms: 3000,
            auto_restart: true,
            watchdog: WatchdogSection::default(),
            client: ClientSection::default(),
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            probe_timeout_ms: 2000,
            probe_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            max_attempts: 3,
            retry_delay_ms: 3000,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            data_dir: self.data_dir.clone(),
            bind_host: self.bind_host,
            ports: self.ports.clone(),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            restart_policy: if self.auto_restart {
                RestartPolicy::AutoRestart
            } else {
                RestartPolicy::Permanent
            },
        }
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            interval: Duration::from_millis(self.watchdog.interval_ms),
            probe_timeout: Duration::from_millis(self.watchdog.probe_timeout_ms),
            probe_host: self.watchdog.probe_host,
        }
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            host: self.client.host.clone(),
            max_attempts: self.client.max_attempts,
            retry_delay: Duration::from_millis(self.client.retry_delay_ms),
        }
    }
}
