pub mod client;
pub mod codegen;
pub mod config;
pub mod conn;
pub mod error;
pub mod image;
pub mod journal;
pub mod manager;
pub mod protocol;
pub mod room;
pub mod server;
pub mod watchdog;

pub use client::{ClientConfig, ClientEvent, ConnState, Connector};
pub use manager::{ManagerConfig, PortManager, RestartPolicy};
pub use server::PortListener;
pub use watchdog::{Watchdog, WatchdogConfig};
