use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the port control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The listening socket could not be bound (usually: port in use).
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("port {0} is already running")]
    AlreadyRunning(u16),

    #[error("port {0} is not running")]
    NotRunning(u16),

    /// The manager was shut down and no longer accepts control calls.
    #[error("port manager is no longer operative")]
    Disposed,

    #[error("desired-state file {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A log or image write failed. Logged by the caller, never fatal.
#[derive(Debug, Error)]
#[error("failed to write {path}: {source}")]
pub struct PersistenceError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, Error)]
#[error("malformed image payload: {0}")]
pub struct DecodeError(#[from] pub base64::DecodeError);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("malformed {0} line")]
    Malformed(&'static str),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not connected")]
    NotConnected,

    #[error("could not reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
