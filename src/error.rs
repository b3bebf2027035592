//! Error types shared by the listeners, the index and the configuration loader.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop a listener or prevent startup.
#[derive(Debug, Error)]
pub enum Error {
    /// None of the configured UDP ports could be bound
    #[error("no UDP listener could be started on ports {0:?}")]
    NoUdpListener(Vec<u16>),

    /// Binding a single UDP port failed
    #[error("failed to bind UDP port {port}: {source}")]
    UdpBind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The named interface does not exist
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The datalink layer handed out something other than an Ethernet channel
    #[error("no ethernet channel available on interface {0}")]
    UnsupportedChannel(String),

    /// Fatal receive error on the raw link-layer socket
    #[error("raw receive on {iface} failed: {source}")]
    RawReceive {
        iface: String,
        #[source]
        source: io::Error,
    },

    /// Reading the configuration file failed
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid YAML for our schema
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    /// The configuration parsed but is not usable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
