use std::fmt;
use std::net::IpAddr;
use std::sync::mpsc::{SyncSender, TrySendError};

use pnet::util::MacAddr;

/// One observed Wake-on-LAN request, as emitted by a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WolEvent {
    pub target: MacAddr,
    /// Transport and peer, only used for logging (`udp 192.168.1.5:50123`, `ether br0`).
    pub source: String,
    /// Present for UDP, absent for raw link-layer frames.
    pub source_ip: Option<IpAddr>,
}

impl fmt::Display for WolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mac={} from={}", self.target, self.source)
    }
}

/// Hands an event to the dispatch queue without blocking the listener.
///
/// Returns `false` once the dispatcher is gone and the listener should stop.
pub fn forward(tx: &SyncSender<WolEvent>, event: WolEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            log::warn!("dispatch queue full, dropping {}", event);
            true
        },
        Err(TrySendError::Disconnected(_)) => false,
    }
}
