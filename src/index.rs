//! MAC → target index, rebuilt from scratch on a timer.
//!
//! Every refresh produces a new immutable map which is swapped in under the
//! write lock. Readers clone the `Arc` of whichever map is current under the
//! read lock, so a lookup never sees a half-built index.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use pnet::util::MacAddr;
use tokio_util::sync::CancellationToken;

use crate::common::parse_mac;
use crate::descriptor::{DescriptorSource, EnablementStore};

/// A manageable target (a libvirt domain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub uuid: String,
    pub macs: Vec<MacAddr>,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

pub type TargetMap = HashMap<MacAddr, Arc<Target>>;

pub struct TargetIndex {
    source: Box<dyn DescriptorSource>,
    enablement: Box<dyn EnablementStore>,
    by_mac: RwLock<Arc<TargetMap>>,
}

impl TargetIndex {
    /// Creates an empty index; call [`TargetIndex::refresh`] to populate it.
    pub fn new(source: impl DescriptorSource + 'static, enablement: impl EnablementStore + 'static) -> Self {
        Self {
            source: Box::new(source),
            enablement: Box::new(enablement),
            by_mac: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Builds a fresh map of every enabled target's MACs.
    ///
    /// Descriptors without a name or UUID are skipped. When two targets claim the same
    /// MAC the one processed last wins.
    pub fn build(&self) -> TargetMap {
        let enablement = self.enablement.load();
        let mut by_mac: TargetMap = HashMap::new();

        for desc in self.source.descriptors() {
            if desc.name.is_empty() || desc.uuid.is_empty() {
                log::debug!("[index] skipping descriptor without name or uuid: {:?}", desc);
                continue;
            }

            let macs: Vec<MacAddr> = desc.macs.iter()
                .filter_map(|text| {
                    let mac = parse_mac(text);
                    if mac.is_none() {
                        log::debug!("[index] {}: ignoring malformed MAC {:?}", desc.name, text);
                    }
                    mac
                })
                .collect();

            let enabled: Vec<MacAddr> = macs.iter()
                .copied()
                .filter(|mac| enablement.is_enabled(&desc.uuid, mac))
                .collect();
            if enabled.is_empty() { continue; }

            let target = Arc::new(Target { name: desc.name, uuid: desc.uuid, macs });
            for mac in enabled {
                if let Some(prev) = by_mac.insert(mac, Arc::clone(&target)) {
                    if prev.uuid != target.uuid {
                        log::warn!("[index] MAC {} claimed by both {} and {}, using {}",
                            mac, prev, target, target.name);
                    }
                }
            }
        }

        by_mac
    }

    /// Rebuilds the index and swaps it in. Returns the number of indexed MACs.
    pub fn refresh(&self) -> usize {
        let fresh = Arc::new(self.build());
        let count = fresh.len();

        let mut current = self.by_mac.write().unwrap_or_else(PoisonError::into_inner);
        if current.len() != count {
            log::info!("[index] {} enabled MAC(s) indexed (was {})", count, current.len());
        }
        *current = fresh;
        count
    }

    /// The map currently served to readers.
    pub fn snapshot(&self) -> Arc<TargetMap> {
        Arc::clone(&self.by_mac.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn find_by_mac(&self, mac: &MacAddr) -> Option<Arc<Target>> {
        self.by_mac.read().unwrap_or_else(PoisonError::into_inner).get(mac).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rebuilds `index` every `period` until `token` is cancelled.
pub async fn refresh_loop(index: Arc<TargetIndex>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => { log::trace!("[index] exit"); break; },
            _ = ticker.tick() => {
                let index = Arc::clone(&index);
                if let Err(e) = tokio::task::spawn_blocking(move || index.refresh()).await {
                    log::error!("[index] refresh task failed: {}", e);
                }
            },
        }
    }
}
