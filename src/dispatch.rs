//! Turns WOL events into start requests.
//!
//! Each event runs through: source allowlist, index lookup, debounce,
//! running-state check, start. Every step is terminal on a miss; nothing is
//! retried here since WOL senders repeat their packets anyway.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::allowlist::SourceAllowlist;
use crate::controller::Controller;
use crate::event::WolEvent;
use crate::index::TargetIndex;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// What happened to a single event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Started,
    SourceDenied,
    UnknownTarget,
    Debounced,
    AlreadyRunning,
    StartFailed,
}

/// Last successful start per target UUID.
#[derive(Debug)]
pub struct Debounce {
    window: Duration,
    last_start: Mutex<HashMap<String, Instant>>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self { window, last_start: Mutex::new(HashMap::new()) }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_suppressed(&self, id: &str) -> bool {
        let last_start = self.last_start.lock().unwrap_or_else(PoisonError::into_inner);
        last_start.get(id).is_some_and(|t| t.elapsed() < self.window)
    }

    pub fn record(&self, id: &str) {
        self.last_start.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), Instant::now());
    }

    pub fn last_start(&self, id: &str) -> Option<Instant> {
        self.last_start.lock().unwrap_or_else(PoisonError::into_inner).get(id).copied()
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

pub struct Dispatcher<C> {
    index: Arc<TargetIndex>,
    allowlist: SourceAllowlist,
    debounce: Debounce,
    controller: C,
}

impl<C: Controller> Dispatcher<C> {
    pub fn new(index: Arc<TargetIndex>, allowlist: SourceAllowlist, debounce: Debounce, controller: C) -> Self {
        Self { index, allowlist, debounce, controller }
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn debounce(&self) -> &Debounce {
        &self.debounce
    }

    pub fn handle(&self, event: &WolEvent) -> Outcome {
        if !self.allowlist.allows(event.source_ip) {
            log::debug!("[dispatch] {}: source not allowed", event);
            return Outcome::SourceDenied;
        }

        let Some(target) = self.index.find_by_mac(&event.target) else {
            log::debug!("[dispatch] {}: no enabled target", event);
            return Outcome::UnknownTarget;
        };

        if self.debounce.is_suppressed(&target.uuid) {
            log::debug!("[dispatch] {}: {} started less than {:?} ago", event, target.name, self.debounce.window());
            return Outcome::Debounced;
        }

        match self.controller.is_running(&target.name) {
            Ok(true) => {
                log::debug!("[dispatch] {}: {} already running", event, target.name);
                return Outcome::AlreadyRunning;
            },
            Ok(false) => {},
            Err(e) => log::warn!("[dispatch] cannot query state of {}, starting anyway: {}", target.name, e),
        }

        log::info!("[dispatch] {} -> start {}", event, target);
        if let Err(e) = self.controller.start(&target.name) {
            log::error!("[dispatch] start of {} failed: {}", target.name, e);
            return Outcome::StartFailed;
        }

        self.debounce.record(&target.uuid);
        Outcome::Started
    }

    /// Handles events in arrival order until the token is cancelled or every sender is gone.
    pub fn run(&self, rx: Receiver<WolEvent>, token: CancellationToken) {
        loop {
            if token.is_cancelled() { log::trace!("[dispatch] exit"); break; }

            let event = match rx.recv_timeout(RECV_TIMEOUT) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            self.handle(&event);
        }
    }
}
