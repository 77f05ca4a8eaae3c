//! Interface lifecycle monitor.
//!
//! Turns the level-triggered stream of kernel link notifications into
//! edge-triggered Up/Down events for interfaces matching a pattern. The
//! first pass over existing links synthesizes Up events for interfaces that
//! were already up when the monitor started.

use crate::error::Result;
use crate::kernel::LinkEventSource;
use crate::types::LinkState;
use regex::Regex;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Capacity of the event channel between monitor and supervisor.
pub const EVENT_CHANNEL_CAPACITY: usize = 5;

/// An edge in an interface's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Up(String),
    Down(String),
}

/// When a link counts as ready to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkReadiness {
    /// Oper state up and IFF_UP set.
    #[default]
    OperStateOnly,
    /// Additionally require transmitted packets, so a link is not bound
    /// before it carries traffic.
    RequireTraffic,
}

impl LinkReadiness {
    pub fn is_ready(&self, link: &LinkState) -> bool {
        let up = link.oper_state.is_up() && link.admin_up;
        match self {
            LinkReadiness::OperStateOnly => up,
            LinkReadiness::RequireTraffic => up && link.tx_packets.is_some_and(|tx| tx > 0),
        }
    }
}

/// Tracks which matching interfaces are currently considered up.
#[derive(Debug)]
pub struct InterfaceTracker {
    pattern: Regex,
    readiness: LinkReadiness,
    known: HashSet<String>,
    processed: u64,
}

impl InterfaceTracker {
    pub fn new(pattern: Regex, readiness: LinkReadiness) -> Self {
        Self {
            pattern,
            readiness,
            known: HashSet::new(),
            processed: 0,
        }
    }

    /// Feeds one link observation; returns the event it causes, if any.
    pub fn process(&mut self, link: &LinkState) -> Option<LinkEvent> {
        self.processed += 1;
        let ready = self.readiness.is_ready(link);
        let known = self.known.contains(&link.name);
        debug!(
            interface = %link.name,
            ctr = self.processed,
            state = %link.oper_state,
            admin_up = link.admin_up,
            known,
            "Processing interface"
        );

        if !self.pattern.is_match(&link.name) {
            debug!(interface = %link.name, "Skipping interface not matching regex");
            return None;
        }

        match (known, ready) {
            (false, true) => {
                self.known.insert(link.name.clone());
                info!(interface = %link.name, "New interface is up, emit up");
                Some(LinkEvent::Up(link.name.clone()))
            }
            (false, false) => {
                debug!(interface = %link.name, "Ignoring event, link not ready");
                None
            }
            (true, true) => {
                debug!(interface = %link.name, "Already up");
                None
            }
            (true, false) => {
                self.known.remove(&link.name);
                info!(interface = %link.name, "Interface went down");
                Some(LinkEvent::Down(link.name.clone()))
            }
        }
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(name)
    }
}

/// Pumps link notifications into the event channel.
pub struct NetlinkMonitor {
    tracker: InterfaceTracker,
    events: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
}

impl NetlinkMonitor {
    /// Creates a monitor and the receiving end of its event channel.
    pub fn new(pattern: Regex, readiness: LinkReadiness) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let monitor = Self {
            tracker: InterfaceTracker::new(pattern, readiness),
            events,
            cancel: CancellationToken::new(),
        };
        (monitor, rx)
    }

    /// Token that stops [`NetlinkMonitor::listen`] when cancelled.
    pub fn close_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Processes the snapshot, then live notifications, until closed.
    ///
    /// `source` must already be subscribed so nothing between the snapshot
    /// and the first live batch is lost. The event channel closes exactly
    /// once, when this returns.
    pub async fn listen<S: LinkEventSource>(mut self, mut source: S) -> Result<()> {
        info!("Processing existing interfaces");
        let existing = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            links = source.snapshot() => links?,
        };
        for link in &existing {
            if !self.dispatch(link).await {
                return Ok(());
            }
        }

        info!("Listening for events");
        loop {
            let batch = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Netlink listener closed");
                    return Ok(());
                }
                batch = source.next_batch() => batch?,
            };
            for link in &batch {
                if !self.dispatch(link).await {
                    return Ok(());
                }
            }
        }
    }

    /// Returns false once the monitor should stop.
    async fn dispatch(&mut self, link: &LinkState) -> bool {
        let Some(event) = self.tracker.process(link) else {
            return true;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!("Event receiver dropped");
                }
                sent.is_ok()
            }
        }
    }
}
