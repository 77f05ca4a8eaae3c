//! Owns the per-VRF listeners and reacts to monitor events.
//!
//! Events are handled strictly one at a time, and a Down event's listener
//! is fully closed before the next event is read, so the listener map needs
//! no locking.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::frame::SERVER_PORT;
use crate::kernel::KernelLinks;
use crate::listener::Listener;
use crate::monitor::LinkEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, instrument, warn};

/// A running listener the supervisor can shut down.
#[async_trait]
pub trait ListenerHandle: Send + 'static {
    async fn close(self);
}

/// Creates listeners scoped to one interface.
pub trait ListenerFactory: Send {
    type Handle: ListenerHandle;

    fn create(&mut self, interface: &str) -> Result<Self::Handle>;
}

#[async_trait]
impl ListenerHandle for Listener {
    async fn close(self) {
        Listener::close(self).await
    }
}

/// Builds real VRF-scoped [`Listener`]s.
pub struct VrfListenerFactory {
    config: Arc<ServerConfig>,
    kernel: Arc<dyn KernelLinks>,
    source: Option<Ipv4Addr>,
    in_flight: Arc<Semaphore>,
}

impl VrfListenerFactory {
    pub fn new(
        config: Arc<ServerConfig>,
        kernel: Arc<dyn KernelLinks>,
        source: Option<Ipv4Addr>,
        in_flight: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            kernel,
            source,
            in_flight,
        }
    }
}

impl ListenerFactory for VrfListenerFactory {
    type Handle = Listener;

    fn create(&mut self, interface: &str) -> Result<Listener> {
        Listener::spawn(
            Some(interface),
            SERVER_PORT,
            self.config.clone(),
            self.kernel.clone(),
            self.source,
            self.in_flight.clone(),
        )
    }
}

/// Interface name to listener. `None` marks an interface that is known but
/// has no listener, so its Down event is expected and not warned about.
pub struct ListenerSupervisor<F: ListenerFactory> {
    factory: F,
    listeners: HashMap<String, Option<F::Handle>>,
}

impl<F: ListenerFactory> ListenerSupervisor<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            listeners: HashMap::new(),
        }
    }

    /// Consumes events until the channel closes, then closes every
    /// remaining listener.
    pub async fn run(mut self, mut events: mpsc::Receiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("Monitor channel closed");

        for (interface, handle) in self.listeners.drain() {
            if let Some(handle) = handle {
                info!(%interface, "Closing listener on shutdown");
                handle.close().await;
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn handle(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up(interface) => {
                let handle = match self.factory.create(&interface) {
                    Ok(handle) => Some(handle),
                    Err(e) if e.is_not_vrf() => {
                        info!(%interface, "Won't bind interface as it's not a VRF");
                        None
                    }
                    Err(e) => {
                        warn!(%interface, error = %e, "Failed to bind interface");
                        None
                    }
                };
                if let Some(Some(previous)) = self.listeners.insert(interface.clone(), handle) {
                    warn!(%interface, "Replacing listener for interface that never went down");
                    previous.close().await;
                }
            }
            LinkEvent::Down(interface) => match self.listeners.remove(&interface) {
                Some(Some(handle)) => handle.close().await,
                Some(None) => {}
                None => warn!(%interface, "Interface without listener going down"),
            },
        }
    }

    /// Whether `interface` has an entry, sentinel or live.
    pub fn is_tracked(&self, interface: &str) -> bool {
        self.listeners.contains_key(interface)
    }

    /// Whether `interface` has a live listener.
    pub fn has_listener(&self, interface: &str) -> bool {
        matches!(self.listeners.get(interface), Some(Some(_)))
    }
}
