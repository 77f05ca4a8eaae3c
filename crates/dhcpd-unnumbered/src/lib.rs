//! DHCPv4 server for unnumbered interfaces.
//!
//! Tap and point-to-point interfaces in this setup carry no IPv4 address
//! of their own. The address a client gets is inferred from the /32 host
//! routes that point through its interface (inside a VRF table when the
//! interface is enslaved to one), or from a per-interface override file.
//! There is no pool and no lease database.
//!
//! # Architecture
//!
//! ```text
//! kernel links ──▶ NetlinkMonitor ──▶ ListenerSupervisor ──▶ Listener (per VRF)
//!                                                              │
//!                     host routes / override files ◀── Responder
//!                                                              │
//!                                              raw frame / UDP ▼
//! ```
//!
//! - [`listener`] reads datagrams and dispatches them to bounded workers.
//! - [`reply`] resolves the lease, hostname and DNS order, then composes
//!   and delivers the reply.
//! - [`frame`] builds Ethernet/IPv4/UDP frames for clients that cannot be
//!   reached through the routing stack yet.
//! - [`monitor`] and [`supervisor`] attach and detach VRF listeners as
//!   interfaces come and go.
//!
//! Linux only: IP_PKTINFO, SO_BINDTODEVICE and AF_PACKET are required.

pub mod config;
pub mod dns;
pub mod error;
pub mod frame;
pub mod hostname;
pub mod kernel;
pub mod listener;
pub mod monitor;
pub mod netlink;
pub mod options;
pub mod reply;
pub mod resolver;
pub mod supervisor;
pub mod types;

pub use config::{Args, LogLevel, ServerConfig};
pub use error::{DhcpdError, Result};
pub use kernel::{KernelLinks, LinkEventSource, MAIN_TABLE};
pub use listener::Listener;
pub use monitor::{InterfaceTracker, LinkEvent, LinkReadiness, NetlinkMonitor};
pub use netlink::{NetlinkKernel, NetlinkLinkSource};
pub use options::OverrideOptions;
pub use reply::{DropReason, Outcome, ReplyTransport, Responder};
pub use resolver::{gateway_for, pick_lease, Lease, LeaseResolver};
pub use supervisor::{ListenerFactory, ListenerHandle, ListenerSupervisor, VrfListenerFactory};
pub use types::{Ipv4Network, LinkState, MacAddress, OperState};
