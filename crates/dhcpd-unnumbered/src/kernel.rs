//! Kernel collaborators.
//!
//! The reply engine and the interface monitor only see these traits. The
//! rtnetlink implementations live in [`crate::netlink`]; tests substitute
//! deterministic fakes.

use crate::error::{DhcpdError, Result};
use crate::types::{Ipv4Network, LinkState};
use async_trait::async_trait;
use std::net::Ipv4Addr;

/// Routing table id of the main table (RT_TABLE_MAIN).
pub const MAIN_TABLE: u32 = 254;

/// Synchronous link and route queries.
///
/// Implementations are called from blocking worker tasks, once per request,
/// and must not cache results.
pub trait KernelLinks: Send + Sync {
    /// Looks up a link by interface index.
    fn link_by_index(&self, index: u32) -> Result<LinkState>;

    /// Looks up a link by interface name.
    fn link_by_name(&self, name: &str) -> Result<LinkState>;

    /// Returns the /32 IPv4 routes through `ifindex` in routing table
    /// `table`, in kernel dump order.
    fn host_routes(&self, ifindex: u32, table: u32) -> Result<Vec<Ipv4Network>>;

    /// Returns the routing table of VRF device `name`.
    ///
    /// Fails with [`DhcpdError::NotVrf`] when the link exists but is not a
    /// VRF.
    fn vrf_table(&self, name: &str) -> Result<u32> {
        let link = self.link_by_name(name)?;
        link.vrf_table.ok_or_else(|| DhcpdError::not_vrf(name))
    }
}

/// A stream of link state notifications.
#[async_trait]
pub trait LinkEventSource: Send {
    /// All links that exist right now. Called once, after the subscription
    /// is established, so nothing is missed between the two.
    async fn snapshot(&mut self) -> Result<Vec<LinkState>>;

    /// Waits for the next batch of link notifications. Deleted links are
    /// reported with an oper state that is not up.
    async fn next_batch(&mut self) -> Result<Vec<LinkState>>;
}

/// First IPv4 address on `interface` that is neither loopback nor
/// link-local.
///
/// Used to pick the server identifier from addresses configured on `lo`.
pub fn source_address(interface: &str) -> Result<Option<Ipv4Addr>> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| DhcpdError::netlink("get interface addresses", e))?;

    Ok(addrs
        .filter(|ifaddr| ifaddr.interface_name == interface)
        .filter_map(|ifaddr| {
            let sin = *ifaddr.address?.as_sockaddr_in()?;
            Some(Ipv4Addr::from(sin.ip()))
        })
        .find(|ip| usable_source(*ip)))
}

fn usable_source(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}
