//! Lease selection from host routes or override addresses.
//!
//! The candidate order is whatever the kernel route dump (or the override
//! file) yields. Selection never sorts: a private first candidate is
//! replaced by each following candidate for as long as the current pick is
//! private, so a trailing private address wins when nothing public closes
//! the scan.

use crate::error::Result;
use crate::kernel::KernelLinks;
use crate::types::Ipv4Network;
use std::net::Ipv4Addr;
use tracing::debug;

/// Picks the lease for one request.
///
/// A candidate equal to the requested address (option 50) or the client's
/// current address (`ciaddr`) wins immediately, even when private.
pub fn pick_lease(
    candidates: &[Ipv4Network],
    requested: Option<Ipv4Addr>,
    client_addr: Ipv4Addr,
    private_range: &Ipv4Network,
) -> Option<Ipv4Network> {
    let mut picked = *candidates.first()?;

    for candidate in candidates {
        if requested == Some(candidate.address()) {
            debug!(address = %candidate.address(), "client requested an address it still owns");
            return Some(*candidate);
        }
        if client_addr == candidate.address() {
            debug!(address = %candidate.address(), "client is using an address it still owns");
            return Some(*candidate);
        }
        if private_range.contains(picked.address()) {
            picked = *candidate;
        }
    }

    Some(picked)
}

/// Default gateway for a lease: the network address under the lease prefix
/// with the last octet incremented.
pub fn gateway_for(lease: &Ipv4Network) -> Ipv4Addr {
    let mut octets = lease.network().octets();
    octets[3] = octets[3].wrapping_add(1);
    Ipv4Addr::from(octets)
}

/// The outcome of lease resolution for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Network,
    pub gateway: Ipv4Addr,
}

/// Request-independent inputs that decide where candidates come from.
#[derive(Debug, Clone, Copy)]
pub struct LeaseQuery<'a> {
    /// Receiving interface index.
    pub ifindex: u32,
    /// Routing table of the listener (VRF table or main).
    pub table: u32,
    /// Addresses from the override file; when non-empty the kernel is not
    /// consulted.
    pub overrides: &'a [Ipv4Network],
    pub gateway_override: Option<Ipv4Addr>,
    pub private_range: &'a Ipv4Network,
}

/// Resolves leases against the kernel routing table.
pub struct LeaseResolver<'k, K: KernelLinks + ?Sized> {
    kernel: &'k K,
}

impl<'k, K: KernelLinks + ?Sized> LeaseResolver<'k, K> {
    pub fn new(kernel: &'k K) -> Self {
        Self { kernel }
    }

    /// Returns the candidate addresses for a query, in source order.
    pub fn candidates(&self, query: &LeaseQuery<'_>) -> Result<Vec<Ipv4Network>> {
        if !query.overrides.is_empty() {
            return Ok(query.overrides.to_vec());
        }
        debug!(table = query.table, ifindex = query.ifindex, "reading host routes");
        let routes = self.kernel.host_routes(query.ifindex, query.table)?;
        Ok(routes
            .into_iter()
            .map(|route| Ipv4Network::implicit(route.address()))
            .collect())
    }

    /// Resolves the lease and gateway. `Ok(None)` means there is nothing to
    /// offer on this interface.
    pub fn resolve(
        &self,
        query: &LeaseQuery<'_>,
        requested: Option<Ipv4Addr>,
        client_addr: Ipv4Addr,
    ) -> Result<Option<Lease>> {
        let candidates = self.candidates(query)?;
        debug!(?candidates, "lease candidates");

        Ok(
            pick_lease(&candidates, requested, client_addr, query.private_range).map(|address| {
                Lease {
                    address,
                    gateway: query
                        .gateway_override
                        .unwrap_or_else(|| gateway_for(&address)),
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DhcpdError;
    use crate::types::LinkState;
    use pretty_assertions::assert_eq;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn implicit(s: &str) -> Ipv4Network {
        Ipv4Network::implicit(s.parse().unwrap())
    }

    fn pvt() -> Ipv4Network {
        net("192.168.0.0/16")
    }

    struct Routes(Vec<Ipv4Network>);

    impl KernelLinks for Routes {
        fn link_by_index(&self, index: u32) -> Result<LinkState> {
            Err(DhcpdError::InterfaceNotFound(index.to_string()))
        }

        fn link_by_name(&self, name: &str) -> Result<LinkState> {
            Err(DhcpdError::InterfaceNotFound(name.to_string()))
        }

        fn host_routes(&self, _ifindex: u32, _table: u32) -> Result<Vec<Ipv4Network>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_gateway_derivation() {
        assert_eq!(
            gateway_for(&net("192.168.11.0/23")),
            Ipv4Addr::new(192, 168, 10, 1)
        );
        assert_eq!(
            gateway_for(&net("192.168.14.0/24")),
            Ipv4Addr::new(192, 168, 14, 1)
        );
        assert_eq!(
            gateway_for(&net("192.168.11.32/27")),
            Ipv4Addr::new(192, 168, 11, 33)
        );
        assert_eq!(
            gateway_for(&implicit("203.0.113.77")),
            Ipv4Addr::new(203, 0, 113, 1)
        );
    }

    #[test]
    fn test_empty_candidates() {
        assert_eq!(pick_lease(&[], None, Ipv4Addr::UNSPECIFIED, &pvt()), None);
    }

    #[test]
    fn test_first_public_wins() {
        let candidates = [implicit("203.0.113.5"), implicit("198.51.100.7")];
        assert_eq!(
            pick_lease(&candidates, None, Ipv4Addr::UNSPECIFIED, &pvt()),
            Some(candidates[0])
        );
    }

    #[test]
    fn test_private_demoted_by_public() {
        let candidates = [implicit("192.168.1.10"), implicit("203.0.113.5")];
        assert_eq!(
            pick_lease(&candidates, None, Ipv4Addr::UNSPECIFIED, &pvt()),
            Some(candidates[1])
        );
    }

    #[test]
    fn test_trailing_private_wins() {
        let candidates = [
            implicit("192.168.1.10"),
            implicit("203.0.113.5"),
            implicit("192.168.1.20"),
        ];
        // The public pick stops the overwrite, so the trailing private one
        // is not reached.
        assert_eq!(
            pick_lease(&candidates, None, Ipv4Addr::UNSPECIFIED, &pvt()),
            Some(candidates[1])
        );

        let all_private = [
            implicit("192.168.1.10"),
            implicit("192.168.1.20"),
            implicit("192.168.1.30"),
        ];
        assert_eq!(
            pick_lease(&all_private, None, Ipv4Addr::UNSPECIFIED, &pvt()),
            Some(all_private[2])
        );
    }

    #[test]
    fn test_requested_address_wins_even_if_private() {
        let candidates = [implicit("203.0.113.5"), implicit("192.168.1.10")];
        assert_eq!(
            pick_lease(
                &candidates,
                Some(Ipv4Addr::new(192, 168, 1, 10)),
                Ipv4Addr::UNSPECIFIED,
                &pvt()
            ),
            Some(candidates[1])
        );
    }

    #[test]
    fn test_client_address_wins() {
        let candidates = [implicit("203.0.113.5"), implicit("198.51.100.7")];
        assert_eq!(
            pick_lease(
                &candidates,
                None,
                Ipv4Addr::new(198, 51, 100, 7),
                &pvt()
            ),
            Some(candidates[1])
        );
    }

    #[test]
    fn test_unknown_requested_address_ignored() {
        let candidates = [implicit("192.168.1.10"), implicit("203.0.113.5")];
        assert_eq!(
            pick_lease(
                &candidates,
                Some(Ipv4Addr::new(10, 9, 9, 9)),
                Ipv4Addr::UNSPECIFIED,
                &pvt()
            ),
            Some(candidates[1])
        );
    }

    #[test]
    fn test_selection_is_idempotent() {
        let candidates = [
            implicit("192.168.1.10"),
            implicit("203.0.113.5"),
            implicit("192.168.1.20"),
        ];
        let requested = Some(Ipv4Addr::new(10, 0, 0, 1));
        let first = pick_lease(&candidates, requested, Ipv4Addr::UNSPECIFIED, &pvt());
        for _ in 0..10 {
            assert_eq!(
                pick_lease(&candidates, requested, Ipv4Addr::UNSPECIFIED, &pvt()),
                first
            );
        }
    }

    #[test]
    fn test_resolver_uses_routes_with_implicit_prefix() {
        let kernel = Routes(vec![net("203.0.113.5/32")]);
        let resolver = LeaseResolver::new(&kernel);
        let private_range = pvt();
        let query = LeaseQuery {
            ifindex: 4,
            table: 254,
            overrides: &[],
            gateway_override: None,
            private_range: &private_range,
        };

        let lease = resolver
            .resolve(&query, None, Ipv4Addr::UNSPECIFIED)
            .unwrap()
            .unwrap();
        assert_eq!(lease.address, implicit("203.0.113.5"));
        assert_eq!(lease.gateway, Ipv4Addr::new(203, 0, 113, 1));
    }

    #[test]
    fn test_resolver_prefers_overrides() {
        let kernel = Routes(vec![net("203.0.113.5/32")]);
        let resolver = LeaseResolver::new(&kernel);
        let private_range = pvt();
        let overrides = [net("198.51.100.40/27")];
        let query = LeaseQuery {
            ifindex: 4,
            table: 254,
            overrides: &overrides,
            gateway_override: Some(Ipv4Addr::new(198, 51, 100, 62)),
            private_range: &private_range,
        };

        let lease = resolver
            .resolve(&query, None, Ipv4Addr::UNSPECIFIED)
            .unwrap()
            .unwrap();
        assert_eq!(lease.address, overrides[0]);
        assert_eq!(lease.gateway, Ipv4Addr::new(198, 51, 100, 62));
    }

    #[test]
    fn test_resolver_no_routes() {
        let kernel = Routes(vec![]);
        let resolver = LeaseResolver::new(&kernel);
        let private_range = pvt();
        let query = LeaseQuery {
            ifindex: 4,
            table: 1001,
            overrides: &[],
            gateway_override: None,
            private_range: &private_range,
        };
        assert_eq!(
            resolver.resolve(&query, None, Ipv4Addr::UNSPECIFIED).unwrap(),
            None
        );
    }
}
