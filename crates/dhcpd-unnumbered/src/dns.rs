//! Per-client DNS server ordering.

use std::net::Ipv4Addr;

/// Rotates `servers` left by `last octet of address % servers.len()`.
///
/// The same client address always sees the same order, while the primary
/// server varies across the address space without any shared state.
pub fn mix_dns(address: Ipv4Addr, servers: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    if servers.is_empty() {
        return Vec::new();
    }
    let offset = usize::from(address.octets()[3]) % servers.len();
    servers[offset..]
        .iter()
        .chain(&servers[..offset])
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);
    const B: Ipv4Addr = Ipv4Addr::new(2, 2, 2, 2);
    const C: Ipv4Addr = Ipv4Addr::new(3, 3, 3, 3);
    const D: Ipv4Addr = Ipv4Addr::new(4, 4, 4, 4);

    #[test]
    fn test_rotation_by_last_octet() {
        let servers = [A, B, C, D];
        assert_eq!(mix_dns(Ipv4Addr::new(10, 0, 0, 0), &servers), vec![A, B, C, D]);
        assert_eq!(mix_dns(Ipv4Addr::new(10, 0, 0, 1), &servers), vec![B, C, D, A]);
        assert_eq!(mix_dns(Ipv4Addr::new(10, 0, 0, 2), &servers), vec![C, D, A, B]);
        assert_eq!(mix_dns(Ipv4Addr::new(10, 0, 0, 7), &servers), vec![D, A, B, C]);
    }

    #[test]
    fn test_only_last_octet_matters() {
        let servers = [A, B, C];
        assert_eq!(
            mix_dns(Ipv4Addr::new(10, 0, 0, 5), &servers),
            mix_dns(Ipv4Addr::new(203, 0, 113, 5), &servers)
        );
    }

    #[test]
    fn test_single_and_empty() {
        assert_eq!(mix_dns(Ipv4Addr::new(10, 0, 0, 9), &[A]), vec![A]);
        assert!(mix_dns(Ipv4Addr::new(10, 0, 0, 9), &[]).is_empty());
    }
}
