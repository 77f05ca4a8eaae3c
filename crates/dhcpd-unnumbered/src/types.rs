//! Core value types shared by the reply engine and the interface monitor.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IPv4 network format: {0}")]
    InvalidNetwork(String),
}

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The broadcast MAC address (ff:ff:ff:ff:ff:ff).
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Builds an address from the first six bytes of a hardware address
    /// field. Returns `None` when fewer than six bytes are present.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let head: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddress(head))
    }

    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// An IPv4 host address together with the prefix length of its network.
///
/// Unlike a pure CIDR block the host bits are kept: `192.168.11.40/27`
/// remembers `.40` as the leased address while [`Ipv4Network::network`]
/// yields `192.168.11.32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Network {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Network {
    /// Prefix length assumed for host routes discovered in the kernel.
    pub const IMPLICIT_PREFIX_LEN: u8 = 24;

    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidNetwork(format!(
                "{address}/{prefix_len}: prefix length exceeds 32"
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Wraps an address in the implicit /24 used for route-derived leases.
    pub const fn implicit(address: Ipv4Addr) -> Self {
        Self {
            address,
            prefix_len: Self::IMPLICIT_PREFIX_LEN,
        }
    }

    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    /// The network address: host bits of [`Self::address`] cleared.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask_bits())
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = self.mask_bits();
        u32::from(addr) & mask == u32::from(self.address) & mask
    }

    fn mask_bits(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Network {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidNetwork(s.to_string()))?;

        let address: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidNetwork(s.to_string()))?;

        Ipv4Network::new(address, prefix_len)
    }
}

/// Kernel operational state of a link (IF_OPER_* from RFC 2863).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperState {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl OperState {
    pub const fn is_up(&self) -> bool {
        matches!(self, OperState::Up)
    }
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperState::Unknown => "unknown",
            OperState::NotPresent => "notpresent",
            OperState::Down => "down",
            OperState::LowerLayerDown => "lowerlayerdown",
            OperState::Testing => "testing",
            OperState::Dormant => "dormant",
            OperState::Up => "up",
        };
        f.write_str(s)
    }
}

/// Snapshot of one kernel link, as seen by a single netlink query or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub index: u32,
    pub name: String,
    /// Hardware address; `None` for links without an Ethernet header.
    pub mac: Option<MacAddress>,
    /// IFF_UP: administratively up.
    pub admin_up: bool,
    pub oper_state: OperState,
    /// Transmitted packet counter, when the kernel reported statistics.
    pub tx_packets: Option<u64>,
    /// Routing table id when the link is a VRF device.
    pub vrf_table: Option<u32>,
}

impl LinkState {
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            mac: None,
            admin_up: false,
            oper_state: OperState::Unknown,
            tx_packets: None,
            vrf_table: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mac_from_chaddr() {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            MacAddress::from_slice(&chaddr),
            Some(MacAddress::new([1, 2, 3, 4, 5, 6]))
        );
        assert_eq!(MacAddress::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_mac_display() {
        let mac = MacAddress::new([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]);
        assert_eq!(mac.to_string(), "52:54:00:ab:cd:ef");
        assert_eq!(MacAddress::BROADCAST.to_string(), "ff:ff:ff:ff:ff:ff");
    }

    #[test]
    fn test_network_keeps_host_bits() {
        let net: Ipv4Network = "192.168.11.40/27".parse().unwrap();
        assert_eq!(net.address(), Ipv4Addr::new(192, 168, 11, 40));
        assert_eq!(net.network(), Ipv4Addr::new(192, 168, 11, 32));
        assert_eq!(net.mask(), Ipv4Addr::new(255, 255, 255, 224));
    }

    #[test]
    fn test_network_contains() {
        let pvt: Ipv4Network = "192.168.0.0/16".parse().unwrap();
        assert!(pvt.contains(Ipv4Addr::new(192, 168, 42, 1)));
        assert!(!pvt.contains(Ipv4Addr::new(192, 169, 0, 1)));

        let everything: Ipv4Network = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(everything.mask(), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_network_implicit_prefix() {
        let net = Ipv4Network::implicit(Ipv4Addr::new(203, 0, 113, 9));
        assert_eq!(net.prefix_len(), 24);
        assert_eq!(net.mask(), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn test_network_invalid() {
        assert!("10.0.0.0/33".parse::<Ipv4Network>().is_err());
        assert!("10.0.0.0".parse::<Ipv4Network>().is_err());
        assert!("10.0.0/8".parse::<Ipv4Network>().is_err());
        assert!(Ipv4Network::new(Ipv4Addr::LOCALHOST, 40).is_err());
    }

    #[test]
    fn test_oper_state_display() {
        assert_eq!(OperState::Up.to_string(), "up");
        assert_eq!(OperState::LowerLayerDown.to_string(), "lowerlayerdown");
        assert!(OperState::Up.is_up());
        assert!(!OperState::Dormant.is_up());
    }
}
