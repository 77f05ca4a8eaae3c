//! Link-layer delivery of DHCP replies.
//!
//! A client without an address cannot be reached through the routing
//! stack: there is nothing to ARP for. Replies are therefore wrapped in
//! hand-built Ethernet, IPv4 and UDP headers and written to an `AF_PACKET`
//! socket on the receiving interface.

use crate::types::MacAddress;
use byteorder::{BigEndian, WriteBytesExt};
use dhcproto::v4::{HType, Message};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const IP_TTL: u8 = 64;
const IP_FLAG_DONT_FRAGMENT: u16 = 0x4000;
const IPPROTO_UDP: u8 = 17;

/// Where a reply goes, at both layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

impl Delivery {
    pub const BROADCAST: Delivery = Delivery {
        ip: Ipv4Addr::BROADCAST,
        mac: MacAddress::BROADCAST,
    };

    /// Chooses the destination for a reply to `request`.
    ///
    /// In priority order: NAKs are broadcast; a client with `ciaddr` set is
    /// unicast there; the broadcast flag forces broadcast; an Ethernet
    /// client without the flag is unicast to the assigned address. Anything
    /// else is broadcast, since unicasting to an unconfigured host that
    /// cannot take it would need ARP table manipulation.
    pub fn select(request: &Message, is_nak: bool, assigned: Ipv4Addr) -> Delivery {
        if is_nak {
            return Self::BROADCAST;
        }

        let client_mac = client_mac(request);
        if !request.ciaddr().is_unspecified() {
            return Delivery {
                ip: request.ciaddr(),
                mac: client_mac.unwrap_or(MacAddress::BROADCAST),
            };
        }
        if request.flags().broadcast() {
            return Self::BROADCAST;
        }
        match client_mac {
            Some(mac) => Delivery { ip: assigned, mac },
            None => {
                tracing::trace!(
                    "cannot unicast to a client without an Ethernet address, broadcasting"
                );
                Self::BROADCAST
            }
        }
    }
}

/// The client hardware address, when it is a 6-byte Ethernet address.
fn client_mac(request: &Message) -> Option<MacAddress> {
    if request.htype() != HType::Eth || request.hlen() != 6 {
        return None;
    }
    MacAddress::from_slice(request.chaddr())
}

/// Internet checksum (RFC 1071) over `data`, seeded with `initial`.
fn checksum(initial: u32, data: &[u8]) -> u16 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, udp_len: u16) -> u32 {
    let [a, b, c, d] = src.octets();
    let [e, f, g, h] = dst.octets();
    u32::from(u16::from_be_bytes([a, b]))
        + u32::from(u16::from_be_bytes([c, d]))
        + u32::from(u16::from_be_bytes([e, f]))
        + u32::from(u16::from_be_bytes([g, h]))
        + u32::from(IPPROTO_UDP)
        + u32::from(udp_len)
}

/// Builds an Ethernet II frame carrying `payload` from UDP 67 to UDP 68.
pub fn build_frame(
    src_mac: MacAddress,
    dst_mac: MacAddress,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let udp_len = u16::try_from(UDP_HEADER_LEN + payload.len())
        .ok()
        .filter(|len| usize::from(*len) + IPV4_HEADER_LEN <= usize::from(u16::MAX))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
    let total_len = udp_len + IPV4_HEADER_LEN as u16;

    let mut frame = Vec::with_capacity(ETH_HEADER_LEN + usize::from(total_len));

    // Ethernet
    frame.write_all(dst_mac.as_bytes())?;
    frame.write_all(src_mac.as_bytes())?;
    frame.write_u16::<BigEndian>(ETHERTYPE_IPV4)?;

    // IPv4, checksum patched below
    let ip_start = frame.len();
    frame.write_u8(0x45)?;
    frame.write_u8(0)?;
    frame.write_u16::<BigEndian>(total_len)?;
    frame.write_u16::<BigEndian>(0)?;
    frame.write_u16::<BigEndian>(IP_FLAG_DONT_FRAGMENT)?;
    frame.write_u8(IP_TTL)?;
    frame.write_u8(IPPROTO_UDP)?;
    frame.write_u16::<BigEndian>(0)?;
    frame.write_all(&src_ip.octets())?;
    frame.write_all(&dst_ip.octets())?;
    let ip_sum = checksum(0, &frame[ip_start..]);
    frame[ip_start + 10..ip_start + 12].copy_from_slice(&ip_sum.to_be_bytes());

    // UDP, checksum patched below
    let udp_start = frame.len();
    frame.write_u16::<BigEndian>(SERVER_PORT)?;
    frame.write_u16::<BigEndian>(CLIENT_PORT)?;
    frame.write_u16::<BigEndian>(udp_len)?;
    frame.write_u16::<BigEndian>(0)?;
    frame.write_all(payload)?;
    let udp_sum = match checksum(
        pseudo_header_sum(src_ip, dst_ip, udp_len),
        &frame[udp_start..],
    ) {
        // Zero means "no checksum" on the wire.
        0 => 0xffff,
        sum => sum,
    };
    frame[udp_start + 6..udp_start + 8].copy_from_slice(&udp_sum.to_be_bytes());

    Ok(frame)
}

/// Send-only `AF_PACKET` socket, opened per reply.
pub struct PacketSocket {
    fd: OwnedFd,
}

impl PacketSocket {
    pub fn open() -> io::Result<Self> {
        // Protocol 0: the socket never receives.
        // SAFETY: plain socket(2) call; the result is checked before use.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Writes a complete Ethernet frame out of interface `ifindex`.
    pub fn send(&self, ifindex: u32, dst_mac: MacAddress, frame: &[u8]) -> io::Result<()> {
        let ifindex = i32::try_from(ifindex)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface index out of range"))?;

        // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_ifindex = ifindex;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(dst_mac.as_bytes());

        // SAFETY: `frame` and `addr` are valid for the lengths passed.
        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        if sent as usize != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {sent} of {} bytes", frame.len()),
            ));
        }
        Ok(())
    }
}
