//! Per-datagram reply engine.
//!
//! Every datagram is handled on its own, with no state carried between
//! requests: routes and override files are read fresh each time. Anything
//! that prevents a reply ends in [`Outcome::Dropped`] with the reason
//! already logged; the client's retransmission timer is the recovery path.

use crate::config::ServerConfig;
use crate::dns::mix_dns;
use crate::frame::{build_frame, Delivery, CLIENT_PORT};
use crate::hostname::HostnamePolicy;
use crate::kernel::KernelLinks;
use crate::options::OverrideOptions;
use crate::resolver::{Lease, LeaseQuery, LeaseResolver};
use crate::types::{LinkState, MacAddress};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Size of the chaddr field.
const MAX_HLEN: usize = 16;

/// Outbound paths for a finished reply.
pub trait ReplyTransport: Send + Sync {
    /// Writes a complete Ethernet frame out of `ifindex`.
    fn send_frame(&self, ifindex: u32, dst_mac: MacAddress, frame: &[u8]) -> io::Result<()>;

    /// Sends a UDP payload from port 67, pinned to egress `ifindex`.
    fn send_datagram(&self, ifindex: u32, dst: SocketAddrV4, payload: &[u8]) -> io::Result<()>;
}

/// Why a datagram did not get a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownInterface,
    Malformed,
    InterfaceFiltered,
    InterfaceDown,
    NotBootRequest,
    UnhandledMessageType,
    RouteLookup,
    NoLease,
    Encode,
    Send,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::UnknownInterface => "unknown interface",
            DropReason::Malformed => "malformed request",
            DropReason::InterfaceFiltered => "interface not accepted",
            DropReason::InterfaceDown => "interface down",
            DropReason::NotBootRequest => "not a BootRequest",
            DropReason::UnhandledMessageType => "unhandled message type",
            DropReason::RouteLookup => "route lookup failed",
            DropReason::NoLease => "no lease candidate",
            DropReason::Encode => "encode failed",
            DropReason::Send => "send failed",
        };
        f.write_str(s)
    }
}

/// Terminal state of one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent {
        message_type: MessageType,
        delivery: Delivery,
        lease: Lease,
    },
    Dropped(DropReason),
}

/// Answers requests arriving on one listener socket.
pub struct Responder {
    config: Arc<ServerConfig>,
    kernel: Arc<dyn KernelLinks>,
    transport: Arc<dyn ReplyTransport>,
    /// Routing table of the listener: the VRF table, or main.
    table: u32,
    /// Server identifier; the lease gateway is used when unset.
    source: Option<Ipv4Addr>,
}

impl Responder {
    pub fn new(
        config: Arc<ServerConfig>,
        kernel: Arc<dyn KernelLinks>,
        transport: Arc<dyn ReplyTransport>,
        table: u32,
        source: Option<Ipv4Addr>,
    ) -> Self {
        Self {
            config,
            kernel,
            transport,
            table,
            source,
        }
    }

    /// Handles one datagram received on interface `ifindex`.
    pub fn handle(&self, ifindex: u32, datagram: &[u8]) -> Outcome {
        match self.try_handle(ifindex, datagram) {
            Ok(outcome) => outcome,
            Err(reason) => Outcome::Dropped(reason),
        }
    }

    fn try_handle(&self, ifindex: u32, datagram: &[u8]) -> Result<Outcome, DropReason> {
        let link = self.kernel.link_by_index(ifindex).map_err(|e| {
            error!(ifindex, error = %e, "Error getting request interface");
            DropReason::UnknownInterface
        })?;

        let request = Message::from_bytes(datagram).map_err(|e| {
            error!(interface = %link.name, error = %e, "Error parsing DHCPv4 request");
            DropReason::Malformed
        })?;
        let reply_type = self.accept(&link, &request)?;
        trace!(?request, "request");

        let options = self.load_options(&link.name);
        let private_range = options.private_range.unwrap_or(self.config.private_range);
        let query = LeaseQuery {
            ifindex,
            table: self.table,
            overrides: &options.addresses,
            gateway_override: options.gateway,
            private_range: &private_range,
        };

        let lease = LeaseResolver::new(self.kernel.as_ref())
            .resolve(&query, requested_address(&request), request.ciaddr())
            .map_err(|e| {
                error!(
                    interface = %link.name,
                    table = self.table,
                    error = %e,
                    "Failed to get routes"
                );
                DropReason::RouteLookup
            })?
            .ok_or_else(|| {
                info!(
                    interface = %link.name,
                    "No host routes or override addresses, not providing DHCP"
                );
                DropReason::NoLease
            })?;
        debug!(lease = %lease.address, gateway = %lease.gateway, "Picked lease");

        let reply = self.compose(&link, &request, reply_type, &lease, &options);
        let delivery = Delivery::select(&request, reply_type == MessageType::Nak, lease.address.address());

        let payload = reply.to_vec().map_err(|e| {
            error!(error = %e, "Failed to compile reply");
            DropReason::Encode
        })?;

        info!(
            message_type = ?reply_type,
            peer = %delivery.ip,
            peer_mac = %delivery.mac,
            interface = %link.name,
            lease = %lease.address,
            lease_secs = self.config.lease_secs(),
            "Sending reply"
        );
        trace!(?reply, "reply");

        self.deliver(&link, &delivery, lease.gateway, &payload)
            .map_err(|e| {
                error!(peer = %delivery.ip, interface = %link.name, error = %e, "Write to connection failed");
                DropReason::Send
            })?;

        Ok(Outcome::Sent {
            message_type: reply_type,
            delivery,
            lease,
        })
    }

    /// Filters on interface, opcode and message type. Returns the reply
    /// message type.
    fn accept(&self, link: &LinkState, request: &Message) -> Result<MessageType, DropReason> {
        // chaddr is 16 bytes on the wire; a larger hlen cannot be sliced.
        if usize::from(request.hlen()) > MAX_HLEN {
            warn!(interface = %link.name, hlen = request.hlen(), "Invalid hardware address length");
            return Err(DropReason::Malformed);
        }
        debug!(interface = %link.name, message_type = ?request.opts().msg_type(), "Received request");

        if !self.config.interface_pattern.is_match(&link.name) {
            debug!(interface = %link.name, "DHCP request on interface is not accepted, ignoring");
            return Err(DropReason::InterfaceFiltered);
        }
        if !link.admin_up {
            debug!(interface = %link.name, "DHCP request on interface which is down, skipping");
            return Err(DropReason::InterfaceDown);
        }
        if request.opcode() != Opcode::BootRequest {
            warn!(opcode = ?request.opcode(), "Unsupported opcode, only BootRequest is supported");
            return Err(DropReason::NotBootRequest);
        }

        match request.opts().msg_type() {
            Some(MessageType::Discover) => Ok(MessageType::Offer),
            Some(MessageType::Request) => Ok(MessageType::Ack),
            other => {
                info!(message_type = ?other, interface = %link.name, "Unhandled message type");
                Err(DropReason::UnhandledMessageType)
            }
        }
    }

    fn load_options(&self, interface: &str) -> OverrideOptions {
        if !self.config.hostname_override {
            return OverrideOptions::default();
        }
        match OverrideOptions::load(&self.config.options_file(interface)) {
            Ok(options) => options,
            Err(e) => {
                warn!(interface, error = %e, "Failed to read options file");
                OverrideOptions::default()
            }
        }
    }

    fn compose(
        &self,
        link: &LinkState,
        request: &Message,
        reply_type: MessageType,
        lease: &Lease,
        options: &OverrideOptions,
    ) -> Message {
        let address = lease.address.address();
        let dns = mix_dns(address, &self.config.dns_servers);
        let (hostname, domain) = HostnamePolicy::new(&self.config).resolve(&link.name, address, options);
        let server_id = self.source.unwrap_or(lease.gateway);
        let tftp = options.tftp.or(self.config.tftp);

        let mut reply = Message::new_with_id(
            request.xid(),
            request.ciaddr(),
            address,
            lease.gateway,
            request.giaddr(),
            request.chaddr(),
        );
        reply
            .set_opcode(Opcode::BootReply)
            .set_htype(request.htype())
            .set_flags(request.flags());

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(reply_type));
        opts.insert(DhcpOption::SubnetMask(lease.address.mask()));
        opts.insert(DhcpOption::Router(vec![lease.gateway]));
        if !dns.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(dns));
        }
        opts.insert(DhcpOption::AddressLeaseTime(self.config.lease_secs()));
        if !hostname.is_empty() {
            opts.insert(DhcpOption::Hostname(hostname));
        }
        if !domain.is_empty() {
            opts.insert(DhcpOption::DomainName(domain));
        }
        opts.insert(DhcpOption::ServerIdentifier(server_id));
        if let Some(bootfile) = &self.config.bootfile {
            opts.insert(DhcpOption::BootfileName(bootfile.as_bytes().to_vec()));
        }
        if let Some(tftp) = tftp {
            opts.insert(DhcpOption::TFTPServerName(tftp.to_string().into_bytes()));
        }

        reply
    }

    /// Raw frame when the link has an Ethernet address, otherwise a UDP
    /// datagram pinned to the interface.
    fn deliver(
        &self,
        link: &LinkState,
        delivery: &Delivery,
        src_ip: Ipv4Addr,
        payload: &[u8],
    ) -> io::Result<()> {
        match link.mac {
            Some(src_mac) => {
                let frame = build_frame(src_mac, delivery.mac, src_ip, delivery.ip, payload)?;
                self.transport.send_frame(link.index, delivery.mac, &frame)
            }
            None => self.transport.send_datagram(
                link.index,
                SocketAddrV4::new(delivery.ip, CLIENT_PORT),
                payload,
            ),
        }
    }
}

/// Option 50, when present.
fn requested_address(request: &Message) -> Option<Ipv4Addr> {
    match request.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    }
}
