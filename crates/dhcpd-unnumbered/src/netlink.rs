//! rtnetlink implementations of the kernel collaborators.
//!
//! [`NetlinkKernel`] opens a fresh NETLINK_ROUTE socket for every query so
//! answers always reflect current kernel state. [`NetlinkLinkSource`] keeps
//! one socket subscribed to RTMGRP_LINK and drives it through tokio's
//! `AsyncFd`.

use crate::error::{DhcpdError, Result};
use crate::kernel::{KernelLinks, LinkEventSource};
use crate::types::{Ipv4Network, LinkState, MacAddress, OperState};
use async_trait::async_trait;
use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVrf, LinkAttribute, LinkFlags, LinkInfo, LinkMessage, State,
};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tracing::{debug, instrument, trace, warn};

/// RTMGRP_LINK multicast group bit.
const RTMGRP_LINK: u32 = 1;

/// Receive buffer for one netlink read.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Subscription socket receive buffer, sized for link event bursts.
const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Queries links and routes over rtnetlink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkKernel;

impl NetlinkKernel {
    pub fn new() -> Self {
        Self
    }

    fn open() -> io::Result<Socket> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        Ok(socket)
    }

    /// Sends one request and collects the inner replies. Dump requests read
    /// until NLMSG_DONE, plain requests until the first reply. Kernel
    /// errors come back as their errno.
    fn request(message: RouteNetlinkMessage, dump: bool) -> io::Result<Vec<RouteNetlinkMessage>> {
        let socket = Self::open()?;

        let mut header = NetlinkHeader::default();
        header.flags = if dump {
            NLM_F_REQUEST | NLM_F_DUMP
        } else {
            NLM_F_REQUEST
        };
        header.sequence_number = 1;
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);
        socket.send(&buf, 0)?;

        let mut replies = Vec::new();
        let mut recv_buf = Vec::with_capacity(RECV_BUFFER_SIZE);
        loop {
            recv_buf.clear();
            let len = socket.recv(&mut recv_buf, 0)?;
            if len == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "netlink socket closed",
                ));
            }

            for msg in parse_messages(&recv_buf[..len])? {
                match msg.payload {
                    NetlinkPayload::InnerMessage(inner) => {
                        replies.push(inner);
                        if !dump {
                            return Ok(replies);
                        }
                    }
                    NetlinkPayload::Done(_) => return Ok(replies),
                    NetlinkPayload::Error(err) => match err.code {
                        Some(_) => return Err(err.to_io()),
                        None if !dump => return Ok(replies),
                        None => {}
                    },
                    _ => {}
                }
            }
        }
    }

    fn get_link(message: LinkMessage, what: String) -> Result<LinkState> {
        let replies = Self::request(RouteNetlinkMessage::GetLink(message), false).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENODEV) {
                DhcpdError::InterfaceNotFound(what.clone())
            } else {
                DhcpdError::netlink("get link", e)
            }
        })?;
        replies
            .into_iter()
            .find_map(|reply| match reply {
                RouteNetlinkMessage::NewLink(link) => Some(link_state(&link)),
                _ => None,
            })
            .ok_or(DhcpdError::InterfaceNotFound(what))
    }
}

impl KernelLinks for NetlinkKernel {
    #[instrument(skip(self))]
    fn link_by_index(&self, index: u32) -> Result<LinkState> {
        let mut message = LinkMessage::default();
        message.header.index = index;
        Self::get_link(message, index.to_string())
    }

    #[instrument(skip(self))]
    fn link_by_name(&self, name: &str) -> Result<LinkState> {
        let mut message = LinkMessage::default();
        message
            .attributes
            .push(LinkAttribute::IfName(name.to_string()));
        Self::get_link(message, name.to_string())
    }

    #[instrument(skip(self))]
    fn host_routes(&self, ifindex: u32, table: u32) -> Result<Vec<Ipv4Network>> {
        let mut message = RouteMessage::default();
        message.header.address_family = AddressFamily::Inet;

        let replies = Self::request(RouteNetlinkMessage::GetRoute(message), true)
            .map_err(|e| DhcpdError::netlink("dump routes", e))?;
        let routes: Vec<Ipv4Network> = replies
            .iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewRoute(route) => host_route(route, ifindex, table),
                _ => None,
            })
            .collect();

        debug!(count = routes.len(), "host routes found");
        Ok(routes)
    }
}

fn parse_messages(mut buf: &[u8]) -> io::Result<Vec<NetlinkMessage<RouteNetlinkMessage>>> {
    let mut messages = Vec::new();
    while !buf.is_empty() {
        let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }
        // Netlink messages are 4-byte aligned.
        let aligned = (len + 3) & !3;
        buf = buf.get(aligned..).unwrap_or(&[]);
        messages.push(msg);
    }
    Ok(messages)
}

/// A /32 IPv4 route through `ifindex` in `table`.
fn host_route(route: &RouteMessage, ifindex: u32, table: u32) -> Option<Ipv4Network> {
    if route.header.address_family != AddressFamily::Inet
        || route.header.destination_prefix_length != 32
    {
        return None;
    }

    let mut destination = None;
    let mut oif = None;
    let mut route_table = u32::from(route.header.table);
    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => destination = Some(*ip),
            RouteAttribute::Oif(index) => oif = Some(*index),
            RouteAttribute::Table(id) => route_table = *id,
            _ => {}
        }
    }

    trace!(?destination, ?oif, route_table, "route");
    if oif != Some(ifindex) || route_table != table {
        return None;
    }
    destination.and_then(|ip| Ipv4Network::new(ip, 32).ok())
}

/// Converts a link message into a [`LinkState`].
pub(crate) fn link_state(link: &LinkMessage) -> LinkState {
    let mut state = LinkState::new(link.header.index, String::new());
    state.admin_up = link.header.flags.contains(LinkFlags::Up);

    let mut is_vrf = false;
    let mut table = None;
    for attr in &link.attributes {
        match attr {
            LinkAttribute::IfName(name) => state.name = name.clone(),
            LinkAttribute::OperState(oper) => state.oper_state = oper_state(oper),
            LinkAttribute::Address(bytes) if bytes.len() == 6 => {
                state.mac = MacAddress::from_slice(bytes);
            }
            LinkAttribute::Stats64(stats) => state.tx_packets = Some(stats.tx_packets),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    match info {
                        LinkInfo::Kind(InfoKind::Vrf) => is_vrf = true,
                        LinkInfo::Data(InfoData::Vrf(vrf)) => {
                            table = vrf.iter().find_map(|v| match v {
                                InfoVrf::TableId(id) => Some(*id),
                                _ => None,
                            });
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if is_vrf {
        state.vrf_table = table;
    }
    state
}

fn oper_state(state: &State) -> OperState {
    match state {
        State::Up => OperState::Up,
        State::Down => OperState::Down,
        State::LowerLayerDown => OperState::LowerLayerDown,
        State::Testing => OperState::Testing,
        State::Dormant => OperState::Dormant,
        State::NotPresent => OperState::NotPresent,
        _ => OperState::Unknown,
    }
}

/// Enlarges the receive buffer and asks the kernel not to report ENOBUFS
/// on overrun. Failures are logged, not returned.
fn tune_socket(socket: &Socket) {
    let fd = socket.as_raw_fd();

    let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
    // SAFETY: the fd is a valid socket owned by `socket` and `size`
    // outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        warn!("Failed to set SO_RCVBUF, using default buffer size");
    }

    let enable: libc::c_int = 1;
    // SAFETY: as above.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_NETLINK,
            libc::NETLINK_NO_ENOBUFS,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        warn!("Failed to set NETLINK_NO_ENOBUFS");
    } else {
        debug!("Enabled NETLINK_NO_ENOBUFS");
    }
}

/// Link notifications from the RTMGRP_LINK multicast group.
pub struct NetlinkLinkSource {
    inner: AsyncFd<OwnedFd>,
    socket: Socket,
    buffer: Vec<u8>,
}

impl NetlinkLinkSource {
    /// Subscribes to link notifications.
    #[instrument]
    pub fn new() -> Result<Self> {
        let mut socket =
            Socket::new(NETLINK_ROUTE).map_err(|e| DhcpdError::netlink("subscribe links", e))?;
        socket
            .bind(&SocketAddr::new(0, RTMGRP_LINK))
            .map_err(|e| DhcpdError::netlink("subscribe links", e))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| DhcpdError::netlink("subscribe links", e))?;

        tune_socket(&socket);

        // Dup the fd so `socket` keeps ownership of the original.
        // SAFETY: dup returns a fresh descriptor we immediately take
        // ownership of.
        let owned_fd = unsafe {
            let new_fd = libc::dup(socket.as_raw_fd());
            if new_fd < 0 {
                return Err(DhcpdError::netlink(
                    "subscribe links",
                    io::Error::last_os_error(),
                ));
            }
            OwnedFd::from_raw_fd(new_fd)
        };
        let inner =
            AsyncFd::new(owned_fd).map_err(|e| DhcpdError::netlink("subscribe links", e))?;

        debug!("Subscribed to RTMGRP_LINK");
        Ok(Self {
            inner,
            socket,
            buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
        })
    }
}

fn receive_links(socket: &Socket, buffer: &mut Vec<u8>) -> io::Result<Vec<LinkState>> {
    buffer.clear();
    let len = socket.recv(buffer, 0)?;
    let messages = parse_messages(&buffer[..len])?;

    Ok(messages
        .into_iter()
        .filter_map(|msg| match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                Some(link_state(&link))
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                let mut state = link_state(&link);
                state.oper_state = OperState::NotPresent;
                state.admin_up = false;
                Some(state)
            }
            _ => None,
        })
        .collect())
}

#[async_trait]
impl LinkEventSource for NetlinkLinkSource {
    async fn snapshot(&mut self) -> Result<Vec<LinkState>> {
        let message = RouteNetlinkMessage::GetLink(LinkMessage::default());
        let replies = tokio::task::spawn_blocking(move || NetlinkKernel::request(message, true))
            .await
            .map_err(|e| DhcpdError::netlink("dump links", e))?
            .map_err(|e| DhcpdError::netlink("dump links", e))?;

        Ok(replies
            .iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewLink(link) => Some(link_state(link)),
                _ => None,
            })
            .collect())
    }

    async fn next_batch(&mut self) -> Result<Vec<LinkState>> {
        loop {
            let mut guard = self
                .inner
                .readable()
                .await
                .map_err(|e| DhcpdError::netlink("receive links", e))?;

            let socket = &self.socket;
            let buffer = &mut self.buffer;
            match guard.try_io(|_| receive_links(socket, buffer)) {
                Ok(Ok(batch)) => return Ok(batch),
                Ok(Err(e)) => return Err(DhcpdError::netlink("receive links", e)),
                Err(_would_block) => continue,
            }
        }
    }
}
