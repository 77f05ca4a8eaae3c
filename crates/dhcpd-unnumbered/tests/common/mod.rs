//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dhcpd_unnumbered::{
    DhcpdError, Ipv4Network, KernelLinks, LinkEventSource, LinkState, MacAddress, OperState,
    ReplyTransport, Result,
};
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType};
use dhcproto::{Decodable, Encodable};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Mutex;

pub const CLIENT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const TAP_MAC: [u8; 6] = [0xfe, 0x54, 0x00, 0x00, 0x00, 0x01];

/// Offset of the DHCP payload in a built frame (Ethernet + IPv4 + UDP).
pub const PAYLOAD_OFFSET: usize = 14 + 20 + 8;

/// In-memory links and host routes keyed by `(ifindex, table)`.
#[derive(Default)]
pub struct FakeKernel {
    links: Vec<LinkState>,
    routes: HashMap<(u32, u32), Vec<Ipv4Network>>,
    pub route_queries: Mutex<Vec<(u32, u32)>>,
}

impl FakeKernel {
    pub fn with_link(mut self, link: LinkState) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_routes(mut self, ifindex: u32, table: u32, routes: &[&str]) -> Self {
        self.routes.insert(
            (ifindex, table),
            routes.iter().map(|r| r.parse().expect("valid route")).collect(),
        );
        self
    }
}

impl KernelLinks for FakeKernel {
    fn link_by_index(&self, index: u32) -> Result<LinkState> {
        self.links
            .iter()
            .find(|l| l.index == index)
            .cloned()
            .ok_or_else(|| DhcpdError::InterfaceNotFound(index.to_string()))
    }

    fn link_by_name(&self, name: &str) -> Result<LinkState> {
        self.links
            .iter()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| DhcpdError::InterfaceNotFound(name.to_string()))
    }

    fn host_routes(&self, ifindex: u32, table: u32) -> Result<Vec<Ipv4Network>> {
        self.route_queries.lock().unwrap().push((ifindex, table));
        Ok(self.routes.get(&(ifindex, table)).cloned().unwrap_or_default())
    }
}

/// Records every reply instead of putting it on the wire.
#[derive(Default)]
pub struct CaptureTransport {
    pub frames: Mutex<Vec<(u32, MacAddress, Vec<u8>)>>,
    pub datagrams: Mutex<Vec<(u32, SocketAddrV4, Vec<u8>)>>,
}

impl CaptureTransport {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Decodes the DHCP payload of the only captured frame.
    pub fn single_reply(&self) -> Message {
        let frames = self.frames.lock().unwrap();
        assert_eq!(frames.len(), 1, "expected exactly one frame");
        Message::from_bytes(&frames[0].2[PAYLOAD_OFFSET..]).expect("valid DHCP payload")
    }
}

impl ReplyTransport for CaptureTransport {
    fn send_frame(&self, ifindex: u32, dst_mac: MacAddress, frame: &[u8]) -> io::Result<()> {
        self.frames
            .lock()
            .unwrap()
            .push((ifindex, dst_mac, frame.to_vec()));
        Ok(())
    }

    fn send_datagram(&self, ifindex: u32, dst: SocketAddrV4, payload: &[u8]) -> io::Result<()> {
        self.datagrams
            .lock()
            .unwrap()
            .push((ifindex, dst, payload.to_vec()));
        Ok(())
    }
}

/// An up tap interface with an Ethernet address.
pub fn tap(index: u32, name: &str) -> LinkState {
    let mut link = LinkState::new(index, name);
    link.admin_up = true;
    link.oper_state = OperState::Up;
    link.mac = Some(MacAddress::new(TAP_MAC));
    link
}

pub fn link(name: &str, oper_state: OperState, admin_up: bool) -> LinkState {
    let mut link = LinkState::new(100, name);
    link.oper_state = oper_state;
    link.admin_up = admin_up;
    link
}

/// A broadcast DHCP request of `message_type`, encoded.
pub fn request(message_type: MessageType, requested: Option<Ipv4Addr>) -> Vec<u8> {
    let mut msg = Message::new(
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        &CLIENT_MAC,
    );
    msg.set_flags(Flags::default().set_broadcast());
    msg.opts_mut().insert(DhcpOption::MessageType(message_type));
    if let Some(ip) = requested {
        msg.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
    }
    msg.to_vec().expect("encodable request")
}

/// Replays scripted link batches, then waits forever.
pub struct ScriptedLinks {
    snapshot: Vec<LinkState>,
    batches: VecDeque<Vec<LinkState>>,
}

impl ScriptedLinks {
    pub fn new(snapshot: Vec<LinkState>, batches: Vec<Vec<LinkState>>) -> Self {
        Self {
            snapshot,
            batches: batches.into(),
        }
    }
}

#[async_trait]
impl LinkEventSource for ScriptedLinks {
    async fn snapshot(&mut self) -> Result<Vec<LinkState>> {
        Ok(std::mem::take(&mut self.snapshot))
    }

    async fn next_batch(&mut self) -> Result<Vec<LinkState>> {
        match self.batches.pop_front() {
            Some(batch) => Ok(batch),
            None => std::future::pending().await,
        }
    }
}

/// Fails on the first live batch.
pub struct BrokenLinks;

#[async_trait]
impl LinkEventSource for BrokenLinks {
    async fn snapshot(&mut self) -> Result<Vec<LinkState>> {
        Ok(Vec::new())
    }

    async fn next_batch(&mut self) -> Result<Vec<LinkState>> {
        Err(DhcpdError::netlink("receive link messages", "ENOBUFS"))
    }
}
