//! UDP listener: one socket on port 67, optionally scoped to a VRF.
//!
//! The receive loop only reads datagrams and hands each one to a blocking
//! worker, so a slow route dump or send for one client never delays the
//! next read. Workers are bounded by a semaphore shared across the
//! process; when none is free the datagram is dropped and the client will
//! retransmit.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::frame::{PacketSocket, SERVER_PORT};
use crate::kernel::{KernelLinks, MAIN_TABLE};
use crate::reply::{ReplyTransport, Responder};
use crate::types::MacAddress;
use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrIn,
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 1 << 16;

/// Listener socket shared between the receive loop and reply workers.
#[derive(Clone)]
struct SharedSocket(Arc<Socket>);

impl AsRawFd for SharedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Sends replies as raw frames, or through the listener socket for links
/// without a hardware address.
struct SocketTransport {
    socket: SharedSocket,
}

impl ReplyTransport for SocketTransport {
    fn send_frame(&self, ifindex: u32, dst_mac: MacAddress, frame: &[u8]) -> io::Result<()> {
        PacketSocket::open()?.send(ifindex, dst_mac, frame)
    }

    fn send_datagram(&self, ifindex: u32, dst: SocketAddrV4, payload: &[u8]) -> io::Result<()> {
        let pktinfo = libc::in_pktinfo {
            ipi_ifindex: i32::try_from(ifindex).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "interface index out of range")
            })?,
            ipi_spec_dst: libc::in_addr { s_addr: 0 },
            ipi_addr: libc::in_addr { s_addr: 0 },
        };
        let iov = [IoSlice::new(payload)];
        let cmsgs = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
        let addr = SockaddrIn::from(dst);
        sendmsg(
            self.socket.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            Some(&addr),
        )?;
        Ok(())
    }
}

/// Creates the UDP socket on `0.0.0.0:port`, bound to `device` when given.
fn bind_socket(device: Option<&str>, port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    if let Some(name) = device {
        socket.bind_device(Some(name.as_bytes()))?;
    }
    // Without a device binding the receiving interface is only known from
    // IP_PKTINFO.
    setsockopt(&socket, sockopt::Ipv4PacketInfo, &true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Reads one datagram and the interface index it arrived on.
fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Option<u32>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!(libc::in_pktinfo);
    let msg = recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    let mut ifindex = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
            ifindex = u32::try_from(info.ipi_ifindex).ok();
        }
    }
    Ok((msg.bytes, ifindex))
}

/// A running listener. Dropping it without [`Listener::close`] leaves the
/// receive loop running.
pub struct Listener {
    name: String,
    local_addr: SocketAddrV4,
    cancel: CancellationToken,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl Listener {
    /// Opens a listener on UDP `port` and starts its receive loop.
    ///
    /// With `device` set the socket is bound to that VRF and routes are
    /// looked up in its table; a non-VRF device fails with
    /// [`crate::error::DhcpdError::NotVrf`]. Without it the socket serves
    /// every interface from the main table.
    pub fn spawn(
        device: Option<&str>,
        port: u16,
        config: Arc<ServerConfig>,
        kernel: Arc<dyn KernelLinks>,
        source: Option<Ipv4Addr>,
        in_flight: Arc<Semaphore>,
    ) -> Result<Self> {
        let table = match device {
            Some(name) => kernel.vrf_table(name)?,
            None => MAIN_TABLE,
        };
        let name = device.unwrap_or("NONE").to_string();

        let socket = bind_socket(device, port)?;
        let local_addr = socket
            .local_addr()?
            .as_socket_ipv4()
            .unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let socket = SharedSocket(Arc::new(socket));
        let fd = AsyncFd::new(socket.clone())?;
        let transport = Arc::new(SocketTransport { socket });
        let responder = Arc::new(Responder::new(config, kernel, transport, table, source));

        let span = info_span!("listener", interface = %name);
        span.in_scope(|| {
            info!(table, "Listen {local_addr}");
            match source {
                Some(ip) => info!(%ip, "Sending from source address"),
                None => info!("No source address, using the lease gateway as server identifier"),
            }
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            receive_loop(fd, responder, in_flight, cancel.clone()).instrument(span),
        );

        Ok(Self {
            name,
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    /// Resolves when the receive loop stops on its own. A loop that fails
    /// to read from its socket returns the error; cancellation through
    /// [`Listener::close`] never reaches here.
    pub async fn finished(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.task = None;
        outcome.map_err(io::Error::from)??;
        Ok(())
    }

    /// Stops the receive loop and waits for it to release the socket.
    /// Replies already being composed still complete.
    pub async fn close(self) {
        info!(interface = %self.name, addr = %self.local_addr, "Closing listener");
        self.cancel.cancel();
        let Some(task) = self.task else {
            return;
        };
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(interface = %self.name, error = %e, "Listener had failed"),
            Err(e) => error!(interface = %self.name, error = %e, "Listener task failed"),
        }
    }
}

async fn receive_loop(
    fd: AsyncFd<SharedSocket>,
    responder: Arc<Responder>,
    in_flight: Arc<Semaphore>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let mut guard = tokio::select! {
            _ = cancel.cancelled() => break,
            ready = fd.readable() => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    error!(error = %e, "Error polling listener socket");
                    return Err(e);
                }
            },
        };

        let (len, ifindex) =
            match guard.try_io(|inner| recv_datagram(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    error!(error = %e, "Error reading from connection");
                    return Err(e);
                }
                Err(_would_block) => continue,
            };

        let Some(ifindex) = ifindex else {
            warn!("Datagram without packet info, dropping");
            continue;
        };

        let Ok(permit) = in_flight.clone().try_acquire_owned() else {
            warn!(ifindex, "Too many requests in flight, dropping datagram");
            continue;
        };

        debug!(ifindex, len, "Received datagram");
        let datagram = buf[..len].to_vec();
        let responder = responder.clone();
        let span = Span::current();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _entered = span.enter();
            responder.handle(ifindex, &datagram);
        });
    }
    debug!("Receive loop finished");
    Ok(())
}
