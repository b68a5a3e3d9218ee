//! Link-layer capture via an AF_PACKET raw socket.

use crate::classify::Transport;
use smoltcp::wire::{EthernetFrame, EthernetProtocol, IPV4_HEADER_LEN, Ipv4Packet};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

/// Receive buffer size; large enough for any non-offloaded frame.
pub const CAPTURE_BUFFER: usize = 65536;

/// Capture setup errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No such interface {name}: {source}")]
    NoInterface {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Capture socket error: {0}")]
    Socket(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// IPv4 header fields of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedPacket {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub transport: Transport,
    /// Wire length of the frame, saturated to `u16::MAX`.
    pub size: u16,
}

/// Decode an Ethernet frame carrying IPv4.
///
/// `frame` is the captured bytes, `wire_len` the original frame length.
/// Only the IPv4 header has to be present, so truncated captures of large
/// packets still parse. Returns `None` for non-IPv4 or malformed frames.
pub fn parse_frame(frame: &[u8], wire_len: usize) -> Option<CapturedPacket> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }

    let payload = eth.payload();
    if payload.len() < IPV4_HEADER_LEN {
        return None;
    }
    let ip = Ipv4Packet::new_unchecked(payload);
    let header_len = usize::from(ip.header_len());
    if ip.version() != 4 || header_len < IPV4_HEADER_LEN || header_len > payload.len() {
        return None;
    }

    Some(CapturedPacket {
        src: ip.src_addr(),
        dst: ip.dst_addr(),
        transport: Transport::from_ip_protocol(ip.next_header().into()),
        size: u16::try_from(wire_len).unwrap_or(u16::MAX),
    })
}

/// Source of captured link-layer frames.
pub trait FrameSource {
    /// Wait for the next frame and copy as much of it as fits into `buf`.
    ///
    /// Returns the full wire length, which may exceed `buf.len()`.
    fn recv_frame(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>>;

    /// Interface or source name, for logging.
    fn name(&self) -> &str;
}

/// Raw capture socket bound to one interface.
pub struct PacketCapture {
    fd: AsyncFd<Socket>,
    interface: String,
}

impl PacketCapture {
    /// Open a capture on `interface`. Must run inside a tokio runtime.
    pub fn open(interface: &str, promiscuous: bool) -> Result<Self> {
        let if_index =
            nix::net::if_::if_nametoindex(interface).map_err(|source| CaptureError::NoInterface {
                name: interface.to_string(),
                source,
            })?;

        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(libc::ETH_P_ALL)),
        )?;
        socket.set_nonblocking(true)?;

        // Bind to interface using sockaddr_ll
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        addr.sll_ifindex = if_index as i32;

        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(CaptureError::Socket(io::Error::last_os_error()));
        }

        if promiscuous {
            let mut mreq: libc::packet_mreq = unsafe { std::mem::zeroed() };
            mreq.mr_ifindex = if_index as i32;
            mreq.mr_type = libc::PACKET_MR_PROMISC as u16;

            let ret = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_PACKET,
                    libc::PACKET_ADD_MEMBERSHIP,
                    &mreq as *const libc::packet_mreq as *const libc::c_void,
                    std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(CaptureError::Socket(io::Error::last_os_error()));
            }
        }

        info!(interface, if_index, promiscuous, "Capture opened");

        Ok(PacketCapture {
            fd: AsyncFd::new(socket)?,
            interface: interface.to_string(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Wait for the next frame and copy as much of it as fits into `buf`.
    ///
    /// Returns the full wire length, which may exceed `buf.len()`.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;

            let result = guard.try_io(|fd| {
                let ret = unsafe {
                    libc::recv(
                        fd.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        libc::MSG_TRUNC,
                    )
                };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            });

            match result {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {
                    debug!("Capture socket would block");
                    continue;
                }
            }
        }
    }
}

impl FrameSource for PacketCapture {
    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).await
    }

    fn name(&self) -> &str {
        &self.interface
    }
}
