//! Address classification against the local network.
//!
//! A packet is reported only when exactly one of its endpoints lies inside
//! the local network. The reported address is that endpoint with the network
//! bits cleared, so only host-identifying bits ever leave the process.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// Direction of a reported packet, seen from the local network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Destination is local.
    Incoming,
    /// Source is local.
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "in",
            Direction::Outgoing => "out",
        }
    }
}

/// Transport protocol class of a reported packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Other,
}

impl Transport {
    /// Map an IPv4 protocol number to a transport class.
    pub fn from_ip_protocol(protocol: u8) -> Self {
        match protocol {
            6 => Transport::Tcp,
            17 => Transport::Udp,
            _ => Transport::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Other => "other",
        }
    }
}

/// One reported packet event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub direction: Direction,
    /// Local endpoint with the network bits cleared.
    pub host: u32,
    pub transport: Transport,
    /// Wire size of the frame in bytes.
    pub size: u16,
}

impl FlowRecord {
    /// Rebuild the full local address from the network base.
    pub fn address(&self, base: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(base) | self.host)
    }
}

/// The address range this collector is authoritative for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalNetwork {
    base: u32,
    mask: u32,
}

impl LocalNetwork {
    /// Build from an explicit base address and netmask.
    ///
    /// Host bits of `base` are cleared.
    pub fn new(base: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let mask = u32::from(mask);
        LocalNetwork {
            base: u32::from(base) & mask,
            mask,
        }
    }

    pub fn base(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base)
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask)
    }

    /// CIDR prefix length of the mask (leading one bits).
    pub fn prefix_len(&self) -> u8 {
        self.mask.leading_ones() as u8
    }

    /// Whether `addr` falls inside the local network.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask == self.base
    }

    /// Clear the network bits of `addr`.
    pub fn host_bits(&self, addr: Ipv4Addr) -> u32 {
        u32::from(addr) & !self.mask
    }

    /// Classify a packet by its endpoints.
    ///
    /// Returns `None` when neither or both endpoints are local.
    pub fn classify(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        size: u16,
        transport: Transport,
    ) -> Option<FlowRecord> {
        let (direction, local) = match (self.contains(src), self.contains(dst)) {
            (true, false) => (Direction::Outgoing, src),
            (false, true) => (Direction::Incoming, dst),
            _ => return None,
        };

        Some(FlowRecord {
            direction,
            host: self.host_bits(local),
            transport,
            size,
        })
    }
}

impl From<Ipv4Net> for LocalNetwork {
    fn from(net: Ipv4Net) -> Self {
        LocalNetwork::new(net.network(), net.netmask())
    }
}

impl fmt::Display for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base(), self.prefix_len())
    }
}
