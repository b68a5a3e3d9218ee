//! Best-effort datagram fan-out to subscribers.

use crate::registry::SubscriberRegistry;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;
use tracing::{debug, warn};

/// Anything that can send one datagram without blocking.
pub trait DatagramSink {
    fn send_datagram(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize>;
}

impl DatagramSink for tokio::net::UdpSocket {
    fn send_datagram(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.try_send_to(payload, SocketAddr::V4(dest))
    }
}

impl DatagramSink for std::net::UdpSocket {
    fn send_datagram(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        self.send_to(payload, dest)
    }
}

impl<T: DatagramSink + ?Sized> DatagramSink for &T {
    fn send_datagram(&self, payload: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        (**self).send_datagram(payload, dest)
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Subscribers removed because they had expired.
    pub expired: usize,
}

/// Send a datagram to one endpoint, logging failure.
///
/// Returns whether the send succeeded.
pub fn unicast<S: DatagramSink + ?Sized>(sink: &S, payload: &[u8], dest: SocketAddrV4) -> bool {
    match sink.send_datagram(payload, dest) {
        Ok(_) => true,
        Err(e) => {
            warn!(dest = %dest, len = payload.len(), error = %e, "Failed to send datagram");
            false
        }
    }
}

/// Fan-out over a dedicated unconnected socket.
#[derive(Debug)]
pub struct Fanout<S> {
    sink: S,
}

impl<S: DatagramSink> Fanout<S> {
    pub fn new(sink: S) -> Self {
        Fanout { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Send `payload` to every live subscriber.
    ///
    /// Expired subscribers are removed first. A failed send is logged and
    /// does not affect the other subscribers or remove the failing one.
    pub fn broadcast(
        &self,
        registry: &mut SubscriberRegistry,
        payload: &[u8],
        now: Instant,
    ) -> BroadcastReport {
        let mut report = BroadcastReport {
            expired: registry.expire(now),
            ..Default::default()
        };

        for dest in registry.iter() {
            if unicast(&self.sink, payload, dest) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        debug!(
            len = payload.len(),
            delivered = report.delivered,
            failed = report.failed,
            expired = report.expired,
            "Broadcast"
        );
        report
    }
}
