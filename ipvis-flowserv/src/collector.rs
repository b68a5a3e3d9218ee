//! The collector service: one cooperative loop over capture and control.

use crate::batch::FlowBatcher;
use crate::capture::{CAPTURE_BUFFER, CapturedPacket, FrameSource, parse_frame};
use crate::classify::LocalNetwork;
use crate::config::Config;
use crate::dispatch::{ControlDispatcher, ControlOutcome};
use crate::fanout::{BroadcastReport, DatagramSink, Fanout};
use crate::registry::{RegistryFull, SubscriberRegistry, Subscription};
use crate::rules::FirewallRuleSet;
use crate::wire::{MAX_DATAGRAM, SubnetSnapshot};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Counters kept over the collector's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub frames: u64,
    /// Frames that were not IPv4 or failed to parse.
    pub unparsed: u64,
    /// IPv4 packets with zero or two local endpoints.
    pub unclassified: u64,
    pub records: u64,
    pub flushes: u64,
    pub control_datagrams: u64,
    /// Failed capture reads; the loop keeps running after each.
    pub capture_errors: u64,
}

/// Owns every piece of collector state.
pub struct Collector<S> {
    local: LocalNetwork,
    batcher: FlowBatcher,
    registry: SubscriberRegistry,
    dispatcher: ControlDispatcher,
    fanout: Fanout<S>,
    min_rate: Duration,
    stats: CollectorStats,
}

impl<S: DatagramSink> Collector<S> {
    pub fn new(
        config: &Config,
        snapshot: SubnetSnapshot,
        rules: FirewallRuleSet,
        fanout_sink: S,
        now: Instant,
    ) -> Self {
        let local = config.local_network;
        Collector {
            local,
            batcher: FlowBatcher::new(&local, config.batch_capacity, config.min_rate, now),
            registry: SubscriberRegistry::new(
                config.max_clients,
                config.subscriber_timeout,
                config.port,
            ),
            dispatcher: ControlDispatcher::new(snapshot, rules),
            fanout: Fanout::new(fanout_sink),
            min_rate: config.min_rate,
            stats: CollectorStats::default(),
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn batcher(&self) -> &FlowBatcher {
        &self.batcher
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Register a subscriber outside the control protocol.
    pub fn subscribe(
        &mut self,
        addr: SocketAddrV4,
        now: Instant,
    ) -> Result<Subscription, RegistryFull> {
        self.registry.subscribe(addr, now)
    }

    /// Handle one captured frame.
    ///
    /// Returns the broadcast report when the frame caused a flush.
    pub fn on_frame(&mut self, frame: &[u8], wire_len: usize, now: Instant) -> Option<BroadcastReport> {
        self.stats.frames += 1;
        match parse_frame(frame, wire_len) {
            Some(packet) => self.on_packet(packet, now),
            None => {
                self.stats.unparsed += 1;
                None
            }
        }
    }

    /// Classify a decoded packet and feed the batcher.
    pub fn on_packet(&mut self, packet: CapturedPacket, now: Instant) -> Option<BroadcastReport> {
        let Some(record) = self
            .local
            .classify(packet.src, packet.dst, packet.size, packet.transport)
        else {
            self.stats.unclassified += 1;
            return None;
        };

        self.stats.records += 1;
        let datagram = self.batcher.append(record, now)?;
        self.stats.flushes += 1;
        Some(self.fanout.broadcast(&mut self.registry, &datagram, now))
    }

    /// Handle one control datagram; replies go out through `reply`.
    pub fn on_control<R: DatagramSink + ?Sized>(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        reply: &R,
        now: Instant,
    ) -> ControlOutcome {
        self.stats.control_datagrams += 1;
        self.dispatcher.handle(
            datagram,
            from,
            now,
            &mut self.registry,
            reply,
            &self.fanout,
        )
    }

    /// Run until `shutdown` resolves.
    ///
    /// Each iteration waits at most `min_rate` for a frame, then drains at
    /// most one pending control datagram without blocking. A failed capture
    /// read is logged and retried after `min_rate`.
    pub async fn run<C, F>(mut self, capture: C, control: UdpSocket, shutdown: F) -> CollectorStats
    where
        C: FrameSource,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut frame_buf = vec![0u8; CAPTURE_BUFFER];
        let mut control_buf = vec![0u8; MAX_DATAGRAM + 1];

        info!(
            interface = capture.name(),
            network = %self.local,
            control = ?control.local_addr().ok(),
            "Collector running"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                result = tokio::time::timeout(self.min_rate, capture.recv_frame(&mut frame_buf)) => {
                    match result {
                        Ok(Ok(wire_len)) => {
                            let captured = wire_len.min(frame_buf.len());
                            self.on_frame(&frame_buf[..captured], wire_len, Instant::now());
                        }
                        Ok(Err(e)) => {
                            self.stats.capture_errors += 1;
                            warn!(error = %e, "Capture read failed");
                            tokio::time::sleep(self.min_rate).await;
                        }
                        Err(_elapsed) => {}
                    }
                }
            }

            match control.try_recv_from(&mut control_buf) {
                Ok((n, from)) => {
                    let outcome = self.on_control(&control_buf[..n], from, &control, Instant::now());
                    debug!(from = %from, ?outcome, "Handled control datagram");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => debug!(error = %e, "Control receive failed"),
            }
        }

        info!(
            frames = self.stats.frames,
            records = self.stats.records,
            flushes = self.stats.flushes,
            subscribers = self.registry.len(),
            "Collector stopped"
        );
        self.stats
    }
}
