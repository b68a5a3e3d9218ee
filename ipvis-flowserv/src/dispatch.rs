//! Control datagram handling.
//!
//! | Type     | Action                                                   |
//! |----------|----------------------------------------------------------|
//! | FLOW     | subscribe or unsubscribe the sender                      |
//! | SUBNET   | reply with the cached snapshot under the request id      |
//! | FIREWALL | relay the datagram verbatim to every live subscriber     |
//! | FWRULE   | reply with the rule set, one datagram per rule           |
//!
//! Malformed datagrams are dropped without a reply.

use crate::fanout::{BroadcastReport, DatagramSink, Fanout, unicast};
use crate::registry::{SubscriberRegistry, Subscription};
use crate::rules::FirewallRuleSet;
use crate::wire::{DecodeError, FlowRequest, PacketType, SubnetRequest, SubnetSnapshot, WireMessage};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;
use tracing::debug;

/// What a control datagram caused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Subscribed(Subscription),
    /// Registry full; the requester gets no reply.
    SubscribeRejected,
    /// Whether the sender had been registered.
    Unsubscribed(bool),
    SubnetsSent,
    Relayed(BroadcastReport),
    /// Number of rule datagrams sent.
    RulesSent(usize),
    Ignored(IgnoreReason),
}

/// Why a datagram was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    Malformed(DecodeError),
    /// Only IPv4 peers are served.
    NotIpv4,
}

/// Holds the cached replies and applies control messages.
#[derive(Debug)]
pub struct ControlDispatcher {
    snapshot: SubnetSnapshot,
    rules: FirewallRuleSet,
}

impl ControlDispatcher {
    pub fn new(snapshot: SubnetSnapshot, rules: FirewallRuleSet) -> Self {
        ControlDispatcher { snapshot, rules }
    }

    pub fn snapshot(&self) -> &SubnetSnapshot {
        &self.snapshot
    }

    pub fn rules(&self) -> &FirewallRuleSet {
        &self.rules
    }

    /// Apply one inbound datagram from `from`.
    ///
    /// Direct replies go through `reply`; relays go through `fanout`.
    pub fn handle<R, F>(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        now: Instant,
        registry: &mut SubscriberRegistry,
        reply: &R,
        fanout: &Fanout<F>,
    ) -> ControlOutcome
    where
        R: DatagramSink + ?Sized,
        F: DatagramSink,
    {
        let from = match from {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => {
                debug!(from = %addr, "Ignoring control datagram from IPv6 peer");
                return ControlOutcome::Ignored(IgnoreReason::NotIpv4);
            }
        };

        match self.dispatch(datagram, from, now, registry, reply, fanout) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(from = %from, len = datagram.len(), error = %e, "Dropping malformed control datagram");
                ControlOutcome::Ignored(IgnoreReason::Malformed(e))
            }
        }
    }

    fn dispatch<R, F>(
        &mut self,
        datagram: &[u8],
        from: SocketAddrV4,
        now: Instant,
        registry: &mut SubscriberRegistry,
        reply: &R,
        fanout: &Fanout<F>,
    ) -> Result<ControlOutcome, DecodeError>
    where
        R: DatagramSink + ?Sized,
        F: DatagramSink,
    {
        let msg = WireMessage::decode(datagram)?;

        let outcome = match msg.packet_type {
            PacketType::Flow => {
                let request = FlowRequest::decode(msg.payload)?;
                if request.flow_on {
                    match registry.subscribe(from, now) {
                        Ok(subscription) => ControlOutcome::Subscribed(subscription),
                        Err(e) => {
                            debug!(from = %from, error = %e, "Subscribe rejected");
                            ControlOutcome::SubscribeRejected
                        }
                    }
                } else {
                    ControlOutcome::Unsubscribed(registry.unsubscribe(from))
                }
            }
            PacketType::Subnet => {
                let request = SubnetRequest::decode(msg.payload)?;
                debug!(from = %from, request_id = request.request_id, "Received a subnet request");
                self.snapshot.request_id = request.request_id;
                unicast(reply, &self.snapshot.to_datagram(), from);
                ControlOutcome::SubnetsSent
            }
            PacketType::Firewall => {
                ControlOutcome::Relayed(fanout.broadcast(registry, datagram, now))
            }
            PacketType::FwRule => {
                debug!(from = %from, "Received a request for firewall rules");
                ControlOutcome::RulesSent(self.rules.send_rules(reply, from))
            }
        };

        Ok(outcome)
    }
}
