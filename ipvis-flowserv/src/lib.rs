//! ipvis-flowserv: live network-flow collector.
//!
//! Sniffs link-layer traffic on one interface, keeps the packets that touch
//! the local network, batches them into flow records and streams the batches
//! over UDP to every subscribed client.
//!
//! # Architecture
//!
//! ```text
//! AF_PACKET --> parse_frame --> LocalNetwork::classify --> FlowBatcher
//!                                                              |
//!                                                              v
//! control UDP <--> ControlDispatcher <--> SubscriberRegistry --> Fanout --> subscribers
//! ```

pub mod batch;
pub mod capture;
pub mod classify;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod registry;
pub mod rules;
pub mod subnets;
pub mod wire;

// Re-export commonly used types
pub use batch::FlowBatcher;
pub use capture::{CapturedPacket, FrameSource, PacketCapture, parse_frame};
pub use classify::{Direction, FlowRecord, LocalNetwork, Transport};
pub use collector::Collector;
pub use config::{Args, Config};
pub use dispatch::{ControlDispatcher, ControlOutcome};
pub use fanout::{BroadcastReport, DatagramSink, Fanout};
pub use registry::{RegistryFull, SubscriberRegistry, Subscription};
pub use rules::{FirewallRuleSet, RuleProvider};
pub use subnets::{Subnet, SubnetProvider};
pub use wire::{PacketType, WireMessage};
