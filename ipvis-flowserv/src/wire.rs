//! Datagram envelope and payload codecs.
//!
//! Every datagram, in both directions, is a 4-byte envelope followed by a
//! payload:
//!
//! ```text
//! version:u8 | type:u8 | reserved:u16 | payload
//! ```
//!
//! All multi-byte integers are big-endian.

use crate::classify::{Direction, FlowRecord, Transport};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Protocol version carried in every envelope.
pub const VERSION: u8 = 1;

/// Envelope header length.
pub const HEADER_LEN: usize = 4;

/// Largest datagram sent or accepted (Ethernet MTU minus IPv4 and UDP headers).
pub const MAX_DATAGRAM: usize = 1472;

/// Largest payload after the envelope.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

const FLOW_HEADER_LEN: usize = 7;
const FLOW_RECORD_LEN: usize = 8;
const SUBNET_HEADER_LEN: usize = 11;
const SUBNET_ENTRY_LEN: usize = 8;
const RULE_HEADER_LEN: usize = 4;

/// Most flow records that fit in one datagram.
pub const MAX_BATCH_RECORDS: usize = (MAX_PAYLOAD - FLOW_HEADER_LEN) / FLOW_RECORD_LEN;

/// Most subnet entries that fit in one snapshot datagram.
pub const MAX_SUBNET_ENTRIES: usize = (MAX_PAYLOAD - SUBNET_HEADER_LEN) / SUBNET_ENTRY_LEN;

/// Longest rule descriptor that fits in one FWRULE datagram.
pub const MAX_RULE_LEN: usize = MAX_PAYLOAD - RULE_HEADER_LEN;

/// Wire decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated datagram: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("Unknown packet type {0}")]
    UnknownType(u8),

    #[error("Payload of {0} bytes exceeds the datagram limit")]
    Oversized(usize),
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Envelope packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Flow = 1,
    Subnet = 2,
    Firewall = 3,
    FwRule = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Flow),
            2 => Ok(PacketType::Subnet),
            3 => Ok(PacketType::Firewall),
            4 => Ok(PacketType::FwRule),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// A decoded envelope borrowing its payload from the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage<'a> {
    pub packet_type: PacketType,
    pub payload: &'a [u8],
}

impl<'a> WireMessage<'a> {
    pub fn new(packet_type: PacketType, payload: &'a [u8]) -> Self {
        WireMessage {
            packet_type,
            payload,
        }
    }

    /// Parse an envelope. The reserved field is ignored.
    pub fn decode(datagram: &'a [u8]) -> Result<Self> {
        if datagram.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                got: datagram.len(),
            });
        }
        if datagram[0] != VERSION {
            return Err(DecodeError::BadVersion(datagram[0]));
        }
        let packet_type = PacketType::try_from(datagram[1])?;
        let payload = &datagram[HEADER_LEN..];
        if payload.len() > MAX_PAYLOAD {
            return Err(DecodeError::Oversized(payload.len()));
        }

        Ok(WireMessage {
            packet_type,
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = envelope(self.packet_type, self.payload.len());
        buf.extend_from_slice(self.payload);
        buf
    }
}

/// Start a datagram with the envelope header written.
fn envelope(packet_type: PacketType, payload_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
    buf.push(VERSION);
    buf.push(packet_type as u8);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// FLOW request (client to server): subscribe or unsubscribe the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRequest {
    pub flow_on: bool,
}

impl FlowRequest {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(FlowRequest {
            flow_on: r.u8()? != 0,
        })
    }

    pub fn to_datagram(&self) -> Vec<u8> {
        WireMessage::new(PacketType::Flow, &[self.flow_on as u8]).encode()
    }
}

/// SUBNET request (client to server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetRequest {
    pub request_id: u32,
}

impl SubnetRequest {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(SubnetRequest {
            request_id: r.u32()?,
        })
    }

    pub fn to_datagram(&self) -> Vec<u8> {
        WireMessage::new(PacketType::Subnet, &self.request_id.to_be_bytes()).encode()
    }
}

/// FWRULE request (client to server); carries no payload.
pub fn rule_request() -> Vec<u8> {
    WireMessage::new(PacketType::FwRule, &[]).encode()
}

/// FIREWALL alert datagram wrapping an opaque payload.
pub fn firewall_alert(payload: &[u8]) -> Vec<u8> {
    WireMessage::new(PacketType::Firewall, payload).encode()
}

/// A batch of flow records for the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowBatch {
    pub base: Ipv4Addr,
    pub prefix_len: u8,
    /// Records in arrival order.
    pub records: Vec<FlowRecord>,
}

impl FlowBatch {
    pub fn new(base: Ipv4Addr, prefix_len: u8, capacity: usize) -> Self {
        FlowBatch {
            base,
            prefix_len,
            records: Vec::with_capacity(capacity),
        }
    }

    /// Encode as a FLOW datagram.
    ///
    /// Callers keep `records.len()` at or below [`MAX_BATCH_RECORDS`].
    pub fn to_datagram(&self) -> Vec<u8> {
        let payload_len = FLOW_HEADER_LEN + self.records.len() * FLOW_RECORD_LEN;
        let mut buf = envelope(PacketType::Flow, payload_len);
        buf.extend_from_slice(&u32::from(self.base).to_be_bytes());
        buf.push(self.prefix_len);
        buf.extend_from_slice(&(self.records.len() as u16).to_be_bytes());
        for record in &self.records {
            buf.push(match record.direction {
                Direction::Outgoing => 0,
                Direction::Incoming => 1,
            });
            buf.extend_from_slice(&record.host.to_be_bytes());
            buf.push(match record.transport {
                Transport::Tcp => 0,
                Transport::Udp => 1,
                Transport::Other => 2,
            });
            buf.extend_from_slice(&record.size.to_be_bytes());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let base = Ipv4Addr::from(r.u32()?);
        let prefix_len = r.u8()?;
        let count = r.u16()? as usize;

        let mut records = Vec::with_capacity(count.min(MAX_BATCH_RECORDS));
        for _ in 0..count {
            let direction = match r.u8()? {
                0 => Direction::Outgoing,
                _ => Direction::Incoming,
            };
            let host = r.u32()?;
            let transport = match r.u8()? {
                0 => Transport::Tcp,
                1 => Transport::Udp,
                _ => Transport::Other,
            };
            let size = r.u16()?;
            records.push(FlowRecord {
                direction,
                host,
                transport,
                size,
            });
        }

        Ok(FlowBatch {
            base,
            prefix_len,
            records,
        })
    }
}

/// One subnet inside the local network, network bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetEntry {
    pub base: u32,
    pub mask: u32,
}

/// Subnet topology reply (server to client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetSnapshot {
    pub request_id: u32,
    pub base: Ipv4Addr,
    pub prefix_len: u8,
    pub entries: Vec<SubnetEntry>,
}

impl SubnetSnapshot {
    /// Encode as a SUBNET datagram.
    ///
    /// Callers keep `entries.len()` at or below [`MAX_SUBNET_ENTRIES`].
    pub fn to_datagram(&self) -> Vec<u8> {
        let payload_len = SUBNET_HEADER_LEN + self.entries.len() * SUBNET_ENTRY_LEN;
        let mut buf = envelope(PacketType::Subnet, payload_len);
        buf.extend_from_slice(&self.request_id.to_be_bytes());
        buf.extend_from_slice(&u32::from(self.base).to_be_bytes());
        buf.push(self.prefix_len);
        buf.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.base.to_be_bytes());
            buf.extend_from_slice(&entry.mask.to_be_bytes());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let request_id = r.u32()?;
        let base = Ipv4Addr::from(r.u32()?);
        let prefix_len = r.u8()?;
        let count = r.u16()? as usize;

        let mut entries = Vec::with_capacity(count.min(MAX_SUBNET_ENTRIES));
        for _ in 0..count {
            entries.push(SubnetEntry {
                base: r.u32()?,
                mask: r.u32()?,
            });
        }

        Ok(SubnetSnapshot {
            request_id,
            base,
            prefix_len,
            entries,
        })
    }
}

/// One firewall rule in an FWRULE reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleChunk<'a> {
    /// 0-based position in the rule set.
    pub index: u16,
    /// Size of the full rule set.
    pub total: u16,
    pub rule: &'a [u8],
}

impl<'a> RuleChunk<'a> {
    pub fn to_datagram(&self) -> Vec<u8> {
        let mut buf = envelope(PacketType::FwRule, RULE_HEADER_LEN + self.rule.len());
        buf.extend_from_slice(&self.index.to_be_bytes());
        buf.extend_from_slice(&self.total.to_be_bytes());
        buf.extend_from_slice(self.rule);
        buf
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let index = r.u16()?;
        let total = r.u16()?;
        Ok(RuleChunk {
            index,
            total,
            rule: r.rest(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_layout() {
        let datagram = FlowRequest { flow_on: true }.to_datagram();
        assert_eq!(datagram, vec![VERSION, 1, 0, 0, 1]);
    }

    #[test]
    fn decode_rejects_short_datagram() {
        assert_eq!(
            WireMessage::decode(&[1, 1]),
            Err(DecodeError::Truncated { needed: 4, got: 2 })
        );
    }

    #[test]
    fn decode_rejects_wrong_version() {
        assert_eq!(
            WireMessage::decode(&[9, 1, 0, 0, 1]),
            Err(DecodeError::BadVersion(9))
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert_eq!(
            WireMessage::decode(&[VERSION, 0, 0, 0]),
            Err(DecodeError::UnknownType(0))
        );
        assert_eq!(
            WireMessage::decode(&[VERSION, 5, 0, 0]),
            Err(DecodeError::UnknownType(5))
        );
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut datagram = vec![VERSION, 3, 0, 0];
        datagram.resize(MAX_DATAGRAM + 1, 0xaa);
        assert_eq!(
            WireMessage::decode(&datagram),
            Err(DecodeError::Oversized(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn decode_ignores_reserved_field() {
        let msg = WireMessage::decode(&[VERSION, 4, 0xde, 0xad]).unwrap();
        assert_eq!(msg.packet_type, PacketType::FwRule);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn truncated_flow_request() {
        assert!(matches!(
            FlowRequest::decode(&[]),
            Err(DecodeError::Truncated { .. })
        ));
        assert_eq!(FlowRequest::decode(&[0]).unwrap(), FlowRequest { flow_on: false });
        assert_eq!(FlowRequest::decode(&[7]).unwrap(), FlowRequest { flow_on: true });
    }

    #[test]
    fn truncated_subnet_request() {
        assert!(SubnetRequest::decode(&[0, 0, 7]).is_err());
        assert_eq!(SubnetRequest::decode(&[0, 0, 0, 7]).unwrap().request_id, 7);
    }

    #[test]
    fn flow_batch_layout() {
        let batch = FlowBatch {
            base: Ipv4Addr::new(10, 1, 0, 0),
            prefix_len: 16,
            records: vec![FlowRecord {
                direction: Direction::Incoming,
                host: 0x0203,
                transport: Transport::Udp,
                size: 1500,
            }],
        };

        let datagram = batch.to_datagram();
        assert_eq!(
            datagram,
            vec![
                VERSION, 1, 0, 0, // envelope
                10, 1, 0, 0, 16, 0, 1, // base, prefix, count
                1, 0, 0, 2, 3, 1, 0x05, 0xdc, // record
            ]
        );

        let msg = WireMessage::decode(&datagram).unwrap();
        assert_eq!(FlowBatch::decode(msg.payload).unwrap(), batch);
    }

    #[test]
    fn flow_batch_with_missing_records_is_truncated() {
        // count says 2, only one record present
        let payload = [10, 1, 0, 0, 16, 0, 2, 1, 0, 0, 2, 3, 1, 0x05, 0xdc];
        assert!(matches!(
            FlowBatch::decode(&payload),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn full_batch_fits_in_datagram() {
        let mut batch = FlowBatch::new(Ipv4Addr::UNSPECIFIED, 0, MAX_BATCH_RECORDS);
        batch.records.resize(
            MAX_BATCH_RECORDS,
            FlowRecord {
                direction: Direction::Outgoing,
                host: 1,
                transport: Transport::Tcp,
                size: 40,
            },
        );
        assert!(batch.to_datagram().len() <= MAX_DATAGRAM);
    }

    #[test]
    fn subnet_snapshot_layout() {
        let snapshot = SubnetSnapshot {
            request_id: 42,
            base: Ipv4Addr::new(129, 123, 0, 0),
            prefix_len: 16,
            entries: vec![SubnetEntry {
                base: 0x0400,
                mask: 0xffff_ff00,
            }],
        };

        let datagram = snapshot.to_datagram();
        assert_eq!(&datagram[..4], &[VERSION, 2, 0, 0]);
        assert_eq!(datagram.len(), HEADER_LEN + 11 + 8);

        let msg = WireMessage::decode(&datagram).unwrap();
        assert_eq!(msg.packet_type, PacketType::Subnet);
        assert_eq!(SubnetSnapshot::decode(msg.payload).unwrap(), snapshot);
    }

    #[test]
    fn rule_chunk_layout() {
        let chunk = RuleChunk {
            index: 2,
            total: 5,
            rule: b"deny tcp any 23",
        };
        let datagram = chunk.to_datagram();
        assert_eq!(&datagram[..8], &[VERSION, 4, 0, 0, 0, 2, 0, 5]);

        let msg = WireMessage::decode(&datagram).unwrap();
        assert_eq!(RuleChunk::decode(msg.payload).unwrap(), chunk);
    }
}
