//! Inbound packet pipeline.
//!
//! parse → flow tracking → forward. Each stage either advances the packet
//! or rejects it with a taxonomy error; rejected input never leaves
//! partial state behind. Responses from the forwarding collaborator enter
//! through [`InboundPipeline::ingest_response`], shared with the poll
//! driver.

use crate::audit::{event_timestamp, AuditEvent, AuditSink};
use crate::config::StackConfig;
use crate::flow::FlowTable;
use crate::forward::Forwarder;
use crate::packet::{Packet, Transport};
use crate::queue::OutboundQueue;
use crate::stats::StackStats;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_common::{RelayError, RelayResult, Timestamp};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Per-source malformed counters are bounded to keep a hostile peer from
/// growing the map without limit.
const MALFORMED_SOURCES_MAX: usize = 1024;

/// Validates and routes packets arriving from the operating system.
pub struct InboundPipeline {
    config: StackConfig,
    table: Arc<FlowTable>,
    queue: Arc<OutboundQueue>,
    forwarder: Arc<dyn Forwarder>,
    audit: Arc<dyn AuditSink>,
    stats: Arc<StackStats>,
    malformed_sources: Mutex<HashMap<IpAddr, u32>>,
}

impl InboundPipeline {
    /// Wire the pipeline to its collaborators.
    pub fn new(
        config: StackConfig,
        table: Arc<FlowTable>,
        queue: Arc<OutboundQueue>,
        forwarder: Arc<dyn Forwarder>,
        audit: Arc<dyn AuditSink>,
        stats: Arc<StackStats>,
    ) -> Self {
        Self {
            config,
            table,
            queue,
            forwarder,
            audit,
            stats,
            malformed_sources: Mutex::new(HashMap::new()),
        }
    }

    /// Process one raw IP datagram from the host.
    ///
    /// Runs to completion or fails synchronously; there is no partial
    /// mutation on any error path before the flow stage commits.
    pub fn process(&self, raw: &[u8]) -> RelayResult<()> {
        if raw.len() > self.config.max_packet_size {
            return Err(self.reject_malformed(raw, "oversized datagram"));
        }

        let packet = match Packet::parse(Bytes::copy_from_slice(raw)) {
            Ok(p) => p,
            Err(RelayError::MalformedPacket(reason)) => {
                return Err(self.reject_malformed(raw, reason));
            }
            Err(other) => return Err(other),
        };

        let now = Timestamp::now();
        self.track_flow(&packet, now)?;
        self.stats.rx_packets.incr();
        self.stats.rx_bytes.add(packet.len() as u64);

        let responses = match self.forwarder.forward(&packet) {
            Ok(responses) => responses,
            Err(RelayError::ForwardingFailure(reason)) => {
                self.stats.forward_failures.incr();
                self.audit.emit(&AuditEvent::ForwardingFailure {
                    flow: packet.flow_key().to_string(),
                    reason: reason.clone(),
                    ts: event_timestamp(),
                });
                return Err(RelayError::ForwardingFailure(reason));
            }
            Err(other) => return Err(other),
        };

        for bytes in responses {
            self.ingest_response(bytes)?;
        }
        Ok(())
    }

    /// Look up or create the flow for this packet and advance its phase.
    fn track_flow(&self, packet: &Packet, now: Timestamp) -> RelayResult<()> {
        let key = packet.flow_key();
        let terminating = packet.is_termination();
        let len = packet.len();

        let updated = self.table.with_flow(&key, |flow| {
            flow.touch(len, now);
            if terminating {
                flow.mark_closing();
            }
        });

        if updated.is_none() {
            let nat_port = self.table.insert(key, now)?;
            self.table.with_flow(&key, |flow| {
                flow.touch(len, now);
                if terminating {
                    flow.mark_closing();
                }
            });
            self.stats.flow_creates.incr();
            tracing::debug!(flow = %key, nat_port, "flow created");

            if let Transport::Other(protocol) = packet.transport() {
                self.audit.emit(&AuditEvent::UnexpectedProtocol {
                    src: packet.src().to_string(),
                    protocol,
                    ts: event_timestamp(),
                });
            }
        }
        Ok(())
    }

    /// Wrap a response datagram from the collaborator and enqueue it for
    /// the host. The first response for a flow completes its round trip.
    pub fn ingest_response(&self, bytes: Bytes) -> RelayResult<()> {
        let packet = match Packet::parse(bytes) {
            Ok(p) => p,
            Err(RelayError::MalformedPacket(reason)) => {
                // A garbled response is a collaborator anomaly, audited
                // like any other malformed input.
                self.stats.malformed.incr();
                self.audit.emit(&AuditEvent::MalformedPacket {
                    src: None,
                    reason,
                    repeats: 1,
                    ts: event_timestamp(),
                });
                return Err(RelayError::MalformedPacket(reason));
            }
            Err(other) => return Err(other),
        };

        let now = Timestamp::now();
        // The tracked flow is keyed on the original direction.
        let tracked = self.table.with_flow(&packet.flow_key().reverse(), |flow| {
            flow.mark_active(now);
        });
        if tracked.is_none() {
            tracing::debug!(key = %packet.flow_key(), "response without a tracked flow");
        }

        self.queue.push(packet, now)
    }

    /// Count, audit, and report one malformed input.
    fn reject_malformed(&self, raw: &[u8], reason: &'static str) -> RelayError {
        self.stats.malformed.incr();

        // Best-effort source extraction from the raw header for repeat
        // tracking; a fully garbled header counts as an unknown source.
        let src = source_hint(raw);
        let repeats = match src {
            Some(addr) => {
                let mut sources = self.malformed_sources.lock();
                if sources.len() >= MALFORMED_SOURCES_MAX && !sources.contains_key(&addr) {
                    sources.clear();
                }
                let count = sources.entry(addr).or_insert(0);
                *count += 1;
                *count
            }
            None => 1,
        };

        self.audit.emit(&AuditEvent::MalformedPacket {
            src: src.map(|a| a.to_string()),
            reason,
            repeats,
            ts: event_timestamp(),
        });
        tracing::warn!(?src, reason, repeats, "malformed packet rejected");
        RelayError::MalformedPacket(reason)
    }
}

/// Pull a source address out of a possibly-invalid header, if the version
/// nibble and length allow it.
fn source_hint(raw: &[u8]) -> Option<IpAddr> {
    match raw.first().map(|b| b >> 4) {
        Some(4) if raw.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(
            raw[12], raw[13], raw[14], raw[15],
        ))),
        Some(6) if raw.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&raw[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}
