//! Audit collaborator seam.
//!
//! The stack reports anomalies as structured JSON events. The collaborator
//! is fire-and-forget: whatever it does with an event never feeds back
//! into stack state.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

/// Structured audit event.
///
/// Serialized with a `kind` tag, e.g.
/// `{"kind":"malformed_packet","src":"10.0.0.9","reason":"...","repeats":3,"ts":"..."}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Input bytes that failed validation.
    MalformedPacket {
        /// Source address when the IP header was readable.
        src: Option<String>,
        /// Parser's rejection reason.
        reason: &'static str,
        /// Malformed packets seen from this source so far (1 when the
        /// source is unknown).
        repeats: u32,
        /// Event timestamp, RFC 3339.
        ts: String,
    },
    /// A protocol the stack relays opaquely.
    UnexpectedProtocol {
        /// Source address.
        src: String,
        /// IP protocol number.
        protocol: u8,
        /// Event timestamp, RFC 3339.
        ts: String,
    },
    /// The forwarding collaborator refused a packet.
    ForwardingFailure {
        /// Flow 5-tuple, rendered.
        flow: String,
        /// Collaborator's error.
        reason: String,
        /// Event timestamp, RFC 3339.
        ts: String,
    },
    /// A flow reaped by the poll driver.
    FlowExpired {
        /// Flow 5-tuple, rendered.
        flow: String,
        /// Why it was reaped.
        reason: &'static str,
        /// Event timestamp, RFC 3339.
        ts: String,
    },
    /// A completed forwarding response the stack could not enqueue.
    ResponseDropped {
        /// Why the response was dropped.
        reason: String,
        /// Response length, bytes.
        len: usize,
        /// Event timestamp, RFC 3339.
        ts: String,
    },
    /// An outbound packet dropped for exceeding the age horizon.
    StalePacketDropped {
        /// Age at drop time, milliseconds.
        age_ms: u64,
        /// Packet length, bytes.
        len: usize,
        /// Event timestamp, RFC 3339.
        ts: String,
    },
}

/// Current time in the format audit events carry.
pub fn event_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Sink for audit events. Failures inside a sink must stay inside it.
pub trait AuditSink: Send + Sync {
    /// Deliver one event. Infallible from the stack's point of view.
    fn emit(&self, event: &AuditEvent);
}

/// Sink that logs each event as one JSON line under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::info!(target: "audit", %json, "audit event"),
            Err(e) => tracing::warn!(target: "audit", error = %e, "unserializable audit event"),
        }
    }
}
