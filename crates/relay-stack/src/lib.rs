//! User-space IP packet relay stack.
//!
//! The host hands raw IP datagrams in, the stack tracks flows, translates
//! ports, forwards payloads to an external collaborator, and buffers the
//! responses for the host to drain. Everything is poll-driven: the stack
//! owns no threads and advances time-based state only inside [`poll`].
//!
//! # Architecture
//!
//! ```text
//!             ┌────────────────────────────────────────────────┐
//!             │                 RelayStack                     │
//!             │                                                │
//!  OS read ──▶│ process_packet ─▶ ┌──────────────────┐         │
//!  loop       │                   │ InboundPipeline  │         │
//!             │                   │ parse → track →  │──┐      │
//!             │                   │ forward          │  │      │
//!             │                   └────────┬─────────┘  │      │
//!             │                            │            ▼      │
//!             │                      ┌─────▼─────┐  Forwarder  │
//!             │                      │ FlowTable │  (external) │
//!             │                      └─────▲─────┘     │       │
//!  timer ────▶│ poll ── sweep flows ───────┘           │       │
//!             │    └──── age queue ──┐    responses ◀──┘       │
//!             │                      ▼        │                │
//!  OS write ◀─│ get_outbound ◀─ ┌──────────────┐               │
//!  loop       │   _packet       │OutboundQueue │◀── ingest     │
//!             │                 └──────────────┘               │
//!             └────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! The three data-path entry points are safe to call from independent
//! threads (an OS read loop, an OS write loop, a timer). The controller
//! serializes lifecycle transitions against in-flight calls with a
//! read/write lock; the flow table and outbound queue synchronize
//! internally so unrelated flows do not stall each other.
//!
//! [`poll`]: RelayStack::poll

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod config;
pub mod flow;
pub mod forward;
pub mod packet;
pub mod pipeline;
pub mod poll;
pub mod queue;
pub mod stack;
pub mod stats;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use config::StackConfig;
pub use flow::{FlowState, FlowTable};
pub use forward::{ChannelForwarder, Forwarder, NullForwarder};
pub use packet::{Packet, Transport};
pub use queue::OutboundQueue;
pub use relay_common::{FlowKey, FlowPhase, RelayError, RelayResult};
pub use stack::{LifecyclePhase, RelayStack};
pub use stats::{StackStats, StatsSnapshot};

/// Absolute upper bound on a single datagram (jumbo frame).
pub const MAX_PACKET_SIZE: usize = 9216;
