//! Stack counters.
//!
//! Relaxed atomics on the hot path, a plain snapshot for readers.

use relay_common::AtomicCounter;

/// Lock-free stack counters.
#[derive(Debug, Default)]
pub struct StackStats {
    /// Datagrams accepted by `process_packet`.
    pub rx_packets: AtomicCounter,
    /// Bytes accepted by `process_packet`.
    pub rx_bytes: AtomicCounter,
    /// Packets handed to the host via `get_outbound_packet`.
    pub tx_packets: AtomicCounter,
    /// Bytes handed to the host.
    pub tx_bytes: AtomicCounter,
    /// Inputs rejected as malformed.
    pub malformed: AtomicCounter,
    /// Flows created.
    pub flow_creates: AtomicCounter,
    /// Flows reaped by the sweep.
    pub flow_expirations: AtomicCounter,
    /// Outbound packets dropped by aging.
    pub queue_drops: AtomicCounter,
    /// Packets refused by the forwarding collaborator.
    pub forward_failures: AtomicCounter,
}

impl StackStats {
    /// Fresh zeroed counters.
    pub const fn new() -> Self {
        Self {
            rx_packets: AtomicCounter::new(),
            rx_bytes: AtomicCounter::new(),
            tx_packets: AtomicCounter::new(),
            tx_bytes: AtomicCounter::new(),
            malformed: AtomicCounter::new(),
            flow_creates: AtomicCounter::new(),
            flow_expirations: AtomicCounter::new(),
            queue_drops: AtomicCounter::new(),
            forward_failures: AtomicCounter::new(),
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_packets: self.rx_packets.get(),
            rx_bytes: self.rx_bytes.get(),
            tx_packets: self.tx_packets.get(),
            tx_bytes: self.tx_bytes.get(),
            malformed: self.malformed.get(),
            flow_creates: self.flow_creates.get(),
            flow_expirations: self.flow_expirations.get(),
            queue_drops: self.queue_drops.get(),
            forward_failures: self.forward_failures.get(),
        }
    }
}

/// Non-atomic stats copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Datagrams accepted.
    pub rx_packets: u64,
    /// Bytes accepted.
    pub rx_bytes: u64,
    /// Packets delivered to the host.
    pub tx_packets: u64,
    /// Bytes delivered to the host.
    pub tx_bytes: u64,
    /// Malformed inputs.
    pub malformed: u64,
    /// Flows created.
    pub flow_creates: u64,
    /// Flows reaped.
    pub flow_expirations: u64,
    /// Aged-out queue drops.
    pub queue_drops: u64,
    /// Forwarding refusals.
    pub forward_failures: u64,
}
