//! Concurrent flow table.
//!
//! Open-addressed table with per-entry locks: lookups and updates for
//! unrelated flows never contend, and the configured capacity is a hard
//! ceiling. Time-based removal happens only in [`FlowTable::sweep`],
//! driven by the poll driver.

use crate::config::StackConfig;
use relay_common::{FlowKey, FlowPhase, RelayError, RelayResult, Timestamp};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Per-flow tracked state.
#[derive(Debug, Clone)]
pub struct FlowState {
    /// The 5-tuple this flow is keyed on.
    pub key: FlowKey,
    /// Lifecycle phase.
    pub phase: FlowPhase,
    /// Translated local port used when forwarding.
    pub nat_port: u16,
    /// Packets seen inbound.
    pub packets: u64,
    /// Bytes seen inbound.
    pub bytes: u64,
    /// Creation timestamp.
    pub first_seen: Timestamp,
    /// Last packet activity in either direction.
    pub last_seen: Timestamp,
}

impl FlowState {
    fn new(key: FlowKey, nat_port: u16, now: Timestamp) -> Self {
        Self {
            key,
            phase: FlowPhase::Establishing,
            nat_port,
            packets: 0,
            bytes: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Account one inbound packet.
    #[inline(always)]
    pub fn touch(&mut self, len: usize, now: Timestamp) {
        self.packets += 1;
        self.bytes += len as u64;
        self.last_seen = now;
    }

    /// First response observed: the flow has completed a round trip.
    #[inline]
    pub fn mark_active(&mut self, now: Timestamp) {
        if self.phase == FlowPhase::Establishing {
            self.phase = FlowPhase::Active;
        }
        self.last_seen = now;
    }

    /// Protocol-level termination seen.
    #[inline]
    pub fn mark_closing(&mut self) {
        if self.phase != FlowPhase::Expired {
            self.phase = FlowPhase::Closing;
        }
    }
}

/// Why the sweep removed a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    /// No activity beyond the idle timeout.
    Idle,
    /// No response round trip within the establish timeout.
    EstablishTimeout,
    /// `Closing` with no residual activity.
    ClosingLinger,
}

impl ExpireReason {
    /// Stable label for audit payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::EstablishTimeout => "establish_timeout",
            Self::ClosingLinger => "closing_linger",
        }
    }
}

/// A flow reaped by the sweep, reported for auditing.
#[derive(Debug, Clone)]
pub struct ExpiredFlow {
    /// The reaped flow's key.
    pub key: FlowKey,
    /// Why it was reaped.
    pub reason: ExpireReason,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Empty = 0,
    Occupied = 1,
    Deleted = 2,
}

/// Table entry, cache-line aligned.
#[repr(C, align(64))]
struct FlowEntry {
    state: AtomicU8,
    hash: AtomicU64,
    flow: RwLock<Option<FlowState>>,
}

impl FlowEntry {
    const fn empty() -> Self {
        Self {
            state: AtomicU8::new(EntryState::Empty as u8),
            hash: AtomicU64::new(0),
            flow: RwLock::new(None),
        }
    }
}

/// Fixed-capacity concurrent flow table.
///
/// At most one flow per key; `len()` never exceeds the configured
/// capacity.
pub struct FlowTable {
    entries: Vec<FlowEntry>,
    size: usize,
    mask: usize,
    count: AtomicU64,
    max_flows: usize,
    nat_base: u16,
    nat_span: u32,
    next_nat: AtomicU32,
}

impl FlowTable {
    /// Create a table honoring `flow_table_capacity` and
    /// `nat_port_range` from the config.
    pub fn new(config: &StackConfig) -> Self {
        // Slot count is the next power of two above capacity so probing
        // always has headroom.
        let size = (config.flow_table_capacity + 1).next_power_of_two();
        let mut entries = Vec::with_capacity(size);
        for _ in 0..size {
            entries.push(FlowEntry::empty());
        }

        let nat_base = *config.nat_port_range.start();
        let nat_span = (*config.nat_port_range.end() - nat_base) as u32 + 1;

        Self {
            entries,
            size,
            mask: size - 1,
            count: AtomicU64::new(0),
            max_flows: config.flow_table_capacity,
            nat_base,
            nat_span,
            next_nat: AtomicU32::new(0),
        }
    }

    /// Round-robin translated-port allocation. Ports are reused after the
    /// range wraps; flows shorter than a full wrap never collide.
    fn alloc_nat_port(&self) -> u16 {
        let n = self.next_nat.fetch_add(1, Ordering::Relaxed);
        self.nat_base + (n % self.nat_span) as u16
    }

    /// Clone out the state for a key, if tracked.
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowState> {
        let hash = key.hash64();
        let mut idx = (hash as usize) & self.mask;

        for _ in 0..self.size {
            let entry = &self.entries[idx];
            let state = entry.state.load(Ordering::Acquire);

            if state == EntryState::Empty as u8 {
                return None;
            }
            if state == EntryState::Occupied as u8
                && entry.hash.load(Ordering::Relaxed) == hash
            {
                let flow = entry.flow.read();
                if let Some(ref f) = *flow {
                    if f.key == *key {
                        return Some(f.clone());
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Mutate the state for a key in place, under the entry lock.
    pub fn with_flow<R>(&self, key: &FlowKey, f: impl FnOnce(&mut FlowState) -> R) -> Option<R> {
        let hash = key.hash64();
        let mut idx = (hash as usize) & self.mask;

        for _ in 0..self.size {
            let entry = &self.entries[idx];
            let state = entry.state.load(Ordering::Acquire);

            if state == EntryState::Empty as u8 {
                return None;
            }
            if state == EntryState::Occupied as u8
                && entry.hash.load(Ordering::Relaxed) == hash
            {
                let mut flow = entry.flow.write();
                if let Some(ref mut fs) = *flow {
                    if fs.key == *key {
                        return Some(f(fs));
                    }
                }
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Insert a new flow in phase `Establishing`, assigning it a
    /// translated port. If the key is already tracked (a concurrent
    /// insert can land between a caller's miss and this call), the
    /// existing flow's port is returned instead. Fails with
    /// [`RelayError::FlowTableFull`] at capacity.
    pub fn insert(&self, key: FlowKey, now: Timestamp) -> RelayResult<u16> {
        if let Some(existing) = self.lookup(&key) {
            return Ok(existing.nat_port);
        }

        // Reserve the count before touching any slot: concurrent inserts
        // that all pass a plain load could each claim a slot and push the
        // table past its ceiling.
        if self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |c| {
                (c < self.max_flows as u64).then_some(c + 1)
            })
            .is_err()
        {
            return Err(RelayError::FlowTableFull);
        }

        let hash = key.hash64();
        let mut idx = (hash as usize) & self.mask;

        for _ in 0..self.size {
            let entry = &self.entries[idx];
            let state = entry.state.load(Ordering::Acquire);

            if state == EntryState::Empty as u8 || state == EntryState::Deleted as u8 {
                if entry
                    .state
                    .compare_exchange(
                        state,
                        EntryState::Occupied as u8,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    let nat_port = self.alloc_nat_port();
                    entry.hash.store(hash, Ordering::Release);
                    *entry.flow.write() = Some(FlowState::new(key, nat_port, now));
                    return Ok(nat_port);
                }
            }
            idx = (idx + 1) & self.mask;
        }

        // No claimable slot despite the reservation; give it back.
        self.count.fetch_sub(1, Ordering::Relaxed);
        Err(RelayError::FlowTableFull)
    }

    /// Remove a flow by key.
    pub fn remove(&self, key: &FlowKey) -> bool {
        let hash = key.hash64();
        let mut idx = (hash as usize) & self.mask;

        for _ in 0..self.size {
            let entry = &self.entries[idx];
            let state = entry.state.load(Ordering::Acquire);

            if state == EntryState::Empty as u8 {
                return false;
            }
            if state == EntryState::Occupied as u8
                && entry.hash.load(Ordering::Relaxed) == hash
            {
                let mut flow = entry.flow.write();
                if flow.as_ref().map(|f| f.key == *key).unwrap_or(false) {
                    *flow = None;
                    entry.state.store(EntryState::Deleted as u8, Ordering::Release);
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
            }
            idx = (idx + 1) & self.mask;
        }
        false
    }

    /// Reap flows that are idle, stuck establishing, or done closing.
    ///
    /// Each reaped flow passes through `Expired` before its slot is freed
    /// and is returned for auditing.
    pub fn sweep(&self, now: Timestamp, config: &StackConfig) -> Vec<ExpiredFlow> {
        let idle_ns = config.flow_idle_timeout.as_nanos() as u64;
        let establish_ns = config.establish_timeout.as_nanos() as u64;
        let linger_ns = config.closing_linger.as_nanos() as u64;

        let mut expired = Vec::new();
        for entry in &self.entries {
            if entry.state.load(Ordering::Acquire) != EntryState::Occupied as u8 {
                continue;
            }
            let mut flow = entry.flow.write();
            let reason = match *flow {
                Some(ref f) => {
                    let idle = f.last_seen.nanos_until(now);
                    if f.phase == FlowPhase::Closing && idle > linger_ns {
                        Some(ExpireReason::ClosingLinger)
                    } else if f.phase == FlowPhase::Establishing
                        && f.first_seen.nanos_until(now) > establish_ns
                    {
                        Some(ExpireReason::EstablishTimeout)
                    } else if idle > idle_ns {
                        Some(ExpireReason::Idle)
                    } else {
                        None
                    }
                }
                None => None,
            };

            if let Some(reason) = reason {
                if let Some(mut f) = flow.take() {
                    f.phase = FlowPhase::Expired;
                    entry.state.store(EntryState::Deleted as u8, Ordering::Release);
                    self.count.fetch_sub(1, Ordering::Relaxed);
                    expired.push(ExpiredFlow { key: f.key, reason });
                }
            }
        }
        expired
    }

    /// Current flow count.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    /// True when no flows are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured maximum flow count.
    pub fn capacity(&self) -> usize {
        self.max_flows
    }

    /// Drop every flow. Used on shutdown/re-init.
    pub fn clear(&self) {
        for entry in &self.entries {
            let mut flow = entry.flow.write();
            *flow = None;
            entry.state.store(EntryState::Empty as u8, Ordering::Release);
            entry.hash.store(0, Ordering::Release);
        }
        self.count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn key(last_octet: u8, src_port: u16) -> FlowKey {
        FlowKey::from_v4(
            Ipv4Addr::new(192, 168, 1, last_octet),
            Ipv4Addr::new(8, 8, 8, 8),
            src_port,
            443,
            6,
        )
    }

    fn small_config(capacity: usize) -> StackConfig {
        StackConfig {
            flow_table_capacity: capacity,
            ..Default::default()
        }
    }

    #[test]
    fn insert_lookup_update() {
        let table = FlowTable::new(&small_config(64));
        let now = Timestamp::from_nanos(1);
        let k = key(1, 40000);

        let nat = table.insert(k, now).unwrap();
        assert!((49152..=65535).contains(&nat));
        assert_eq!(table.len(), 1);

        let f = table.lookup(&k).unwrap();
        assert_eq!(f.phase, FlowPhase::Establishing);
        assert_eq!(f.packets, 0);

        table.with_flow(&k, |f| f.touch(1500, Timestamp::from_nanos(2)));
        let f = table.lookup(&k).unwrap();
        assert_eq!(f.packets, 1);
        assert_eq!(f.bytes, 1500);
    }

    #[test]
    fn capacity_is_hard_ceiling() {
        let table = FlowTable::new(&small_config(4));
        let now = Timestamp::from_nanos(1);

        for i in 0..4 {
            table.insert(key(i as u8, 1000 + i), now).unwrap();
        }
        assert_eq!(table.len(), 4);
        assert!(matches!(
            table.insert(key(200, 9999), now),
            Err(RelayError::FlowTableFull)
        ));
        assert_eq!(table.len(), 4);

        // One removal frees one slot.
        assert!(table.remove(&key(0, 1000)));
        table.insert(key(200, 9999), now).unwrap();
    }

    #[test]
    fn sweep_reaps_idle() {
        let mut config = small_config(16);
        config.flow_idle_timeout = Duration::from_secs(1);
        let table = FlowTable::new(&config);

        let t0 = Timestamp::from_nanos(0);
        table.insert(key(1, 1), t0).unwrap();
        // Active flows are not establish-timed-out.
        table.with_flow(&key(1, 1), |f| f.mark_active(t0));

        let before = Timestamp::from_nanos(900_000_000);
        assert!(table.sweep(before, &config).is_empty());

        let after = Timestamp::from_nanos(1_100_000_000);
        let expired = table.sweep(after, &config);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, ExpireReason::Idle);
        assert!(table.lookup(&key(1, 1)).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn sweep_reaps_stuck_establishing() {
        let mut config = small_config(16);
        config.establish_timeout = Duration::from_secs(2);
        let table = FlowTable::new(&config);

        table.insert(key(1, 1), Timestamp::from_nanos(0)).unwrap();
        let expired = table.sweep(Timestamp::from_nanos(3_000_000_000), &config);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, ExpireReason::EstablishTimeout);
    }

    #[test]
    fn sweep_reaps_closing_after_linger() {
        let mut config = small_config(16);
        config.closing_linger = Duration::from_secs(1);
        let table = FlowTable::new(&config);

        let t0 = Timestamp::from_nanos(0);
        table.insert(key(1, 1), t0).unwrap();
        table.with_flow(&key(1, 1), |f| {
            f.mark_active(t0);
            f.mark_closing();
        });

        let expired = table.sweep(Timestamp::from_nanos(1_500_000_000), &config);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reason, ExpireReason::ClosingLinger);
    }

    #[test]
    fn clear_resets() {
        let table = FlowTable::new(&small_config(16));
        let now = Timestamp::now();
        table.insert(key(1, 1), now).unwrap();
        table.insert(key(2, 2), now).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert!(table.lookup(&key(1, 1)).is_none());
        // Slots are reusable after a clear.
        table.insert(key(1, 1), now).unwrap();
    }

    #[test]
    fn insert_existing_key_reuses_entry() {
        let table = FlowTable::new(&small_config(8));
        let now = Timestamp::from_nanos(1);
        let k = key(1, 1000);

        let first = table.insert(k, now).unwrap();
        let second = table.insert(k, now).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn failed_insert_does_not_leak_capacity() {
        let table = FlowTable::new(&small_config(2));
        let now = Timestamp::from_nanos(1);
        table.insert(key(1, 1), now).unwrap();
        table.insert(key(2, 2), now).unwrap();

        for i in 0..8u16 {
            assert!(table.insert(key(100, 5000 + i), now).is_err());
        }
        // Refused inserts leave the count untouched; a removal frees
        // exactly one slot.
        assert_eq!(table.len(), 2);
        assert!(table.remove(&key(1, 1)));
        table.insert(key(3, 3), now).unwrap();
        assert_eq!(table.len(), 2);
    }

    // Threads released together race for the last slots; the ceiling must
    // hold even when every thread observes a non-full table beforehand.
    #[test]
    fn simultaneous_inserts_never_exceed_ceiling() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let table = Arc::new(FlowTable::new(&small_config(4)));

        for round in 0u16..100 {
            let barrier = Arc::new(Barrier::new(8));
            let mut handles = Vec::new();
            for t in 0u16..8 {
                let table = table.clone();
                let barrier = barrier.clone();
                handles.push(thread::spawn(move || {
                    let now = Timestamp::now();
                    barrier.wait();
                    let _ = table.insert(key((t + 1) as u8, 10_000 + round), now);
                }));
            }
            for h in handles {
                h.join().unwrap();
            }

            assert!(table.len() <= table.capacity());
            table.clear();
        }
    }

    #[test]
    fn concurrent_insert_respects_capacity() {
        use std::sync::Arc;
        use std::thread;

        let table = Arc::new(FlowTable::new(&small_config(512)));
        let mut handles = Vec::new();

        for t in 0u16..4 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                let now = Timestamp::now();
                for i in 0u16..256 {
                    let _ = table.insert(key((t % 250) as u8, t * 1000 + i), now);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert!(table.len() <= 512);
    }
}
