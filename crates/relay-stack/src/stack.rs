//! Stack controller.
//!
//! Owns the lifecycle state machine and composes the flow table, inbound
//! pipeline, outbound queue, and poll driver into the single unit the
//! host talks to.
//!
//! Lifecycle serialization uses one read/write lock: every data-path call
//! holds it for read, `init`/`shutdown` take it for write. Shutdown
//! therefore waits for in-flight calls to finish, and every later call
//! fails with `NotInitialized` until the next `init`. Within a running
//! stack the components synchronize internally, so the host's read loop,
//! write loop, and timer do not stall each other on unrelated flows.

use crate::audit::AuditSink;
use crate::config::StackConfig;
use crate::flow::FlowTable;
use crate::forward::Forwarder;
use crate::pipeline::InboundPipeline;
use crate::poll::PollDriver;
use crate::queue::OutboundQueue;
use crate::stats::{StackStats, StatsSnapshot};
use parking_lot::RwLock;
use relay_common::{RelayError, RelayResult};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecyclePhase {
    /// Never initialized.
    Uninitialized = 0,
    /// `init` in progress.
    Initializing = 1,
    /// Data path open.
    Running = 2,
    /// `shutdown` in progress, waiting for in-flight calls.
    ShuttingDown = 3,
    /// Shut down; `init` may be called again.
    Stopped = 4,
}

impl LifecyclePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            4 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }
}

/// Everything a running stack owns. Dropped wholesale on shutdown.
struct StackInner {
    table: Arc<FlowTable>,
    queue: Arc<OutboundQueue>,
    pipeline: Arc<InboundPipeline>,
    poll: PollDriver,
    stats: Arc<StackStats>,
}

enum Lifecycle {
    /// Uninitialized or stopped; which one the phase atomic says.
    Down,
    Running(StackInner),
}

/// The packet relay stack, one `init`/`shutdown` cycle at a time.
pub struct RelayStack {
    state: RwLock<Lifecycle>,
    phase: AtomicU8,
}

impl RelayStack {
    /// A stack in the `Uninitialized` phase.
    pub const fn new() -> Self {
        Self {
            state: RwLock::new(Lifecycle::Down),
            phase: AtomicU8::new(LifecyclePhase::Uninitialized as u8),
        }
    }

    /// Bring the stack up with fixed-capacity tables and queues.
    ///
    /// Fails with [`RelayError::AlreadyInitialized`] while running.
    /// Spawns no threads; the host drives everything through the three
    /// data-path calls.
    pub fn init(
        &self,
        config: StackConfig,
        forwarder: Arc<dyn Forwarder>,
        audit: Arc<dyn AuditSink>,
    ) -> RelayResult<()> {
        let mut guard = self.state.write();
        if matches!(*guard, Lifecycle::Running(_)) {
            return Err(RelayError::AlreadyInitialized);
        }
        config.validate()?;
        self.phase
            .store(LifecyclePhase::Initializing as u8, Ordering::Release);

        let table = Arc::new(FlowTable::new(&config));
        let queue = Arc::new(OutboundQueue::new(config.outbound_queue_capacity));
        let stats = Arc::new(StackStats::new());
        let pipeline = Arc::new(InboundPipeline::new(
            config.clone(),
            table.clone(),
            queue.clone(),
            forwarder.clone(),
            audit.clone(),
            stats.clone(),
        ));
        let poll = PollDriver::new(
            config.clone(),
            table.clone(),
            queue.clone(),
            forwarder,
            pipeline.clone(),
            audit,
            stats.clone(),
        );

        *guard = Lifecycle::Running(StackInner {
            table,
            queue,
            pipeline,
            poll,
            stats,
        });
        self.phase
            .store(LifecyclePhase::Running as u8, Ordering::Release);
        tracing::info!(
            flows = config.flow_table_capacity,
            queue = config.outbound_queue_capacity,
            "relay stack initialized"
        );
        Ok(())
    }

    /// Tear the stack down, discarding all flows and queued packets.
    ///
    /// Blocks until in-flight data-path calls on other threads complete;
    /// safe to call when nothing is in flight or the stack never started.
    pub fn shutdown(&self) {
        self.phase
            .store(LifecyclePhase::ShuttingDown as u8, Ordering::Release);
        let mut guard = self.state.write();
        match std::mem::replace(&mut *guard, Lifecycle::Down) {
            Lifecycle::Running(inner) => {
                inner.table.clear();
                inner.queue.clear();
                tracing::info!("relay stack shut down");
            }
            Lifecycle::Down => {}
        }
        self.phase
            .store(LifecyclePhase::Stopped as u8, Ordering::Release);
    }

    /// Process one raw IP datagram from the host.
    pub fn process_packet(&self, raw: &[u8]) -> RelayResult<()> {
        self.with_inner(|inner| inner.pipeline.process(raw))
    }

    /// Retrieve the next outbound packet into `buf`.
    ///
    /// `Ok(None)` means no data is available; that is not an error.
    pub fn get_outbound_packet(&self, buf: &mut [u8]) -> RelayResult<Option<usize>> {
        self.with_inner(|inner| {
            let written = inner.queue.copy_head_into(buf)?;
            if let Some(n) = written {
                inner.stats.tx_packets.incr();
                inner.stats.tx_bytes.add(n as u64);
            }
            Ok(written)
        })
    }

    /// One maintenance tick; see [`PollDriver`].
    pub fn poll(&self) -> RelayResult<()> {
        self.with_inner(|inner| {
            inner.poll.tick();
            Ok(())
        })
    }

    /// Counters for the current run.
    pub fn stats(&self) -> RelayResult<StatsSnapshot> {
        self.with_inner(|inner| Ok(inner.stats.snapshot()))
    }

    /// Number of currently tracked flows.
    pub fn flow_count(&self) -> RelayResult<usize> {
        self.with_inner(|inner| Ok(inner.table.len()))
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn with_inner<R>(&self, f: impl FnOnce(&StackInner) -> RelayResult<R>) -> RelayResult<R> {
        let guard = self.state.read();
        match &*guard {
            Lifecycle::Running(inner) => f(inner),
            Lifecycle::Down => Err(RelayError::NotInitialized),
        }
    }
}

impl Default for RelayStack {
    fn default() -> Self {
        Self::new()
    }
}
