//! Poll driver.
//!
//! The only place time-based state changes happen. The host ticks this on
//! a timer; a tick drains completed forwarding responses, reaps stale
//! flows, and ages the outbound queue. A tick never blocks on I/O.

use crate::audit::{event_timestamp, AuditEvent, AuditSink};
use crate::config::StackConfig;
use crate::flow::FlowTable;
use crate::forward::Forwarder;
use crate::pipeline::InboundPipeline;
use crate::queue::OutboundQueue;
use crate::stats::StackStats;
use relay_common::{RelayError, Timestamp};
use std::sync::Arc;

/// Periodic maintenance for the stack.
pub struct PollDriver {
    config: StackConfig,
    table: Arc<FlowTable>,
    queue: Arc<OutboundQueue>,
    forwarder: Arc<dyn Forwarder>,
    pipeline: Arc<InboundPipeline>,
    audit: Arc<dyn AuditSink>,
    stats: Arc<StackStats>,
}

impl PollDriver {
    /// Wire the driver to the components it maintains.
    pub fn new(
        config: StackConfig,
        table: Arc<FlowTable>,
        queue: Arc<OutboundQueue>,
        forwarder: Arc<dyn Forwarder>,
        pipeline: Arc<InboundPipeline>,
        audit: Arc<dyn AuditSink>,
        stats: Arc<StackStats>,
    ) -> Self {
        Self {
            config,
            table,
            queue,
            forwarder,
            pipeline,
            audit,
            stats,
        }
    }

    /// One maintenance tick.
    pub fn tick(&self) {
        let now = Timestamp::now();
        self.drain_completions();
        self.sweep_flows(now);
        self.age_queue(now);
    }

    /// Check the forwarding collaborator for asynchronously completed
    /// responses, without waiting. Per-response failures are audited and
    /// do not stop the drain: garbled responses by the pipeline at parse
    /// time, enqueue failures here.
    fn drain_completions(&self) {
        for bytes in self.forwarder.poll() {
            let len = bytes.len();
            match self.pipeline.ingest_response(bytes) {
                Ok(()) => {}
                Err(e @ RelayError::MalformedPacket(_)) => {
                    tracing::warn!(error = %e, "dropped completed response");
                }
                Err(e) => {
                    self.audit.emit(&AuditEvent::ResponseDropped {
                        reason: e.to_string(),
                        len,
                        ts: event_timestamp(),
                    });
                    tracing::warn!(error = %e, "dropped completed response");
                }
            }
        }
    }

    /// Expire idle, stuck-establishing, and lingering-closed flows.
    fn sweep_flows(&self, now: Timestamp) {
        let expired = self.table.sweep(now, &self.config);
        for flow in &expired {
            self.stats.flow_expirations.incr();
            self.audit.emit(&AuditEvent::FlowExpired {
                flow: flow.key.to_string(),
                reason: flow.reason.as_str(),
                ts: event_timestamp(),
            });
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "flows expired");
        }
    }

    /// Drop outbound packets older than the age horizon; sustained
    /// backpressure must not serve arbitrarily stale data.
    fn age_queue(&self, now: Timestamp) {
        let horizon_ns = self.config.queue_age_horizon.as_nanos() as u64;
        for entry in self.queue.drop_older_than(horizon_ns, now) {
            self.stats.queue_drops.incr();
            self.audit.emit(&AuditEvent::StalePacketDropped {
                age_ms: entry.enqueued_at.millis_until(now),
                len: entry.packet.len(),
                ts: event_timestamp(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testutil::RecordingSink;
    use crate::forward::ChannelForwarder;
    use crate::packet::testutil;
    use bytes::Bytes;
    use relay_common::FlowPhase;
    use std::time::Duration;

    struct Fixture {
        driver: PollDriver,
        pipeline: Arc<InboundPipeline>,
        table: Arc<FlowTable>,
        queue: Arc<OutboundQueue>,
        forwarder: Arc<ChannelForwarder>,
        audit: RecordingSink,
    }

    fn fixture(config: StackConfig) -> Fixture {
        let table = Arc::new(FlowTable::new(&config));
        let queue = Arc::new(OutboundQueue::new(config.outbound_queue_capacity));
        let forwarder = Arc::new(ChannelForwarder::new(64));
        let audit = RecordingSink::default();
        let stats = Arc::new(StackStats::new());
        let pipeline = Arc::new(InboundPipeline::new(
            config.clone(),
            table.clone(),
            queue.clone(),
            forwarder.clone(),
            Arc::new(audit.clone()),
            stats.clone(),
        ));
        let driver = PollDriver::new(
            config,
            table.clone(),
            queue.clone(),
            forwarder.clone(),
            pipeline.clone(),
            Arc::new(audit.clone()),
            stats,
        );
        Fixture {
            driver,
            pipeline,
            table,
            queue,
            forwarder,
            audit,
        }
    }

    #[test]
    fn tick_delivers_async_responses() {
        let f = fixture(StackConfig::default());
        let query = testutil::udp_v4([10, 0, 0, 1], [8, 8, 8, 8], 40000, 53, b"q");
        let reply = testutil::udp_v4([8, 8, 8, 8], [10, 0, 0, 1], 53, 40000, b"a");

        f.pipeline.process(&query).unwrap();
        assert!(f.queue.is_empty());

        // Collaborator completes asynchronously; the next tick picks it up.
        f.forwarder.push_response(reply.clone()).unwrap();
        f.driver.tick();

        assert_eq!(f.queue.len(), 1);
        let key = crate::packet::Packet::parse(query).unwrap().flow_key();
        assert_eq!(f.table.lookup(&key).unwrap().phase, FlowPhase::Active);
    }

    #[test]
    fn tick_expires_idle_flows_and_audits() {
        let config = StackConfig {
            flow_idle_timeout: Duration::from_nanos(1),
            establish_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let f = fixture(config);
        f.pipeline
            .process(&testutil::udp_v4([10, 0, 0, 1], [8, 8, 8, 8], 1, 53, b""))
            .unwrap();
        assert_eq!(f.table.len(), 1);

        std::thread::sleep(Duration::from_millis(2));
        f.driver.tick();

        assert!(f.table.is_empty());
        assert!(f.audit.kinds().contains(&"flow_expired"));
    }

    #[test]
    fn tick_ages_outbound_queue() {
        let config = StackConfig {
            queue_age_horizon: Duration::from_nanos(1),
            ..Default::default()
        };
        let f = fixture(config);

        let reply = testutil::udp_v4([8, 8, 8, 8], [10, 0, 0, 1], 53, 40000, b"a");
        f.pipeline.ingest_response(reply).unwrap();
        assert_eq!(f.queue.len(), 1);

        std::thread::sleep(Duration::from_millis(2));
        f.driver.tick();

        assert!(f.queue.is_empty());
        assert!(f.audit.kinds().contains(&"stale_packet_dropped"));
    }

    #[test]
    fn completion_lost_to_full_queue_is_audited() {
        let config = StackConfig {
            outbound_queue_capacity: 1,
            queue_age_horizon: Duration::from_secs(3600),
            ..Default::default()
        };
        let f = fixture(config);

        let first = testutil::udp_v4([8, 8, 8, 8], [10, 0, 0, 1], 53, 40000, b"a");
        let second = testutil::udp_v4([8, 8, 8, 8], [10, 0, 0, 1], 53, 40001, b"b");
        f.forwarder.push_response(first).unwrap();
        f.forwarder.push_response(second).unwrap();
        f.driver.tick();

        // The second response cannot be enqueued and leaves a trace.
        assert_eq!(f.queue.len(), 1);
        assert!(f.audit.kinds().contains(&"response_dropped"));
    }

    #[test]
    fn garbled_completion_does_not_stop_tick() {
        let config = StackConfig {
            queue_age_horizon: Duration::from_secs(3600),
            ..Default::default()
        };
        let f = fixture(config);
        let good = testutil::udp_v4([8, 8, 8, 8], [10, 0, 0, 1], 53, 40000, b"ok");

        f.forwarder.push_response(Bytes::from_static(b"\xff\xff")).unwrap();
        f.forwarder.push_response(good).unwrap();
        f.driver.tick();

        // Bad response audited, good one delivered.
        assert!(f.audit.kinds().contains(&"malformed_packet"));
        assert_eq!(f.queue.len(), 1);
    }
}
