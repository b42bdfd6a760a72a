//! Stack configuration.
//!
//! The interface contract leaves every capacity and timeout open; the
//! values here are deployment choices, all overridable from a JSON file.

use crate::MAX_PACKET_SIZE;
use relay_common::{RelayError, RelayResult};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

/// Relay stack configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Largest datagram accepted by `process_packet`, bytes.
    pub max_packet_size: usize,
    /// Maximum number of concurrently tracked flows.
    pub flow_table_capacity: usize,
    /// Maximum number of packets buffered for the host.
    pub outbound_queue_capacity: usize,
    /// A flow with no packet activity for this long is reaped.
    #[serde(with = "duration_secs")]
    pub flow_idle_timeout: Duration,
    /// An `Establishing` flow with no response by this deadline is
    /// expired and audited.
    #[serde(with = "duration_secs")]
    pub establish_timeout: Duration,
    /// A `Closing` flow quiet for this long is reaped.
    #[serde(with = "duration_secs")]
    pub closing_linger: Duration,
    /// Outbound packets older than this are dropped by `poll`.
    #[serde(with = "duration_secs")]
    pub queue_age_horizon: Duration,
    /// Translated local ports are allocated from this range.
    pub nat_port_range: RangeInclusive<u16>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1500,
            flow_table_capacity: 4096,
            outbound_queue_capacity: 1024,
            flow_idle_timeout: Duration::from_secs(60),
            establish_timeout: Duration::from_secs(10),
            closing_linger: Duration::from_secs(5),
            queue_age_horizon: Duration::from_secs(3),
            nat_port_range: 49152..=65535,
        }
    }
}

impl StackConfig {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> RelayResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the stack cannot honor.
    pub fn validate(&self) -> RelayResult<()> {
        if self.max_packet_size == 0 || self.max_packet_size > MAX_PACKET_SIZE {
            return Err(RelayError::Config(format!(
                "max_packet_size must be in 1..={MAX_PACKET_SIZE}"
            )));
        }
        if self.flow_table_capacity == 0 {
            return Err(RelayError::Config("flow_table_capacity must be > 0".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(RelayError::Config(
                "outbound_queue_capacity must be > 0".into(),
            ));
        }
        if self.nat_port_range.is_empty() {
            return Err(RelayError::Config("nat_port_range must be non-empty".into()));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
