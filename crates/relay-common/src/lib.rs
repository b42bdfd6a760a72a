//! Shared leaf types for the user-space packet relay stack.
//!
//! This crate carries the pieces every other crate in the workspace needs:
//! the error taxonomy, the 5-tuple flow key, the flow lifecycle phase, and
//! a cheap monotonic-enough timestamp. It deliberately has no knowledge of
//! the stack itself.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flow;

pub use error::{RelayError, RelayResult};
pub use flow::{FlowKey, FlowPhase};

use std::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds-since-epoch timestamp.
///
/// Wall-clock based; precise ordering between threads is not required by
/// any consumer, only coarse idle/age measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current timestamp.
    #[inline(always)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self(nanos)
    }

    /// Construct from a raw nanosecond value.
    #[inline(always)]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Raw nanosecond value.
    #[inline(always)]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Nanoseconds elapsed between `self` and a later timestamp.
    ///
    /// Saturates at zero if the clock stepped backwards.
    #[inline(always)]
    pub fn nanos_until(&self, later: Timestamp) -> u64 {
        later.0.saturating_sub(self.0)
    }

    /// Milliseconds elapsed between `self` and a later timestamp.
    #[inline(always)]
    pub fn millis_until(&self, later: Timestamp) -> u64 {
        self.nanos_until(later) / 1_000_000
    }
}

/// Lock-free counter for hot-path accounting.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// New counter starting at zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment by one.
    #[inline(always)]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`.
    #[inline(always)]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
