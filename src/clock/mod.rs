//! Local time base and peer clock estimation.
//!
//! AppleMIDI timestamps count 100 microsecond ticks from an arbitrary
//! origin. [`Clock`] provides the local monotonic tick counter and
//! [`ClockSync`] runs the three-message `CK` exchange that estimates the
//! offset and one-way latency to a peer.
//!
//! ```text
//! Initiator                          Responder
//!   |--- CK0 (t1) ------------------->|
//!   |<-- CK1 (t1, t2) ----------------|   t2 = responder now
//!   |--- CK2 (t1, t2, t3) ----------->|   t3 = initiator now
//!   |                                 |
//!   |  latency = (t3 - t1) / 2        |
//!   |  offset  = t2 - t1 - latency    |  (peer minus local)
//! ```

mod sync;

#[cfg(test)]
mod tests;

pub use sync::{ClockEstimate, ClockSync, SyncStatus, SyncStep};

use std::time::{Duration, Instant};

/// Clock ticks per second (100 microsecond resolution)
pub const TICKS_PER_SECOND: u64 = 10_000;

const NANOS_PER_TICK: u64 = 1_000_000_000 / TICKS_PER_SECOND;

/// Convert a duration to clock ticks, saturating at `u64::MAX`
#[must_use]
pub fn duration_to_ticks(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos() / u128::from(NANOS_PER_TICK)).unwrap_or(u64::MAX)
}

/// Convert clock ticks to a duration
#[must_use]
pub fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(NANOS_PER_TICK))
}

/// Monotonic local time source in protocol ticks
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    /// Instant that corresponds to `base` ticks
    origin: Instant,
    /// Tick value at `origin`
    base: u64,
}

impl Clock {
    /// Create a clock starting at tick zero now
    #[must_use]
    pub fn new() -> Self {
        Self::with_origin(Instant::now(), 0)
    }

    /// Create a clock where `origin` reads as `base` ticks
    #[must_use]
    pub fn with_origin(origin: Instant, base: u64) -> Self {
        Self { origin, base }
    }

    /// Current local timestamp in ticks. Never fails.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.ticks_at(Instant::now())
    }

    /// Timestamp of `instant` in ticks. Instants before the origin read as
    /// the base value.
    #[must_use]
    pub fn ticks_at(&self, instant: Instant) -> u64 {
        self.base
            .saturating_add(duration_to_ticks(instant.saturating_duration_since(self.origin)))
    }

    /// Instant corresponding to `ticks`
    #[must_use]
    pub fn instant_at(&self, ticks: u64) -> Instant {
        self.origin + ticks_to_duration(ticks.saturating_sub(self.base))
    }

    /// 32-bit RTP timestamp for `instant`, wrapping modulo 2^32
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn rtp_timestamp(&self, instant: Instant) -> u32 {
        self.ticks_at(instant) as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
