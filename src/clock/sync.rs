//! Three-step clock synchronization exchange

use tracing::debug;

use crate::error::MidiError;

/// Synchronization status of a peer clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No completed exchange, or the last re-synchronization failed.
    /// Timestamps from the peer are approximate.
    Unsynchronized,
    /// A recent exchange completed
    Synchronized,
}

/// Peer clock estimate, in ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEstimate {
    /// Peer time minus local time
    pub offset: i64,
    /// Estimated one-way latency
    pub latency: u64,
}

fn diff(a: u64, b: u64) -> i128 {
    i128::from(a) - i128::from(b)
}

fn clamp_i64(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

impl ClockEstimate {
    /// Estimate as seen by the initiator.
    ///
    /// `t1` and `t3` are initiator timestamps, `t2` is the responder's.
    #[must_use]
    pub fn for_initiator(t1: u64, t2: u64, t3: u64) -> Self {
        let latency = t3.saturating_sub(t1) / 2;
        let offset = diff(t2, t1) - i128::from(latency);
        Self {
            offset: clamp_i64(offset),
            latency,
        }
    }

    /// Estimate as seen by the responder, from the same three timestamps
    #[must_use]
    pub fn for_responder(t1: u64, t2: u64, t3: u64) -> Self {
        let latency = t3.saturating_sub(t1) / 2;
        let offset = diff(t1, t2) + i128::from(latency);
        Self {
            offset: clamp_i64(offset),
            latency,
        }
    }

    /// Convert a peer timestamp to local ticks
    #[must_use]
    pub fn peer_to_local(&self, peer_ticks: u64) -> u64 {
        let local = i128::from(peer_ticks) - i128::from(self.offset);
        u64::try_from(local.max(0)).unwrap_or(u64::MAX)
    }
}

/// Result of feeding a `CK` message into [`ClockSync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Send a `CK` message with this count and these timestamps
    Reply {
        /// Count field of the reply
        count: u8,
        /// Timestamp slots of the reply
        timestamps: [u64; 3],
    },
    /// The exchange completed. `reply` is the closing `CK2` to send, if any.
    Complete {
        /// New estimate
        estimate: ClockEstimate,
        /// Closing message (initiator side only)
        reply: Option<[u64; 3]>,
    },
}

/// Per-session clock synchronization state
#[derive(Debug, Clone)]
pub struct ClockSync {
    status: SyncStatus,
    estimate: Option<ClockEstimate>,
    /// `t1` of the exchange we started and have not seen answered
    pending: Option<u64>,
    /// `t1` and `t2` of the last `CK0` we answered
    answered: Option<(u64, u64)>,
    /// Consecutive unanswered exchanges
    failures: u32,
    /// Completed exchanges
    rounds: u32,
}

impl ClockSync {
    /// Create an unsynchronized estimator
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: SyncStatus::Unsynchronized,
            estimate: None,
            pending: None,
            answered: None,
            failures: 0,
            rounds: 0,
        }
    }

    /// Start an exchange. Returns the timestamp slots of the `CK0` message.
    pub fn begin(&mut self, now: u64) -> [u64; 3] {
        self.pending = Some(now);
        [now, 0, 0]
    }

    /// Advance the exchange with a received `CK` message.
    ///
    /// # Errors
    ///
    /// Returns `MidiError::ProtocolViolation` for unknown counts, a `CK1`
    /// that does not answer our outstanding `CK0` or a `CK2` that does not
    /// close an exchange we answered. The caller logs and ignores these.
    /// None of them change the estimate or the status.
    pub fn on_message(
        &mut self,
        count: u8,
        timestamps: [u64; 3],
        now: u64,
    ) -> Result<SyncStep, MidiError> {
        let [t1, t2, t3] = timestamps;
        match count {
            0 => {
                self.answered = Some((t1, now));
                Ok(SyncStep::Reply {
                    count: 1,
                    timestamps: [t1, now, 0],
                })
            }
            1 => {
                if self.pending != Some(t1) {
                    return Err(MidiError::violation(format!(
                        "CK1 for unknown exchange (t1={t1})"
                    )));
                }
                let estimate = ClockEstimate::for_initiator(t1, t2, now);
                self.complete(estimate);
                Ok(SyncStep::Complete {
                    estimate,
                    reply: Some([t1, t2, now]),
                })
            }
            2 => {
                if self.answered != Some((t1, t2)) {
                    return Err(MidiError::violation(format!(
                        "CK2 for unknown exchange (t1={t1}, t2={t2})"
                    )));
                }
                let estimate = ClockEstimate::for_responder(t1, t2, t3);
                self.complete(estimate);
                Ok(SyncStep::Complete {
                    estimate,
                    reply: None,
                })
            }
            other => Err(MidiError::violation(format!("CK with count {other}"))),
        }
    }

    fn complete(&mut self, estimate: ClockEstimate) {
        debug!(
            offset = estimate.offset,
            latency = estimate.latency,
            "clock exchange complete"
        );
        self.pending = None;
        self.answered = None;
        self.failures = 0;
        self.rounds = self.rounds.saturating_add(1);
        self.estimate = Some(estimate);
        self.status = SyncStatus::Synchronized;
    }

    /// Record an unanswered exchange. Returns the number of consecutive
    /// failures.
    pub fn record_failure(&mut self) -> u32 {
        self.pending = None;
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// Give up on re-synchronization. The last estimate is kept but
    /// treated as approximate.
    pub fn degrade(&mut self) {
        self.pending = None;
        self.failures = 0;
        self.status = SyncStatus::Unsynchronized;
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Check for a synchronized clock
    #[must_use]
    pub fn is_synchronized(&self) -> bool {
        self.status == SyncStatus::Synchronized
    }

    /// Latest estimate, if any exchange ever completed
    #[must_use]
    pub fn estimate(&self) -> Option<ClockEstimate> {
        self.estimate
    }

    /// Whether we are waiting for a `CK1`
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of completed exchanges
    #[must_use]
    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}
