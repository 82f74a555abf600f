//! RTP sequence number tracking and packet loss detection

/// Outcome of recording an inbound sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First packet or exactly the expected one
    InOrder,
    /// Packets were skipped. The loss is accepted and not recovered.
    Gap(GapInfo),
    /// Duplicate or older than the last accepted packet
    Late,
}

/// Information about a detected gap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapInfo {
    /// First missing sequence
    pub start: u16,
    /// Count of missing packets
    pub count: u16,
}

/// Tracks RTP sequence numbers to detect gaps.
///
/// Sequence numbers are compared modulo 2^16: anything up to half the
/// space ahead of the last accepted number is a forward step, anything
/// else is late. Counters live in the session statistics.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    /// Last accepted sequence number
    last_seq: Option<u16>,
}

impl SequenceTracker {
    /// Create a new sequence tracker
    #[must_use]
    pub fn new() -> Self {
        Self { last_seq: None }
    }

    /// Record a received packet. Every forward step other than the
    /// expected one is a gap.
    pub fn record(&mut self, seq: u16) -> SequenceCheck {
        let Some(last) = self.last_seq else {
            self.last_seq = Some(seq);
            return SequenceCheck::InOrder;
        };

        let step = seq.wrapping_sub(last);
        if step == 0 || step >= 0x8000 {
            return SequenceCheck::Late;
        }

        self.last_seq = Some(seq);
        if step == 1 {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap(GapInfo {
                start: last.wrapping_add(1),
                count: step - 1,
            })
        }
    }

    /// Highest sequence number received after which no packet is
    /// outstanding. Gaps are accepted as lost, so this is the last accepted
    /// sequence number.
    #[must_use]
    pub fn highest_contiguous(&self) -> Option<u16> {
        self.last_seq
    }
}
