//! Outbound MIDI message queue
//!
//! One FIFO per session. Enqueueing never blocks and never drops: the
//! pacing policy only decides how many queued messages go into the next
//! packet, the rest wait for the following tick.


use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::clock::Clock;
use crate::error::{MidiError, Result};
use crate::midi::MidiMessage;
use crate::protocol::rtp::TimedCommand;
use crate::protocol::rtp::payload::{MAX_DELTA, MAX_SECTION_LEN, encoded_size};
use crate::types::{DriverConfig, SessionId};

/// Limits applied when coalescing queued messages into one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Maximum messages per packet
    pub max_commands: usize,
    /// Maximum command list size in bytes
    pub max_payload_size: usize,
    /// Target time from enqueue to send
    pub latency_budget: Duration,
}

impl PacingPolicy {
    /// Take the pacing limits from a driver configuration
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            max_commands: config.max_commands_per_tick.max(1),
            max_payload_size: config.max_payload_size,
            latency_budget: config.latency_budget,
        }
    }
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self::from_config(&DriverConfig::default())
    }
}

/// A message waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Destination session
    pub session: SessionId,
    /// The message
    pub message: MidiMessage,
    /// When it was enqueued
    pub enqueued_at: Instant,
    /// When it should have been sent
    pub deadline: Instant,
}

impl QueuedMessage {
    /// How far past its deadline the message is at `now`
    #[must_use]
    pub fn lateness(&self, now: Instant) -> Option<Duration> {
        let late = now.saturating_duration_since(self.deadline);
        (!late.is_zero()).then_some(late)
    }
}

/// Per-session outbound FIFOs
#[derive(Debug)]
pub struct MessageQueue {
    policy: PacingPolicy,
    queues: HashMap<SessionId, VecDeque<QueuedMessage>>,
    total_enqueued: u64,
    total_drained: u64,
}

impl MessageQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            queues: HashMap::new(),
            total_enqueued: 0,
            total_drained: 0,
        }
    }

    /// Pacing policy in use
    #[must_use]
    pub fn policy(&self) -> PacingPolicy {
        self.policy
    }

    /// Start accepting messages for `session`. Returns false if it was
    /// already open.
    pub fn open(&mut self, session: SessionId) -> bool {
        if self.queues.contains_key(&session) {
            return false;
        }
        self.queues.insert(session, VecDeque::new());
        true
    }

    /// Stop accepting messages for `session` and hand back whatever was
    /// still waiting
    pub fn close(&mut self, session: SessionId) -> Vec<QueuedMessage> {
        self.queues
            .remove(&session)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Check whether `session` accepts messages
    #[must_use]
    pub fn is_open(&self, session: SessionId) -> bool {
        self.queues.contains_key(&session)
    }

    /// Append a message to the session's FIFO
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` if the session is not open or the
    /// message can never fit a packet, and `MidiError::ResourceExhaustion`
    /// if the queue cannot grow.
    pub fn enqueue(&mut self, session: SessionId, message: MidiMessage, now: Instant) -> Result<()> {
        if encoded_size(&message) > MAX_SECTION_LEN {
            return Err(MidiError::invalid_argument(
                "message",
                format!("{} bytes exceeds the packet limit", message.len()),
            ));
        }
        let queue = self.queues.get_mut(&session).ok_or_else(|| {
            MidiError::invalid_argument("session", format!("{session} is closed"))
        })?;
        queue
            .try_reserve(1)
            .map_err(|e| MidiError::ResourceExhaustion {
                message: e.to_string(),
            })?;

        queue.push_back(QueuedMessage {
            session,
            message,
            enqueued_at: now,
            deadline: now + self.policy.latency_budget,
        });
        self.total_enqueued += 1;
        Ok(())
    }

    /// Take the messages for one packet, oldest first.
    ///
    /// At least one message is taken whenever any is queued, so an
    /// oversized message is sent alone rather than blocking the queue.
    pub fn drain_tick(&mut self, session: SessionId) -> Vec<QueuedMessage> {
        let Some(queue) = self.queues.get_mut(&session) else {
            return Vec::new();
        };

        let mut size = 0;
        let mut count = 0;
        for queued in queue.iter() {
            let entry = encoded_size(&queued.message);
            if count >= self.policy.max_commands
                || (count > 0 && size + entry > self.policy.max_payload_size)
            {
                break;
            }
            size += entry;
            count += 1;
        }

        let batch: Vec<_> = queue.drain(..count).collect();
        self.total_drained += batch.len() as u64;
        trace!(
            session = %session,
            taken = batch.len(),
            remaining = queue.len(),
            "queue tick"
        );
        batch
    }

    /// Messages waiting for `session`
    #[must_use]
    pub fn pending(&self, session: SessionId) -> usize {
        self.queues.get(&session).map_or(0, VecDeque::len)
    }

    /// Messages waiting across all sessions
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Sessions with queued messages, in id order
    #[must_use]
    pub fn sessions_with_pending(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Total messages accepted
    #[must_use]
    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    /// Total messages handed out by [`drain_tick`](Self::drain_tick)
    #[must_use]
    pub fn total_drained(&self) -> u64 {
        self.total_drained
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(PacingPolicy::default())
    }
}

/// Turn a drained batch into a packet timestamp and delta-timed commands.
///
/// The packet timestamp is the enqueue time of the first message; each delta
/// is the time since the previous message was enqueued.
#[must_use]
pub fn timed_commands(batch: &[QueuedMessage], clock: &Clock) -> (u32, Vec<TimedCommand>) {
    let Some(first) = batch.first() else {
        return (0, Vec::new());
    };

    let mut previous = clock.ticks_at(first.enqueued_at);
    let commands = batch
        .iter()
        .map(|queued| {
            let ticks = clock.ticks_at(queued.enqueued_at);
            let delta = ticks.saturating_sub(previous).min(u64::from(MAX_DELTA));
            previous = ticks;
            TimedCommand::new(
                u32::try_from(delta).unwrap_or(MAX_DELTA),
                queued.message.clone(),
            )
        })
        .collect();

    (clock.rtp_timestamp(first.enqueued_at), commands)
}
