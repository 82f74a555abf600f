//! AppleMIDI session state machine
//!
//! A [`Session`] performs no I/O. Callers feed it received packets and
//! expired deadlines, then collect the datagrams it wants sent with
//! [`Session::poll_transmit`] and what happened with
//! [`Session::poll_event`].
//!
//! ```text
//! Initiator:  Idle -> Inviting -> Invited -> SyncPending -> Established
//! Responder:  Listening -> AcceptingInvite -> SyncPending -> Established
//! Either:     ... -> Ending -> Closed      (or straight to Closed)
//! ```
//!
//! The initiator invites the peer's control port, then its data port with
//! the same token, then runs the clock handshake on the data port.

mod peer;
mod state;

#[cfg(test)]
mod tests;

pub use peer::{Peer, data_addr_for};
pub use state::{CloseReason, Role, SessionState};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, ClockEstimate, ClockSync, SyncStatus, SyncStep};
use crate::context::Context;
use crate::error::{HandshakeStage, MidiError, Result};
use crate::protocol::applemidi::{
    ClockSyncPacket, ControlPacket, Exchange, PROTOCOL_VERSION, ReceiverFeedback,
};
use crate::protocol::rtp::{
    GapInfo, JournalHeader, RtpMidiCodec, SequenceCheck, SequenceTracker, TimedCommand,
};
use crate::types::{Port, SessionId};

/// A datagram the session wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Local socket to send from
    pub port: Port,
    /// Remote address
    pub destination: SocketAddr,
    /// Encoded packet
    pub payload: Bytes,
}

/// Notifications produced by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// State changed
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// Handshake finished, MIDI can flow
    Established,
    /// A clock exchange completed
    ClockSynchronized(ClockEstimate),
    /// Re-synchronization failed; peer timestamps are approximate
    ClockDegraded,
    /// MIDI commands received from the peer
    Midi {
        /// RTP timestamp of the packet
        timestamp: u32,
        /// Commands in order
        commands: Vec<TimedCommand>,
    },
    /// Inbound packets were lost
    SequenceGap(GapInfo),
    /// The session reached `Closed`
    Closed(CloseReason),
}

/// Per-session counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// RTP packets sent
    pub packets_sent: u64,
    /// RTP packets accepted
    pub packets_received: u64,
    /// RTP bytes sent
    pub bytes_sent: u64,
    /// RTP bytes received
    pub bytes_received: u64,
    /// MIDI commands sent
    pub commands_sent: u64,
    /// MIDI commands received
    pub commands_received: u64,
    /// Sequence gaps detected
    pub gaps: u64,
    /// Packets lost in gaps
    pub packets_lost: u64,
    /// Late or duplicate packets dropped
    pub late_packets: u64,
    /// Invitations sent in the current stage
    pub invitation_attempts: u32,
    /// Completed clock exchanges
    pub sync_rounds: u32,
    /// Last measured one-way latency in ticks
    pub latency: Option<u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timers {
    /// Invitation retry (initiator) or handshake deadline (responder)
    retry: Option<Instant>,
    /// Unanswered clock sync
    sync: Option<Instant>,
    /// Next periodic clock sync
    resync: Option<Instant>,
    /// Next receiver feedback
    feedback: Option<Instant>,
    /// End of the bye grace period
    grace: Option<Instant>,
}

impl Timers {
    fn next(&self) -> Option<Instant> {
        [self.retry, self.sync, self.resync, self.feedback, self.grace]
            .into_iter()
            .flatten()
            .min()
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    if slot.is_some_and(|deadline| deadline <= now) {
        *slot = None;
        true
    } else {
        false
    }
}

/// One AppleMIDI session with a single peer
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    ctx: Rc<Context>,
    role: Role,
    state: SessionState,
    local_ssrc: u32,
    peer: Peer,
    clock: Clock,
    sync: ClockSync,
    codec: RtpMidiCodec,
    tracker: SequenceTracker,
    /// Last sequence number the peer acknowledged with `RS`
    acked: Option<u16>,
    /// Last sequence number we acknowledged with `RS`
    feedback_sent: Option<u16>,
    attempts: u32,
    timers: Timers,
    transmits: VecDeque<Transmit>,
    events: VecDeque<SessionEvent>,
    stats: SessionStats,
    close_reason: Option<CloseReason>,
}

impl Session {
    /// Create a session that will invite the peer at `peer_control`
    #[must_use]
    pub fn initiator(
        id: SessionId,
        ctx: Rc<Context>,
        clock: Clock,
        local_ssrc: u32,
        token: u32,
        peer_control: SocketAddr,
    ) -> Self {
        Self::new(
            id,
            ctx,
            clock,
            Role::Initiator,
            local_ssrc,
            Peer::new(peer_control, token),
        )
    }

    /// Create a session waiting for an invitation from `peer_control`
    #[must_use]
    pub fn responder(
        id: SessionId,
        ctx: Rc<Context>,
        clock: Clock,
        local_ssrc: u32,
        peer_control: SocketAddr,
    ) -> Self {
        Self::new(
            id,
            ctx,
            clock,
            Role::Responder,
            local_ssrc,
            Peer::new(peer_control, 0),
        )
    }

    fn new(
        id: SessionId,
        ctx: Rc<Context>,
        clock: Clock,
        role: Role,
        local_ssrc: u32,
        peer: Peer,
    ) -> Self {
        let state = match role {
            Role::Initiator => SessionState::Idle,
            Role::Responder => SessionState::Listening,
        };
        Self {
            id,
            ctx,
            role,
            state,
            local_ssrc,
            peer,
            clock,
            sync: ClockSync::new(),
            codec: RtpMidiCodec::new(local_ssrc, rand::random()),
            tracker: SequenceTracker::new(),
            acked: None,
            feedback_sent: None,
            attempts: 0,
            timers: Timers::default(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            stats: SessionStats::default(),
            close_reason: None,
        }
    }

    /// Start outbound RTP sequence numbers at `sequence`
    #[must_use]
    pub fn with_initial_sequence(mut self, sequence: u16) -> Self {
        self.codec = RtpMidiCodec::new(self.local_ssrc, sequence);
        self
    }

    // ===== Accessors =====

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Our role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The remote end
    #[must_use]
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Our SSRC
    #[must_use]
    pub fn local_ssrc(&self) -> u32 {
        self.local_ssrc
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Peer clock status
    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    /// Latest peer clock estimate
    #[must_use]
    pub fn clock_estimate(&self) -> Option<ClockEstimate> {
        self.sync.estimate()
    }

    /// Sequence number of the next outbound RTP packet
    #[must_use]
    pub fn next_sequence(&self) -> u16 {
        self.codec.sequence()
    }

    /// Why the session closed
    #[must_use]
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Check for the terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Earliest instant at which [`on_timeout`](Self::on_timeout) has work
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next()
    }

    /// Next datagram to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next event
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    // ===== Commands =====

    /// Send the control port invitation
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` unless the session is an idle
    /// initiator.
    pub fn invite(&mut self, now: Instant) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(MidiError::invalid_argument(
                "session",
                format!("cannot invite in state {}", self.state),
            ));
        }
        self.transition(SessionState::Inviting);
        self.attempts = 1;
        self.send_invitation(Port::Control);
        self.timers.retry = Some(now + self.backoff());
        Ok(())
    }

    /// Send a packet of MIDI commands
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` if the session is not
    /// established or the commands do not fit one packet.
    pub fn send_midi(&mut self, timestamp: u32, commands: &[TimedCommand]) -> Result<()> {
        if self.state != SessionState::Established {
            return Err(MidiError::invalid_argument(
                "session",
                format!("{} is {}, not established", self.id, self.state),
            ));
        }

        let journal = match (self.acked, self.codec.last_sent()) {
            (Some(acked), Some(last)) if acked != last => Some(JournalHeader {
                single_packet_loss: last == acked.wrapping_add(1),
                checkpoint: acked,
            }),
            _ => None,
        };

        let sequence = self.codec.sequence();
        let payload = self
            .codec
            .encode(commands, timestamp, journal)
            .map_err(|e| MidiError::invalid_argument("commands", e.to_string()))?;

        if self.ctx.develop() {
            trace!(
                session = %self.id,
                seq = sequence,
                commands = commands.len(),
                bytes = payload.len(),
                "rtp out"
            );
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        self.stats.commands_sent += commands.len() as u64;
        self.push_transmit(Port::Data, self.peer.data_addr, payload);
        Ok(())
    }

    /// End the session: send bye and close after the grace period
    pub fn end(&mut self, now: Instant) {
        match self.state {
            SessionState::Closed | SessionState::Ending => {}
            SessionState::Idle | SessionState::Listening => self.close(CloseReason::Ended),
            _ => {
                let bye = Exchange::new(self.peer.token, self.local_ssrc, None);
                self.push_control(Port::Control, ControlPacket::Bye(bye));
                self.transition(SessionState::Ending);
                self.timers = Timers {
                    grace: Some(now + self.ctx.config().end_grace_period),
                    ..Timers::default()
                };
            }
        }
    }

    // ===== Input =====

    /// Handle a control packet received on `port` from `from`
    ///
    /// # Errors
    ///
    /// Returns `MidiError::ProtocolViolation` for packets that do not fit
    /// the session. The session is unaffected.
    pub fn handle_control(
        &mut self,
        port: Port,
        packet: ControlPacket,
        from: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(MidiError::violation(format!("{} is closed", self.id)));
        }
        if self.ctx.develop() {
            trace!(session = %self.id, %port, %from, command = ?packet.command(), "control in");
        }

        match packet {
            ControlPacket::Invitation(exchange) => self.on_invitation(port, exchange, from, now),
            ControlPacket::Accepted(exchange) => self.on_accepted(port, exchange, from, now),
            ControlPacket::Rejected(exchange) => {
                self.on_rejected(&exchange);
                Ok(())
            }
            ControlPacket::Bye(exchange) => self.on_bye(&exchange),
            ControlPacket::ClockSync(ck) => {
                if port != Port::Data {
                    return Err(MidiError::violation("clock sync on control port"));
                }
                self.on_clock_sync(ck, now)
            }
            ControlPacket::ReceiverFeedback(rs) => self.on_feedback(rs),
        }
    }

    /// Handle an RTP-MIDI packet from the data port
    ///
    /// # Errors
    ///
    /// Returns a recoverable error for undecodable, foreign, late or
    /// duplicate packets, and for malformed command lists. Commands parsed
    /// before a malformed one are still delivered.
    pub fn handle_data(&mut self, buf: &[u8], now: Instant) -> Result<()> {
        let decoded = self.codec.decode(buf)?;
        let header = &decoded.packet.header;

        if Some(header.ssrc) != self.peer.ssrc {
            return Err(MidiError::violation(format!(
                "RTP from unknown SSRC 0x{:08x}",
                header.ssrc
            )));
        }

        match self.state {
            SessionState::Established => {}
            SessionState::SyncPending if self.role == Role::Responder => {
                // The peer finished its handshake; our CK2 was lost
                debug!(session = %self.id, "RTP before CK2, assuming established");
                self.establish(now);
            }
            state => {
                return Err(MidiError::violation(format!(
                    "RTP in state {state}"
                )));
            }
        }

        let sequence = header.sequence;
        match self.tracker.record(sequence) {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap(gap) => {
                warn!(
                    session = %self.id,
                    first_missing = gap.start,
                    count = gap.count,
                    "sequence gap, continuing"
                );
                self.stats.gaps += 1;
                self.stats.packets_lost += u64::from(gap.count);
                self.events.push_back(SessionEvent::SequenceGap(gap));
            }
            SequenceCheck::Late => {
                self.stats.late_packets += 1;
                return Err(MidiError::violation(format!(
                    "late or duplicate packet {sequence}"
                )));
            }
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += buf.len() as u64;
        if self.ctx.develop() {
            trace!(
                session = %self.id,
                seq = sequence,
                commands = decoded.packet.commands.len(),
                checkpoint = decoded.packet.journal.map(|j| j.checkpoint),
                "rtp in"
            );
        }

        let timestamp = header.timestamp;
        let commands = decoded.packet.commands;
        if !commands.is_empty() {
            self.stats.commands_received += commands.len() as u64;
            self.events
                .push_back(SessionEvent::Midi { timestamp, commands });
        }

        match decoded.fault {
            Some(fault) => Err(MidiError::violation(format!(
                "malformed command list in packet {sequence}: {fault}"
            ))),
            None => Ok(()),
        }
    }

    /// Run the work of every expired deadline
    pub fn on_timeout(&mut self, now: Instant) {
        if take_due(&mut self.timers.retry, now) {
            self.on_retry_timeout(now);
        }
        if take_due(&mut self.timers.sync, now) {
            self.on_sync_timeout(now);
        }
        if take_due(&mut self.timers.resync, now) && self.state == SessionState::Established {
            self.start_sync(now);
        }
        if take_due(&mut self.timers.feedback, now) && self.state == SessionState::Established {
            self.send_feedback();
            self.timers.feedback = Some(now + self.ctx.config().feedback_interval);
        }
        if take_due(&mut self.timers.grace, now) {
            self.close(CloseReason::Ended);
        }
    }

    // ===== Handshake =====

    fn on_invitation(
        &mut self,
        port: Port,
        exchange: Exchange,
        from: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        if self.role == Role::Initiator {
            return Err(MidiError::violation("invitation on an initiated session"));
        }
        if exchange.version != PROTOCOL_VERSION {
            let reply = Exchange::new(exchange.token, self.local_ssrc, None);
            self.push_control_to(port, from, ControlPacket::Rejected(reply));
            return Err(MidiError::violation(format!(
                "unsupported protocol version {}",
                exchange.version
            )));
        }
        if self.peer.ssrc.is_some_and(|ssrc| ssrc != exchange.ssrc) {
            return Err(MidiError::violation(format!(
                "invitation from foreign SSRC 0x{:08x}",
                exchange.ssrc
            )));
        }

        match (port, self.state) {
            (Port::Control, SessionState::Listening) => {
                self.peer.token = exchange.token;
                self.peer.ssrc = Some(exchange.ssrc);
                self.peer.name = exchange.name;
                self.accept(Port::Control, from);
                self.transition(SessionState::AcceptingInvite);
                self.timers.retry = Some(now + self.ctx.config().handshake_timeout);
                Ok(())
            }
            (
                Port::Control,
                SessionState::AcceptingInvite | SessionState::SyncPending | SessionState::Established,
            ) => {
                debug!(session = %self.id, "repeated control invitation, acknowledging again");
                self.peer.token = exchange.token;
                self.accept(Port::Control, from);
                Ok(())
            }
            (Port::Data, SessionState::AcceptingInvite) if exchange.token == self.peer.token => {
                self.peer.data_addr = from;
                self.accept(Port::Data, from);
                self.transition(SessionState::SyncPending);
                Ok(())
            }
            (Port::Data, SessionState::SyncPending | SessionState::Established)
                if exchange.token == self.peer.token =>
            {
                debug!(session = %self.id, "repeated data invitation, acknowledging again");
                self.accept(Port::Data, from);
                Ok(())
            }
            (port, state) => Err(MidiError::violation(format!(
                "{port} invitation in state {state}"
            ))),
        }
    }

    fn accept(&mut self, port: Port, to: SocketAddr) {
        let reply = Exchange::new(
            self.peer.token,
            self.local_ssrc,
            Some(self.ctx.config().session_name.clone()),
        );
        self.push_control_to(port, to, ControlPacket::Accepted(reply));
    }

    fn on_accepted(
        &mut self,
        port: Port,
        exchange: Exchange,
        from: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(MidiError::violation("acceptance on a responder session"));
        }
        if exchange.token != self.peer.token {
            debug!(
                session = %self.id,
                token = exchange.token,
                "acceptance with unknown token ignored"
            );
            return Ok(());
        }

        match (port, self.state) {
            (Port::Control, SessionState::Inviting) => {
                self.peer.ssrc = Some(exchange.ssrc);
                self.peer.name = exchange.name;
                info!(
                    session = %self.id,
                    peer = %self.peer.display_name(),
                    "control invitation accepted"
                );
                self.transition(SessionState::Invited);
                self.attempts = 1;
                self.send_invitation(Port::Data);
                self.timers.retry = Some(now + self.backoff());
                Ok(())
            }
            (Port::Data, SessionState::Invited) => {
                self.peer.data_addr = from;
                self.timers.retry = None;
                self.transition(SessionState::SyncPending);
                self.start_sync(now);
                Ok(())
            }
            (Port::Control, SessionState::Invited | SessionState::SyncPending)
            | (Port::Control | Port::Data, SessionState::Established)
            | (Port::Data, SessionState::SyncPending) => {
                debug!(session = %self.id, %port, "duplicate acceptance ignored");
                Ok(())
            }
            (port, state) => Err(MidiError::violation(format!(
                "{port} acceptance in state {state}"
            ))),
        }
    }

    fn on_rejected(&mut self, exchange: &Exchange) {
        let handshaking = matches!(self.state, SessionState::Inviting | SessionState::Invited);
        if !handshaking || exchange.token != self.peer.token {
            debug!(
                session = %self.id,
                token = exchange.token,
                state = %self.state,
                "rejection ignored"
            );
            return;
        }
        info!(session = %self.id, peer = %self.peer.control_addr, "invitation rejected");
        self.close(CloseReason::Rejected);
    }

    fn on_bye(&mut self, exchange: &Exchange) -> Result<()> {
        let matches_peer = match self.peer.ssrc {
            Some(ssrc) => ssrc == exchange.ssrc,
            None => exchange.token == self.peer.token,
        };
        if !matches_peer {
            return Err(MidiError::violation(format!(
                "bye from foreign SSRC 0x{:08x}",
                exchange.ssrc
            )));
        }

        if self.state == SessionState::Ending {
            self.close(CloseReason::Ended);
        } else {
            info!(session = %self.id, peer = %self.peer.display_name(), "peer ended session");
            self.close(CloseReason::PeerBye);
        }
        Ok(())
    }

    fn send_invitation(&mut self, port: Port) {
        self.stats.invitation_attempts = self.attempts;
        let invitation = Exchange::new(
            self.peer.token,
            self.local_ssrc,
            Some(self.ctx.config().session_name.clone()),
        );
        debug!(session = %self.id, %port, attempt = self.attempts, "sending invitation");
        self.push_control(port, ControlPacket::Invitation(invitation));
    }

    /// Delay before the next invitation retry
    fn backoff(&self) -> Duration {
        let config = self.ctx.config();
        let factor = 1u32
            .checked_shl(self.attempts.saturating_sub(1))
            .unwrap_or(u32::MAX);
        config
            .invitation_retry_delay
            .saturating_mul(factor)
            .min(config.max_invitation_delay.max(config.invitation_retry_delay))
    }

    fn on_retry_timeout(&mut self, now: Instant) {
        let (stage, port) = match self.state {
            SessionState::Inviting => (HandshakeStage::ControlInvitation, Port::Control),
            SessionState::Invited => (HandshakeStage::DataInvitation, Port::Data),
            SessionState::AcceptingInvite | SessionState::SyncPending
                if self.role == Role::Responder =>
            {
                self.close(CloseReason::HandshakeTimeout {
                    stage: HandshakeStage::PeerSetup,
                    attempts: 1,
                });
                return;
            }
            _ => return,
        };

        if self.attempts >= self.ctx.config().max_invitation_retries {
            self.close(CloseReason::HandshakeTimeout {
                stage,
                attempts: self.attempts,
            });
            return;
        }
        self.attempts += 1;
        self.send_invitation(port);
        self.timers.retry = Some(now + self.backoff());
    }

    // ===== Clock sync =====

    fn start_sync(&mut self, now: Instant) {
        let timestamps = self.sync.begin(self.clock.ticks_at(now));
        self.send_clock_sync(0, timestamps);
        self.timers.sync = Some(now + self.ctx.config().sync_timeout);
    }

    fn send_clock_sync(&mut self, count: u8, timestamps: [u64; 3]) {
        let ck = ClockSyncPacket {
            ssrc: self.local_ssrc,
            count,
            timestamps,
        };
        self.push_control(Port::Data, ControlPacket::ClockSync(ck));
    }

    fn on_clock_sync(&mut self, ck: ClockSyncPacket, now: Instant) -> Result<()> {
        if Some(ck.ssrc) != self.peer.ssrc {
            return Err(MidiError::violation(format!(
                "clock sync from foreign SSRC 0x{:08x}",
                ck.ssrc
            )));
        }
        if !matches!(
            self.state,
            SessionState::SyncPending | SessionState::Established
        ) {
            return Err(MidiError::violation(format!(
                "clock sync in state {}",
                self.state
            )));
        }

        match self
            .sync
            .on_message(ck.count, ck.timestamps, self.clock.ticks_at(now))?
        {
            SyncStep::Reply { count, timestamps } => {
                self.send_clock_sync(count, timestamps);
            }
            SyncStep::Complete { estimate, reply } => {
                if let Some(timestamps) = reply {
                    self.send_clock_sync(2, timestamps);
                }
                self.timers.sync = None;
                self.stats.sync_rounds = self.sync.rounds();
                self.stats.latency = Some(estimate.latency);
                self.events
                    .push_back(SessionEvent::ClockSynchronized(estimate));

                if self.state == SessionState::SyncPending {
                    self.establish(now);
                } else if self.role == Role::Initiator {
                    self.timers.resync = Some(now + self.ctx.config().sync_interval);
                }
            }
        }
        Ok(())
    }

    fn on_sync_timeout(&mut self, now: Instant) {
        let failures = self.sync.record_failure();
        let max_retries = self.ctx.config().max_sync_retries;

        match self.state {
            SessionState::SyncPending if failures > max_retries => {
                self.close(CloseReason::HandshakeTimeout {
                    stage: HandshakeStage::ClockSync,
                    attempts: failures,
                });
            }
            SessionState::Established if failures > max_retries => {
                warn!(
                    session = %self.id,
                    attempts = failures,
                    "clock re-synchronization failed, timestamps approximate"
                );
                self.sync.degrade();
                self.events.push_back(SessionEvent::ClockDegraded);
                self.timers.resync = Some(now + self.ctx.config().sync_interval);
            }
            SessionState::SyncPending | SessionState::Established => {
                debug!(session = %self.id, attempt = failures + 1, "retrying clock sync");
                self.start_sync(now);
            }
            _ => {}
        }
    }

    fn on_feedback(&mut self, rs: ReceiverFeedback) -> Result<()> {
        if Some(rs.ssrc) != self.peer.ssrc {
            return Err(MidiError::violation(format!(
                "receiver feedback from foreign SSRC 0x{:08x}",
                rs.ssrc
            )));
        }
        trace!(session = %self.id, checkpoint = rs.sequence, "peer acknowledged");
        self.acked = Some(rs.sequence);
        Ok(())
    }

    fn send_feedback(&mut self) {
        let Some(highest) = self.tracker.highest_contiguous() else {
            return;
        };
        if self.feedback_sent == Some(highest) {
            return;
        }
        self.feedback_sent = Some(highest);
        let rs = ReceiverFeedback {
            ssrc: self.local_ssrc,
            sequence: highest,
        };
        self.push_control(Port::Data, ControlPacket::ReceiverFeedback(rs));
    }

    fn establish(&mut self, now: Instant) {
        self.transition(SessionState::Established);
        self.timers.retry = None;
        self.timers.feedback = Some(now + self.ctx.config().feedback_interval);
        if self.role == Role::Initiator {
            self.timers.resync = Some(now + self.ctx.config().sync_interval);
        }
        info!(
            session = %self.id,
            peer = %self.peer.display_name(),
            latency = self.sync.estimate().map(|e| e.latency),
            "session established"
        );
        self.events.push_back(SessionEvent::Established);
    }

    // ===== Helpers =====

    fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        info!(session = %self.id, reason = %reason, "session closed");
        self.transition(SessionState::Closed);
        self.timers = Timers::default();
        self.close_reason = Some(reason.clone());
        self.events.push_back(SessionEvent::Closed(reason));
    }

    fn transition(&mut self, to: SessionState) {
        let from = self.state;
        if from == to {
            return;
        }
        debug_assert!(
            from.can_transition_to(to),
            "invalid session transition {from} -> {to}"
        );
        debug!(session = %self.id, %from, %to, "state change");
        self.state = to;
        self.events.push_back(SessionEvent::StateChanged { from, to });
    }

    fn push_control(&mut self, port: Port, packet: ControlPacket) {
        let destination = match port {
            Port::Control => self.peer.control_addr,
            Port::Data => self.peer.data_addr,
        };
        self.push_control_to(port, destination, packet);
    }

    fn push_control_to(&mut self, port: Port, destination: SocketAddr, packet: ControlPacket) {
        if self.ctx.develop() {
            trace!(session = %self.id, %port, %destination, command = ?packet.command(), "control out");
        }
        self.push_transmit(port, destination, packet.encode());
    }

    fn push_transmit(&mut self, port: Port, destination: SocketAddr, payload: Bytes) {
        self.transmits.push_back(Transmit {
            port,
            destination,
            payload,
        });
    }
}
