//! Test harnesses
//!
//! [`SessionPair`] connects two sans-IO sessions in memory so handshakes and
//! MIDI exchange can be driven with a virtual clock.

mod network_sim;

pub use network_sim::NetworkSimulator;

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::context::Context;
use crate::driver::MidiSink;
use crate::error::MidiError;
use crate::protocol::applemidi::{ControlPacket, is_control_packet};
use crate::protocol::rtp::TimedCommand;
use crate::session::{Session, SessionEvent, SessionState, Transmit};
use crate::types::{DriverConfig, Port, SessionId};

/// Address of the initiating side of a [`SessionPair`]
pub const INITIATOR_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5004);

/// Address of the responding side of a [`SessionPair`]
pub const RESPONDER_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 5004);

/// One side of a [`SessionPair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The inviting session
    Initiator,
    /// The invited session
    Responder,
}

type Filter = Box<dyn FnMut(Side, &Transmit) -> bool>;

/// Two sessions wired back to back
pub struct SessionPair {
    /// The inviting session
    pub initiator: Session,
    /// The invited session
    pub responder: Session,
    /// Loss and duplication applied to every packet
    pub network: NetworkSimulator,
    now: Instant,
    filter: Option<Filter>,
    initiator_events: Vec<SessionEvent>,
    responder_events: Vec<SessionEvent>,
    errors: Vec<(Side, MidiError)>,
    delivered: u64,
    dropped: u64,
}

impl std::fmt::Debug for SessionPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPair")
            .field("initiator", &self.initiator.state())
            .field("responder", &self.responder.state())
            .field("delivered", &self.delivered)
            .field("dropped", &self.dropped)
            .finish_non_exhaustive()
    }
}

/// Config with short timers for in-memory tests
#[must_use]
pub fn fast_config(name: &str) -> DriverConfig {
    DriverConfig::builder()
        .session_name(name)
        .invitation_retries(Duration::from_millis(100), 4)
        .max_invitation_delay(Duration::from_millis(400))
        .handshake_timeout(Duration::from_secs(2))
        .sync_retries(Duration::from_millis(100), 2)
        .sync_interval(Duration::from_secs(10))
        .feedback_interval(Duration::from_millis(200))
        .end_grace_period(Duration::from_millis(50))
        .build()
}

impl SessionPair {
    /// Pair with fast test timers
    #[must_use]
    pub fn new() -> Self {
        Self::with_configs(fast_config("initiator"), fast_config("responder"))
    }

    /// Pair with explicit configurations
    #[must_use]
    pub fn with_configs(initiator: DriverConfig, responder: DriverConfig) -> Self {
        let now = Instant::now();
        let clock = Clock::with_origin(now, 0);
        let initiator = Session::initiator(
            SessionId(1),
            Rc::new(Context::new(initiator)),
            clock,
            0x1111_1111,
            0xA5A5_0001,
            RESPONDER_ADDR,
        )
        .with_initial_sequence(100);
        // The responder's clock runs one second ahead
        let responder = Session::responder(
            SessionId(2),
            Rc::new(Context::new(responder)),
            Clock::with_origin(now, 10_000),
            0x2222_2222,
            INITIATOR_ADDR,
        )
        .with_initial_sequence(200);

        Self {
            initiator,
            responder,
            network: NetworkSimulator::perfect(),
            now,
            filter: None,
            initiator_events: Vec::new(),
            responder_events: Vec::new(),
            errors: Vec::new(),
            delivered: 0,
            dropped: 0,
        }
    }

    /// Current virtual time
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Only deliver packets for which `filter` returns true
    pub fn set_filter(&mut self, filter: impl FnMut(Side, &Transmit) -> bool + 'static) {
        self.filter = Some(Box::new(filter));
    }

    /// Deliver every packet again
    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Invite and pump until both sides settle
    pub fn handshake(&mut self) {
        if let Err(e) = self.initiator.invite(self.now) {
            self.errors.push((Side::Initiator, e));
        }
        self.pump();
    }

    /// Check that both sides reached `Established`
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.initiator.state() == SessionState::Established
            && self.responder.state() == SessionState::Established
    }

    /// Move virtual time forward, fire due timers and pump
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.initiator.on_timeout(self.now);
        self.responder.on_timeout(self.now);
        self.pump();
    }

    /// Advance in `step` increments until `until` has passed
    pub fn run_for(&mut self, until: Duration, step: Duration) {
        let end = self.now + until;
        while self.now < end {
            self.advance(step);
        }
    }

    /// Shuttle packets between the sessions until none are left.
    /// Returns the number delivered.
    pub fn pump(&mut self) -> u64 {
        let before = self.delivered;
        loop {
            let mut moved = false;
            while let Some(transmit) = self.initiator.poll_transmit() {
                moved = true;
                self.route(Side::Initiator, &transmit);
            }
            while let Some(transmit) = self.responder.poll_transmit() {
                moved = true;
                self.route(Side::Responder, &transmit);
            }
            if !moved {
                break;
            }
        }
        self.collect_events();
        self.delivered - before
    }

    fn route(&mut self, from: Side, transmit: &Transmit) {
        let deliver = match self.filter.as_mut() {
            Some(filter) => filter(from, transmit),
            None => true,
        };
        if !deliver || self.network.should_drop() {
            self.dropped += 1;
            return;
        }
        self.deliver(from, transmit);
        if self.network.should_duplicate() {
            self.deliver(from, transmit);
        }
    }

    fn deliver(&mut self, from: Side, transmit: &Transmit) {
        let (target, source_base, to) = match from {
            Side::Initiator => (&mut self.responder, INITIATOR_ADDR, Side::Responder),
            Side::Responder => (&mut self.initiator, RESPONDER_ADDR, Side::Initiator),
        };
        let source = match transmit.port {
            Port::Control => source_base,
            Port::Data => crate::session::data_addr_for(source_base),
        };

        self.delivered += 1;
        let result = if is_control_packet(&transmit.payload) {
            ControlPacket::decode(&transmit.payload)
                .map_err(MidiError::from)
                .and_then(|packet| target.handle_control(transmit.port, packet, source, self.now))
        } else {
            target.handle_data(&transmit.payload, self.now)
        };
        if let Err(e) = result {
            self.errors.push((to, e));
        }
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.initiator.poll_event() {
            self.initiator_events.push(event);
        }
        while let Some(event) = self.responder.poll_event() {
            self.responder_events.push(event);
        }
    }

    /// Events produced by one side so far
    #[must_use]
    pub fn events(&self, side: Side) -> &[SessionEvent] {
        match side {
            Side::Initiator => &self.initiator_events,
            Side::Responder => &self.responder_events,
        }
    }

    /// MIDI commands received by one side, in order
    #[must_use]
    pub fn received_midi(&self, side: Side) -> Vec<TimedCommand> {
        self.events(side)
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Midi { commands, .. } => Some(commands.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Errors returned by the receiving side of delivered packets
    #[must_use]
    pub fn errors(&self) -> &[(Side, MidiError)] {
        &self.errors
    }

    /// Packets delivered so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Packets dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for SessionPair {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`MidiSink`] that records everything it receives.
///
/// Clones share the same record, so one clone can be handed to a driver
/// while the test keeps another.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    received: Rc<RefCell<Vec<(SessionId, TimedCommand)>>>,
}

impl RecordingSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far
    #[must_use]
    pub fn received(&self) -> Vec<(SessionId, TimedCommand)> {
        self.received.borrow().clone()
    }

    /// Number of commands received
    #[must_use]
    pub fn len(&self) -> usize {
        self.received.borrow().len()
    }

    /// Check whether nothing was received
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.received.borrow().is_empty()
    }
}

impl MidiSink for RecordingSink {
    fn receive(&mut self, session: SessionId, _timestamp: u32, commands: &[TimedCommand]) {
        self.received
            .borrow_mut()
            .extend(commands.iter().map(|command| (session, command.clone())));
    }
}
