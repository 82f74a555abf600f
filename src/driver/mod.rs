//! Network MIDI driver
//!
//! [`Driver`] binds the control and data sockets, owns the session table and
//! the outbound queue, and wires all of them into a [`RunLoop`]. Everything
//! runs on the loop's thread: socket callbacks route datagrams to sessions,
//! one timer per session follows its next deadline, and a flush timer drains
//! the queue into RTP packets.
//!
//! ```text
//! enqueue -> MessageQueue -> flush timer -> Session::send_midi -> data socket
//! socket readable -> route -> Session::handle_* -> sink / events / replies
//! ```

mod events;
mod sink;
mod table;


pub use events::DriverEvent;
pub use sink::MidiSink;
pub use table::SessionTable;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, ClockEstimate};
use crate::context::Context;
use crate::error::{MidiError, Result};
use crate::midi::MidiMessage;
use crate::protocol::applemidi::{ControlPacket, Exchange, PROTOCOL_VERSION, is_control_packet};
use crate::protocol::rtp::{RtpHeader, TimedCommand};
use crate::queue::{self, MessageQueue, PacingPolicy};
use crate::runloop::{LoopHandle, LoopSocket, RunLoop, SocketId, TimerId};
use crate::session::{CloseReason, Peer, Session, SessionEvent, SessionState, SessionStats, Transmit};
use crate::types::{Port, SessionId};

/// Largest datagram read from a socket
const MAX_DATAGRAM: usize = 8192;

/// Datagrams read per readiness notification before yielding to the loop
const MAX_DATAGRAMS_PER_WAKE: usize = 64;

/// Capacity of the event channel
const EVENT_CAPACITY: usize = 64;

/// Attempts at finding a free control/data port pair
const MAX_BIND_ATTEMPTS: usize = 16;

type Delivery = (SessionId, u32, Vec<TimedCommand>);

/// AppleMIDI driver bound to a run loop.
///
/// Cheap to clone; clones share the same sockets and sessions. Must be used
/// on the thread that runs the loop.
#[derive(Clone)]
pub struct Driver {
    shared: Rc<Shared>,
}

struct Shared {
    inner: RefCell<DriverInner>,
    sink: RefCell<Option<Box<dyn MidiSink>>>,
}

struct DriverInner {
    ctx: Rc<Context>,
    handle: LoopHandle,
    clock: Clock,
    ssrc: u32,
    control: Rc<LoopSocket>,
    data: Rc<LoopSocket>,
    registrations: Vec<SocketId>,
    sessions: SessionTable,
    timers: HashMap<SessionId, TimerId>,
    queue: MessageQueue,
    flush_timer: Option<TimerId>,
    events: broadcast::Sender<DriverEvent>,
    next_id: u64,
    shut_down: bool,
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("Driver")
            .field("ssrc", &format_args!("0x{:08x}", inner.ssrc))
            .field("control", &inner.control.local_addr().ok())
            .field("sessions", &inner.sessions)
            .field("pending", &inner.queue.total_pending())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Bind the control and data sockets and register them with `run_loop`.
    ///
    /// With `control_port` 0 a free adjacent port pair is chosen.
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` for an invalid configuration and
    /// `MidiError::Network` if the sockets cannot be bound.
    pub fn bind(ctx: Rc<Context>, run_loop: &RunLoop) -> Result<Self> {
        ctx.config().validate()?;
        let config = ctx.config();
        let (control, data) = bind_pair(run_loop, config.bind_address, config.control_port)?;
        let ssrc = config.ssrc.unwrap_or_else(rand::random);
        let queue = MessageQueue::new(PacingPolicy::from_config(config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = run_loop.handle();

        info!(
            name = %config.session_name,
            control = %control.local_addr()?,
            ssrc = format_args!("0x{ssrc:08x}"),
            "driver bound"
        );

        let shared = Rc::new(Shared {
            inner: RefCell::new(DriverInner {
                ctx: Rc::clone(&ctx),
                handle: handle.clone(),
                clock: Clock::new(),
                ssrc,
                control: Rc::clone(&control),
                data: Rc::clone(&data),
                registrations: Vec::new(),
                sessions: SessionTable::new(),
                timers: HashMap::new(),
                queue,
                flush_timer: None,
                events,
                next_id: 0,
                shut_down: false,
            }),
            sink: RefCell::new(None),
        });

        let registrations = [(Port::Control, control), (Port::Data, data)]
            .into_iter()
            .map(|(port, socket)| {
                let weak = Rc::downgrade(&shared);
                handle.add_socket(socket, move |_| Shared::on_readable(&weak, port))
            })
            .collect();
        shared.inner.borrow_mut().registrations = registrations;

        Ok(Self { shared })
    }

    // ===== Sessions =====

    /// Invite the peer whose control port is `peer`
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` if a session with that peer
    /// already exists or the driver was shut down.
    pub fn connect(&self, peer: SocketAddr) -> Result<SessionId> {
        let id = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.shut_down {
                return Err(MidiError::invalid_argument("driver", "shut down"));
            }
            let id = inner.allocate_id();
            let session = Session::initiator(
                id,
                Rc::clone(&inner.ctx),
                inner.clock,
                inner.ssrc,
                rand::random(),
                peer,
            );
            inner.add_session(session)?;
            if let Some(session) = inner.sessions.get_mut(id) {
                session.invite(Instant::now())?;
            }
            id
        };
        self.shared.service(id);
        Ok(id)
    }

    /// End a session with bye
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` for an unknown session.
    pub fn end(&self, id: SessionId) -> Result<()> {
        {
            let mut inner = self.shared.inner.borrow_mut();
            let session = inner.sessions.get_mut(id).ok_or_else(|| unknown_session(id))?;
            session.end(Instant::now());
        }
        self.shared.service(id);
        Ok(())
    }

    /// End every session and stop accepting invitations. The sockets are
    /// released once the last session has closed.
    pub fn shutdown(&self) {
        let ids = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.shut_down = true;
            let now = Instant::now();
            inner.sessions.apply(|session| {
                session.end(now);
                1
            });
            inner.sessions.ids()
        };
        info!(sessions = ids.len(), "driver shutting down");
        for id in ids {
            self.shared.service(id);
        }
        self.shared.inner.borrow_mut().detach_if_done();
    }

    // ===== MIDI =====

    /// Queue a message for a session. It is sent once the session is
    /// established.
    ///
    /// # Errors
    ///
    /// Returns `MidiError::InvalidArgument` if the session is closed or
    /// unknown or the message can never fit a packet, and
    /// `MidiError::ResourceExhaustion` if the queue cannot grow.
    pub fn enqueue(&self, id: SessionId, message: MidiMessage) -> Result<()> {
        let mut inner = self.shared.inner.borrow_mut();
        let established = match inner.sessions.get(id) {
            Some(session) if !session.is_closed() => session.state() == SessionState::Established,
            _ => return Err(unknown_session(id)),
        };
        let now = Instant::now();
        inner.queue.enqueue(id, message, now)?;
        if established {
            inner.arm_flush(&self.shared, now);
        }
        Ok(())
    }

    /// Queue a message for every established session. Returns the number
    /// of sessions it was queued for.
    ///
    /// # Errors
    ///
    /// Returns the first enqueue error.
    pub fn broadcast(&self, message: &MidiMessage) -> Result<usize> {
        let targets: Vec<_> = {
            let inner = self.shared.inner.borrow();
            inner
                .sessions
                .ids()
                .into_iter()
                .filter(|id| {
                    inner
                        .sessions
                        .get(*id)
                        .is_some_and(|s| s.state() == SessionState::Established)
                })
                .collect()
        };
        for id in &targets {
            self.enqueue(*id, message.clone())?;
        }
        Ok(targets.len())
    }

    /// Install the receiver of inbound MIDI, replacing any previous one
    pub fn set_sink(&self, sink: impl MidiSink + 'static) {
        *self.shared.sink.borrow_mut() = Some(Box::new(sink));
    }

    /// Subscribe to driver events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.shared.inner.borrow().events.subscribe()
    }

    // ===== Accessors =====

    /// Ids of all open sessions
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionId> {
        self.shared.inner.borrow().sessions.ids()
    }

    /// State of a session, `None` once it was removed
    #[must_use]
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.shared.inner.borrow().sessions.get(id).map(Session::state)
    }

    /// Counters of a session
    #[must_use]
    pub fn session_stats(&self, id: SessionId) -> Option<SessionStats> {
        self.shared
            .inner
            .borrow()
            .sessions
            .get(id)
            .map(|s| s.stats().clone())
    }

    /// Peer of a session
    #[must_use]
    pub fn session_peer(&self, id: SessionId) -> Option<Peer> {
        self.shared
            .inner
            .borrow()
            .sessions
            .get(id)
            .map(|s| s.peer().clone())
    }

    /// Clock estimate of a session
    #[must_use]
    pub fn clock_estimate(&self, id: SessionId) -> Option<ClockEstimate> {
        self.shared
            .inner
            .borrow()
            .sessions
            .get(id)
            .and_then(Session::clock_estimate)
    }

    /// Messages queued for a session
    #[must_use]
    pub fn pending(&self, id: SessionId) -> usize {
        self.shared.inner.borrow().queue.pending(id)
    }

    /// Our SSRC
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.shared.inner.borrow().ssrc
    }

    /// Shared context
    #[must_use]
    pub fn context(&self) -> Rc<Context> {
        Rc::clone(&self.shared.inner.borrow().ctx)
    }

    /// Control socket address
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Network` if the socket address is unavailable.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.inner.borrow().control.local_addr()?)
    }

    /// Data socket address
    ///
    /// # Errors
    ///
    /// Returns `MidiError::Network` if the socket address is unavailable.
    pub fn data_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.inner.borrow().data.local_addr()?)
    }
}

fn unknown_session(id: SessionId) -> MidiError {
    MidiError::invalid_argument("session", format!("{id} is closed or unknown"))
}

fn bind_pair(
    run_loop: &RunLoop,
    ip: IpAddr,
    control_port: u16,
) -> Result<(Rc<LoopSocket>, Rc<LoopSocket>)> {
    if control_port != 0 {
        let control = run_loop.bind_udp(SocketAddr::new(ip, control_port))?;
        let data = run_loop.bind_udp(SocketAddr::new(ip, control_port.wrapping_add(1)))?;
        return Ok((control, data));
    }

    let mut last_error = None;
    for _ in 0..MAX_BIND_ATTEMPTS {
        let control = run_loop.bind_udp(SocketAddr::new(ip, 0))?;
        let Some(data_port) = control.local_addr()?.port().checked_add(1) else {
            continue;
        };
        match run_loop.bind_udp(SocketAddr::new(ip, data_port)) {
            Ok(data) => return Ok((control, data)),
            Err(e) => {
                debug!(port = data_port, error = %e, "data port taken, retrying");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| MidiError::ResourceExhaustion {
        message: "no free control/data port pair".to_string(),
    }))
}

impl Shared {
    fn on_readable(weak: &Weak<Self>, port: Port) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        for _ in 0..MAX_DATAGRAMS_PER_WAKE {
            let received = shared.inner.borrow().socket(port).try_recv_from(&mut buf);
            match received {
                Ok((len, from)) => shared.on_datagram(port, &buf[..len], from),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                // ICMP errors from earlier sends surface here
                Err(e) => debug!(%port, error = %e, "receive failed"),
            }
        }
    }

    fn on_datagram(self: &Rc<Self>, port: Port, buf: &[u8], from: SocketAddr) {
        let touched = self
            .inner
            .borrow_mut()
            .route(port, buf, from, Instant::now());
        if let Some(id) = touched {
            self.service(id);
        }
    }

    fn on_session_timer(weak: &Weak<Self>, id: SessionId) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        if let Some(session) = shared.inner.borrow_mut().sessions.get_mut(id) {
            session.on_timeout(Instant::now());
        }
        shared.service(id);
    }

    fn on_flush(weak: &Weak<Self>, handle: &LoopHandle, timer: TimerId) {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let now = Instant::now();
        let flushed = shared.inner.borrow_mut().flush(now);
        for id in flushed {
            shared.service(id);
        }

        let mut inner = shared.inner.borrow_mut();
        if inner.flush_timer == Some(timer) && inner.has_sendable() {
            handle.rearm(timer, now + inner.ctx.config().flush_interval);
        } else if inner.flush_timer == Some(timer) {
            inner.flush_timer = None;
        }
    }

    /// Send what a session produced, publish its events and follow its
    /// next deadline
    fn service(self: &Rc<Self>, id: SessionId) {
        let deliveries = self.inner.borrow_mut().service(id, self);
        self.deliver(deliveries);
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        // Taken out so the sink may call back into the driver
        let taken = self.sink.borrow_mut().take();
        let Some(mut sink) = taken else {
            debug!(packets = deliveries.len(), "no sink installed, inbound MIDI dropped");
            return;
        };
        for (session, timestamp, commands) in &deliveries {
            sink.receive(*session, *timestamp, commands);
        }
        let mut slot = self.sink.borrow_mut();
        if slot.is_none() {
            *slot = Some(sink);
        }
    }
}

impl DriverInner {
    fn socket(&self, port: Port) -> &LoopSocket {
        match port {
            Port::Control => &self.control,
            Port::Data => &self.data,
        }
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn add_session(&mut self, session: Session) -> Result<()> {
        let id = session.id();
        let peer = session.peer().control_addr;
        let role = session.role();
        self.sessions.insert(session)?;
        self.queue.open(id);
        debug!(session = %id, %peer, ?role, "session created");
        self.emit(DriverEvent::SessionStarted {
            session: id,
            peer,
            role,
        });
        Ok(())
    }

    fn lookup(&self, port: Port, ssrc: Option<u32>, from: SocketAddr) -> Option<SessionId> {
        ssrc.and_then(|ssrc| self.sessions.by_ssrc(ssrc))
            .or_else(|| match port {
                Port::Control => self.sessions.by_control_addr(from),
                Port::Data => self.sessions.by_data_addr(from),
            })
    }

    /// Hand a datagram to its session. Returns the session that may have
    /// output.
    fn route(&mut self, port: Port, buf: &[u8], from: SocketAddr, now: Instant) -> Option<SessionId> {
        if is_control_packet(buf) {
            let packet = match ControlPacket::decode(buf) {
                Ok(packet) => packet,
                Err(e) => {
                    self.ctx.report(&e.into());
                    return None;
                }
            };
            let id = match self.lookup(port, Some(packet.ssrc()), from) {
                Some(id) => id,
                None => self.accept_new(port, &packet, from)?,
            };
            let session = self.sessions.get_mut(id)?;
            if let Err(e) = session.handle_control(port, packet, from, now) {
                self.ctx.report(&e);
            }
            return Some(id);
        }

        if port != Port::Data {
            self.ctx
                .report(&MidiError::violation(format!("RTP on control port from {from}")));
            return None;
        }
        let ssrc = RtpHeader::decode(buf).ok().map(|header| header.ssrc);
        let Some(id) = self.lookup(port, ssrc, from) else {
            self.ctx
                .report(&MidiError::violation(format!("RTP from unknown peer {from}")));
            return None;
        };
        let session = self.sessions.get_mut(id)?;
        if let Err(e) = session.handle_data(buf, now) {
            self.ctx.report(&e);
        }
        Some(id)
    }

    /// Create a responder for an unsolicited invitation, or refuse it
    fn accept_new(&mut self, port: Port, packet: &ControlPacket, from: SocketAddr) -> Option<SessionId> {
        let ControlPacket::Invitation(exchange) = packet else {
            debug!(%port, %from, command = ?packet.command(), "control packet for no session");
            return None;
        };
        if port != Port::Control {
            self.ctx.report(&MidiError::violation(format!(
                "data port invitation from unknown peer {from}"
            )));
            return None;
        }

        let refusal = if self.shut_down {
            Some("shutting down")
        } else if !self.ctx.config().accept_invitations {
            Some("not accepting invitations")
        } else if exchange.version != PROTOCOL_VERSION {
            Some("unsupported protocol version")
        } else {
            None
        };
        if let Some(refusal) = refusal {
            info!(%from, version = exchange.version, refusal, "invitation refused");
            let reply = ControlPacket::Rejected(Exchange::new(exchange.token, self.ssrc, None));
            self.send(&Transmit {
                port,
                destination: from,
                payload: reply.encode(),
            });
            return None;
        }

        let id = self.allocate_id();
        let session = Session::responder(id, Rc::clone(&self.ctx), self.clock, self.ssrc, from);
        match self.add_session(session) {
            Ok(()) => Some(id),
            Err(e) => {
                self.ctx.report(&e);
                None
            }
        }
    }

    fn send(&self, transmit: &Transmit) {
        if let Err(e) = self
            .socket(transmit.port)
            .send_to(&transmit.payload, transmit.destination)
        {
            warn!(
                port = %transmit.port,
                destination = %transmit.destination,
                error = %e,
                "send failed"
            );
            self.ctx.report(&MidiError::Network(e));
        }
    }

    fn service(&mut self, id: SessionId, shared: &Rc<Shared>) -> Vec<Delivery> {
        let mut transmits = Vec::new();
        let mut events = Vec::new();
        let Some(session) = self.sessions.get_mut(id) else {
            return Vec::new();
        };
        while let Some(transmit) = session.poll_transmit() {
            transmits.push(transmit);
        }
        while let Some(event) = session.poll_event() {
            events.push(event);
        }
        let peer_name = session.peer().display_name();

        for transmit in &transmits {
            self.send(transmit);
        }
        self.sessions.reindex(id);

        let mut deliveries = Vec::new();
        let mut closed = None;
        let mut established = false;
        for event in events {
            match event {
                SessionEvent::StateChanged { from, to } => {
                    self.emit(DriverEvent::StateChanged {
                        session: id,
                        from,
                        to,
                    });
                }
                SessionEvent::Established => {
                    established = true;
                    self.ctx.info(&format!("session {id} established with {peer_name}"));
                    self.emit(DriverEvent::Established {
                        session: id,
                        peer: peer_name.clone(),
                    });
                }
                SessionEvent::ClockSynchronized(estimate) => {
                    self.emit(DriverEvent::ClockSynchronized {
                        session: id,
                        estimate,
                    });
                }
                SessionEvent::ClockDegraded => {
                    self.emit(DriverEvent::ClockDegraded { session: id });
                }
                SessionEvent::Midi {
                    timestamp,
                    commands,
                } => deliveries.push((id, timestamp, commands)),
                SessionEvent::SequenceGap(gap) => {
                    self.emit(DriverEvent::SequenceGap { session: id, gap });
                }
                SessionEvent::Closed(reason) => closed = Some(reason),
            }
        }

        match closed {
            Some(reason) => self.remove_session(id, reason, &peer_name),
            None => {
                self.sync_timer(id, shared);
                if established && self.queue.pending(id) > 0 {
                    self.arm_flush(shared, Instant::now());
                }
            }
        }
        deliveries
    }

    fn remove_session(&mut self, id: SessionId, reason: CloseReason, peer_name: &str) {
        if let Some(timer) = self.timers.remove(&id) {
            self.handle.cancel_timer(timer);
        }
        let leftovers = self.queue.close(id);
        if !leftovers.is_empty() {
            warn!(session = %id, count = leftovers.len(), "session closed with queued messages");
        }
        self.sessions.remove(id);
        if let Some(err) = reason.to_error(peer_name) {
            self.ctx.report(&err);
        }
        info!(session = %id, peer = %peer_name, %reason, "session closed");
        self.emit(DriverEvent::SessionClosed {
            session: id,
            reason,
        });
        self.detach_if_done();
    }

    /// Keep one loop timer per session at its next deadline
    fn sync_timer(&mut self, id: SessionId, shared: &Rc<Shared>) {
        let deadline = self.sessions.get(id).and_then(Session::next_deadline);
        let Some(deadline) = deadline else {
            if let Some(timer) = self.timers.remove(&id) {
                self.handle.cancel_timer(timer);
            }
            return;
        };
        if let Some(timer) = self.timers.get(&id) {
            if self.handle.rearm(*timer, deadline) {
                return;
            }
        }
        let weak = Rc::downgrade(shared);
        let timer = self
            .handle
            .add_timer(deadline, move |_, _| Shared::on_session_timer(&weak, id));
        self.timers.insert(id, timer);
    }

    fn arm_flush(&mut self, shared: &Rc<Shared>, now: Instant) {
        if self.flush_timer.is_some() {
            return;
        }
        let weak = Rc::downgrade(shared);
        let timer = self.handle.add_timer(
            now + self.ctx.config().flush_interval,
            move |handle, timer| Shared::on_flush(&weak, handle, timer),
        );
        self.flush_timer = Some(timer);
    }

    fn is_established(&self, id: SessionId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.state() == SessionState::Established)
    }

    fn has_sendable(&self) -> bool {
        self.queue
            .sessions_with_pending()
            .into_iter()
            .any(|id| self.is_established(id))
    }

    /// Send one paced packet for every established session with pending
    /// messages. Returns the sessions that sent.
    fn flush(&mut self, now: Instant) -> Vec<SessionId> {
        let mut flushed = Vec::new();
        for id in self.queue.sessions_with_pending() {
            if !self.is_established(id) {
                continue;
            }
            let batch = self.queue.drain_tick(id);
            if let Some(late) = batch.iter().filter_map(|queued| queued.lateness(now)).max() {
                debug!(
                    session = %id,
                    late_us = u64::try_from(late.as_micros()).unwrap_or(u64::MAX),
                    "sent past latency budget"
                );
            }
            let (timestamp, commands) = queue::timed_commands(&batch, &self.clock);
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            if let Err(e) = session.send_midi(timestamp, &commands) {
                self.ctx.report(&e);
            }
            flushed.push(id);
        }
        flushed
    }

    /// Release the sockets and timers once a shut down driver has no
    /// sessions left
    fn detach_if_done(&mut self) {
        if self.shut_down && self.sessions.is_empty() {
            self.detach();
        }
    }

    fn detach(&mut self) {
        for id in self.registrations.drain(..) {
            self.handle.remove_socket(id);
        }
        for (_, timer) in self.timers.drain() {
            self.handle.cancel_timer(timer);
        }
        if let Some(timer) = self.flush_timer.take() {
            self.handle.cancel_timer(timer);
        }
    }
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        self.detach();
    }
}
