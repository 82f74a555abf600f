//! Two drivers talking over loopback UDP on one run loop

use std::rc::Rc;
use std::time::{Duration, Instant};

use midikit::error::{ErrorKind, HandshakeStage};
use midikit::testing::{RecordingSink, fast_config};
use midikit::{
    CloseReason, Context, Driver, DriverConfig, DriverEvent, MidiMessage, RunLoop, SessionId,
    SessionState,
};
use tokio::sync::broadcast;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(name: &str, ssrc: u32) -> DriverConfig {
    let mut config = fast_config(name);
    config.bind_address = "127.0.0.1".parse().unwrap();
    config.control_port = 0;
    config.ssrc = Some(ssrc);
    config
}

fn bind(run_loop: &RunLoop, config: DriverConfig) -> Driver {
    init_tracing();
    Driver::bind(Rc::new(Context::new(config)), run_loop).unwrap()
}

fn run_until(run_loop: &RunLoop, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if done() {
            return true;
        }
        run_loop.run_once(Some(Duration::from_millis(10)));
    }
    done()
}

fn drain(rx: &mut broadcast::Receiver<DriverEvent>) -> Vec<DriverEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn only_session(driver: &Driver) -> Option<SessionId> {
    match driver.sessions().as_slice() {
        [id] => Some(*id),
        _ => None,
    }
}

/// Connect `from` to `to` and wait until both sides are established
fn establish(run_loop: &RunLoop, from: &Driver, to: &Driver) -> (SessionId, SessionId) {
    let initiator = from.connect(to.local_addr().unwrap()).unwrap();
    let settled = run_until(run_loop, || {
        let responder = to
            .sessions()
            .into_iter()
            .find(|id| to.session_peer(*id).and_then(|p| p.ssrc) == Some(from.ssrc()));
        from.session_state(initiator) == Some(SessionState::Established)
            && responder.and_then(|id| to.session_state(id)) == Some(SessionState::Established)
    });
    assert!(settled, "handshake did not complete");

    let responder = to
        .sessions()
        .into_iter()
        .find(|id| to.session_peer(*id).and_then(|p| p.ssrc) == Some(from.ssrc()))
        .unwrap();
    (initiator, responder)
}

#[test]
fn test_handshake_over_loopback() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let beta = bind(&run_loop, config("beta", 0xB2));
    let mut alpha_events = alpha.subscribe();
    let mut beta_events = beta.subscribe();

    let (initiator, responder) = establish(&run_loop, &alpha, &beta);

    let peer = alpha.session_peer(initiator).unwrap();
    assert_eq!(peer.name.as_deref(), Some("beta"));
    assert_eq!(peer.ssrc, Some(0xB2));
    assert_eq!(beta.session_peer(responder).unwrap().name.as_deref(), Some("alpha"));
    assert!(alpha.clock_estimate(initiator).is_some());

    let events = drain(&mut alpha_events);
    assert!(matches!(
        events.first(),
        Some(DriverEvent::SessionStarted { session, .. }) if *session == initiator
    ));
    assert!(events.iter().any(|e| matches!(e, DriverEvent::ClockSynchronized { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        DriverEvent::Established { peer, .. } if peer == "beta"
    )));

    let events = drain(&mut beta_events);
    assert!(events.iter().any(|e| matches!(e, DriverEvent::Established { .. })));
}

#[test]
fn test_midi_delivered_in_order() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let beta = bind(&run_loop, config("beta", 0xB2));
    let sink = RecordingSink::new();
    beta.set_sink(sink.clone());

    let (initiator, responder) = establish(&run_loop, &alpha, &beta);

    let notes: Vec<_> = (0..20u8).map(|i| MidiMessage::note_on(0, 40 + i, 100)).collect();
    for note in &notes {
        alpha.enqueue(initiator, note.clone()).unwrap();
    }
    assert!(run_until(&run_loop, || sink.len() == notes.len()));

    let received = sink.received();
    assert!(received.iter().all(|(session, _)| *session == responder));
    let messages: Vec<_> = received.into_iter().map(|(_, c)| c.message).collect();
    assert_eq!(messages, notes);

    assert_eq!(alpha.pending(initiator), 0);
    assert_eq!(alpha.session_stats(initiator).unwrap().commands_sent, 20);
    assert_eq!(beta.session_stats(responder).unwrap().commands_received, 20);
}

#[test]
fn test_midi_flows_both_ways() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let beta = bind(&run_loop, config("beta", 0xB2));
    let alpha_sink = RecordingSink::new();
    let beta_sink = RecordingSink::new();
    alpha.set_sink(alpha_sink.clone());
    beta.set_sink(beta_sink.clone());

    let (initiator, responder) = establish(&run_loop, &alpha, &beta);

    alpha
        .enqueue(initiator, MidiMessage::control_change(1, 7, 90))
        .unwrap();
    beta.enqueue(responder, MidiMessage::program_change(2, 12))
        .unwrap();
    assert!(run_until(&run_loop, || alpha_sink.len() == 1 && beta_sink.len() == 1));

    assert_eq!(
        alpha_sink.received()[0].1.message,
        MidiMessage::program_change(2, 12)
    );
    assert_eq!(
        beta_sink.received()[0].1.message,
        MidiMessage::control_change(1, 7, 90)
    );
}

#[test]
fn test_closure_sink() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let beta = bind(&run_loop, config("beta", 0xB2));
    let seen = Rc::new(std::cell::Cell::new(0usize));
    {
        let seen = Rc::clone(&seen);
        beta.set_sink(
            move |_: SessionId, _: u32, commands: &[midikit::TimedCommand]| {
                seen.set(seen.get() + commands.len());
            },
        );
    }

    let (initiator, _) = establish(&run_loop, &alpha, &beta);
    alpha
        .enqueue(initiator, MidiMessage::real_time(0xF8).unwrap())
        .unwrap();
    assert!(run_until(&run_loop, || seen.get() == 1));
}

#[test]
fn test_broadcast_reaches_every_session() {
    let run_loop = RunLoop::new().unwrap();
    let hub = bind(&run_loop, config("hub", 0x01));
    let left = bind(&run_loop, config("left", 0x02));
    let right = bind(&run_loop, config("right", 0x03));
    let left_sink = RecordingSink::new();
    let right_sink = RecordingSink::new();
    left.set_sink(left_sink.clone());
    right.set_sink(right_sink.clone());

    establish(&run_loop, &hub, &left);
    establish(&run_loop, &hub, &right);

    let start = MidiMessage::real_time(0xFA).unwrap();
    assert_eq!(hub.broadcast(&start).unwrap(), 2);
    assert!(run_until(&run_loop, || left_sink.len() == 1 && right_sink.len() == 1));
}

#[test]
fn test_end_closes_both_sides() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let beta = bind(&run_loop, config("beta", 0xB2));
    let mut alpha_events = alpha.subscribe();
    let mut beta_events = beta.subscribe();

    let (initiator, responder) = establish(&run_loop, &alpha, &beta);
    alpha.end(initiator).unwrap();
    assert_eq!(alpha.session_state(initiator), Some(SessionState::Ending));

    assert!(run_until(&run_loop, || alpha.sessions().is_empty()
        && beta.sessions().is_empty()));

    assert!(drain(&mut alpha_events).contains(&DriverEvent::SessionClosed {
        session: initiator,
        reason: CloseReason::Ended,
    }));
    assert!(drain(&mut beta_events).contains(&DriverEvent::SessionClosed {
        session: responder,
        reason: CloseReason::PeerBye,
    }));
    assert!(alpha.enqueue(initiator, MidiMessage::note_off(0, 60, 0)).is_err());
}

#[test]
fn test_refused_invitation_closes_initiator() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let mut closed = config("closed", 0xB2);
    closed.accept_invitations = false;
    let beta = bind(&run_loop, closed);
    let mut events = alpha.subscribe();

    let id = alpha.connect(beta.local_addr().unwrap()).unwrap();
    assert!(run_until(&run_loop, || alpha.sessions().is_empty()));

    assert!(drain(&mut events).contains(&DriverEvent::SessionClosed {
        session: id,
        reason: CloseReason::Rejected,
    }));
    assert_eq!(alpha.context().last_error(), Some(ErrorKind::Rejected));
    assert!(beta.sessions().is_empty());
}

#[test]
fn test_silent_peer_times_out() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut events = alpha.subscribe();

    let id = alpha.connect(silent.local_addr().unwrap()).unwrap();
    assert!(run_until(&run_loop, || alpha.sessions().is_empty()));

    let reason = drain(&mut events).into_iter().find_map(|event| match event {
        DriverEvent::SessionClosed { session, reason } if session == id => Some(reason),
        _ => None,
    });
    assert!(matches!(
        reason,
        Some(CloseReason::HandshakeTimeout {
            stage: HandshakeStage::ControlInvitation,
            attempts: 4
        })
    ));
    assert_eq!(alpha.context().last_error(), Some(ErrorKind::HandshakeTimeout));
}

#[test]
fn test_shutdown_ends_sessions_and_releases_sockets() {
    let run_loop = RunLoop::new().unwrap();
    let alpha = bind(&run_loop, config("alpha", 0xA1));
    let beta = bind(&run_loop, config("beta", 0xB2));
    establish(&run_loop, &alpha, &beta);

    assert_eq!(run_loop.handle().socket_count(), 4);
    alpha.shutdown();
    assert!(run_until(&run_loop, || alpha.sessions().is_empty()
        && beta.sessions().is_empty()));
    assert_eq!(run_loop.handle().socket_count(), 2);
    assert!(only_session(&beta).is_none());
}
