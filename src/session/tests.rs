use super::*;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SyncStatus};
use crate::context::Context;
use crate::error::{ErrorKind, HandshakeStage};
use crate::midi::MidiMessage;
use crate::protocol::applemidi::{ClockSyncPacket, Command, ControlPacket, Exchange};
use crate::protocol::rtp::{GapInfo, RtpMidiCodec, RtpMidiPacket, TimedCommand};
use crate::midi::StandardFormat;
use crate::testing::{INITIATOR_ADDR, RESPONDER_ADDR, SessionPair, Side, fast_config};
use crate::types::{Port, SessionId};

const TOKEN: u32 = 0xA5A5_0001;
const PEER_SSRC: u32 = 0x2222_2222;

fn initiator(now: Instant) -> Session {
    Session::initiator(
        SessionId(1),
        Rc::new(Context::new(fast_config("solo"))),
        Clock::with_origin(now, 0),
        0x1111_1111,
        TOKEN,
        RESPONDER_ADDR,
    )
}

fn responder(now: Instant) -> Session {
    Session::responder(
        SessionId(2),
        Rc::new(Context::new(fast_config("solo"))),
        Clock::with_origin(now, 0),
        PEER_SSRC,
        INITIATOR_ADDR,
    )
}

fn drain(session: &mut Session) -> Vec<Transmit> {
    std::iter::from_fn(|| session.poll_transmit()).collect()
}

fn control(transmit: &Transmit) -> ControlPacket {
    ControlPacket::decode(&transmit.payload).unwrap()
}

fn is_clock_sync(transmit: &Transmit) -> bool {
    transmit.payload.len() > 4 && &transmit.payload[2..4] == b"CK"
}

fn notes(count: u8) -> Vec<TimedCommand> {
    (0..count)
        .map(|i| TimedCommand::new(u32::from(i), MidiMessage::note_on(0, 60 + i, 100)))
        .collect()
}

// ===== State transitions =====

#[test]
fn test_state_transitions() {
    use SessionState::*;

    assert!(Idle.can_transition_to(Inviting));
    assert!(Inviting.can_transition_to(Invited));
    assert!(Invited.can_transition_to(SyncPending));
    assert!(Listening.can_transition_to(AcceptingInvite));
    assert!(AcceptingInvite.can_transition_to(SyncPending));
    assert!(SyncPending.can_transition_to(Established));
    assert!(Established.can_transition_to(Ending));
    assert!(Ending.can_transition_to(Closed));

    assert!(!Closed.can_transition_to(Established));
    assert!(!Idle.can_transition_to(Established));
    assert!(!Listening.can_transition_to(Invited));
    assert!(!Ending.can_transition_to(Established));
}

// ===== Handshake =====

#[test]
fn test_handshake_establishes_both_sides() {
    let mut pair = SessionPair::new();
    pair.handshake();

    assert!(pair.is_established());
    assert!(pair.errors().is_empty());
    assert_eq!(pair.initiator.peer().ssrc, Some(PEER_SSRC));
    assert_eq!(pair.responder.peer().ssrc, Some(0x1111_1111));
    assert_eq!(pair.initiator.peer().name.as_deref(), Some("responder"));
    assert_eq!(pair.responder.peer().name.as_deref(), Some("initiator"));
    assert!(pair.events(Side::Initiator).contains(&SessionEvent::Established));
    assert!(pair.events(Side::Responder).contains(&SessionEvent::Established));
}

#[test]
fn test_handshake_state_sequence() {
    let mut pair = SessionPair::new();
    pair.handshake();

    let states: Vec<_> = pair
        .events(Side::Initiator)
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Inviting,
            SessionState::Invited,
            SessionState::SyncPending,
            SessionState::Established,
        ]
    );

    let states: Vec<_> = pair
        .events(Side::Responder)
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::AcceptingInvite,
            SessionState::SyncPending,
            SessionState::Established,
        ]
    );
}

#[test]
fn test_handshake_measures_clock_offset() {
    let mut pair = SessionPair::new();
    pair.handshake();

    // The responder clock runs 10_000 ticks ahead, delivery is instant
    let estimate = pair.initiator.clock_estimate().unwrap();
    assert_eq!(estimate.offset, 10_000);
    assert_eq!(estimate.latency, 0);
    assert_eq!(pair.initiator.sync_status(), SyncStatus::Synchronized);

    let estimate = pair.responder.clock_estimate().unwrap();
    assert_eq!(estimate.offset, -10_000);
    assert_eq!(pair.responder.sync_status(), SyncStatus::Synchronized);
}

#[test]
fn test_invite_uses_both_ports_with_same_token() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();

    let sent = drain(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port, Port::Control);
    assert_eq!(sent[0].destination, RESPONDER_ADDR);
    let ControlPacket::Invitation(invitation) = control(&sent[0]) else {
        panic!("expected invitation");
    };
    assert_eq!(invitation.token, TOKEN);
    assert_eq!(invitation.name.as_deref(), Some("solo"));

    let accept = Exchange::new(TOKEN, PEER_SSRC, Some("peer".into()));
    session
        .handle_control(Port::Control, ControlPacket::Accepted(accept), RESPONDER_ADDR, now)
        .unwrap();
    assert_eq!(session.state(), SessionState::Invited);

    let sent = drain(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].port, Port::Data);
    assert_eq!(sent[0].destination, data_addr_for(RESPONDER_ADDR));
    assert_eq!(control(&sent[0]).command(), Command::Invitation);
}

#[test]
fn test_invite_twice_is_rejected() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();
    let err = session.invite(now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_reject_with_matching_token_closes() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();

    let reject = Exchange::new(TOKEN, PEER_SSRC, None);
    session
        .handle_control(Port::Control, ControlPacket::Rejected(reject), RESPONDER_ADDR, now)
        .unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.close_reason(), Some(&CloseReason::Rejected));
    assert_eq!(session.next_deadline(), None);
}

#[test]
fn test_reject_with_other_token_is_ignored() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();

    let reject = Exchange::new(TOKEN + 1, PEER_SSRC, None);
    session
        .handle_control(Port::Control, ControlPacket::Rejected(reject), RESPONDER_ADDR, now)
        .unwrap();

    assert_eq!(session.state(), SessionState::Inviting);
    assert!(session.next_deadline().is_some());
}

#[test]
fn test_accept_with_other_token_is_ignored() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();

    let accept = Exchange::new(TOKEN ^ 0xFFFF, PEER_SSRC, None);
    session
        .handle_control(Port::Control, ControlPacket::Accepted(accept), RESPONDER_ADDR, now)
        .unwrap();

    assert_eq!(session.state(), SessionState::Inviting);
    assert_eq!(session.peer().ssrc, None);
}

#[test]
fn test_invitation_backoff() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();

    assert_eq!(session.next_deadline(), Some(now + Duration::from_millis(100)));
    session.on_timeout(now + Duration::from_millis(100));
    assert_eq!(session.next_deadline(), Some(now + Duration::from_millis(300)));
    session.on_timeout(now + Duration::from_millis(300));
    assert_eq!(session.next_deadline(), Some(now + Duration::from_millis(700)));
    session.on_timeout(now + Duration::from_millis(700));
    // Capped at 400ms
    assert_eq!(session.next_deadline(), Some(now + Duration::from_millis(1100)));
}

#[test]
fn test_invitation_retry_exhaustion() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.invite(now).unwrap();

    while let Some(deadline) = session.next_deadline() {
        session.on_timeout(deadline);
    }

    let invitations = drain(&mut session)
        .iter()
        .filter(|t| control(t).command() == Command::Invitation)
        .count();
    assert_eq!(invitations, 4);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        session.close_reason(),
        Some(&CloseReason::HandshakeTimeout {
            stage: HandshakeStage::ControlInvitation,
            attempts: 4,
        })
    );

    let err = session.close_reason().unwrap().to_error("peer").unwrap();
    assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
}

#[test]
fn test_data_invitation_retry_exhaustion() {
    let mut pair = SessionPair::new();
    pair.set_filter(|side, transmit| !(side == Side::Initiator && transmit.port == Port::Data));
    pair.handshake();
    assert_eq!(pair.initiator.state(), SessionState::Invited);

    pair.run_for(Duration::from_secs(2), Duration::from_millis(50));

    assert_eq!(
        pair.initiator.close_reason(),
        Some(&CloseReason::HandshakeTimeout {
            stage: HandshakeStage::DataInvitation,
            attempts: 4,
        })
    );
    // The responder gives up waiting for the data port
    assert_eq!(
        pair.responder.close_reason(),
        Some(&CloseReason::HandshakeTimeout {
            stage: HandshakeStage::PeerSetup,
            attempts: 1,
        })
    );
}

#[test]
fn test_clock_sync_timeout_closes() {
    let mut pair = SessionPair::new();
    pair.set_filter(|side, transmit| !(side == Side::Responder && is_clock_sync(transmit)));
    pair.handshake();
    assert_eq!(pair.initiator.state(), SessionState::SyncPending);

    pair.run_for(Duration::from_millis(400), Duration::from_millis(50));

    assert_eq!(
        pair.initiator.close_reason(),
        Some(&CloseReason::HandshakeTimeout {
            stage: HandshakeStage::ClockSync,
            attempts: 3,
        })
    );
}

#[test]
fn test_lost_ck2_recovered_by_first_data_packet() {
    let mut pair = SessionPair::new();
    // CK2: count byte follows signature, command and SSRC
    pair.set_filter(|side, transmit| {
        !(side == Side::Initiator && is_clock_sync(transmit) && transmit.payload[8] == 2)
    });
    pair.handshake();
    assert_eq!(pair.initiator.state(), SessionState::Established);
    assert_eq!(pair.responder.state(), SessionState::SyncPending);

    pair.initiator.send_midi(0, &notes(1)).unwrap();
    pair.pump();

    assert!(pair.is_established());
    assert_eq!(pair.received_midi(Side::Responder), notes(1));
}

fn stray_ck2(ssrc: u32) -> ControlPacket {
    ControlPacket::ClockSync(ClockSyncPacket {
        ssrc,
        count: 2,
        timestamps: [999_999, 5, 7],
    })
}

#[test]
fn test_stray_ck2_does_not_establish_initiator() {
    let mut pair = SessionPair::new();
    pair.set_filter(|side, transmit| !(side == Side::Responder && is_clock_sync(transmit)));
    pair.handshake();
    assert_eq!(pair.initiator.state(), SessionState::SyncPending);

    let from = data_addr_for(RESPONDER_ADDR);
    let now = pair.now();
    let packet = stray_ck2(pair.responder.local_ssrc());
    let err = pair
        .initiator
        .handle_control(Port::Data, packet, from, now)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(pair.initiator.state(), SessionState::SyncPending);
    assert_eq!(pair.initiator.sync_status(), SyncStatus::Unsynchronized);
    assert!(pair.initiator.clock_estimate().is_none());
}

#[test]
fn test_stray_ck2_does_not_establish_responder() {
    let mut pair = SessionPair::new();
    pair.set_filter(|side, transmit| {
        !(side == Side::Initiator && is_clock_sync(transmit) && transmit.payload[8] == 2)
    });
    pair.handshake();
    assert_eq!(pair.responder.state(), SessionState::SyncPending);

    let from = data_addr_for(INITIATOR_ADDR);
    let now = pair.now();
    let packet = stray_ck2(pair.initiator.local_ssrc());
    assert!(pair.responder.handle_control(Port::Data, packet, from, now).is_err());

    assert_eq!(pair.responder.state(), SessionState::SyncPending);
    assert!(pair.responder.clock_estimate().is_none());
}

#[test]
fn test_duplicated_packets_are_harmless() {
    let mut pair = SessionPair::new();
    pair.network.duplicate_rate = 1.0;
    pair.handshake();
    assert!(pair.is_established());

    pair.initiator.send_midi(0, &notes(3)).unwrap();
    pair.pump();

    assert_eq!(pair.received_midi(Side::Responder), notes(3));
    assert!(pair.is_established());
    assert_eq!(pair.responder.stats().late_packets, 1);
}

// ===== Responder =====

#[test]
fn test_unsupported_version_is_rejected() {
    let now = Instant::now();
    let mut session = responder(now);
    let mut invitation = Exchange::new(TOKEN, 0x1111_1111, None);
    invitation.version = 1;

    let err = session
        .handle_control(Port::Control, ControlPacket::Invitation(invitation), INITIATOR_ADDR, now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(session.state(), SessionState::Listening);

    let sent = drain(&mut session);
    assert_eq!(sent.len(), 1);
    assert_eq!(control(&sent[0]).command(), Command::Rejected);
}

#[test]
fn test_repeated_invitation_is_acknowledged_again() {
    let mut pair = SessionPair::new();
    pair.handshake();
    drain(&mut pair.responder);

    let invitation = Exchange::new(TOKEN, 0x1111_1111, Some("initiator".into()));
    let now = pair.now();
    pair.responder
        .handle_control(Port::Control, ControlPacket::Invitation(invitation), INITIATOR_ADDR, now)
        .unwrap();

    let sent = drain(&mut pair.responder);
    assert_eq!(sent.len(), 1);
    assert_eq!(control(&sent[0]).command(), Command::Accepted);
    assert_eq!(pair.responder.state(), SessionState::Established);
}

#[test]
fn test_responder_handshake_timeout() {
    let now = Instant::now();
    let mut session = responder(now);
    let invitation = Exchange::new(TOKEN, 0x1111_1111, None);
    session
        .handle_control(Port::Control, ControlPacket::Invitation(invitation), INITIATOR_ADDR, now)
        .unwrap();
    assert_eq!(session.state(), SessionState::AcceptingInvite);

    session.on_timeout(now + Duration::from_secs(2));
    assert_eq!(
        session.close_reason(),
        Some(&CloseReason::HandshakeTimeout {
            stage: HandshakeStage::PeerSetup,
            attempts: 1,
        })
    );
}

// ===== Data =====

#[test]
fn test_midi_round_trip() {
    let mut pair = SessionPair::new();
    pair.handshake();

    let commands = vec![
        TimedCommand::new(0, MidiMessage::note_on(2, 64, 90)),
        TimedCommand::new(12, MidiMessage::system_exclusive(&[0x7E, 0x00, 0x09, 0x01])),
        TimedCommand::new(3, MidiMessage::note_off(2, 64, 0)),
    ];
    pair.initiator.send_midi(1234, &commands).unwrap();
    pair.responder.send_midi(99, &notes(2)).unwrap();
    pair.pump();

    assert_eq!(pair.received_midi(Side::Responder), commands);
    assert_eq!(pair.received_midi(Side::Initiator), notes(2));
    assert_eq!(pair.initiator.next_sequence(), 101);
    assert_eq!(pair.responder.stats().commands_received, 3);
    assert_eq!(pair.initiator.stats().packets_sent, 1);
}

#[test]
fn test_send_before_established_fails() {
    let now = Instant::now();
    let mut session = initiator(now);
    let err = session.send_midi(0, &notes(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(session.stats().packets_sent, 0);
}

#[test]
fn test_gap_tolerance() {
    let mut pair = SessionPair::new();
    pair.handshake();
    let now = pair.now();

    let mut peer = RtpMidiCodec::new(0x1111_1111, 5);
    let packets: Vec<_> = (0..4)
        .map(|i| peer.encode(&notes(1), i, None).unwrap())
        .collect();

    // Sequence 5, 6, 8: packet 7 is lost
    pair.responder.handle_data(&packets[0], now).unwrap();
    pair.responder.handle_data(&packets[1], now).unwrap();
    pair.responder.handle_data(&packets[3], now).unwrap();
    pair.pump();

    assert_eq!(pair.responder.state(), SessionState::Established);
    assert_eq!(pair.received_midi(Side::Responder).len(), 3);
    assert!(
        pair.events(Side::Responder)
            .contains(&SessionEvent::SequenceGap(GapInfo { start: 7, count: 1 }))
    );
    assert_eq!(pair.responder.stats().gaps, 1);
    assert_eq!(pair.responder.stats().packets_lost, 1);

    // The lost packet arriving late is dropped
    let err = pair.responder.handle_data(&packets[2], now).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(pair.responder.state(), SessionState::Established);
}

#[test]
fn test_foreign_ssrc_dropped() {
    let mut pair = SessionPair::new();
    pair.handshake();

    let mut stranger = RtpMidiCodec::new(0xBAD0_BAD0, 1);
    let packet = stranger.encode(&notes(1), 0, None).unwrap();
    let err = pair.responder.handle_data(&packet, pair.now()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(pair.responder.stats().packets_received, 0);
}

#[test]
fn test_malformed_payload_keeps_leading_commands() {
    let mut pair = SessionPair::new();
    pair.handshake();

    let mut packet = crate::protocol::rtp::RtpHeader::new_midi(1, 0, 0x1111_1111)
        .encode()
        .to_vec();
    packet.extend_from_slice(&[0x26, 0x00, 0x90, 60, 100, 0x00, 0xF7]);

    let err = pair.responder.handle_data(&packet, pair.now()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    pair.pump();

    assert_eq!(
        pair.received_midi(Side::Responder),
        vec![TimedCommand::new(0, MidiMessage::note_on(0, 60, 100))]
    );
}

#[test]
fn test_receiver_feedback_and_journal() {
    let mut pair = SessionPair::new();
    pair.handshake();

    pair.initiator.send_midi(0, &notes(1)).unwrap();
    pair.initiator.send_midi(0, &notes(1)).unwrap();
    pair.pump();

    // Responder reports sequence 101 at its next feedback tick
    pair.advance(Duration::from_millis(200));

    pair.initiator.send_midi(0, &notes(1)).unwrap();
    pair.initiator.send_midi(0, &notes(1)).unwrap();
    let sent = drain(&mut pair.initiator);
    assert_eq!(sent.len(), 2);

    let first = RtpMidiPacket::decode(&sent[0].payload, &StandardFormat).unwrap();
    assert_eq!(first.packet.header.sequence, 102);
    assert_eq!(first.packet.journal, None);

    let second = RtpMidiPacket::decode(&sent[1].payload, &StandardFormat).unwrap();
    assert_eq!(second.packet.header.sequence, 103);
    let journal = second.packet.journal.unwrap();
    assert_eq!(journal.checkpoint, 101);
    assert!(journal.single_packet_loss);
}

#[test]
fn test_feedback_only_when_new_packets_arrive() {
    let mut pair = SessionPair::new();
    pair.handshake();
    pair.initiator.send_midi(0, &notes(1)).unwrap();
    pair.pump();

    let mut feedback = 0;
    for i in 1..=3 {
        pair.responder.on_timeout(pair.now() + Duration::from_secs(5 * i));
        feedback += drain(&mut pair.responder)
            .iter()
            .filter(|t| control(t).command() == Command::ReceiverFeedback)
            .count();
    }
    assert_eq!(feedback, 1);
}

// ===== Clock re-synchronization =====

#[test]
fn test_periodic_resync() {
    let mut pair = SessionPair::new();
    pair.handshake();
    assert_eq!(pair.initiator.stats().sync_rounds, 1);

    pair.advance(Duration::from_secs(10));

    assert_eq!(pair.initiator.stats().sync_rounds, 2);
    assert_eq!(pair.responder.stats().sync_rounds, 2);
}

#[test]
fn test_resync_failure_degrades_but_keeps_session() {
    let mut pair = SessionPair::new();
    pair.handshake();
    pair.set_filter(|side, transmit| !(side == Side::Responder && is_clock_sync(transmit)));

    pair.run_for(Duration::from_millis(10_400), Duration::from_millis(50));

    assert!(pair.events(Side::Initiator).contains(&SessionEvent::ClockDegraded));
    assert_eq!(pair.initiator.sync_status(), SyncStatus::Unsynchronized);
    assert_eq!(pair.initiator.state(), SessionState::Established);
    assert!(pair.initiator.clock_estimate().is_some());
}

// ===== Ending =====

#[test]
fn test_end_sends_bye_and_closes() {
    let mut pair = SessionPair::new();
    pair.handshake();

    let now = pair.now();
    pair.initiator.end(now);
    assert_eq!(pair.initiator.state(), SessionState::Ending);
    pair.pump();

    assert_eq!(pair.responder.close_reason(), Some(&CloseReason::PeerBye));
    assert_eq!(pair.initiator.state(), SessionState::Ending);

    pair.advance(Duration::from_millis(60));
    assert_eq!(pair.initiator.close_reason(), Some(&CloseReason::Ended));
    assert_eq!(pair.initiator.next_deadline(), None);
}

#[test]
fn test_end_idle_session_closes_immediately() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.end(now);
    assert!(session.is_closed());
    assert!(drain(&mut session).is_empty());
}

#[test]
fn test_bye_from_foreign_ssrc_is_ignored() {
    let mut pair = SessionPair::new();
    pair.handshake();

    let bye = Exchange::new(TOKEN, 0xDEAD_0000, None);
    let now = pair.now();
    let err = pair
        .responder
        .handle_control(Port::Control, ControlPacket::Bye(bye), INITIATOR_ADDR, now)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(pair.responder.state(), SessionState::Established);
}

#[test]
fn test_closed_session_ignores_packets() {
    let now = Instant::now();
    let mut session = initiator(now);
    session.end(now);

    let accept = Exchange::new(TOKEN, PEER_SSRC, None);
    let err = session
        .handle_control(Port::Control, ControlPacket::Accepted(accept), RESPONDER_ADDR, now)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert!(session.is_closed());
}
