use super::*;
use std::time::{Duration, Instant};

// ===== Clock =====

#[test]
fn test_tick_conversions() {
    assert_eq!(duration_to_ticks(Duration::from_secs(1)), TICKS_PER_SECOND);
    assert_eq!(duration_to_ticks(Duration::from_micros(250)), 2);
    assert_eq!(ticks_to_duration(15), Duration::from_micros(1500));
}

#[test]
fn test_clock_ticks_from_origin() {
    let origin = Instant::now();
    let clock = Clock::with_origin(origin, 1_000);

    assert_eq!(clock.ticks_at(origin), 1_000);
    assert_eq!(clock.ticks_at(origin + Duration::from_millis(10)), 1_100);
    assert_eq!(clock.instant_at(1_100), origin + Duration::from_millis(10));
}

#[test]
fn test_clock_is_monotonic() {
    let clock = Clock::new();
    let a = clock.now();
    std::thread::sleep(Duration::from_millis(2));
    let b = clock.now();
    assert!(b > a);
}

#[test]
fn test_rtp_timestamp_wraps() {
    let origin = Instant::now();
    let clock = Clock::with_origin(origin, u64::from(u32::MAX));
    assert_eq!(clock.rtp_timestamp(origin), u32::MAX);
    assert_eq!(clock.rtp_timestamp(origin + Duration::from_micros(100)), 0);
}

// ===== Estimates =====

#[test]
fn test_estimate_recovers_delay_and_skew() {
    let delay = 50;
    let skew = 5_000;
    let t1 = 1_000;
    let t2 = t1 + delay + skew;
    let t3 = t1 + 2 * delay;

    let initiator = ClockEstimate::for_initiator(t1, t2, t3);
    assert_eq!(initiator.latency, 50);
    assert_eq!(initiator.offset, 5_000);

    let responder = ClockEstimate::for_responder(t1, t2, t3);
    assert_eq!(responder.latency, 50);
    assert_eq!(responder.offset, -5_000);
}

#[test]
fn test_estimate_negative_skew() {
    // Peer clock is behind ours
    let t1 = 90_000;
    let t2 = 10_030;
    let t3 = 90_060;

    let estimate = ClockEstimate::for_initiator(t1, t2, t3);
    assert_eq!(estimate.latency, 30);
    assert_eq!(estimate.offset, -80_000);
    assert_eq!(estimate.peer_to_local(10_030), 90_030);
}

// ===== Exchange =====

#[test]
fn test_full_exchange_between_two_estimators() {
    let mut initiator = ClockSync::new();
    let mut responder = ClockSync::new();
    assert_eq!(initiator.status(), SyncStatus::Unsynchronized);

    // Responder clock runs 7000 ticks ahead, one-way delay 20 ticks
    let ck0 = initiator.begin(100);
    assert!(initiator.is_pending());

    let SyncStep::Reply { count, timestamps } = responder.on_message(0, ck0, 7_120).unwrap()
    else {
        panic!("expected CK1 reply");
    };
    assert_eq!(count, 1);
    assert_eq!(timestamps, [100, 7_120, 0]);

    let SyncStep::Complete { estimate, reply } =
        initiator.on_message(1, timestamps, 140).unwrap()
    else {
        panic!("expected completion");
    };
    assert_eq!(estimate.latency, 20);
    assert_eq!(estimate.offset, 7_000);
    assert!(initiator.is_synchronized());
    assert!(!initiator.is_pending());

    let ck2 = reply.unwrap();
    let SyncStep::Complete { estimate, reply } = responder.on_message(2, ck2, 7_160).unwrap()
    else {
        panic!("expected completion");
    };
    assert!(reply.is_none());
    assert_eq!(estimate.offset, -7_000);
    assert!(responder.is_synchronized());
    assert_eq!(responder.rounds(), 1);
}

#[test]
fn test_stale_ck1_is_rejected() {
    let mut sync = ClockSync::new();
    sync.begin(500);

    let result = sync.on_message(1, [400, 900, 0], 600);
    assert!(result.is_err());
    assert!(sync.is_pending());
    assert!(!sync.is_synchronized());
}

#[test]
fn test_ck2_without_answered_ck0_is_rejected() {
    let mut sync = ClockSync::new();
    sync.begin(500);

    assert!(sync.on_message(2, [999_999, 5, 7], 600).is_err());
    assert!(!sync.is_synchronized());
    assert!(sync.estimate().is_none());
    assert_eq!(sync.rounds(), 0);
}

#[test]
fn test_ck2_must_match_answered_timestamps() {
    let mut responder = ClockSync::new();
    responder.on_message(0, [100, 0, 0], 7_120).unwrap();

    assert!(responder.on_message(2, [100, 9_999, 140], 7_160).is_err());
    assert!(responder.on_message(2, [101, 7_120, 140], 7_160).is_err());
    assert!(!responder.is_synchronized());

    responder.on_message(2, [100, 7_120, 140], 7_160).unwrap();
    assert!(responder.is_synchronized());

    // A repeated CK2 closes nothing
    assert!(responder.on_message(2, [100, 7_120, 140], 7_170).is_err());
    assert_eq!(responder.rounds(), 1);
}

#[test]
fn test_unknown_count_is_violation() {
    let mut sync = ClockSync::new();
    let err = sync.on_message(3, [0; 3], 0).unwrap_err();
    assert!(err.is_recoverable());
}

#[test]
fn test_failures_and_degrade() {
    let mut sync = ClockSync::new();
    sync.begin(0);
    sync.on_message(1, [0, 10, 0], 20).unwrap();
    assert!(sync.is_synchronized());

    sync.begin(1_000);
    assert_eq!(sync.record_failure(), 1);
    sync.begin(2_000);
    assert_eq!(sync.record_failure(), 2);

    sync.degrade();
    assert_eq!(sync.status(), SyncStatus::Unsynchronized);
    // Last estimate survives as an approximation
    assert!(sync.estimate().is_some());
}
