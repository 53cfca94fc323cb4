use super::*;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn scheduler() -> PollScheduler {
    PollScheduler::new(&SyncSettings::default())
}

#[test]
fn never_connected_realtime_enters_polling_on_first_tick() {
    let mut poll = scheduler();
    let t0 = Instant::now();

    assert_eq!(poll.tick(t0, None), PollDecision::Skip(SkipReason::NotDue));
    assert_eq!(poll.state(), PollState::Polling);
    assert_eq!(poll.tick(t0 + secs(4), None), PollDecision::Skip(SkipReason::NotDue));
    assert_eq!(poll.tick(t0 + secs(5), None), PollDecision::Poll);
}

#[test]
fn discovery_keeps_floor_interval() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.tick(t0, None);
    assert_eq!(poll.tick(t0 + secs(5), None), PollDecision::Poll);

    poll.finish(t0 + secs(5), true);

    assert_eq!(poll.interval(), secs(5));
    assert_eq!(poll.tick(t0 + secs(9), None), PollDecision::Skip(SkipReason::NotDue));
    assert_eq!(poll.tick(t0 + secs(10), None), PollDecision::Poll);
}

#[test]
fn empty_cycles_back_off_to_ceiling_and_discovery_resets() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.tick(t0, None);

    let mut intervals = Vec::new();
    for _ in 0..5 {
        poll.finish(t0, false);
        intervals.push(poll.interval().as_millis());
    }
    assert_eq!(intervals, [7_500, 11_250, 15_000, 15_000, 15_000]);

    poll.finish(t0, true);
    assert_eq!(poll.interval(), secs(5));
}

#[test]
fn outstanding_poll_blocks_the_next_one() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.tick(t0, None);
    assert_eq!(poll.tick(t0 + secs(5), None), PollDecision::Poll);
    assert!(poll.is_in_flight());

    assert_eq!(
        poll.tick(t0 + secs(30), None),
        PollDecision::Skip(SkipReason::InFlight)
    );
    poll.finish(t0 + secs(30), false);
    assert!(!poll.is_in_flight());
}

#[test]
fn converges_to_polling_after_silence_and_back_to_idle_after_event() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    let last = Some(t0);

    assert_eq!(
        poll.tick(t0 + secs(10), last),
        PollDecision::Skip(SkipReason::RealtimeLive)
    );
    assert_eq!(poll.state(), PollState::Idle);

    poll.tick(t0 + secs(11), last);
    assert_eq!(poll.state(), PollState::Polling);

    let fresh = Some(t0 + secs(12));
    assert_eq!(
        poll.tick(t0 + secs(13), fresh),
        PollDecision::Skip(SkipReason::RealtimeLive)
    );
    assert_eq!(poll.state(), PollState::Idle);
}

#[test]
fn hidden_view_never_polls() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.set_visible(false, t0, None);

    for n in 0..30 {
        assert_eq!(
            poll.tick(t0 + secs(n), None),
            PollDecision::Skip(SkipReason::Hidden)
        );
    }
}

#[test]
fn regaining_visibility_with_stale_liveness_polls_once() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.set_visible(false, t0, None);

    assert_eq!(poll.set_visible(true, t0 + secs(20), None), PollDecision::Poll);
    assert!(poll.is_in_flight());
    assert_eq!(
        poll.set_visible(true, t0 + secs(21), None),
        PollDecision::Skip(SkipReason::NotDue)
    );
}

#[test]
fn regaining_visibility_while_live_does_not_poll() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.set_visible(false, t0, Some(t0));

    assert_eq!(
        poll.set_visible(true, t0 + secs(2), Some(t0)),
        PollDecision::Skip(SkipReason::RealtimeLive)
    );
}

#[test]
fn reset_returns_to_idle_floor() {
    let mut poll = scheduler();
    let t0 = Instant::now();
    poll.tick(t0, None);
    poll.finish(t0, false);
    poll.reset();

    assert_eq!(poll.state(), PollState::Idle);
    assert_eq!(poll.interval(), secs(5));
    assert!(!poll.is_in_flight());
}
