//! Self-activating polling backstop for a degraded realtime channel.
//!
//! The scheduler is a plain state machine driven by explicit `now` values;
//! the session owns the timer task that feeds it ticks.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Hidden,
    RealtimeLive,
    InFlight,
    NotDue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Poll,
    Skip(SkipReason),
}

#[derive(Debug, Clone)]
pub struct PollScheduler {
    stale_after: Duration,
    floor: Duration,
    ceiling: Duration,
    backoff: f64,
    state: PollState,
    interval: Duration,
    next_due: Option<Instant>,
    in_flight: bool,
    visible: bool,
}

impl PollScheduler {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            stale_after: settings.realtime_stale_after,
            floor: settings.poll_floor,
            ceiling: settings.poll_ceiling,
            backoff: settings.poll_backoff,
            state: PollState::Idle,
            interval: settings.poll_floor,
            next_due: None,
            in_flight: false,
            visible: true,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Current cadence while polling.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    fn is_stale(&self, now: Instant, last_event: Option<Instant>) -> bool {
        last_event.map_or(true, |at| now.saturating_duration_since(at) > self.stale_after)
    }

    /// One scheduler step. A `Poll` decision marks a request outstanding
    /// until [`PollScheduler::finish`] is called.
    pub fn tick(&mut self, now: Instant, last_event: Option<Instant>) -> PollDecision {
        if !self.visible {
            return PollDecision::Skip(SkipReason::Hidden);
        }
        if !self.is_stale(now, last_event) {
            if self.state == PollState::Polling {
                info!("poll: realtime live again, polling stopped");
                self.state = PollState::Idle;
                self.interval = self.floor;
                self.next_due = None;
            }
            return PollDecision::Skip(SkipReason::RealtimeLive);
        }
        if self.state == PollState::Idle {
            info!(
                interval_ms = self.floor.as_millis() as u64,
                "poll: realtime stale, polling started"
            );
            self.state = PollState::Polling;
            self.interval = self.floor;
            self.next_due = Some(now + self.floor);
        }
        if self.in_flight {
            return PollDecision::Skip(SkipReason::InFlight);
        }
        if self.next_due.is_some_and(|due| now < due) {
            return PollDecision::Skip(SkipReason::NotDue);
        }
        self.in_flight = true;
        PollDecision::Poll
    }

    /// Completes the outstanding poll. Finding new messages resets the
    /// cadence to the floor; otherwise it backs off up to the ceiling. A
    /// failed request counts as finding nothing.
    pub fn finish(&mut self, now: Instant, discovered: bool) {
        self.in_flight = false;
        self.interval = if discovered {
            self.floor
        } else {
            self.interval.mul_f64(self.backoff).min(self.ceiling)
        };
        if self.state == PollState::Polling {
            self.next_due = Some(now + self.interval);
        }
        debug!(
            discovered,
            interval_ms = self.interval.as_millis() as u64,
            "poll: cycle finished"
        );
    }

    /// Records visibility. Regaining visibility with stale liveness asks for
    /// an immediate one-shot poll.
    pub fn set_visible(
        &mut self,
        visible: bool,
        now: Instant,
        last_event: Option<Instant>,
    ) -> PollDecision {
        let was_visible = std::mem::replace(&mut self.visible, visible);
        if !visible {
            return PollDecision::Skip(SkipReason::Hidden);
        }
        if was_visible {
            return PollDecision::Skip(SkipReason::NotDue);
        }
        if !self.is_stale(now, last_event) {
            return PollDecision::Skip(SkipReason::RealtimeLive);
        }
        if self.in_flight {
            return PollDecision::Skip(SkipReason::InFlight);
        }
        self.state = PollState::Polling;
        self.in_flight = true;
        PollDecision::Poll
    }

    /// Back to idle at the floor cadence, e.g. after switching task.
    pub fn reset(&mut self) {
        self.state = PollState::Idle;
        self.interval = self.floor;
        self.next_due = None;
        self.in_flight = false;
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
