//! One-shot deadline timers that can be frozen and thawed.
//!
//! Timers hold an absolute [`Instant`]; nothing runs in the background. The
//! owner asks [`DeadlineTimer::is_due`] from its poll loop. Freezing stores
//! `deadline - now`, thawing arms `now + remaining`, so a pause never changes
//! how much of a timeout is left.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TimerState {
    #[default]
    Stopped,
    Armed(Instant),
    Frozen(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeadlineTimer {
    state: TimerState,
}

impl DeadlineTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: Instant, duration: Duration) {
        self.state = TimerState::Armed(now + duration);
    }

    pub fn stop(&mut self) {
        self.state = TimerState::Stopped;
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TimerState::Armed(deadline) => Some(deadline),
            _ => None,
        }
    }

    /// Time left before expiry; frozen timers report their captured value.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            TimerState::Stopped => None,
            TimerState::Armed(deadline) => Some(deadline.saturating_duration_since(now)),
            TimerState::Frozen(remaining) => Some(remaining),
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.state, TimerState::Armed(deadline) if now >= deadline)
    }

    /// Captures the remaining time of an armed timer. Other states are kept.
    pub fn freeze(&mut self, now: Instant) {
        if let TimerState::Armed(deadline) = self.state {
            self.state = TimerState::Frozen(deadline.saturating_duration_since(now));
        }
    }

    /// Re-arms a frozen timer with exactly its captured remaining time.
    /// Returns whether anything was re-armed.
    pub fn thaw(&mut self, now: Instant) -> bool {
        match self.state {
            TimerState::Frozen(remaining) => {
                self.state = TimerState::Armed(now + remaining);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_at_deadline() {
        let t0 = Instant::now();
        let mut timer = DeadlineTimer::new();
        timer.start(t0, Duration::from_millis(500));
        assert!(!timer.is_due(t0 + Duration::from_millis(499)));
        assert!(timer.is_due(t0 + Duration::from_millis(500)));
        timer.stop();
        assert!(!timer.is_due(t0 + Duration::from_secs(10)));
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn freeze_keeps_remaining_across_pause() {
        let t0 = Instant::now();
        let mut timer = DeadlineTimer::new();
        timer.start(t0, Duration::from_millis(8000));
        timer.freeze(t0 + Duration::from_millis(3000));
        assert_eq!(timer.remaining(t0 + Duration::from_secs(60)), Some(Duration::from_millis(5000)));
        assert!(!timer.is_due(t0 + Duration::from_secs(60)));

        let resumed = t0 + Duration::from_secs(60);
        assert!(timer.thaw(resumed));
        assert_eq!(timer.deadline(), Some(resumed + Duration::from_millis(5000)));
    }

    #[test]
    fn thaw_ignores_stopped_timer() {
        let mut timer = DeadlineTimer::new();
        timer.freeze(Instant::now());
        assert!(!timer.thaw(Instant::now()));
        assert_eq!(timer.remaining(Instant::now()), None);
    }
}
