//! The per-tab countdown
//!
//! A pure state machine driven by the engine's one-second tick. It owns
//! no clock and performs no I/O, which keeps every transition testable
//! without a runtime.
//!
//! Remaining time is a non-negative whole number of seconds and is
//! monotonically non-increasing except under an explicit extension:
//! corrections reconcile to the smaller of the local and asserted values,
//! so a correction may shorten a session but never lengthen one, and
//! re-applying a correction is idempotent.

use wicket_clock::DurationSecs;

/// The countdown's lifecycle states
///
/// `Ended` is terminal; no transition leaves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    /// Not yet started
    Idle,
    /// Counting down
    Running,
    /// Suspended without losing remaining time
    Paused,
    /// Reached zero or was ended by a correction
    Ended,
}

/// A threshold crossing produced by a tick or correction
///
/// At most one signal is produced per transition; reaching zero always
/// wins over a pending warning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerSignal {
    /// The countdown crossed the warning threshold
    Warning,
    /// The countdown reached zero
    Ended,
}

/// The cooperative one-second countdown
#[derive(Clone, Debug)]
pub struct CountdownTimer {
    state: TimerState,
    remaining: DurationSecs,
    warning_threshold: DurationSecs,
    warned: bool,
}

impl CountdownTimer {
    /// Creates an idle timer
    pub fn new() -> Self {
        Self {
            state: TimerState::Idle,
            remaining: DurationSecs(0),
            warning_threshold: DurationSecs(0),
            warned: false,
        }
    }

    /// The current state
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// The seconds left on the countdown
    pub fn remaining(&self) -> DurationSecs {
        self.remaining
    }

    /// Whether the warning signal has fired for this session
    pub fn warned(&self) -> bool {
        self.warned
    }

    /// Whether the countdown is in its terminal state
    pub fn is_ended(&self) -> bool {
        self.state == TimerState::Ended
    }

    /// Begins the countdown from `remaining` seconds
    ///
    /// A session that starts at or below the warning threshold never
    /// crosses it, so the warning is suppressed for its entire lifetime.
    /// Starting with zero remaining ends the countdown immediately.
    pub fn start(
        &mut self,
        remaining: DurationSecs,
        warning_threshold: DurationSecs,
    ) -> Option<TimerSignal> {
        if self.state != TimerState::Idle {
            return None;
        }

        self.remaining = remaining;
        self.warning_threshold = warning_threshold;
        self.warned = remaining <= warning_threshold;

        if remaining == DurationSecs(0) {
            self.state = TimerState::Ended;
            return Some(TimerSignal::Ended);
        }

        self.state = TimerState::Running;
        None
    }

    /// Advances the countdown by one second
    ///
    /// Has no effect unless the timer is running.
    pub fn tick(&mut self) -> Option<TimerSignal> {
        if self.state != TimerState::Running {
            return None;
        }

        self.remaining = self.remaining - DurationSecs(1);

        if self.remaining == DurationSecs(0) {
            self.state = TimerState::Ended;
            return Some(TimerSignal::Ended);
        }

        if !self.warned && self.remaining <= self.warning_threshold {
            self.warned = true;
            return Some(TimerSignal::Warning);
        }

        None
    }

    /// Suspends a running countdown; a no-op in any other state
    pub fn pause(&mut self) {
        if self.state == TimerState::Running {
            self.state = TimerState::Paused;
        }
    }

    /// Resumes a paused countdown; a no-op in any other state
    pub fn resume(&mut self) {
        if self.state == TimerState::Paused {
            self.state = TimerState::Running;
        }
    }

    /// Reconciles the countdown against an authoritative remaining value
    ///
    /// The local value only ever moves down: `remaining` becomes the
    /// smaller of the current and asserted values. An asserted value of
    /// zero ends the countdown even while paused.
    pub fn apply_correction(&mut self, asserted: DurationSecs) -> Option<TimerSignal> {
        if self.state == TimerState::Ended || self.state == TimerState::Idle {
            return None;
        }

        if asserted >= self.remaining {
            tracing::debug!(
                local = self.remaining.0,
                asserted = asserted.0,
                "correction does not shorten the countdown; keeping local value"
            );
            return None;
        }

        self.remaining = asserted;

        if self.remaining == DurationSecs(0) {
            self.state = TimerState::Ended;
            return Some(TimerSignal::Ended);
        }

        None
    }

    /// Applies an explicit extension, overwriting the remaining time
    ///
    /// Extension is the one operation that may raise the countdown. The
    /// warning does not re-arm: it fires at most once per session.
    pub fn extend_to(&mut self, new_remaining: DurationSecs) {
        if self.state == TimerState::Ended || self.state == TimerState::Idle {
            return;
        }

        self.remaining = new_remaining;
    }

    /// Stops the countdown unconditionally
    pub fn end(&mut self) -> Option<TimerSignal> {
        if self.state == TimerState::Ended || self.state == TimerState::Idle {
            return None;
        }
        self.state = TimerState::Ended;
        self.remaining = DurationSecs(0);
        Some(TimerSignal::Ended)
    }
}

impl Default for CountdownTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(remaining: u64, threshold: u64) -> CountdownTimer {
        let mut t = CountdownTimer::new();
        assert_eq!(t.start(DurationSecs(remaining), DurationSecs(threshold)), None);
        t
    }

    #[test]
    fn ticks_decrement_by_one() {
        let mut t = running(10, 3);
        assert_eq!(t.tick(), None);
        assert_eq!(t.remaining(), DurationSecs(9));
    }

    #[test]
    fn warning_fires_exactly_once_on_crossing() {
        let mut t = running(5, 3);
        assert_eq!(t.tick(), None); // 4
        assert_eq!(t.tick(), Some(TimerSignal::Warning)); // 3
        assert_eq!(t.tick(), None); // 2
        assert_eq!(t.tick(), None); // 1
        assert_eq!(t.tick(), Some(TimerSignal::Ended)); // 0
        assert_eq!(t.state(), TimerState::Ended);
    }

    #[test]
    fn short_session_never_warns() {
        // total duration below the threshold: no crossing ever happens
        let mut t = running(3, 300);
        assert_eq!(t.tick(), None);
        assert_eq!(t.tick(), None);
        assert_eq!(t.tick(), Some(TimerSignal::Ended));
    }

    #[test]
    fn zero_beats_warning_on_ties() {
        // threshold equal to initial remaining minus one: the tick that
        // would warn is also the tick that ends
        let mut t = running(1, 300);
        assert_eq!(t.tick(), Some(TimerSignal::Ended));
    }

    #[test]
    fn starting_at_zero_ends_immediately() {
        let mut t = CountdownTimer::new();
        assert_eq!(
            t.start(DurationSecs(0), DurationSecs(300)),
            Some(TimerSignal::Ended)
        );
    }

    #[test]
    fn pause_and_resume_do_not_lose_time() {
        let mut t = running(10, 3);
        t.tick();
        t.pause();
        assert_eq!(t.tick(), None);
        assert_eq!(t.remaining(), DurationSecs(9));
        t.resume();
        t.tick();
        assert_eq!(t.remaining(), DurationSecs(8));
    }

    #[test]
    fn pause_resume_are_noops_when_inapplicable() {
        let mut t = CountdownTimer::new();
        t.pause();
        assert_eq!(t.state(), TimerState::Idle);
        t.resume();
        assert_eq!(t.state(), TimerState::Idle);

        let mut t = running(5, 1);
        t.resume();
        assert_eq!(t.state(), TimerState::Running);
    }

    #[test]
    fn corrections_shorten_but_never_lengthen() {
        let mut t = running(100, 10);
        assert_eq!(t.apply_correction(DurationSecs(50)), None);
        assert_eq!(t.remaining(), DurationSecs(50));

        assert_eq!(t.apply_correction(DurationSecs(200)), None);
        assert_eq!(t.remaining(), DurationSecs(50));
    }

    #[test]
    fn corrections_are_idempotent() {
        let mut t = running(100, 10);
        t.apply_correction(DurationSecs(40));
        let first = t.remaining();
        t.apply_correction(DurationSecs(40));
        assert_eq!(t.remaining(), first);
    }

    #[test]
    fn zero_correction_ends_even_while_paused() {
        let mut t = running(100, 10);
        t.pause();
        assert_eq!(t.apply_correction(DurationSecs(0)), Some(TimerSignal::Ended));
        assert_eq!(t.state(), TimerState::Ended);
    }

    #[test]
    fn corrections_after_end_are_ignored() {
        let mut t = running(1, 0);
        assert_eq!(t.tick(), Some(TimerSignal::Ended));
        assert_eq!(t.apply_correction(DurationSecs(500)), None);
        assert_eq!(t.remaining(), DurationSecs(0));
        assert_eq!(t.state(), TimerState::Ended);
    }

    #[test]
    fn extension_raises_remaining() {
        let mut t = running(30, 10);
        t.extend_to(DurationSecs(1200));
        assert_eq!(t.remaining(), DurationSecs(1200));
        assert_eq!(t.state(), TimerState::Running);
    }

    #[test]
    fn extension_does_not_rearm_the_warning() {
        let mut t = running(11, 10);
        assert_eq!(t.tick(), Some(TimerSignal::Warning));
        t.extend_to(DurationSecs(1200));
        assert!(t.warned());
        assert_eq!(t.tick(), None);
    }

    #[test]
    fn monotonic_across_ticks_and_corrections() {
        let mut t = running(50, 5);
        let mut last = t.remaining();
        let corrections = [60u64, 45, 45, 70, 20];
        for (i, c) in corrections.iter().enumerate() {
            t.tick();
            t.apply_correction(DurationSecs(*c));
            assert!(t.remaining() <= last, "not monotonic at step {i}");
            last = t.remaining();
        }
    }
}
