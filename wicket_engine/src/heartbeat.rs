//! Reconciling the local countdown against the server
//!
//! While a tab holds coordinatorship it reports liveness on a fixed
//! interval and applies the server's authoritative remaining time as a
//! correction. Losing server contact is survivable: after three
//! consecutive failures heartbeating stops for good and the local
//! countdown runs unassisted, which beats terminating a session the user
//! is actively working in.

use wicket_clock::DurationSecs;

/// The consecutive-failure accounting for heartbeat calls
///
/// The counter belongs to a coordinatorship: a newly promoted coordinator
/// starts from a fresh one.
#[derive(Debug)]
pub struct HeartbeatReconciler {
    failures: u32,
    max_failures: u32,
    stopped: bool,
}

impl HeartbeatReconciler {
    /// Creates the accounting with the given failure tolerance
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures,
            stopped: false,
        }
    }

    /// Whether heartbeating has permanently stopped for this session
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The current consecutive-failure count
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records a successful round-trip, resetting the failure streak
    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Records a failed round-trip
    ///
    /// Returns `true` when this failure exhausted the tolerance and
    /// heartbeating is now stopped.
    pub fn record_failure(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.failures += 1;
        if self.failures >= self.max_failures {
            self.stopped = true;
            tracing::warn!(
                failures = self.failures,
                "heartbeat failure tolerance exhausted; continuing unassisted"
            );
            return true;
        }
        false
    }

    /// Resets the accounting for a coordinator handoff
    pub fn reset(&mut self) {
        self.failures = 0;
        self.stopped = false;
    }
}

/// Floors a server-reported remaining-seconds value
///
/// The server may answer with fractional seconds; the countdown never
/// displays time the session does not actually have, so the fraction is
/// dropped. Negative values clamp to zero.
pub fn floor_remaining(remaining_seconds: f64) -> DurationSecs {
    if remaining_seconds.is_nan() || remaining_seconds <= 0.0 {
        DurationSecs(0)
    } else {
        DurationSecs(remaining_seconds.floor() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_stop_heartbeating() {
        let mut hb = HeartbeatReconciler::new(3);
        assert!(!hb.record_failure());
        assert!(!hb.record_failure());
        assert!(hb.record_failure());
        assert!(hb.is_stopped());

        // Further failures are inert
        assert!(!hb.record_failure());
    }

    #[test]
    fn success_resets_the_streak() {
        let mut hb = HeartbeatReconciler::new(3);
        hb.record_failure();
        hb.record_failure();
        hb.record_success();
        assert_eq!(hb.failures(), 0);
        assert!(!hb.record_failure());
        assert!(!hb.is_stopped());
    }

    #[test]
    fn handoff_starts_fresh() {
        let mut hb = HeartbeatReconciler::new(3);
        hb.record_failure();
        hb.record_failure();
        hb.record_failure();
        assert!(hb.is_stopped());
        hb.reset();
        assert!(!hb.is_stopped());
        assert_eq!(hb.failures(), 0);
    }

    #[test]
    fn fractional_remaining_is_floored_never_rounded_up() {
        assert_eq!(floor_remaining(1199.94), DurationSecs(1199));
        assert_eq!(floor_remaining(0.9), DurationSecs(0));
        assert_eq!(floor_remaining(-3.0), DurationSecs(0));
        assert_eq!(floor_remaining(f64::NAN), DurationSecs(0));
    }
}
