//! Debounce timers
//!
//! One generic interval primitive used three ways: the shutdown grace period
//! after the enable switch opens, the charge-mode re-evaluation hold-off
//! after any tracked signal changes, and the voltage-stabilization wait after
//! a charge-relay transition.
//!
//! Timers never read the clock themselves; callers pass `now` in, so timer
//! behavior is a pure function of its inputs.

use crate::logging::get_logger;
use chrono::{DateTime, Duration, Utc};

/// A one-shot hold-off interval with extend-only re-arming
pub struct DebounceTimer {
    name: &'static str,
    armed_at: Option<DateTime<Utc>>,
    duration: Duration,
    logger: crate::logging::StructuredLogger,
}

impl DebounceTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            armed_at: None,
            duration: Duration::zero(),
            logger: get_logger("timer"),
        }
    }

    /// Arm (or restart) the timer for `duration` from `now`
    pub fn arm(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.armed_at = Some(now);
        self.duration = duration;
        self.logger.debug(&format!(
            "{} timer armed for {}s at {}",
            self.name,
            duration.num_seconds(),
            now.format("%H:%M:%S")
        ));
    }

    /// Arm only if the resulting deadline extends past the current one.
    ///
    /// A short request arriving inside a longer in-progress delay is ignored;
    /// this asymmetry stops flapping signals from perpetually resetting to a
    /// short window.
    pub fn arm_if_longer(&mut self, now: DateTime<Utc>, duration: Duration) {
        match self.deadline() {
            Some(deadline) if now + duration < deadline => {
                self.logger.debug(&format!(
                    "{} timer: new {}s request ignored, inside existing window ending {}",
                    self.name,
                    duration.num_seconds(),
                    deadline.format("%H:%M:%S")
                ));
            }
            _ => self.arm(now, duration),
        }
    }

    /// Deadline of the current arming, if armed
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.armed_at.map(|t| t + self.duration)
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Whether the armed interval has passed. False when not armed.
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.deadline() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Returns true exactly once per arming, the first time the elapsed
    /// interval is observed, then clears the timer.
    pub fn consume(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_elapsed(now) {
            self.armed_at = None;
            self.logger.debug(&format!("{} timer elapsed", self.name));
            true
        } else {
            false
        }
    }

    pub fn cancel(&mut self) {
        if self.armed_at.take().is_some() {
            self.logger.debug(&format!("{} timer cancelled", self.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn unarmed_timer_never_elapses() {
        let mut timer = DebounceTimer::new("test");
        assert!(!timer.is_armed());
        assert!(!timer.is_elapsed(t0()));
        assert!(!timer.consume(t0()));
    }

    #[test]
    fn arm_and_elapse() {
        let mut timer = DebounceTimer::new("test");
        timer.arm(t0(), Duration::seconds(30));
        assert!(timer.is_armed());
        assert!(!timer.is_elapsed(t0() + Duration::seconds(29)));
        assert!(timer.is_elapsed(t0() + Duration::seconds(30)));
    }

    #[test]
    fn consume_fires_exactly_once() {
        let mut timer = DebounceTimer::new("test");
        timer.arm(t0(), Duration::seconds(10));
        let later = t0() + Duration::seconds(11);
        assert!(timer.consume(later));
        assert!(!timer.consume(later));
        assert!(!timer.is_armed());
    }

    #[test]
    fn arm_if_longer_never_shortens() {
        // 5s, then 30s, then 5s again behaves like a 30s window from the
        // second call
        let mut timer = DebounceTimer::new("test");
        timer.arm_if_longer(t0(), Duration::seconds(5));
        let t1 = t0() + Duration::seconds(1);
        timer.arm_if_longer(t1, Duration::seconds(30));
        let t2 = t0() + Duration::seconds(2);
        timer.arm_if_longer(t2, Duration::seconds(5));

        assert_eq!(timer.deadline(), Some(t1 + Duration::seconds(30)));
        assert!(!timer.is_elapsed(t1 + Duration::seconds(29)));
        assert!(timer.is_elapsed(t1 + Duration::seconds(30)));
    }

    #[test]
    fn arm_if_longer_extends_a_shorter_window() {
        let mut timer = DebounceTimer::new("test");
        timer.arm_if_longer(t0(), Duration::seconds(5));
        let t1 = t0() + Duration::seconds(4);
        timer.arm_if_longer(t1, Duration::seconds(5));
        assert_eq!(timer.deadline(), Some(t1 + Duration::seconds(5)));
    }

    #[test]
    fn plain_arm_restarts_unconditionally() {
        let mut timer = DebounceTimer::new("test");
        timer.arm(t0(), Duration::seconds(60));
        let t1 = t0() + Duration::seconds(10);
        timer.arm(t1, Duration::seconds(5));
        assert_eq!(timer.deadline(), Some(t1 + Duration::seconds(5)));
    }

    #[test]
    fn cancel_clears_arming() {
        let mut timer = DebounceTimer::new("test");
        timer.arm(t0(), Duration::seconds(5));
        timer.cancel();
        assert!(!timer.is_armed());
        assert!(!timer.consume(t0() + Duration::seconds(10)));
    }
}
