//! Inspection interval and the per-deployment scheduler
//!
//! Steps may only shrink the next interval within a cycle. Between cycles
//! the worker grows it while the deployment stays quiet. The scheduler turns
//! a cycle outcome into the delay before the next cycle.

use std::time::Duration;

/// Default floor between two cycles
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(250);
/// Default ceiling between two cycles
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(10);
/// Growth factor applied when the timer fires without an external trigger
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Delay before the next reconciliation cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval(Duration);

impl Interval {
    /// Wrap a duration
    pub const fn new(d: Duration) -> Self {
        Self(d)
    }

    /// The wrapped duration
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// The smaller of the two intervals
    pub fn reduce_to(self, other: Interval) -> Interval {
        self.min(other)
    }

    /// Merge an optional request; `None` leaves the interval unchanged
    pub fn reduce_to_opt(self, other: Option<Interval>) -> Interval {
        other.map_or(self, |o| self.reduce_to(o))
    }

    /// Grow by `factor`, never beyond `max`
    pub fn backoff(self, factor: f64, max: Interval) -> Interval {
        let grown = Duration::from_secs_f64(self.0.as_secs_f64() * factor);
        Interval(grown).reduce_to(max)
    }
}

impl From<Duration> for Interval {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

/// How a cycle ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// All steps ran or the cycle stopped early on purpose; carries the folded hint
    Clean(Interval),
    /// A step asked to run again soon, or a reconcile-needed error occurred
    RetrySoon,
    /// A step failed or the cycle ran out of time
    Failed,
}

impl CycleOutcome {
    /// Label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleOutcome::Clean(_) => "clean",
            CycleOutcome::RetrySoon => "retry",
            CycleOutcome::Failed => "failed",
        }
    }
}

/// Floor/ceiling bounded scheduler with a consecutive error flag
#[derive(Clone, Debug)]
pub struct InspectionScheduler {
    min: Interval,
    max: Interval,
    in_error_streak: bool,
}

impl Default for InspectionScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL.into(), DEFAULT_MAX_INTERVAL.into())
    }
}

impl InspectionScheduler {
    /// Create a scheduler; `max` is raised to `min` if given lower
    pub fn new(min: Interval, max: Interval) -> Self {
        Self {
            min,
            max: max.max(min),
            in_error_streak: false,
        }
    }

    /// Configured floor
    pub fn floor(&self) -> Interval {
        self.min
    }

    /// Configured ceiling
    pub fn ceiling(&self) -> Interval {
        self.max
    }

    /// Whether the previous cycle ended in failure
    pub fn in_error_streak(&self) -> bool {
        self.in_error_streak
    }

    /// Interval to use after a timer fire with no external trigger
    pub fn relax(&self, last: Interval) -> Interval {
        last.backoff(BACKOFF_FACTOR, self.max)
    }

    /// Delay before the next cycle
    ///
    /// Every failing cycle returns the floor. The streak flag only records
    /// whether the previous cycle failed; any non-failing cycle ends it.
    pub fn complete(&mut self, outcome: CycleOutcome) -> Interval {
        let next = match outcome {
            CycleOutcome::Clean(next) => {
                self.in_error_streak = false;
                next
            }
            CycleOutcome::RetrySoon => {
                self.in_error_streak = false;
                self.min
            }
            CycleOutcome::Failed => {
                self.in_error_streak = true;
                self.min
            }
        };
        next.reduce_to(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ms(v: u64) -> Interval {
        Interval::new(Duration::from_millis(v))
    }

    fn scheduler() -> InspectionScheduler {
        InspectionScheduler::new(ms(250), ms(10_000))
    }

    #[test]
    fn reduce_to_keeps_smallest() {
        assert_eq!(ms(500).reduce_to(ms(300)), ms(300));
        assert_eq!(ms(300).reduce_to(ms(500)), ms(300));
        assert_eq!(ms(300).reduce_to_opt(None), ms(300));
        assert_eq!(ms(300).reduce_to_opt(Some(ms(100))), ms(100));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(ms(1000).backoff(1.5, ms(10_000)), ms(1500));
        assert_eq!(ms(8000).backoff(1.5, ms(10_000)), ms(10_000));
    }

    #[test]
    fn relax_from_floor_reaches_ceiling() {
        let s = scheduler();
        let mut i = s.floor();
        for _ in 0..20 {
            i = s.relax(i);
        }
        assert_eq!(i, s.ceiling());
    }

    #[rstest]
    #[case(ms(250))]
    #[case(ms(5_000))]
    #[case(ms(60_000))]
    fn retry_soon_always_returns_floor(#[case] _previous: Interval) {
        let mut s = scheduler();
        assert_eq!(s.complete(CycleOutcome::RetrySoon), ms(250));
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(10)]
    fn failures_in_a_row_return_floor(#[case] failures: usize) {
        let mut s = scheduler();
        for _ in 0..failures {
            assert_eq!(s.complete(CycleOutcome::Failed), ms(250));
            assert!(s.in_error_streak());
        }
    }

    #[rstest]
    #[case(ms(1))]
    #[case(ms(10_000))]
    #[case(ms(3_600_000))]
    fn clean_cycles_never_exceed_ceiling(#[case] hint: Interval) {
        let mut s = scheduler();
        assert!(s.complete(CycleOutcome::Clean(hint)) <= s.ceiling());
    }

    /// clean -> error -> error -> clean: every failure returns the floor and
    /// the streak ends on the next clean cycle.
    #[test]
    fn error_streak_transitions() {
        let mut s = scheduler();

        assert_eq!(s.complete(CycleOutcome::Clean(ms(4_000))), ms(4_000));
        assert!(!s.in_error_streak());

        assert_eq!(s.complete(CycleOutcome::Failed), ms(250));
        assert!(s.in_error_streak());

        assert_eq!(s.complete(CycleOutcome::Failed), ms(250));
        assert!(s.in_error_streak());

        assert_eq!(s.complete(CycleOutcome::Clean(ms(15_000))), ms(10_000));
        assert!(!s.in_error_streak());

        assert_eq!(s.complete(CycleOutcome::Failed), ms(250));
        assert!(s.in_error_streak());
    }

    #[test]
    fn retry_soon_ends_a_streak() {
        let mut s = scheduler();
        s.complete(CycleOutcome::Failed);
        s.complete(CycleOutcome::RetrySoon);
        assert!(!s.in_error_streak());
        assert_eq!(s.complete(CycleOutcome::Failed), ms(250));
    }

    #[test]
    fn ceiling_is_never_below_floor() {
        let s = InspectionScheduler::new(ms(500), ms(100));
        assert_eq!(s.ceiling(), ms(500));
    }
}
