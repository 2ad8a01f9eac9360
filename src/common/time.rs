use chrono::{SecondsFormat, Utc};
use std::time::{Duration, Instant};

pub(crate) fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Run tags sort lexicographically in chronological order.
pub fn default_run_tag() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Measured milliseconds, or `None` when nothing was measured.
pub(crate) fn positive_millis(duration: Duration) -> Option<i64> {
    let ms = millis(duration);
    (ms > 0).then_some(ms)
}

/// Optional overall deadline shared by every phase of one site probe.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            return Self::none();
        }
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    pub(crate) fn none() -> Self {
        Self { at: None }
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Caps a per-operation timeout by whatever time the deadline leaves.
    pub(crate) fn cap(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(left) => timeout.min(left),
            None => timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Deadline, positive_millis};
    use std::time::Duration;

    #[test]
    fn disabled_deadline_never_caps() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(!deadline.expired());
        assert_eq!(deadline.cap(Duration::from_secs(7)), Duration::from_secs(7));
    }

    #[test]
    fn active_deadline_caps_longer_timeouts() {
        let deadline = Deadline::after(Duration::from_secs(2));
        assert!(deadline.cap(Duration::from_secs(120)) <= Duration::from_secs(2));
        assert_eq!(deadline.cap(Duration::from_millis(5)), Duration::from_millis(5));
    }

    #[test]
    fn zero_durations_are_not_measurements() {
        assert_eq!(positive_millis(Duration::from_micros(400)), None);
        assert_eq!(positive_millis(Duration::from_millis(12)), Some(12));
    }
}
