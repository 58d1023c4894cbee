use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use shrinkwraprs::Shrinkwrap;
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Process-wide origin of the monotonic clock used for [`Timestamp`]s.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A point on the process monotonic clock, in nanoseconds since the first
/// timestamp was taken.
///
/// Timestamps are what trace feeds stamp their begin/end notifications with.
/// Feeds that carry their own clock can build them directly with
/// [`Timestamp::from_nanos`] or [`Timestamp::from_millis`].
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Shrinkwrap,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from(EPOCH.elapsed())
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl From<Duration> for Timestamp {
    fn from(offset: Duration) -> Self {
        Self(u64::try_from(offset.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", format_duration(Duration::from_nanos(self.0)))
    }
}

/// Pretty-print a duration using the largest unit that keeps the value above one
/// (used in logs and diagnostics).
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    let seconds = duration.as_secs_f64();

    match nanos {
        0..=999 => format!("{}ns", nanos),
        1_000..=999_999 => format!("{:.3}μs", nanos as f64 / 1_000.0),
        1_000_000..=999_999_999 => format!("{:.3}ms", nanos as f64 / 1_000_000.0),
        _ if seconds < 60.0 => format!("{:.3}s", seconds),
        _ if seconds < 3_600.0 => format!("{:.3}m", seconds / 60.0),
        _ if seconds < 86_400.0 => format!("{:.3}h", seconds / 3_600.0),
        _ => format!("{:.3}d", seconds / 86_400.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_picks_unit() {
        assert_eq!(format_duration(Duration::from_nanos(12)), "12ns");
        assert_eq!(format_duration(Duration::from_micros(1_500)), "1.500ms");
        assert_eq!(format_duration(Duration::from_millis(2_250)), "2.250s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1.500m");
        assert_eq!(format_duration(Duration::from_secs(2 * 86_400)), "2.000d");
    }

    #[test]
    fn timestamps_are_monotonic() {
        let first = Timestamp::now();
        let second = Timestamp::now();

        assert!(second >= first);
    }

    #[test]
    fn duration_since_saturates() {
        let start = Timestamp::from_millis(10);
        let end = Timestamp::from_millis(15);

        assert_eq!(end.saturating_duration_since(start), Duration::from_millis(5));
        assert_eq!(start.saturating_duration_since(end), Duration::ZERO);
    }

    #[test]
    fn conversions_saturate_instead_of_wrapping() {
        assert_eq!(Timestamp::from_millis(u64::MAX).as_nanos(), u64::MAX);
        assert_eq!(Timestamp::from(Duration::MAX).as_nanos(), u64::MAX);
        assert_eq!(Timestamp::from(Duration::from_secs(3)), Timestamp::from_millis(3_000));
    }
}
