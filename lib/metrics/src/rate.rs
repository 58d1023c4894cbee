//! Derived metrics from monotonic counters.
//!
//! Both engines are owned by exactly one caller (`&mut self`); collectors that
//! share them across tasks wrap them in a mutex.

use std::time::Instant;
use tracing::trace;

/// Turns successive counter reads into deltas.
///
/// The previous value starts at zero, so the first sample returns the raw
/// counter itself. Callers that care discard or label that first reading.
#[derive(Debug, Clone, Default)]
pub struct DeltaEngine {
    previous: f64,
}

impl DeltaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `raw - previous` and remembers `raw`.
    ///
    /// The result is negative when the counter was reset; [`RateEngine`]
    /// clamps that case, plain deltas are reported as-is.
    pub fn sample(&mut self, raw: f64) -> f64 {
        let delta = raw - self.previous;
        self.previous = raw;
        delta
    }

    pub fn previous(&self) -> f64 {
        self.previous
    }
}

/// Turns successive counter reads into a per-second rate.
#[derive(Debug, Clone)]
pub struct RateEngine {
    delta: DeltaEngine,
    previous_at: Instant,
}

impl Default for RateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEngine {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates an engine whose first sample is measured against `at`.
    pub fn starting_at(at: Instant) -> Self {
        Self {
            delta: DeltaEngine::new(),
            previous_at: at,
        }
    }

    pub fn sample(&mut self, raw: f64) -> f64 {
        self.sample_at(raw, Instant::now())
    }

    /// Returns `delta / elapsed_seconds` for a read taken at `now`.
    ///
    /// Yields `0.0` when no time has passed (or the clock went backwards) and
    /// when the counter did not grow. The stored timestamp never moves back.
    pub fn sample_at(&mut self, raw: f64, now: Instant) -> f64 {
        let delta = self.delta.sample(raw);
        let elapsed = now
            .checked_duration_since(self.previous_at)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);

        if now > self.previous_at {
            self.previous_at = now;
        }

        if elapsed <= 0.0 || delta <= 0.0 {
            trace!(delta, elapsed, "Clamping rate to zero");
            return 0.0;
        }

        delta / elapsed
    }

    pub fn previous(&self) -> f64 {
        self.delta.previous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_delta_is_measured_from_zero() {
        let mut engine = DeltaEngine::new();

        assert_eq!(engine.sample(42.0), 42.0);
        assert_eq!(engine.previous(), 42.0);
    }

    #[test]
    fn deltas_follow_non_decreasing_sequence() {
        let mut engine = DeltaEngine::new();
        let sequence = [3.0, 3.0, 10.0, 11.5, 20.0];

        let deltas = sequence.map(|v| engine.sample(v));
        assert_eq!(deltas, [3.0, 0.0, 7.0, 1.5, 8.5]);
    }

    #[test]
    fn rate_is_zero_on_counter_reset() {
        let start = Instant::now();
        let mut engine = RateEngine::starting_at(start);

        engine.sample_at(500.0, start + Duration::from_secs(1));
        let rate = engine.sample_at(100.0, start + Duration::from_secs(2));

        assert_eq!(rate, 0.0);
        assert_eq!(engine.previous(), 100.0);
    }

    #[test]
    fn rate_is_zero_on_clock_rollback() {
        let start = Instant::now();
        let later = start + Duration::from_secs(10);
        let mut engine = RateEngine::starting_at(later);

        assert_eq!(engine.sample_at(100.0, start), 0.0);
        // the engine kept the later timestamp, so growth is measured from there
        let rate = engine.sample_at(300.0, later + Duration::from_secs(2));
        assert_eq!(rate, 100.0);
    }

    #[test]
    fn rate_is_zero_without_elapsed_time() {
        let start = Instant::now();
        let mut engine = RateEngine::starting_at(start);

        assert_eq!(engine.sample_at(100.0, start), 0.0);
    }

    #[test]
    fn rate_normalizes_by_elapsed_seconds() {
        let start = Instant::now();
        let mut engine = RateEngine::starting_at(start);

        engine.sample_at(0.0, start + Duration::from_millis(500));
        let rate = engine.sample_at(250.0, start + Duration::from_millis(1_000));

        assert_eq!(rate, 500.0);
    }

    #[test]
    fn end_to_end_counter_sequence() {
        let start = Instant::now();
        let mut engine = RateEngine::starting_at(start);
        let raw = [1000.0, 1000.0, 1500.0, 1500.0, 3000.0];

        let outputs: Vec<f64> = raw
            .iter()
            .enumerate()
            .map(|(i, value)| engine.sample_at(*value, start + Duration::from_secs(i as u64 + 1)))
            .collect();

        assert_eq!(outputs, vec![1000.0, 0.0, 500.0, 0.0, 1500.0]);
    }
}
