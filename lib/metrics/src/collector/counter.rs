use super::Collector;
use crate::metric::{CounterRate, Metric};
use crate::rate::RateEngine;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{instrument, trace};

/// Supplies a raw monotonic counter (or an instantaneous value) on demand.
///
/// This is the seam for anything platform- or runtime-specific: managed heap
/// collections, thread-pool queue depth, exception counts and the like.
pub trait CounterSource: Send {
    fn name(&self) -> &str;

    fn poll(&mut self) -> anyhow::Result<f64>;
}

impl<F> CounterSource for (&'static str, F)
where
    F: FnMut() -> anyhow::Result<f64> + Send,
{
    fn name(&self) -> &str {
        self.0
    }

    fn poll(&mut self) -> anyhow::Result<f64> {
        (self.1)()
    }
}

struct RateState<S> {
    source: S,
    rate: RateEngine,
}

/// Reports the per-second growth of a [`CounterSource`].
pub struct CounterRateCollector<S> {
    name: String,
    state: Mutex<RateState<S>>,
}

impl<S: CounterSource> CounterRateCollector<S> {
    pub fn new(source: S) -> Self {
        Self {
            name: source.name().to_string(),
            state: Mutex::new(RateState {
                source,
                rate: RateEngine::new(),
            }),
        }
    }

    /// Polls the source once and returns its rate since the previous poll.
    pub fn sample(&self) -> anyhow::Result<f64> {
        let mut state = self.state.lock();
        let raw = state.source.poll()?;
        let per_second = state.rate.sample(raw);
        trace!(source = %self.name, raw, per_second, "Sampled counter");
        Ok(per_second)
    }
}

#[async_trait]
impl<S: CounterSource> Collector for CounterRateCollector<S> {
    type Output = Metric;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn collect(&self) -> anyhow::Result<Metric> {
        let per_second = self.sample()?;
        Ok(Metric::CounterRate(
            CounterRate::builder()
                .source(self.name.clone())
                .per_second(per_second)
                .build(),
        ))
    }
}
