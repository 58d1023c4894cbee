use crate::collector::{Collector, CollectorRef};
use crate::error::{MetricsError, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use core::fmt;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

type InFlight<T> = Shared<BoxFuture<'static, Result<T, Arc<anyhow::Error>>>>;

enum Slot<T> {
    Empty,
    /// A collection is running; every caller awaits this same future.
    Pending {
        generation: u64,
        future: InFlight<T>,
    },
    Ready {
        value: T,
        expires_at: Instant,
    },
}

struct CacheState<T> {
    slot: Slot<T>,
    generation: u64,
    invocations: u64,
}

/// Bounds how often an expensive collection actually runs.
///
/// The first `obtain` (or the first after the TTL elapsed) runs the wrapped
/// collector once; callers arriving while it runs share its outcome. A
/// successful value is served until `ttl` after it was produced. A failure is
/// handed only to the callers that were waiting on it and leaves the cache
/// empty, so the next call tries again. A panicking collector counts as a
/// failure.
pub struct ThrottlingCache<T> {
    collector: CollectorRef<T>,
    ttl: Duration,
    name: String,
    state: Mutex<CacheState<T>>,
}

impl<T> ThrottlingCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(collector: CollectorRef<T>, ttl: Duration) -> Self {
        let name = format!("cached:{}", collector.name());
        Self {
            collector,
            ttl,
            name,
            state: Mutex::new(CacheState {
                slot: Slot::Empty,
                generation: 0,
                invocations: 0,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How many times the wrapped collector has been started.
    pub fn invocations(&self) -> u64 {
        self.state.lock().invocations
    }

    #[instrument(skip(self), fields(cache = %self.name))]
    pub async fn obtain(&self) -> Result<T> {
        let (generation, future) = {
            let mut state = self.state.lock();

            if let Slot::Ready { value, expires_at } = &state.slot {
                if Instant::now() < *expires_at {
                    trace!("Serving cached value");
                    return Ok(value.clone());
                }
            }

            if let Slot::Pending { generation, future } = &state.slot {
                trace!(generation, "Joining in-flight collection");
                (*generation, future.clone())
            } else {
                state.generation += 1;
                state.invocations += 1;
                let generation = state.generation;

                let collector = Arc::clone(&self.collector);
                let future = async move {
                    match AssertUnwindSafe(collector.collect()).catch_unwind().await {
                        Ok(outcome) => outcome.map_err(Arc::new),
                        Err(_) => {
                            let name = collector.name();
                            Err(Arc::new(anyhow!("collector `{}` panicked", name)))
                        }
                    }
                }
                .boxed()
                .shared();

                debug!(generation, "Starting collection");
                state.slot = Slot::Pending {
                    generation,
                    future: future.clone(),
                };
                (generation, future)
            }
        };

        let outcome = future.await;

        {
            let mut state = self.state.lock();
            // only the first waiter to wake publishes; later ones find the slot moved on
            let still_pending = matches!(
                &state.slot,
                Slot::Pending { generation: current, .. } if *current == generation
            );
            if still_pending {
                state.slot = match &outcome {
                    Ok(value) => Slot::Ready {
                        value: value.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                    Err(error) => {
                        warn!(generation, error = %error, "Collection failed, cache left empty");
                        Slot::Empty
                    }
                };
            }
        }

        outcome.map_err(MetricsError::Collection)
    }

    /// Drops the cached value so the next `obtain` collects again.
    /// An in-flight collection is left to finish for its waiters.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if matches!(state.slot, Slot::Ready { .. }) {
            state.slot = Slot::Empty;
        }
    }
}

#[async_trait]
impl<T> Collector for ThrottlingCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> anyhow::Result<T> {
        self.obtain().await.map_err(anyhow::Error::new)
    }
}

impl<T> fmt::Debug for ThrottlingCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let slot = match state.slot {
            Slot::Empty => "empty",
            Slot::Pending { .. } => "pending",
            Slot::Ready { .. } => "ready",
        };
        f.debug_struct("ThrottlingCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("slot", &slot)
            .field("invocations", &state.invocations)
            .finish()
    }
}
