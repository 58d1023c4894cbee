//! Periodic fan-out of one collector to many subscribers.
//!
//! Every distinct period gets at most one polling loop, started by its first
//! subscriber and stopped when its last subscriber leaves. Loops for different
//! periods are independent tokio tasks.

use crate::collector::CollectorRef;
use crate::error::{MetricsError, Result};
use crate::subscriber::{ObserverRef, SubscriberId, SubscriberList, Subscription};
use common::util::time::format_duration;
use core::fmt;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, Copy, Default, TypedBuilder)]
pub struct SchedulerOptions {
    /// Hand collection failures to subscribers through `on_error` instead of
    /// only logging them.
    #[builder(default = false)]
    forward_errors: bool,
}

/// A running loop and the subscribers it delivers to.
struct PeriodBucket<T> {
    subscribers: Arc<SubscriberList<T>>,
    cancel: CancellationToken,
}

struct SchedulerInner<T: Send + Sync + 'static> {
    collector: CollectorRef<T>,
    options: SchedulerOptions,
    buckets: Mutex<HashMap<Duration, PeriodBucket<T>>>,
    disposed: AtomicBool,
}

impl<T: Send + Sync + 'static> SchedulerInner<T> {
    fn unsubscribe(&self, period: Duration, id: SubscriberId) {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get(&period) else {
            return;
        };

        if bucket.subscribers.remove(id) == Some(0) {
            if let Some(bucket) = buckets.remove(&period) {
                bucket.cancel.cancel();
                debug!(
                    collector = self.collector.name(),
                    period = %format_duration(period),
                    "Last subscriber left, stopping polling loop"
                );
            }
        }
    }

    fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let buckets: Vec<_> = self.buckets.lock().drain().map(|(_, bucket)| bucket).collect();
        debug!(
            collector = self.collector.name(),
            loops = buckets.len(),
            "Disposing broadcast scheduler"
        );
        for bucket in buckets {
            bucket.cancel.cancel();
            bucket.subscribers.complete_all();
        }
    }
}

/// Runs one collector on a schedule per distinct period and broadcasts each
/// result to every subscriber of that period.
///
/// Dropping the scheduler disposes it.
pub struct BroadcastScheduler<T: Send + Sync + 'static> {
    inner: Arc<SchedulerInner<T>>,
}

impl<T> BroadcastScheduler<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(collector: CollectorRef<T>) -> Self {
        Self::with_options(collector, SchedulerOptions::default())
    }

    pub fn with_options(collector: CollectorRef<T>, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                collector,
                options,
                buckets: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.collector.name()
    }

    /// Adds `observer` to the fan-out set of `period`, starting that period's
    /// loop if it is the first subscriber.
    ///
    /// Must be called within a tokio runtime when it may start a loop.
    #[instrument(skip(self, observer), fields(collector = self.name()))]
    pub fn subscribe(&self, period: Duration, observer: ObserverRef<T>) -> Result<Subscription> {
        if period.is_zero() {
            return Err(MetricsError::InvalidPeriod(period));
        }

        let mut buckets = self.inner.buckets.lock();
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(MetricsError::AlreadyDisposed("broadcast scheduler"));
        }

        let id = match buckets.get(&period) {
            Some(bucket) => {
                trace!(period = %format_duration(period), "Joining running polling loop");
                bucket.subscribers.insert(observer)
            }
            None => {
                let handle =
                    Handle::try_current().map_err(|e| MetricsError::LoopStart(e.to_string()))?;

                let subscribers = Arc::new(SubscriberList::new());
                let id = subscribers.insert(observer);
                let cancel = CancellationToken::new();

                handle.spawn(run_loop(
                    self.inner.collector.clone(),
                    period,
                    subscribers.clone(),
                    cancel.clone(),
                    self.inner.options,
                ));
                info!(period = %format_duration(period), "Started polling loop");

                buckets.insert(period, PeriodBucket {
                    subscribers,
                    cancel,
                });
                id
            }
        };
        drop(buckets);

        let inner: Weak<SchedulerInner<T>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.unsubscribe(period, id);
            }
        }))
    }

    /// Periods that currently have a running loop.
    pub fn active_periods(&self) -> Vec<Duration> {
        let mut periods: Vec<_> = self.inner.buckets.lock().keys().copied().collect();
        periods.sort();
        periods
    }

    pub fn subscriber_count(&self, period: Duration) -> usize {
        self.inner
            .buckets
            .lock()
            .get(&period)
            .map_or(0, |bucket| bucket.subscribers.len())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Stops every loop and completes every subscriber. Idempotent.
    pub fn dispose(&self) {
        self.inner.shutdown();
    }
}

impl<T: Send + Sync + 'static> Drop for BroadcastScheduler<T> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for BroadcastScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastScheduler")
            .field("collector", &self.inner.collector.name())
            .field("loops", &self.inner.buckets.lock().len())
            .field("disposed", &self.inner.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

/// The body of one period's polling loop.
///
/// A collection that is already running when the loop is cancelled completes
/// but is delivered to nobody. Otherwise it goes to the subscribers captured
/// before it started that are still subscribed when it finishes.
async fn run_loop<T>(
    collector: CollectorRef<T>,
    period: Duration,
    subscribers: Arc<SubscriberList<T>>,
    cancel: CancellationToken,
    options: SchedulerOptions,
) where
    T: Send + Sync + 'static,
{
    let name = collector.name().to_string();
    debug!(collector = %name, period = %format_duration(period), "Polling loop running");

    while !cancel.is_cancelled() {
        let started = Instant::now();
        let snapshot = subscribers.snapshot();
        let outcome = AssertUnwindSafe(collector.collect()).catch_unwind().await;

        if cancel.is_cancelled() {
            trace!(collector = %name, "Loop stopped during collection, discarding tick");
            break;
        }
        let recipients = snapshot.still_in(&subscribers);

        match outcome {
            Ok(Ok(value)) => {
                trace!(collector = %name, subscribers = recipients.len(), "Delivering tick");
                recipients.deliver(&value);
            }
            Ok(Err(error)) => {
                warn!(
                    collector = %name,
                    error = %format!("{:#}", error),
                    "Collection failed, skipping tick"
                );
                if options.forward_errors {
                    recipients.deliver_error(&MetricsError::Collection(Arc::new(error)));
                }
            }
            Err(_) => {
                warn!(collector = %name, "Collector panicked, skipping tick");
            }
        }

        let elapsed = started.elapsed();
        match period.checked_sub(elapsed).filter(|wait| !wait.is_zero()) {
            Some(wait) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            None => {
                debug!(
                    collector = %name,
                    elapsed = %format_duration(elapsed),
                    "Collection overran its period, polling again immediately"
                );
                tokio::task::yield_now().await;
            }
        }
    }

    debug!(collector = %name, period = %format_duration(period), "Polling loop stopped");
}
