//! Pairs asynchronous begin/end notifications into measured intervals.
//!
//! Feeds (GC cycles, DNS lookups, socket connects, ...) report the two halves
//! of an occurrence separately, possibly from different delivery threads. The
//! caller supplies a correlation key at both ends; it must be wide enough
//! (generation plus a monotonic sequence, say) that it cannot repeat within
//! the retention window.

use crate::error::{MetricsError, Result};
use crate::ring::BoundedRing;
use crate::subscriber::{ObserverRef, SubscriberList, Subscription};
use common::Timestamp;
use core::fmt;
use getset::Getters;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Default number of pending begins retained per correlator.
pub const DEFAULT_CAPACITY: usize = 50;

/// A begin notification waiting for its end.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct PendingInterval<K, A> {
    key: K,
    attributes: A,
    started_at: Timestamp,
    /// Set once an end has been paired with this begin.
    matched: bool,
}

/// A begin paired with its end.
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct CompletedInterval<K, A> {
    key: K,
    attributes: A,
    started_at: Timestamp,
    ended_at: Timestamp,
}

impl<K, A> CompletedInterval<K, A> {
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}

/// Matches `on_end` calls against the most recent pending `on_begin` calls.
///
/// Pending begins live in a fixed-size ring. When it is full the oldest begin
/// is overwritten; if that begin never saw its end it is counted in
/// [`dropped_unmatched`](Self::dropped_unmatched) and otherwise forgotten.
pub struct EventCorrelator<K, A> {
    pending: Mutex<BoundedRing<PendingInterval<K, A>>>,
    dropped_unmatched: AtomicU64,
}

impl<K, A> EventCorrelator<K, A>
where
    K: PartialEq + Clone + fmt::Debug,
    A: Clone,
{
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            pending: Mutex::new(BoundedRing::new(capacity)?),
            dropped_unmatched: AtomicU64::new(0),
        })
    }

    pub fn on_begin(&self, key: K, attributes: A, timestamp: Timestamp) {
        let evicted = self.pending.lock().push(PendingInterval {
            key,
            attributes,
            started_at: timestamp,
            matched: false,
        });

        if let Some(evicted) = evicted.filter(|evicted| !evicted.matched) {
            self.dropped_unmatched.fetch_add(1, Ordering::Relaxed);
            trace!(key = ?evicted.key, "Pending begin aged out before its end");
        }
    }

    /// Pairs an end with the newest begin carrying `key`.
    ///
    /// Returns `None` for an unknown key, for a begin that already aged out,
    /// and for a repeated end of an interval that was already reported.
    pub fn on_end(&self, key: &K, timestamp: Timestamp) -> Option<CompletedInterval<K, A>> {
        let mut pending = self.pending.lock();

        let Some(entry) = pending.find_newest_mut(|entry| entry.key == *key) else {
            trace!(?key, "End without a pending begin");
            return None;
        };

        if entry.matched {
            trace!(?key, "Duplicate end ignored");
            return None;
        }
        entry.matched = true;

        Some(CompletedInterval {
            key: entry.key.clone(),
            attributes: entry.attributes.clone(),
            started_at: entry.started_at,
            ended_at: timestamp,
        })
    }

    /// Begins currently retained that have not been matched yet.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .iter_newest()
            .filter(|entry| !entry.matched)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.pending.lock().capacity()
    }

    /// Begins overwritten before any end arrived for them.
    pub fn dropped_unmatched(&self) -> u64 {
        self.dropped_unmatched.load(Ordering::Relaxed)
    }
}

impl<K, A> fmt::Debug for EventCorrelator<K, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("EventCorrelator")
            .field("retained", &pending.len())
            .field("capacity", &pending.capacity())
            .field("dropped_unmatched", &self.dropped_unmatched.load(Ordering::Relaxed))
            .finish()
    }
}

struct StreamShared<K, A> {
    subscribers: SubscriberList<CompletedInterval<K, A>>,
    disposed: AtomicBool,
}

/// An [`EventCorrelator`] whose completed intervals are pushed to subscribers.
///
/// Delivery happens after the correlator lock is released, on the thread that
/// reported the end.
pub struct IntervalStream<K, A> {
    correlator: EventCorrelator<K, A>,
    shared: Arc<StreamShared<K, A>>,
}

impl<K, A> IntervalStream<K, A>
where
    K: PartialEq + Clone + fmt::Debug + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            correlator: EventCorrelator::new(capacity)?,
            shared: Arc::new(StreamShared {
                subscribers: SubscriberList::new(),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn correlator(&self) -> &EventCorrelator<K, A> {
        &self.correlator
    }

    pub fn subscribe(
        &self,
        observer: ObserverRef<CompletedInterval<K, A>>,
    ) -> Result<Subscription> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(MetricsError::AlreadyDisposed("interval stream"));
        }

        let id = self.shared.subscribers.insert(observer);
        let shared: Weak<StreamShared<K, A>> = Arc::downgrade(&self.shared);

        Ok(Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.subscribers.remove(id);
            }
        }))
    }

    pub fn on_begin(&self, key: K, attributes: A, timestamp: Timestamp) {
        self.correlator.on_begin(key, attributes, timestamp);
    }

    pub fn on_end(&self, key: &K, timestamp: Timestamp) -> Option<CompletedInterval<K, A>> {
        let completed = self.correlator.on_end(key, timestamp)?;
        self.shared.subscribers.publish(&completed);
        Some(completed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Completes every subscriber. Idempotent.
    pub fn dispose(&self) {
        if !self.shared.disposed.swap(true, Ordering::SeqCst) {
            self.shared.subscribers.complete_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::{ChannelObserver, FnObserver};
    use std::thread;

    fn at(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn begin_then_end_yields_duration() {
        let correlator = EventCorrelator::new(DEFAULT_CAPACITY).unwrap();
        correlator.on_begin(7_u64, "gen0", at(10));

        let interval = correlator.on_end(&7, at(15)).unwrap();

        assert_eq!(interval.duration(), Duration::from_millis(5));
        assert_eq!(*interval.attributes(), "gen0");
        assert_eq!(*interval.started_at(), at(10));
    }

    #[test]
    fn unknown_key_does_not_match() {
        let correlator = EventCorrelator::new(4).unwrap();
        correlator.on_begin(1_u64, (), at(0));

        assert!(correlator.on_end(&2, at(1)).is_none());
        assert_eq!(correlator.pending(), 1);
    }

    #[test]
    fn duplicate_end_is_reported_once() {
        let correlator = EventCorrelator::new(4).unwrap();
        correlator.on_begin(1_u64, (), at(0));

        assert!(correlator.on_end(&1, at(3)).is_some());
        assert!(correlator.on_end(&1, at(4)).is_none());
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn oldest_begin_ages_out_beyond_capacity() {
        let capacity = 4;
        let correlator = EventCorrelator::new(capacity).unwrap();
        for key in 0..=capacity as u64 {
            correlator.on_begin(key, (), at(key));
        }

        assert!(correlator.on_end(&0, at(100)).is_none());
        assert!(correlator.on_end(&1, at(100)).is_some());
        assert_eq!(correlator.dropped_unmatched(), 1);
    }

    #[test]
    fn matched_entries_age_out_silently() {
        let correlator = EventCorrelator::new(2).unwrap();
        correlator.on_begin(1_u64, (), at(0));
        correlator.on_end(&1, at(1));
        correlator.on_begin(2, (), at(2));
        correlator.on_begin(3, (), at(3));

        assert_eq!(correlator.dropped_unmatched(), 0);
    }

    #[test]
    fn newest_begin_wins_on_key_collision() {
        let correlator = EventCorrelator::new(4).unwrap();
        correlator.on_begin("lookup", 1, at(0));
        correlator.on_begin("lookup", 2, at(5));

        let interval = correlator.on_end(&"lookup", at(6)).unwrap();
        assert_eq!(*interval.attributes(), 2);
        assert_eq!(interval.duration(), Duration::from_millis(1));
    }

    #[test]
    fn end_before_begin_saturates_to_zero() {
        let correlator = EventCorrelator::new(4).unwrap();
        correlator.on_begin(1_u64, (), at(20));

        let interval = correlator.on_end(&1, at(10)).unwrap();
        assert_eq!(interval.duration(), Duration::ZERO);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(EventCorrelator::<u64, ()>::new(0).is_err());
    }

    #[test]
    fn concurrent_feeds_match_every_interval() {
        let correlator = Arc::new(EventCorrelator::new(256).unwrap());
        let matched = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..4_u64)
            .map(|thread_id| {
                let correlator = correlator.clone();
                let matched = matched.clone();
                thread::spawn(move || {
                    for sequence in 0..50_u64 {
                        let key = (thread_id, sequence);
                        correlator.on_begin(key, (), Timestamp::now());
                        if correlator.on_end(&key, Timestamp::now()).is_some() {
                            matched.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(matched.load(Ordering::Relaxed), 200);
    }

    #[tokio::test]
    async fn stream_delivers_completed_intervals() {
        let stream = IntervalStream::<String, u16>::new(8).unwrap();
        let (observer, mut receiver) =
            ChannelObserver::<CompletedInterval<String, u16>>::channel(8);
        let _subscription = stream.subscribe(Arc::new(observer)).unwrap();

        stream.on_begin("dns:example.org#1".to_string(), 53_u16, at(100));
        assert!(stream.on_end(&"unknown".to_string(), at(101)).is_none());
        stream.on_end(&"dns:example.org#1".to_string(), at(140));

        let interval = receiver.recv().await.unwrap();
        assert_eq!(interval.key(), "dns:example.org#1");
        assert_eq!(interval.duration(), Duration::from_millis(40));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn disposed_subscription_stops_delivery() {
        let stream = IntervalStream::<u64, ()>::new(8).unwrap();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let subscription = stream
            .subscribe(Arc::new(FnObserver::<CompletedInterval<u64, ()>, _>::new(
                move |_: &CompletedInterval<u64, ()>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )))
            .unwrap();

        stream.on_begin(1, (), at(0));
        stream.on_end(&1, at(1));
        subscription.dispose();
        stream.on_begin(2, (), at(2));
        stream.on_end(&2, at(3));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(stream.subscriber_count(), 0);
    }

    #[test]
    fn subscribe_after_dispose_fails() {
        let stream = IntervalStream::<u64, ()>::new(8).unwrap();
        stream.dispose();
        stream.dispose();

        let observer = FnObserver::<CompletedInterval<u64, ()>, _>::new(|_: &_| {});
        assert!(matches!(
            stream.subscribe(Arc::new(observer)),
            Err(MetricsError::AlreadyDisposed(_))
        ));
    }
}
