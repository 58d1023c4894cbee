//! The consumer side of every metric stream.

use crate::error::MetricsError;
use core::fmt;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace, warn};

/// Receives values from a stream.
///
/// Callbacks run on the producer's task, so implementations must return
/// quickly; hand the value off (see [`ChannelObserver`]) when the work is slow.
pub trait Observer<T>: Send + Sync {
    fn on_next(&self, value: &T);

    /// A non-fatal error. Streams only forward errors when configured to.
    fn on_error(&self, _error: &MetricsError) {}

    /// The stream has shut down and will not deliver anything else.
    fn on_completed(&self) {}
}

/// A reference-counted reference to an [`Observer`].
pub type ObserverRef<T> = Arc<dyn Observer<T>>;

/// Subscriber ids are unique across every list in the process, so a stale
/// handle can never remove somebody else's subscription.
static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

pub type SubscriberId = u64;

type Entries<T> = Arc<Vec<(SubscriberId, ObserverRef<T>)>>;

/// Copy-on-write list of observers.
///
/// Mutations rebuild the vector under the lock; readers grab the current `Arc`
/// and iterate without holding anything.
pub struct SubscriberList<T> {
    entries: Mutex<Entries<T>>,
}

impl<T> Default for SubscriberList<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Arc::new(Vec::new())),
        }
    }
}

impl<T> SubscriberList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, observer: ObserverRef<T>) -> SubscriberId {
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();

        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push((id, observer));
        *entries = Arc::new(next);

        id
    }

    /// Removes `id`, returning how many subscribers remain, or `None` if the id
    /// was not in this list.
    pub fn remove(&self, id: SubscriberId) -> Option<usize> {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|(existing, _)| *existing == id) {
            return None;
        }

        let next: Vec<_> = entries
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        let remaining = next.len();
        *entries = Arc::new(next);

        Some(remaining)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time view of the current subscribers.
    pub fn snapshot(&self) -> SubscriberSnapshot<T> {
        SubscriberSnapshot(Arc::clone(&self.entries.lock()))
    }

    pub fn publish(&self, value: &T) {
        self.snapshot().deliver(value);
    }

    pub fn publish_error(&self, error: &MetricsError) {
        self.snapshot().deliver_error(error);
    }

    /// Signals completion to everyone and empties the list.
    pub fn complete_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for (_, observer) in entries.iter() {
            observer.on_completed();
        }
    }
}

impl<T> fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberList")
            .field("len", &self.len())
            .finish()
    }
}

/// Subscribers captured at one instant. Delivery iterates this, never the live list.
pub struct SubscriberSnapshot<T>(Entries<T>);

impl<T> SubscriberSnapshot<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The captured subscribers that are still present in `live`.
    ///
    /// Subscribers that joined `live` after the capture stay excluded.
    pub fn still_in(&self, live: &SubscriberList<T>) -> SubscriberSnapshot<T> {
        let current = live.snapshot();
        let retained: Vec<_> = self
            .0
            .iter()
            .filter(|(id, _)| current.0.iter().any(|(live_id, _)| live_id == id))
            .cloned()
            .collect();
        SubscriberSnapshot(Arc::new(retained))
    }

    /// Hands `value` to every captured subscriber. A panicking observer is
    /// logged and skipped; the others still receive the value.
    pub fn deliver(&self, value: &T) {
        for (id, observer) in self.0.iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| observer.on_next(value))).is_err() {
                warn!(subscriber = id, "Observer panicked in on_next");
            }
        }
    }

    pub fn deliver_error(&self, error: &MetricsError) {
        for (id, observer) in self.0.iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| observer.on_error(error))).is_err() {
                warn!(subscriber = id, "Observer panicked in on_error");
            }
        }
    }
}

/// Handle returned by every `subscribe` call.
///
/// Disposing (explicitly or by dropping the handle) unsubscribes; repeated
/// disposal is a no-op.
pub struct Subscription {
    unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub(crate) fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Mutex::new(Some(Box::new(unsubscribe))),
        }
    }

    pub fn dispose(&self) {
        // the guard is released before the callback runs
        let unsubscribe = self.unsubscribe.lock().take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.unsubscribe.lock().is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Adapts a closure into an [`Observer`] that only cares about values.
pub struct FnObserver<T, F> {
    callback: F,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F> FnObserver<T, F>
where
    F: Fn(&T) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

impl<T, F> Observer<T> for FnObserver<T, F>
where
    F: Fn(&T) + Send + Sync,
{
    fn on_next(&self, value: &T) {
        (self.callback)(value)
    }
}

/// Forwards values into a bounded channel without ever waiting.
///
/// A full channel drops the value so a slow consumer cannot stall the
/// producer. Completion is observed as the receiver closing once the stream
/// releases the observer.
#[derive(Debug, Clone)]
pub struct ChannelObserver<T> {
    sender: mpsc::Sender<T>,
}

impl<T> ChannelObserver<T> {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl<T> Observer<T> for ChannelObserver<T>
where
    T: Clone + Send + Sync,
{
    fn on_next(&self, value: &T) {
        match self.sender.try_send(value.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Subscriber channel full, dropping value"),
            Err(TrySendError::Closed(_)) => trace!("Subscriber channel closed"),
        }
    }
}
