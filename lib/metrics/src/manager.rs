use crate::{
    broadcast::BroadcastScheduler,
    cache::ThrottlingCache,
    collector::{Collector, CollectorRef},
    correlator::IntervalStream,
    error::{MetricsError, Result},
    metric::{Metric, MetricKind},
    subscriber::{Observer, ObserverRef, Subscription},
};
use async_trait::async_trait;
use common::Timestamp;
use core::fmt;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// A reference-counted reference to a [`MetricsManager`].
pub type MetricsManagerRef = Arc<MetricsManager>;

/// One registered collector, throttled and scheduled.
struct Registered {
    cache: Arc<ThrottlingCache<Metric>>,
    scheduler: BroadcastScheduler<Metric>,
}

/// Identifies one collection run: the kind and a manager-wide sequence number.
pub type CollectionKey = (MetricKind, u64);

/// Begin/end intervals of every collection that actually ran.
pub type CollectionIntervals = IntervalStream<CollectionKey, MetricKind>;

/// Reports each run of the wrapped collector to the interval stream.
struct Timed {
    kind: MetricKind,
    inner: CollectorRef<Metric>,
    sequence: Arc<AtomicU64>,
    intervals: Arc<CollectionIntervals>,
}

#[async_trait]
impl Collector for Timed {
    type Output = Metric;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn collect(&self) -> anyhow::Result<Metric> {
        let key = (self.kind, self.sequence.fetch_add(1, Ordering::Relaxed));
        self.intervals.on_begin(key, self.kind, Timestamp::now());
        let outcome = self.inner.collect().await;
        self.intervals.on_end(&key, Timestamp::now());
        outcome
    }
}

/// Records every delivered metric as the latest value of its kind before
/// handing it on.
struct Recording {
    latest: Arc<DashMap<MetricKind, Metric>>,
    downstream: ObserverRef<Metric>,
}

impl Observer<Metric> for Recording {
    fn on_next(&self, metric: &Metric) {
        self.latest.insert(metric.kind(), metric.clone());
        self.downstream.on_next(metric);
    }

    fn on_error(&self, error: &MetricsError) {
        self.downstream.on_error(error);
    }

    fn on_completed(&self) {
        self.downstream.on_completed();
    }
}

/// Entry point tying collectors, caches and schedulers together per
/// [`MetricKind`].
pub struct MetricsManager {
    registered: DashMap<MetricKind, Registered>,
    latest: Arc<DashMap<MetricKind, Metric>>,
    intervals: Arc<CollectionIntervals>,
    sequence: Arc<AtomicU64>,
    cache_ttl: Duration,
    disposed: AtomicBool,
}

impl fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsManager")
            .field("kinds", &self.kinds())
            .field("latest", &self.latest)
            .field("intervals", self.intervals.correlator())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl MetricsManager {
    /// `correlator_capacity` bounds how many unfinished collections the
    /// timing stream remembers.
    pub fn new(cache_ttl: Duration, correlator_capacity: usize) -> Result<Self> {
        Ok(Self {
            registered: DashMap::new(),
            latest: Arc::new(DashMap::new()),
            intervals: Arc::new(IntervalStream::new(correlator_capacity)?),
            sequence: Arc::new(AtomicU64::new(0)),
            cache_ttl,
            disposed: AtomicBool::new(false),
        })
    }

    /// Registers `collector` as the source of `kind`, replacing (and
    /// disposing) any earlier registration.
    pub fn register_collector(
        &self,
        kind: MetricKind,
        collector: impl Collector<Output = Metric> + 'static,
    ) -> Result<()> {
        self.ensure_live()?;

        let collector: CollectorRef<Metric> = Arc::new(Timed {
            kind,
            inner: Arc::new(collector),
            sequence: self.sequence.clone(),
            intervals: self.intervals.clone(),
        });
        let cache = Arc::new(ThrottlingCache::new(collector, self.cache_ttl));
        let scheduler = BroadcastScheduler::new(cache.clone() as CollectorRef<Metric>);

        debug!(%kind, collector = cache.name(), "Registering collector");
        if let Some(previous) = self.registered.insert(kind, Registered { cache, scheduler }) {
            warn!(%kind, "Replacing previously registered collector");
            previous.scheduler.dispose();
        }
        Ok(())
    }

    /// Kinds with a registered collector, in declaration order.
    pub fn kinds(&self) -> Vec<MetricKind> {
        let mut kinds: Vec<_> = self.registered.iter().map(|entry| *entry.key()).collect();
        kinds.sort();
        kinds
    }

    /// Streams `kind` to `observer` every `period`.
    pub fn subscribe(
        &self,
        kind: MetricKind,
        period: Duration,
        observer: ObserverRef<Metric>,
    ) -> Result<Subscription> {
        self.ensure_live()?;

        let registered = self
            .registered
            .get(&kind)
            .ok_or_else(|| MetricsError::UnknownMetric(kind.to_string()))?;

        let recording = Arc::new(Recording {
            latest: self.latest.clone(),
            downstream: observer,
        });
        registered.scheduler.subscribe(period, recording)
    }

    /// Collects `kind` once, through its cache.
    #[instrument(skip(self))]
    pub async fn collect(&self, kind: MetricKind) -> Result<Metric> {
        self.ensure_live()?;

        let cache = self
            .registered
            .get(&kind)
            .map(|entry| entry.cache.clone())
            .ok_or_else(|| MetricsError::UnknownMetric(kind.to_string()))?;

        let metric = cache.obtain().await?;
        self.latest.insert(kind, metric.clone());
        Ok(metric)
    }

    /// Collects every registered kind once. Failing kinds are logged and left out.
    pub async fn collect_all(&self) -> Vec<Metric> {
        let mut collected = Vec::new();

        for kind in self.kinds() {
            match self.collect(kind).await {
                Ok(metric) => collected.push(metric),
                Err(error) => warn!(%kind, %error, "Skipping metric"),
            }
        }

        collected
    }

    /// How long each collection took, as it finishes. Cache hits are not
    /// collections and do not show up here.
    pub fn collection_intervals(&self) -> &CollectionIntervals {
        &self.intervals
    }

    pub fn latest(&self, kind: MetricKind) -> Option<Metric> {
        self.latest.get(&kind).map(|entry| entry.value().clone())
    }

    /// The latest value of every kind as a JSON object keyed by kind name.
    pub fn get_metrics(&self) -> serde_json::Result<String> {
        let all_metrics: BTreeMap<String, Metric> = self
            .latest
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();

        serde_json::to_string(&all_metrics)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops every polling loop. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let kinds = self.kinds();
        for kind in &kinds {
            if let Some((_, registered)) = self.registered.remove(kind) {
                registered.scheduler.dispose();
            }
        }
        self.intervals.dispose();
        info!(kinds = kinds.len(), "Metrics manager disposed");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(MetricsError::AlreadyDisposed("metrics manager"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::FnCollector;
    use crate::correlator::CompletedInterval;
    use crate::metric::{CpuUsage, MemoryUsage};
    use crate::subscriber::ChannelObserver;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    const TTL: Duration = Duration::from_millis(50);
    const CAPACITY: usize = 8;

    fn cpu_collector(calls: Arc<AtomicUsize>) -> impl Collector<Output = Metric> {
        FnCollector::new("cpu", move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, anyhow::Error>(Metric::CpuUsage(
                    CpuUsage::builder()
                        .usage_percentage(n as f32)
                        .core_count(4)
                        .build(),
                ))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn collect_goes_through_the_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        manager
            .register_collector(MetricKind::CpuUsage, cpu_collector(calls.clone()))
            .unwrap();

        let first = manager.collect(MetricKind::CpuUsage).await.unwrap();
        let second = manager.collect(MetricKind::CpuUsage).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.latest(MetricKind::CpuUsage), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_records_latest_value() {
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        manager
            .register_collector(MetricKind::CpuUsage, cpu_collector(Arc::default()))
            .unwrap();
        let (observer, mut rx) = ChannelObserver::<Metric>::channel(4);

        let _subscription = manager
            .subscribe(MetricKind::CpuUsage, Duration::from_millis(100), Arc::new(observer))
            .unwrap();
        let received = rx.recv().await.unwrap();

        assert_eq!(received.kind(), MetricKind::CpuUsage);
        assert_eq!(manager.latest(MetricKind::CpuUsage), Some(received));
    }

    #[tokio::test(start_paused = true)]
    async fn collections_are_timed_but_cache_hits_are_not() {
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        manager
            .register_collector(MetricKind::CpuUsage, cpu_collector(Arc::default()))
            .unwrap();
        let (observer, mut rx) =
            ChannelObserver::<CompletedInterval<CollectionKey, MetricKind>>::channel(4);
        let _timing = manager
            .collection_intervals()
            .subscribe(Arc::new(observer))
            .unwrap();

        manager.collect(MetricKind::CpuUsage).await.unwrap();
        manager.collect(MetricKind::CpuUsage).await.unwrap();

        let interval = rx.recv().await.unwrap();
        assert_eq!(*interval.attributes(), MetricKind::CpuUsage);
        assert_eq!(interval.key().0, MetricKind::CpuUsage);
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.collection_intervals().correlator().pending(), 0);
    }

    #[test]
    fn zero_correlator_capacity_is_rejected() {
        assert!(matches!(
            MetricsManager::new(TTL, 0),
            Err(MetricsError::InvalidCapacity)
        ));
    }

    #[tokio::test]
    async fn unregistered_kind_is_unknown() {
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        let (observer, _rx) = ChannelObserver::<Metric>::channel(1);

        assert!(matches!(
            manager.subscribe(MetricKind::NetworkIO, TTL, Arc::new(observer)),
            Err(MetricsError::UnknownMetric(name)) if name == "network"
        ));
        assert!(matches!(
            manager.collect(MetricKind::NetworkIO).await,
            Err(MetricsError::UnknownMetric(_))
        ));
    }

    #[tokio::test]
    async fn collect_all_skips_failing_kinds() {
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        manager
            .register_collector(MetricKind::CpuUsage, cpu_collector(Arc::default()))
            .unwrap();
        manager
            .register_collector(
                MetricKind::MemoryUsage,
                FnCollector::new("memory", || async {
                    Err::<Metric, _>(anyhow!("meminfo unreadable"))
                }),
            )
            .unwrap();

        let collected = manager.collect_all().await;

        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].kind(), MetricKind::CpuUsage);
    }

    #[tokio::test]
    async fn get_metrics_renders_latest_values_as_json() {
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        manager
            .register_collector(
                MetricKind::MemoryUsage,
                FnCollector::new("memory", || async {
                    Ok::<_, anyhow::Error>(Metric::MemoryUsage(
                        MemoryUsage::builder().used_mb(512).total_mb(2048).build(),
                    ))
                }),
            )
            .unwrap();
        assert_eq!(manager.get_metrics().unwrap(), "{}");

        manager.collect(MetricKind::MemoryUsage).await.unwrap();
        let rendered: serde_json::Value =
            serde_json::from_str(&manager.get_metrics().unwrap()).unwrap();

        assert_eq!(rendered["memory"]["MemoryUsage"]["used_mb"], 512);
        assert_eq!(rendered["memory"]["MemoryUsage"]["total_mb"], 2048);
    }

    #[tokio::test]
    async fn disposed_manager_rejects_operations() {
        let manager = MetricsManager::new(TTL, CAPACITY).unwrap();
        manager
            .register_collector(MetricKind::CpuUsage, cpu_collector(Arc::default()))
            .unwrap();

        manager.dispose();
        manager.dispose();

        assert!(manager.is_disposed());
        assert!(manager.kinds().is_empty());
        assert!(matches!(
            manager.collect(MetricKind::CpuUsage).await,
            Err(MetricsError::AlreadyDisposed(_))
        ));
        assert!(matches!(
            manager.register_collector(MetricKind::CpuUsage, cpu_collector(Arc::default())),
            Err(MetricsError::AlreadyDisposed(_))
        ));
    }
}
