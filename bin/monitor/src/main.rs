use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, SnapshotArgs, WatchArgs};
use common::{
    util::{time::format_duration, trace::initialize_tracing},
    MonitorConfig,
};
use metrics::{
    collector::{
        cpu::CpuUsageCollector, memory::MemoryUsageCollector, network::NetworkIoCollector,
        process::ProcessCollector,
    },
    correlator::CompletedInterval,
    manager::{CollectionKey, MetricsManager},
    metric::{Metric, MetricKind},
    subscriber::FnObserver,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config_path = args.config().to_string_lossy();
    let config = MonitorConfig::load_from_file_and_env(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    initialize_tracing(config.log_level())?;
    info!("sysmon started");

    match args.command() {
        Commands::Watch(watch) => run_watch(&config, watch).await,
        Commands::Snapshot(snapshot) => run_snapshot(&config, snapshot).await,
    }
}

type CollectionInterval = CompletedInterval<CollectionKey, MetricKind>;

fn log_collection_time(interval: &CollectionInterval) {
    debug!(
        kind = %interval.attributes(),
        took = %format_duration(interval.duration()),
        "Collection finished"
    );
}

/// Builds a manager with a collector for each of `names`.
fn build_manager(config: &MonitorConfig, names: &[String]) -> anyhow::Result<MetricsManager> {
    let manager = MetricsManager::new(config.cache_ttl(), *config.correlator_capacity())?;

    for name in names {
        let kind = MetricKind::from_str(name)?;
        match kind {
            MetricKind::CpuUsage => manager.register_collector(kind, CpuUsageCollector::new())?,
            MetricKind::MemoryUsage => {
                manager.register_collector(kind, MemoryUsageCollector::new())?
            }
            MetricKind::NetworkIO => manager.register_collector(kind, NetworkIoCollector::new())?,
            MetricKind::ProcessUsage => {
                manager.register_collector(kind, ProcessCollector::current()?)?
            }
            MetricKind::CounterRate => {
                warn!(%kind, "Counter sources are registered programmatically, skipping");
            }
        }
    }

    Ok(manager)
}

async fn run_watch(config: &MonitorConfig, args: &WatchArgs) -> anyhow::Result<()> {
    let names = if args.metrics().is_empty() {
        config.collectors()
    } else {
        args.metrics()
    };
    let period = args
        .period_ms()
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.period());

    let manager = build_manager(config, names)?;
    let observer = Arc::new(FnObserver::<Metric, _>::new(|metric: &Metric| {
        metric.log_metric()
    }));

    let timing = manager
        .collection_intervals()
        .subscribe(Arc::new(FnObserver::<CollectionInterval, _>::new(log_collection_time)))?;

    let mut subscriptions = Vec::new();
    for kind in manager.kinds() {
        subscriptions.push(manager.subscribe(kind, period, observer.clone())?);
    }
    info!(kinds = subscriptions.len(), period_ms = period.as_millis() as u64, "Watching");

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    for subscription in &subscriptions {
        subscription.dispose();
    }
    timing.dispose();

    let unfinished = manager.collection_intervals().correlator().dropped_unmatched();
    if unfinished > 0 {
        warn!(unfinished, "Some collections never finished");
    }
    manager.dispose();

    Ok(())
}

async fn run_snapshot(config: &MonitorConfig, args: &SnapshotArgs) -> anyhow::Result<()> {
    let manager = build_manager(config, config.collectors())?;
    manager.collect_all().await;

    let rendered = manager.get_metrics()?;
    if *args.pretty() {
        let value: serde_json::Value = serde_json::from_str(&rendered)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", rendered);
    }

    manager.dispose();
    Ok(())
}
