use super::{Collector, SystemRef};
use crate::metric::{CpuUsage, Metric};
use async_trait::async_trait;
use getset::Getters;
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::{instrument, trace};
use typed_builder::TypedBuilder;

/// Global CPU usage.
///
/// Usage is computed by sysinfo from the difference between two refreshes, so
/// the very first collection reports 0% and later ones cover the time since
/// the previous collection.
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct CpuUsageCollector {
    system: SystemRef,
}

impl Default for CpuUsageCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuUsageCollector {
    pub fn new() -> Self {
        let system =
            System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()));

        CpuUsageCollector::builder()
            .system(Arc::new(Mutex::new(system)))
            .build()
    }
}

#[async_trait]
impl Collector for CpuUsageCollector {
    type Output = Metric;

    fn name(&self) -> &str {
        "cpu"
    }

    #[instrument(skip(self))]
    async fn collect(&self) -> anyhow::Result<Metric> {
        let mut system = self.system.lock();
        system.refresh_cpu();

        let usage = system.global_cpu_info().cpu_usage();
        let cores = system.cpus().len();
        trace!(usage, cores, "Refreshed CPU usage");

        Ok(Metric::CpuUsage(
            CpuUsage::builder()
                .usage_percentage(usage)
                .core_count(cores)
                .build(),
        ))
    }
}
