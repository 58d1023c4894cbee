use super::{Collector, SystemRef};
use crate::metric::{MemoryUsage, Metric};
use async_trait::async_trait;
use getset::Getters;
use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::instrument;
use typed_builder::TypedBuilder;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct MemoryUsageCollector {
    system: SystemRef,
}

impl Default for MemoryUsageCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUsageCollector {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );

        MemoryUsageCollector::builder()
            .system(Arc::new(Mutex::new(system)))
            .build()
    }
}

#[async_trait]
impl Collector for MemoryUsageCollector {
    type Output = Metric;

    fn name(&self) -> &str {
        "memory"
    }

    #[instrument(skip(self))]
    async fn collect(&self) -> anyhow::Result<Metric> {
        let mut system = self.system.lock();
        system.refresh_memory();

        Ok(Metric::MemoryUsage(
            MemoryUsage::builder()
                .used_mb(system.used_memory() / BYTES_PER_MB)
                .total_mb(system.total_memory() / BYTES_PER_MB)
                .build(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn used_memory_never_exceeds_total() {
        let collector = MemoryUsageCollector::new();

        let Metric::MemoryUsage(usage) = collector.collect().await.unwrap() else {
            panic!("expected a memory metric");
        };
        assert!(*usage.total_mb() > 0);
        assert!(usage.used_mb() <= usage.total_mb());
    }
}
