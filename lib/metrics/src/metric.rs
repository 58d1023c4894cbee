use crate::error::MetricsError;
use core::fmt;
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;
use typed_builder::TypedBuilder;

/// Represents different kinds of metrics that can be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    // Host metrics
    CpuUsage,
    MemoryUsage,
    NetworkIO,

    // Process metrics
    ProcessUsage,

    // Pluggable counter sources (GC, thread pool, ...)
    CounterRate,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::CpuUsage,
        MetricKind::MemoryUsage,
        MetricKind::NetworkIO,
        MetricKind::ProcessUsage,
        MetricKind::CounterRate,
    ];

    /// Short name used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuUsage => "cpu",
            MetricKind::MemoryUsage => "memory",
            MetricKind::NetworkIO => "network",
            MetricKind::ProcessUsage => "process",
            MetricKind::CounterRate => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricsError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| MetricsError::UnknownMetric(name.to_string()))
    }
}

/// Represents a metric with its specific data.
/// Each variant corresponds to a different type of metric being tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Metric {
    // Host metrics
    CpuUsage(CpuUsage),
    MemoryUsage(MemoryUsage),
    NetworkIO(NetworkIO),

    // Process metrics
    ProcessUsage(ProcessUsage),

    // Pluggable counter sources
    CounterRate(CounterRate),
}

/// Metric for tracking CPU usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct CpuUsage {
    /// Global CPU usage percentage (0-100%)
    usage_percentage: f32,
    /// Number of logical CPUs the usage is averaged over.
    core_count: usize,
}

/// Metric for tracking memory usage.
///
/// Memory usage is measured in megabytes (MB).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct MemoryUsage {
    /// Memory currently in use, in megabytes.
    used_mb: u64,
    /// Total installed memory, in megabytes.
    total_mb: u64,
}

/// Metric for tracking network I/O across every interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct NetworkIO {
    /// Bytes received per second since the previous sample.
    received_per_sec: f64,
    /// Bytes sent per second since the previous sample.
    sent_per_sec: f64,
    /// Total bytes received since the interfaces came up.
    total_received: u64,
    /// Total bytes sent since the interfaces came up.
    total_sent: u64,
}

/// Metric for tracking the resource usage of the current process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct ProcessUsage {
    /// Process CPU usage; may exceed 100% on multi-core hosts.
    cpu_percentage: f32,
    /// Resident memory in megabytes.
    resident_mb: u64,
    /// Disk bytes read per second since the previous sample.
    disk_read_per_sec: f64,
    /// Disk bytes written per second since the previous sample.
    disk_write_per_sec: f64,
}

/// Per-second growth of a pluggable counter source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
pub struct CounterRate {
    /// Name of the counter source.
    source: String,
    per_second: f64,
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::CpuUsage(_) => MetricKind::CpuUsage,
            Metric::MemoryUsage(_) => MetricKind::MemoryUsage,
            Metric::NetworkIO(_) => MetricKind::NetworkIO,
            Metric::ProcessUsage(_) => MetricKind::ProcessUsage,
            Metric::CounterRate(_) => MetricKind::CounterRate,
        }
    }

    pub fn log_metric(&self) {
        match self {
            Metric::CpuUsage(data) => info!(
                "CPU Usage: {:.1}% across {} cores",
                data.usage_percentage, data.core_count
            ),
            Metric::MemoryUsage(data) => {
                info!("Memory Usage: {}MB / {}MB", data.used_mb, data.total_mb)
            }
            Metric::NetworkIO(data) => info!(
                "Network I/O - Received: {:.0} B/s, Sent: {:.0} B/s (totals {} / {} bytes)",
                data.received_per_sec, data.sent_per_sec, data.total_received, data.total_sent
            ),
            Metric::ProcessUsage(data) => info!(
                "Process - CPU: {:.1}%, Resident: {}MB, Disk R/W: {:.0} / {:.0} B/s",
                data.cpu_percentage,
                data.resident_mb,
                data.disk_read_per_sec,
                data.disk_write_per_sec
            ),
            Metric::CounterRate(data) => {
                info!("Counter {}: {:.2}/s", data.source, data.per_second)
            }
        }
    }
}
