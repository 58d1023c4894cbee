use super::Collector;
use crate::metric::{Metric, ProcessUsage};
use crate::rate::RateEngine;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::{instrument, warn};

const BYTES_PER_MB: u64 = 1024 * 1024;

struct ProcessState {
    system: System,
    disk_read: RateEngine,
    disk_write: RateEngine,
}

/// Resource usage of one process, the current one by default.
pub struct ProcessCollector {
    pid: Pid,
    state: Mutex<ProcessState>,
}

impl ProcessCollector {
    pub fn current() -> anyhow::Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!(e))?;
        Ok(Self::for_pid(pid))
    }

    pub fn for_pid(pid: Pid) -> Self {
        Self {
            pid,
            state: Mutex::new(ProcessState {
                system: System::new(),
                disk_read: RateEngine::new(),
                disk_write: RateEngine::new(),
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

#[async_trait]
impl Collector for ProcessCollector {
    type Output = Metric;

    fn name(&self) -> &str {
        "process"
    }

    #[instrument(skip(self), fields(pid = %self.pid))]
    async fn collect(&self) -> anyhow::Result<Metric> {
        let mut state = self.state.lock();

        if !state.system.refresh_process(self.pid) {
            warn!("Process disappeared while refreshing");
        }

        let (cpu, memory, read, written) = {
            let process = state
                .system
                .process(self.pid)
                .with_context(|| format!("process {} not found", self.pid))?;
            let disk = process.disk_usage();
            (
                process.cpu_usage(),
                process.memory(),
                disk.total_read_bytes,
                disk.total_written_bytes,
            )
        };

        let disk_read_per_sec = state.disk_read.sample(read as f64);
        let disk_write_per_sec = state.disk_write.sample(written as f64);

        Ok(Metric::ProcessUsage(
            ProcessUsage::builder()
                .cpu_percentage(cpu)
                .resident_mb(memory / BYTES_PER_MB)
                .disk_read_per_sec(disk_read_per_sec)
                .disk_write_per_sec(disk_write_per_sec)
                .build(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_the_current_process() {
        let collector = ProcessCollector::current().unwrap();

        let Metric::ProcessUsage(usage) = collector.collect().await.unwrap() else {
            panic!("expected a process metric");
        };
        assert!(*usage.cpu_percentage() >= 0.0);
        assert!(*usage.disk_read_per_sec() >= 0.0);
    }

    #[tokio::test]
    async fn missing_process_is_an_error() {
        let collector = ProcessCollector::for_pid(Pid::from(u32::MAX as usize));

        assert!(collector.collect().await.is_err());
    }
}
