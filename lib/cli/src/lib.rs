use clap::{command, Args, Parser, Subcommand};
use getset::Getters;
use std::path::PathBuf;

/// sysmon: system and runtime counter sampling
#[derive(Debug, Parser, Getters)]
#[command(name = "sysmon")]
#[command(about = "sysmon: sample system counters and stream them as metrics", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file; missing files fall back to defaults
    #[arg(short, long, global = true, default_value = "sysmon.toml")]
    #[getset(get = "pub")]
    config: PathBuf,
    #[command(subcommand)]
    #[getset(get = "pub")]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Stream every enabled metric to the log until interrupted
    Watch(WatchArgs),
    /// Collect every enabled metric once and print it as JSON
    Snapshot(SnapshotArgs),
}

#[derive(Debug, Args, Getters)]
pub struct WatchArgs {
    /// Sampling period in milliseconds, overriding the configured one
    #[arg(short, long)]
    #[getset(get = "pub")]
    period_ms: Option<u64>,
    /// Metric kinds to watch (cpu, memory, network, process), overriding the configured ones
    #[arg(short, long = "metric")]
    #[getset(get = "pub")]
    metrics: Vec<String>,
}

#[derive(Debug, Args, Getters)]
pub struct SnapshotArgs {
    /// Pretty-print the JSON output
    #[arg(short, long)]
    #[getset(get = "pub")]
    pretty: bool,
}
