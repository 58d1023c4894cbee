//! Shared configuration, clock and tracing helpers for the sysmon workspace.

pub mod config;

pub mod util {
    pub mod time;
    pub mod trace;
}

pub use config::{ConfigError, MonitorConfig};
pub use util::time::Timestamp;
