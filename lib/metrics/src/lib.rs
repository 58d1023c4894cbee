//! Collection-and-delivery engine shared by every system collector.
//!
//! Counters flow through a [`rate::RateEngine`] into snapshots, snapshots are
//! throttled by a [`cache::ThrottlingCache`] and fanned out to subscribers by a
//! [`broadcast::BroadcastScheduler`]. Begin/end trace notifications are paired
//! into intervals by a [`correlator::EventCorrelator`].

pub mod broadcast;
pub mod cache;
pub mod collector;
pub mod correlator;
pub mod error;
pub mod manager;
pub mod metric;
pub mod rate;
pub mod ring;
pub mod subscriber;

pub use error::{MetricsError, Result};
