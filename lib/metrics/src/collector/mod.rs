use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use sysinfo::System;

pub mod counter;
pub mod cpu;
pub mod memory;
pub mod network;
pub mod process;

pub use counter::{CounterRateCollector, CounterSource};

/// Produces one snapshot per call.
///
/// Schedulers and caches call `collect` from a single context at a time, but
/// implementations must still be `Sync` because the handle is shared.
#[async_trait]
pub trait Collector: Send + Sync {
    type Output: Send + 'static;

    fn name(&self) -> &str;

    async fn collect(&self) -> anyhow::Result<Self::Output>;
}

/// A reference-counted, type-erased [`Collector`].
pub type CollectorRef<T> = Arc<dyn Collector<Output = T>>;

/// A shared, lockable [`System`] handle used by the sysinfo collectors.
pub type SystemRef = Arc<Mutex<System>>;

/// Adapts an async closure into a [`Collector`].
pub struct FnCollector<F> {
    name: String,
    produce: F,
}

impl<F> FnCollector<F> {
    pub fn new(name: impl Into<String>, produce: F) -> Self {
        Self {
            name: name.into(),
            produce,
        }
    }
}

#[async_trait]
impl<F, Fut, T> Collector for FnCollector<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send,
    T: Send + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self) -> anyhow::Result<T> {
        (self.produce)().await
    }
}
