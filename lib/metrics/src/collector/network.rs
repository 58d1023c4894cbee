use super::Collector;
use crate::metric::{Metric, NetworkIO};
use crate::rate::RateEngine;
use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::Networks;
use tracing::{instrument, trace};

struct NetworkState {
    networks: Networks,
    received: RateEngine,
    sent: RateEngine,
}

/// Byte rates summed over every network interface.
///
/// Interface counters are cumulative, so the rates come from a [`RateEngine`]
/// per direction. The first collection measures from construction time.
pub struct NetworkIoCollector {
    state: Mutex<NetworkState>,
}

impl Default for NetworkIoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkIoCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NetworkState {
                networks: Networks::new_with_refreshed_list(),
                received: RateEngine::new(),
                sent: RateEngine::new(),
            }),
        }
    }
}

#[async_trait]
impl Collector for NetworkIoCollector {
    type Output = Metric;

    fn name(&self) -> &str {
        "network"
    }

    #[instrument(skip(self))]
    async fn collect(&self) -> anyhow::Result<Metric> {
        let mut state = self.state.lock();
        state.networks.refresh();

        let (total_received, total_sent) = state
            .networks
            .list()
            .values()
            .fold((0u64, 0u64), |(rx, tx), data| {
                (
                    rx.saturating_add(data.total_received()),
                    tx.saturating_add(data.total_transmitted()),
                )
            });

        let received_per_sec = state.received.sample(total_received as f64);
        let sent_per_sec = state.sent.sample(total_sent as f64);
        trace!(total_received, total_sent, "Refreshed network counters");

        Ok(Metric::NetworkIO(
            NetworkIO::builder()
                .received_per_sec(received_per_sec)
                .sent_per_sec(sent_per_sec)
                .total_received(total_received)
                .total_sent(total_sent)
                .build(),
        ))
    }
}
