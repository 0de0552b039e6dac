use crate::bus::BusClient;
use crate::device_client::DeviceClient;
use crate::normalizer::normalize;
use crate::poller::{DevicePoller, PollError};
use crate::publisher::{PublishReport, Publisher};
use crate::register_map::RegisterMap;
use crate::state_store::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// What one poll cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Published(PublishReport),
    Failed { error: PollError, went_offline: bool },
}

/// The poll → normalize → store → publish loop. Sole writer of the [`StateStore`].
pub struct Bridge<D, B> {
    poller: DevicePoller<D>,
    map: Arc<RegisterMap>,
    store: StateStore,
    publisher: Publisher<B>,
    poll_interval: Duration,
}

impl<D, B> Bridge<D, B>
where
    D: DeviceClient + 'static,
    B: BusClient,
{
    pub fn new(
        poller: DevicePoller<D>,
        map: Arc<RegisterMap>,
        store: StateStore,
        publisher: Publisher<B>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            poller,
            map,
            store,
            publisher,
            poll_interval,
        }
    }

    /// Spawns the loop in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs a cycle on every tick until the process ends.
    ///
    /// A slow device delays the next tick instead of bunching cycles up.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.poll_interval.as_secs_f64(),
            metrics = self.map.metrics().len(),
            "starting poll loop"
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_cycle().await;
        }
    }

    /// Polls the device once and forwards the result.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        match self.poller.poll().await {
            Ok(raw) => {
                let metrics = normalize(&raw, &self.map);
                info!(state = %metrics.to_json(), "device reading");

                if self.store.write(metrics.clone(), raw) {
                    info!("device online");
                    self.publisher.publish_availability(&self.store);
                }
                CycleOutcome::Published(self.publisher.publish_metrics(&metrics))
            }
            Err(error) => {
                warn!(kind = error.kind(), error = %error, "poll failed");
                let went_offline = self.store.mark_offline(&error);
                if went_offline {
                    warn!("device offline, keeping last known values");
                    self.publisher.publish_availability(&self.store);
                }
                CycleOutcome::Failed {
                    error,
                    went_offline,
                }
            }
        }
    }
}

/// Hook for the bus driver: re-announces discovery and availability on every connect.
pub fn announce_on_connect<B: BusClient>(
    publisher: Publisher<B>,
    store: StateStore,
) -> impl Fn() + Send + 'static {
    move || {
        let report = publisher.publish_discovery();
        publisher.publish_availability(&store);
        info!(
            sent = report.sent,
            failed = report.failed,
            "announced discovery"
        );
    }
}
