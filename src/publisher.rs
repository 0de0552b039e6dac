use crate::bus::{BusClient, BusError, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::normalizer::{MetricSet, SignalState};
use crate::register_map::{DeviceInfo, RegisterMap};
use crate::state_store::StateStore;
use serde_derive::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Serialize)]
struct DeviceRecord<'a> {
    ids: [&'a str; 1],
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    mf: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    mdl: &'a str,
}

impl<'a> From<&'a DeviceInfo> for DeviceRecord<'a> {
    fn from(device: &'a DeviceInfo) -> Self {
        Self {
            ids: [device.identifier.as_str()],
            name: &device.name,
            mf: &device.manufacturer,
            mdl: &device.model,
        }
    }
}

#[derive(Serialize)]
struct SensorConfig<'a> {
    name: &'a str,
    stat_t: &'a str,
    unit_of_meas: &'a str,
    dev_cla: &'a str,
    stat_cla: &'a str,
    uniq_id: &'a str,
    avty_t: &'a str,
    dev: DeviceRecord<'a>,
}

#[derive(Serialize)]
struct BinarySensorConfig<'a> {
    name: &'a str,
    stat_t: &'a str,
    payload_on: &'static str,
    payload_off: &'static str,
    dev_cla: &'a str,
    uniq_id: &'a str,
    avty_t: &'a str,
    dev: DeviceRecord<'a>,
}

/// A retained configuration document for the home-automation platform.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Outcome of one batch of publishes. Failures are logged, never propagated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Turns metric sets into bus messages.
#[derive(Clone)]
pub struct Publisher<B> {
    bus: B,
    map: Arc<RegisterMap>,
    discovery_prefix: String,
    // Serializes availability publishes
    availability: Arc<Mutex<()>>,
}

impl<B: BusClient> Publisher<B> {
    pub fn new(bus: B, map: Arc<RegisterMap>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            bus,
            map,
            discovery_prefix: discovery_prefix.into(),
            availability: Arc::new(Mutex::new(())),
        }
    }

    /// Builds the discovery documents, one per metric and per signal.
    ///
    /// Output depends only on the register map, so repeated calls are byte-identical.
    /// A document that fails to serialize is left out rather than sent empty,
    /// since an empty retained config removes the entity.
    pub fn discovery_messages(&self) -> Vec<DiscoveryMessage> {
        let availability = self.map.availability_topic();
        let device = self.map.device();
        let mut messages = Vec::with_capacity(self.map.metrics().len() + self.map.signals().len());

        for metric in self.map.metrics() {
            let config = SensorConfig {
                name: &metric.display_name,
                stat_t: &metric.topic,
                unit_of_meas: &metric.unit,
                dev_cla: &metric.device_class,
                stat_cla: &metric.state_class,
                uniq_id: &metric.unique_id,
                avty_t: &availability,
                dev: device.into(),
            };
            let topic = format!("{}/sensor/{}/config", self.discovery_prefix, metric.unique_id);
            if let Some(payload) = to_payload(&topic, &config) {
                messages.push(DiscoveryMessage { topic, payload });
            }
        }

        for signal in self.map.signals() {
            let config = BinarySensorConfig {
                name: &signal.display_name,
                stat_t: &signal.topic,
                payload_on: SignalState::On.payload(),
                payload_off: SignalState::Off.payload(),
                dev_cla: &signal.device_class,
                uniq_id: &signal.unique_id,
                avty_t: &availability,
                dev: device.into(),
            };
            let topic = format!(
                "{}/binary_sensor/{}/config",
                self.discovery_prefix, signal.unique_id
            );
            if let Some(payload) = to_payload(&topic, &config) {
                messages.push(DiscoveryMessage { topic, payload });
            }
        }
        messages
    }

    /// Publishes every discovery document, retained. Called on each bus connect.
    pub fn publish_discovery(&self) -> PublishReport {
        let mut report = PublishReport::default();
        for message in self.discovery_messages() {
            self.send(&mut report, &message.topic, message.payload, true);
        }
        debug!(sent = report.sent, failed = report.failed, "published discovery");
        report
    }

    /// Publishes each metric and signal to its own topic plus the aggregate state.
    pub fn publish_metrics(&self, set: &MetricSet) -> PublishReport {
        let mut report = PublishReport::default();
        let total = set.metrics.len() + set.signals.len() + 1;
        if !self.bus.is_connected() {
            report.skipped = total;
            warn!(
                error = %BusError::Unavailable("not connected".to_string()),
                dropped = total,
                "dropping metrics publish"
            );
            return report;
        }

        for metric in &set.metrics {
            if let Some(spec) = self.map.metric(&metric.name) {
                let payload = Value::from(metric.value).to_string().into_bytes();
                self.send(&mut report, &spec.topic, payload, false);
            }
        }
        for signal in &set.signals {
            if let Some(spec) = self.map.signals().iter().find(|s| s.name == signal.name) {
                let payload = signal.state.payload().as_bytes().to_vec();
                self.send(&mut report, &spec.topic, payload, false);
            }
        }
        let aggregate = set.to_json().to_string().into_bytes();
        self.send(&mut report, &self.map.state_topic(), aggregate, false);
        report
    }

    /// Publishes the retained device availability as currently held by `store`.
    ///
    /// The state is read under the availability lock, so concurrent callers
    /// cannot leave an older state as the retained value.
    pub fn publish_availability(&self, store: &StateStore) -> PublishReport {
        let _guard = self
            .availability
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut report = PublishReport::default();
        if !self.bus.is_connected() {
            report.skipped = 1;
            return report;
        }
        let payload = if store.is_online() {
            PAYLOAD_ONLINE
        } else {
            PAYLOAD_OFFLINE
        };
        self.send(
            &mut report,
            &self.map.availability_topic(),
            payload.as_bytes().to_vec(),
            true,
        );
        report
    }

    fn send(&self, report: &mut PublishReport, topic: &str, payload: Vec<u8>, retain: bool) {
        match self.bus.publish(topic, payload, retain) {
            Ok(()) => report.sent += 1,
            Err(e) => {
                report.failed += 1;
                warn!(topic = %topic, error = %e, "publish failed");
            }
        }
    }
}

fn to_payload<T: serde::Serialize>(topic: &str, value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(topic = %topic, error = %e, "skipping unserializable discovery document");
            None
        }
    }
}
