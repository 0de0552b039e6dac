use crate::poller::RawReading;
use crate::register_map::{RegisterMap, SignalSpec};
use serde_derive::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Value substituted for a register the device did not report.
pub const MISSING_REGISTER_DEFAULT: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalState {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl SignalState {
    pub fn payload(self) -> &'static str {
        match self {
            SignalState::On => "ON",
            SignalState::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalValue {
    pub name: String,
    pub state: SignalState,
}

/// Scaled metrics plus derived signals for one poll, in register map order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSet {
    pub metrics: Vec<MetricValue>,
    pub signals: Vec<SignalValue>,
}

impl MetricSet {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.metrics
            .iter()
            .find(|metric| metric.name == name)
            .map(|metric| metric.value)
    }

    pub fn signal(&self, name: &str) -> Option<SignalState> {
        self.signals
            .iter()
            .find(|signal| signal.name == name)
            .map(|signal| signal.state)
    }

    /// Flat `{name: value}` object used as the aggregate state payload.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        for metric in &self.metrics {
            object.insert(metric.name.clone(), Value::from(metric.value));
        }
        for signal in &self.signals {
            object.insert(signal.name.clone(), Value::from(signal.state.payload()));
        }
        Value::Object(object)
    }
}

/// Applies the register map to a raw reading.
///
/// A missing register yields [`MISSING_REGISTER_DEFAULT`] for that metric only.
pub fn normalize(raw: &RawReading, map: &RegisterMap) -> MetricSet {
    let metrics: Vec<MetricValue> = map
        .metrics()
        .iter()
        .map(|spec| {
            let raw_value = raw.get(&spec.register).copied().unwrap_or_else(|| {
                debug!(metric = %spec.name, register = %spec.register, "register missing from reading");
                MISSING_REGISTER_DEFAULT
            });
            MetricValue {
                name: spec.name.clone(),
                value: raw_value as f64 / spec.divisor,
            }
        })
        .collect();

    let signals = map
        .signals()
        .iter()
        .map(|spec| SignalValue {
            name: spec.name.clone(),
            state: derive_signal(spec, &metrics),
        })
        .collect();

    MetricSet { metrics, signals }
}

/// `On` when the sum of the source metrics strictly exceeds the threshold.
pub fn derive_signal(spec: &SignalSpec, metrics: &[MetricValue]) -> SignalState {
    let total: f64 = metrics
        .iter()
        .filter(|metric| spec.sources.contains(&metric.name))
        .map(|metric| metric.value)
        .sum();
    if total > spec.threshold {
        SignalState::On
    } else {
        SignalState::Off
    }
}
