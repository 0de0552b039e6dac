use crate::config::ConfigError;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;

/// One physical quantity read from a device register.
///
/// `value = raw / divisor`; the divisor is a property of the wiring/firmware
/// variant and comes from the register map document, never from code.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSpec {
    pub name: String,
    pub register: String,
    pub divisor: f64,
    pub unit: String,
    pub device_class: String,
    pub state_class: String,
    pub display_name: String,
    pub topic: String,
    pub unique_id: String,
}

/// A boolean signal derived from the sum of other metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSpec {
    pub name: String,
    pub display_name: String,
    pub sources: Vec<String>,
    pub threshold: f64,
    pub device_class: String,
    pub topic: String,
    pub unique_id: String,
}

/// Logical device record every published entity is grouped under.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

/// Immutable, ordered table of everything the bridge publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterMap {
    device: DeviceInfo,
    metrics: Vec<MetricSpec>,
    signals: Vec<SignalSpec>,
    topic_prefix: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterMapFile {
    device: DeviceEntry,
    metrics: Vec<MetricEntry>,
    #[serde(default)]
    signals: Vec<SignalEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceEntry {
    identifier: String,
    name: String,
    #[serde(default)]
    manufacturer: String,
    #[serde(default)]
    model: String,
    unique_id_prefix: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MetricEntry {
    name: String,
    #[serde(deserialize_with = "register_id")]
    register: String,
    divisor: f64,
    unit: String,
    device_class: String,
    #[serde(default = "default_state_class")]
    state_class: String,
    display_name: Option<String>,
    topic: Option<String>,
    unique_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SignalEntry {
    name: String,
    display_name: Option<String>,
    sources: Vec<String>,
    threshold: f64,
    #[serde(default = "default_signal_class")]
    device_class: String,
    topic: Option<String>,
    unique_id: Option<String>,
}

fn default_state_class() -> String {
    "measurement".to_string()
}

fn default_signal_class() -> String {
    "running".to_string()
}

// Devices report register ids as strings ("104") but people write them as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RegisterKey {
    Text(String),
    Number(u64),
}

fn register_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RegisterKey::deserialize(deserializer)? {
        RegisterKey::Text(text) => text,
        RegisterKey::Number(number) => number.to_string(),
    })
}

impl RegisterMap {
    /// Parses and validates a register map document, resolving topics under `topic_prefix`.
    pub fn from_json(document: &str, topic_prefix: &str) -> Result<Self, ConfigError> {
        let file: RegisterMapFile = serde_json::from_str(document)?;
        Self::from_file(file, topic_prefix)
    }

    fn from_file(file: RegisterMapFile, topic_prefix: &str) -> Result<Self, ConfigError> {
        let topic_prefix = topic_prefix.trim_end_matches('/').to_string();
        if topic_prefix.is_empty() {
            return Err(invalid("topic prefix must not be empty"));
        }
        if file.metrics.is_empty() {
            return Err(invalid("at least one metric is required"));
        }

        let uid_prefix = file
            .device
            .unique_id_prefix
            .unwrap_or_else(|| file.device.identifier.clone());
        let device = DeviceInfo {
            identifier: file.device.identifier,
            name: file.device.name,
            manufacturer: file.device.manufacturer,
            model: file.device.model,
        };

        let metrics: Vec<MetricSpec> = file
            .metrics
            .into_iter()
            .map(|entry| MetricSpec {
                topic: resolve_topic(&topic_prefix, entry.topic.as_deref(), &entry.name),
                unique_id: entry
                    .unique_id
                    .unwrap_or_else(|| format!("{uid_prefix}_{}", entry.name)),
                display_name: entry.display_name.unwrap_or_else(|| entry.name.clone()),
                name: entry.name,
                register: entry.register,
                divisor: entry.divisor,
                unit: entry.unit,
                device_class: entry.device_class,
                state_class: entry.state_class,
            })
            .collect();

        let signals: Vec<SignalSpec> = file
            .signals
            .into_iter()
            .map(|entry| SignalSpec {
                topic: resolve_topic(&topic_prefix, entry.topic.as_deref(), &entry.name),
                unique_id: entry
                    .unique_id
                    .unwrap_or_else(|| format!("{uid_prefix}_{}", entry.name)),
                display_name: entry.display_name.unwrap_or_else(|| entry.name.clone()),
                name: entry.name,
                sources: entry.sources,
                threshold: entry.threshold,
                device_class: entry.device_class,
            })
            .collect();

        let map = Self {
            device,
            metrics,
            signals,
            topic_prefix,
        };
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut topics = HashSet::from([self.state_topic(), self.availability_topic()]);
        let mut unique_ids = HashSet::new();

        for metric in &self.metrics {
            if !(metric.divisor.is_finite() && metric.divisor > 0.0) {
                return Err(invalid(format!(
                    "metric `{}` has invalid divisor {}",
                    metric.name, metric.divisor
                )));
            }
            check_entity(
                &metric.name,
                &metric.topic,
                &metric.unique_id,
                &mut names,
                &mut topics,
                &mut unique_ids,
            )?;
        }

        for signal in &self.signals {
            if !signal.threshold.is_finite() {
                return Err(invalid(format!(
                    "signal `{}` has invalid threshold",
                    signal.name
                )));
            }
            if signal.sources.is_empty() {
                return Err(invalid(format!("signal `{}` has no sources", signal.name)));
            }
            if let Some(unknown) = signal
                .sources
                .iter()
                .find(|source| self.metric(source).is_none())
            {
                return Err(invalid(format!(
                    "signal `{}` references unknown metric `{unknown}`",
                    signal.name
                )));
            }
            check_entity(
                &signal.name,
                &signal.topic,
                &signal.unique_id,
                &mut names,
                &mut topics,
                &mut unique_ids,
            )?;
        }
        Ok(())
    }

    /// Replaces the threshold of every derived signal.
    pub fn with_signal_threshold(mut self, threshold: f64) -> Self {
        for signal in &mut self.signals {
            signal.threshold = threshold;
        }
        self
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn metrics(&self) -> &[MetricSpec] {
        &self.metrics
    }

    pub fn signals(&self) -> &[SignalSpec] {
        &self.signals
    }

    pub fn metric(&self, name: &str) -> Option<&MetricSpec> {
        self.metrics.iter().find(|metric| metric.name == name)
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    /// Topic of the aggregate JSON message.
    pub fn state_topic(&self) -> String {
        format!("{}/state", self.topic_prefix)
    }

    /// Retained `online`/`offline` topic for the device link.
    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.topic_prefix)
    }
}

fn resolve_topic(prefix: &str, suffix: Option<&str>, name: &str) -> String {
    let suffix = suffix.unwrap_or(name).trim_matches('/');
    format!("{prefix}/{suffix}")
}

fn check_entity(
    name: &str,
    topic: &str,
    unique_id: &str,
    names: &mut HashSet<String>,
    topics: &mut HashSet<String>,
    unique_ids: &mut HashSet<String>,
) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(invalid("entity names must not be empty"));
    }
    if !names.insert(name.to_string()) {
        return Err(invalid(format!("duplicate name `{name}`")));
    }
    if !topics.insert(topic.to_string()) {
        return Err(invalid(format!("duplicate topic `{topic}`")));
    }
    if !unique_ids.insert(unique_id.to_string()) {
        return Err(invalid(format!("duplicate unique id `{unique_id}`")));
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::RegisterMap(reason.into())
}
