//! Process configuration, read from environment variables at startup.

use crate::register_map::RegisterMap;
use std::env;
use std::fmt::Display;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Startup configuration errors. These are the only fatal errors in the bridge.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid register map: {0}")]
    RegisterMap(String),
    #[error("failed to read register map: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse register map: {0}")]
    Json(#[from] serde_json::Error),
}

/// How to reach the metering device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    pub local_key: String,
    pub protocol_version: String,
    pub gateway_url: String,
    pub timeout: Duration,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub client_id: String,
    pub keepalive: Duration,
}

/// Status page settings; the page is only served when `STATUS_LISTEN` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusConfig {
    pub listen: SocketAddr,
    pub refresh: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub discovery_prefix: String,
    pub poll_interval: Duration,
    pub register_map: RegisterMap,
    pub status: Option<StatusConfig>,
}

impl BridgeConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let device = DeviceConfig {
            id: require("DEVICE_ID")?,
            address: require("IP_ADDRESS")?,
            local_key: require("LOCAL_KEY")?,
            protocol_version: get("DEVICE_VERSION").unwrap_or_else(|| "3.4".to_string()),
            gateway_url: get("DEVICE_GATEWAY_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8888".to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout: Duration::from_secs(parse(&get, "DEVICE_TIMEOUT_SECS", 5u64)?),
        };

        let credentials = match (get("MQTT_USER"), get("MQTT_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        let mqtt = MqttConfig {
            host: get("MQTT_HOST").unwrap_or_else(|| "mosquitto".to_string()),
            port: parse(&get, "MQTT_PORT", 1883u16)?,
            credentials,
            client_id: get("MQTT_CLIENT_ID").unwrap_or_else(|| "tuya-energy-bridge".to_string()),
            keepalive: Duration::from_secs(parse(&get, "MQTT_KEEPALIVE_SECS", 60u64)?),
        };

        let poll_secs: u64 = parse(&get, "POLL_INTERVAL_SECS", 10)?;
        if poll_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_SECS",
                reason: "must be at least 1 second".to_string(),
            });
        }

        let topic_prefix = get("TOPIC_PREFIX").unwrap_or_else(|| "bridge/energy".to_string());
        let document = match (get("REGISTER_MAP_FILE"), get("REGISTER_MAP")) {
            (Some(path), None) => fs::read_to_string(path)?,
            (None, Some(inline)) => inline,
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid {
                    key: "REGISTER_MAP",
                    reason: "set either REGISTER_MAP or REGISTER_MAP_FILE, not both".to_string(),
                })
            }
            (None, None) => return Err(ConfigError::Missing("REGISTER_MAP_FILE")),
        };
        let mut register_map = RegisterMap::from_json(&document, &topic_prefix)?;
        if let Some(threshold) = get("ACTIVITY_THRESHOLD") {
            let threshold = parse_value::<f64>("ACTIVITY_THRESHOLD", &threshold)?;
            register_map = register_map.with_signal_threshold(threshold);
        }

        let status = match get("STATUS_LISTEN") {
            Some(listen) => Some(StatusConfig {
                listen: parse_value("STATUS_LISTEN", &listen)?,
                refresh: Duration::from_secs(parse(&get, "STATUS_REFRESH_SECS", 5u64)?.max(1)),
            }),
            None => None,
        };

        Ok(Self {
            device,
            mqtt,
            discovery_prefix: get("DISCOVERY_PREFIX")
                .unwrap_or_else(|| "homeassistant".to_string())
                .trim_end_matches('/')
                .to_string(),
            poll_interval: Duration::from_secs(poll_secs),
            register_map,
            status,
        })
    }
}

fn parse<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("`{raw}`: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_map::tests::DUAL_CLAMP;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, String> {
        HashMap::from([
            ("DEVICE_ID", "eb43fe0ed2c8be5220tg2u".to_string()),
            ("IP_ADDRESS", "192.168.1.40".to_string()),
            ("LOCAL_KEY", "secret".to_string()),
            ("REGISTER_MAP", DUAL_CLAMP.to_string()),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<BridgeConfig, ConfigError> {
        BridgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_env()).unwrap();

        assert_eq!(config.device.protocol_version, "3.4");
        assert_eq!(config.device.gateway_url, "http://127.0.0.1:8888");
        assert_eq!(config.device.timeout, Duration::from_secs(5));
        assert_eq!(config.mqtt.host, "mosquitto");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.credentials, None);
        assert_eq!(config.mqtt.keepalive, Duration::from_secs(60));
        assert_eq!(config.discovery_prefix, "homeassistant");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.register_map.topic_prefix(), "bridge/energy");
        assert!(config.status.is_none());
    }

    #[test]
    fn test_overrides() {
        let mut vars = base_env();
        vars.insert("MQTT_HOST", "broker.lan".to_string());
        vars.insert("MQTT_PORT", "8883".to_string());
        vars.insert("MQTT_USER", "ha".to_string());
        vars.insert("MQTT_PASS", "pw".to_string());
        vars.insert("POLL_INTERVAL_SECS", "5".to_string());
        vars.insert("TOPIC_PREFIX", "tuya/energy".to_string());
        vars.insert("ACTIVITY_THRESHOLD", "75.5".to_string());
        vars.insert("STATUS_LISTEN", "0.0.0.0:8080".to_string());
        vars.insert("DEVICE_GATEWAY_URL", "http://gateway:8888/".to_string());

        let config = load(&vars).unwrap();

        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(
            config.mqtt.credentials,
            Some(("ha".to_string(), "pw".to_string()))
        );
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.device.gateway_url, "http://gateway:8888");
        assert_eq!(
            config.register_map.metric("voltage").unwrap().topic,
            "tuya/energy/voltage"
        );
        assert_eq!(config.register_map.signals()[0].threshold, 75.5);

        let status = config.status.unwrap();
        assert_eq!(status.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(status.refresh, Duration::from_secs(5));
    }

    #[test]
    fn test_credentials_need_both_halves() {
        let mut vars = base_env();
        vars.insert("MQTT_USER", "ha".to_string());
        assert_eq!(load(&vars).unwrap().mqtt.credentials, None);
    }

    #[test]
    fn test_missing_device_settings() {
        for key in ["DEVICE_ID", "IP_ADDRESS", "LOCAL_KEY"] {
            let mut vars = base_env();
            vars.remove(key);
            match load(&vars) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, key),
                other => panic!("expected missing {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        let mut vars = base_env();
        vars.insert("LOCAL_KEY", "  ".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::Missing("LOCAL_KEY"))));
    }

    #[test]
    fn test_register_map_required() {
        let mut vars = base_env();
        vars.remove("REGISTER_MAP");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::Missing("REGISTER_MAP_FILE"))
        ));
    }

    #[test]
    fn test_register_map_file_missing_on_disk() {
        let mut vars = base_env();
        vars.remove("REGISTER_MAP");
        vars.insert("REGISTER_MAP_FILE", "/nonexistent/map.json".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_register_map_file_is_read() {
        let path = env::temp_dir().join(format!("register_map_{}.json", std::process::id()));
        fs::write(&path, DUAL_CLAMP).unwrap();

        let mut vars = base_env();
        vars.remove("REGISTER_MAP");
        vars.insert("REGISTER_MAP_FILE", path.display().to_string());
        let config = load(&vars).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.register_map.metrics().len(), 6);
    }

    #[test]
    fn test_invalid_numbers() {
        let mut vars = base_env();
        vars.insert("MQTT_PORT", "not-a-port".to_string());
        let err = load(&vars).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "MQTT_PORT", .. }));

        let mut vars = base_env();
        vars.insert("POLL_INTERVAL_SECS", "0".to_string());
        let err = load(&vars).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "POLL_INTERVAL_SECS",
                ..
            }
        ));
    }
}
