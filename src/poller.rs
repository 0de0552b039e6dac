use crate::device_client::DeviceClient;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Register id → raw integer, as reported by one poll.
pub type RawReading = BTreeMap<String, i64>;

// Gateway error codes meaning the device could not be reached at all
const UNREACHABLE_CODES: &[&str] = &["901", "905"];

/// Why a poll produced no reading.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PollError {
    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),
    #[error("device protocol error: {0}")]
    DeviceProtocol(String),
}

impl PollError {
    /// Short category name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::DeviceUnreachable(_) => "unreachable",
            PollError::DeviceProtocol(_) => "protocol",
        }
    }
}

/// Reads one raw reading per call from the device client.
///
/// There is no retry here: the next scheduled tick is the retry.
pub struct DevicePoller<D> {
    client: D,
}

impl<D: DeviceClient> DevicePoller<D> {
    /// Wraps `client`, selecting `protocol_version` once.
    pub fn new(mut client: D, protocol_version: &str) -> Self {
        client.set_protocol_version(protocol_version);
        Self { client }
    }

    pub async fn poll(&mut self) -> Result<RawReading, PollError> {
        let document = self.client.status().await?;
        extract_reading(&document)
    }
}

/// Pulls the register map out of a device status document.
///
/// Non-integer registers (switch states, strings) are skipped.
pub fn extract_reading(document: &Value) -> Result<RawReading, PollError> {
    let object = document
        .as_object()
        .ok_or_else(|| PollError::DeviceProtocol("status document is not an object".to_string()))?;

    if let Some(code) = object.get("Err") {
        let code = match code {
            Value::String(code) => code.clone(),
            other => other.to_string(),
        };
        let message = object
            .get("Error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        let detail = format!("{message} (code {code})");
        return Err(if UNREACHABLE_CODES.contains(&code.as_str()) {
            PollError::DeviceUnreachable(detail)
        } else {
            PollError::DeviceProtocol(detail)
        });
    }

    let dps = object
        .get("dps")
        .ok_or_else(|| PollError::DeviceProtocol("status document has no dps".to_string()))?
        .as_object()
        .ok_or_else(|| PollError::DeviceProtocol("dps is not an object".to_string()))?;

    let mut reading = RawReading::new();
    for (register, value) in dps {
        match value.as_i64() {
            Some(raw) => {
                reading.insert(register.clone(), raw);
            }
            None => debug!(register = %register, value = %value, "skipping non-integer register"),
        }
    }
    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    struct ScriptedClient {
        version: Option<String>,
        responses: VecDeque<Result<Value, PollError>>,
    }

    impl DeviceClient for ScriptedClient {
        fn set_protocol_version(&mut self, version: &str) {
            self.version = Some(version.to_string());
        }

        async fn status(&mut self) -> Result<Value, PollError> {
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(PollError::DeviceUnreachable("script ended".to_string())))
        }
    }

    #[test]
    fn test_extract_reading() {
        let reading =
            extract_reading(&json!({"dps": {"104": 2301, "17": 12345, "1": true, "9": "idle"}}))
                .unwrap();

        assert_eq!(reading.len(), 2);
        assert_eq!(reading["104"], 2301);
        assert_eq!(reading["17"], 12345);
    }

    #[test]
    fn test_missing_dps_is_protocol_error() {
        let err = extract_reading(&json!({"devId": "abc"})).unwrap_err();
        assert_eq!(err.kind(), "protocol");

        let err = extract_reading(&json!({"dps": [1, 2]})).unwrap_err();
        assert_eq!(err.kind(), "protocol");

        let err = extract_reading(&json!("busy")).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_gateway_error_codes() {
        let err = extract_reading(&json!({"Error": "Network Error: Device Unreachable", "Err": "905"}))
            .unwrap_err();
        assert_eq!(
            err,
            PollError::DeviceUnreachable("Network Error: Device Unreachable (code 905)".to_string())
        );

        let err = extract_reading(&json!({"Error": "Check device key or version", "Err": 914}))
            .unwrap_err();
        assert!(matches!(err, PollError::DeviceProtocol(_)));
    }

    #[test]
    fn test_empty_dps_is_a_reading() {
        let reading = extract_reading(&json!({"dps": {}})).unwrap();
        assert!(reading.is_empty());
    }

    #[tokio::test]
    async fn test_poller_sets_version_and_reports_failures() {
        let client = ScriptedClient {
            version: None,
            responses: VecDeque::from([
                Ok(json!({"dps": {"101": 500}})),
                Err(PollError::DeviceUnreachable("timeout".to_string())),
                Ok(json!({"dps": {"101": 600}})),
            ]),
        };
        let mut poller = DevicePoller::new(client, "3.4");
        assert_eq!(poller.client.version.as_deref(), Some("3.4"));

        assert_eq!(poller.poll().await.unwrap()["101"], 500);
        assert_eq!(poller.poll().await.unwrap_err().kind(), "unreachable");
        assert_eq!(poller.poll().await.unwrap()["101"], 600);
    }
}
