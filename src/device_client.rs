use crate::config::DeviceConfig;
use crate::poller::PollError;
use serde_derive::Serialize;
use serde_json::Value;
use std::future::Future;

/// Boundary to whatever speaks the device's local protocol.
///
/// Handshake, encryption and framing live behind this trait; the bridge only
/// asks for the current status document.
pub trait DeviceClient: Send {
    /// Selects the device protocol version. Called once at startup.
    fn set_protocol_version(&mut self, version: &str);

    /// Reads the device status document, e.g. `{"dps": {"104": 2301}}`.
    fn status(&mut self) -> impl Future<Output = Result<Value, PollError>> + Send;
}

/// Device client that delegates the encrypted protocol to a local HTTP gateway.
pub struct GatewayClient {
    endpoint_url: String,
    device_id: String,
    address: String,
    local_key: String,
    protocol_version: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct StatusRequest<'a> {
    id: &'a str,
    ip: &'a str,
    key: &'a str,
    version: &'a str,
}

impl GatewayClient {
    /// Creates a client for the configured device.
    ///
    /// The protocol version is left unset; [`DeviceClient::set_protocol_version`]
    /// selects it before the first request.
    pub fn new(config: &DeviceConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            endpoint_url: config.gateway_url.clone(),
            device_id: config.id.clone(),
            address: config.address.clone(),
            local_key: config.local_key.clone(),
            protocol_version: String::new(),
            client,
        })
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }
}

impl DeviceClient for GatewayClient {
    fn set_protocol_version(&mut self, version: &str) {
        self.protocol_version = version.to_string();
    }

    async fn status(&mut self) -> Result<Value, PollError> {
        let request = StatusRequest {
            id: &self.device_id,
            ip: &self.address,
            key: &self.local_key,
            version: &self.protocol_version,
        };
        let response = self
            .client
            .post(format!("{}/status", self.endpoint_url))
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| PollError::DeviceUnreachable(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| PollError::DeviceProtocol(format!("undecodable status response: {e}")))
    }
}
