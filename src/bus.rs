//! Message-bus boundary and the MQTT implementation behind it.

use crate::config::MqttConfig;
use crate::register_map::RegisterMap;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde_derive::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const MIN_REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MIN_KEEPALIVE: Duration = Duration::from_secs(5);

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    #[error("publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },
}

/// What the bridge needs from a publish-subscribe client.
///
/// Publishing must not block: the poll loop calls it inline.
pub trait BusClient: Clone + Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl From<u8> for LinkState {
    fn from(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }
}

/// Lock-free view of the bus link state, shared with the status page.
#[derive(Debug, Clone, Default)]
pub struct LinkMonitor {
    state: Arc<AtomicU8>,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Stores `state` and returns the previous one.
    pub fn set(&self, state: LinkState) -> LinkState {
        self.state.swap(state as u8, Ordering::AcqRel).into()
    }
}

/// MQTT client; reconnects are driven by [`drive_event_loop`].
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    link: LinkMonitor,
}

impl MqttBus {
    /// Creates the client and its event loop. Nothing is sent until the loop is polled.
    ///
    /// The map's availability topic receives a retained `offline` if the bridge
    /// drops off the broker.
    pub fn connect(config: &MqttConfig, map: &RegisterMap) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keepalive.max(MIN_KEEPALIVE));
        if let Some((user, pass)) = &config.credentials {
            options.set_credentials(user, pass);
        }
        options.set_last_will(LastWill::new(
            map.availability_topic(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, request_capacity(map));
        (
            Self {
                client,
                link: LinkMonitor::new(),
            },
            eventloop,
        )
    }

    pub fn link(&self) -> LinkMonitor {
        self.link.clone()
    }
}

impl BusClient for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        let qos = if retain {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| BusError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn is_connected(&self) -> bool {
        self.link.state() == LinkState::Connected
    }
}

/// Request queue size for `map`.
///
/// The on-connect setup runs inside the event-loop task, so the queue is not
/// drained while it publishes: a full discovery round plus availability and one
/// cycle of metrics has to fit.
fn request_capacity(map: &RegisterMap) -> usize {
    let entities = map.metrics().len() + map.signals().len();
    MIN_REQUEST_CAPACITY.max(2 * entities + 8)
}

/// Polls the MQTT event loop forever, tracking the link state.
///
/// `on_connect` runs on every ConnAck, so per-session setup (discovery) is
/// repeated after each reconnect. It must not block.
pub async fn drive_event_loop<F>(mut eventloop: EventLoop, link: LinkMonitor, on_connect: F)
where
    F: Fn() + Send + 'static,
{
    loop {
        if link.state() == LinkState::Disconnected {
            link.set(LinkState::Connecting);
            info!("connecting to mqtt broker");
        }

        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                link.set(LinkState::Connected);
                info!("mqtt connected");
                on_connect();
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                link.set(LinkState::Disconnected);
                warn!("mqtt broker closed the session");
            }
            Ok(_) => {}
            Err(e) => {
                if link.set(LinkState::Disconnected) == LinkState::Connected {
                    warn!(error = %e, "mqtt connection lost");
                } else {
                    warn!(error = %e, "mqtt connection failed");
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Publisher;
    use crate::register_map::tests::dual_clamp;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn mqtt_config(port: u16) -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            credentials: Some(("user".to_string(), "pass".to_string())),
            client_id: "bridge-test".to_string(),
            keepalive: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_link_monitor_transitions() {
        let link = LinkMonitor::new();
        assert_eq!(link.state(), LinkState::Disconnected);

        assert_eq!(link.set(LinkState::Connecting), LinkState::Disconnected);
        assert_eq!(link.set(LinkState::Connected), LinkState::Connecting);
        assert_eq!(link.state(), LinkState::Connected);

        let shared = link.clone();
        shared.set(LinkState::Disconnected);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_link_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&LinkState::Connecting).unwrap(),
            "\"connecting\""
        );
    }

    #[tokio::test]
    async fn test_new_bus_is_not_connected() {
        let (bus, _eventloop) = MqttBus::connect(&mqtt_config(1883), &dual_clamp());
        assert!(!bus.is_connected());
        assert_eq!(bus.link().state(), LinkState::Disconnected);

        bus.link().set(LinkState::Connected);
        assert!(bus.is_connected());
    }

    #[tokio::test]
    async fn test_publish_is_queued_without_blocking() {
        let (bus, _eventloop) = MqttBus::connect(&mqtt_config(1883), &dual_clamp());
        bus.publish("bridge/energy/voltage", b"230.0".to_vec(), false)
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_fails_when_queue_is_full() {
        let (bus, _eventloop) = MqttBus::connect(&mqtt_config(1883), &dual_clamp());
        let results: Vec<_> = (0..=MIN_REQUEST_CAPACITY)
            .map(|_| bus.publish("bridge/energy/voltage", b"230.0".to_vec(), false))
            .collect();
        assert!(matches!(
            results.last(),
            Some(Err(BusError::Rejected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_broker_never_connects() {
        // Nothing listens on port 1
        let (bus, eventloop) = MqttBus::connect(&mqtt_config(1), &dual_clamp());
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        let driver = tokio::spawn(drive_event_loop(eventloop, bus.link(), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        tokio::time::sleep(Duration::from_millis(200)).await;
        driver.abort();

        assert_ne!(bus.link().state(), LinkState::Connected);
        assert_eq!(connects.load(Ordering::Relaxed), 0);
    }

    fn large_map(metric_count: usize) -> RegisterMap {
        let metrics: Vec<String> = (0..metric_count)
            .map(|i| {
                format!(
                    r#"{{"name": "m{i}", "register": "{i}", "divisor": 10, "unit": "W", "device_class": "power"}}"#
                )
            })
            .collect();
        let document = format!(
            r#"{{"device": {{"identifier": "big", "name": "Big"}}, "metrics": [{}],
                "signals": [{{"name": "activity", "sources": ["m0", "m1"], "threshold": 50}}]}}"#,
            metrics.join(",")
        );
        RegisterMap::from_json(&document, "bridge/energy").unwrap()
    }

    #[tokio::test]
    async fn test_discovery_fits_queue_for_large_maps() {
        let map = Arc::new(large_map(70));
        // The event loop is not polled, as while the on-connect setup runs
        let (bus, _eventloop) = MqttBus::connect(&mqtt_config(1883), &map);
        bus.link().set(LinkState::Connected);
        let publisher = Publisher::new(bus, map, "homeassistant");

        let report = publisher.publish_discovery();
        assert_eq!(report.sent, 71);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn test_request_capacity() {
        assert_eq!(request_capacity(&dual_clamp()), MIN_REQUEST_CAPACITY);
        assert_eq!(request_capacity(&large_map(70)), 150);
    }

    /// Accepts one client, reads its CONNECT and acknowledges the session.
    async fn accept_session(listener: &TcpListener, link: &LinkMonitor) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 512];
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0] >> 4, 1, "expected CONNECT");
        assert_eq!(link.state(), LinkState::Connecting);
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        socket
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(15), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_setup_reruns_on_every_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (bus, eventloop) = MqttBus::connect(&mqtt_config(port), &dual_clamp());
        let link = bus.link();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let hook_link = link.clone();
        let driver = tokio::spawn(drive_event_loop(eventloop, link.clone(), move || {
            hook_seen.lock().unwrap().push(hook_link.state());
        }));

        let first = accept_session(&listener, &link).await;
        wait_until(|| seen.lock().unwrap().len() == 1).await;
        assert!(bus.is_connected());

        drop(first);
        wait_until(|| link.state() == LinkState::Disconnected).await;
        assert!(!bus.is_connected());

        let _second = accept_session(&listener, &link).await;
        wait_until(|| seen.lock().unwrap().len() == 2).await;
        driver.abort();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![LinkState::Connected, LinkState::Connected]
        );
        assert!(bus.is_connected());
    }
}
