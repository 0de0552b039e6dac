//! Tuya Energy Bridge Library
//!
//! Polls a dual-clamp energy meter, scales its raw registers into metrics and
//! republishes them over MQTT with Home Assistant discovery.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod device_client;
pub mod normalizer;
pub mod poller;
pub mod publisher;
pub mod register_map;
pub mod state_store;
pub mod status_page;

// Re-export commonly used types for easier access
pub use bridge::{announce_on_connect, Bridge, CycleOutcome};
pub use bus::{drive_event_loop, BusClient, BusError, LinkMonitor, LinkState, MqttBus};
pub use config::{BridgeConfig, ConfigError};
pub use device_client::{DeviceClient, GatewayClient};
pub use normalizer::{normalize, MetricSet, SignalState};
pub use poller::{DevicePoller, PollError, RawReading};
pub use publisher::{PublishReport, Publisher};
pub use register_map::RegisterMap;
pub use state_store::{NormalizedState, StateStore};
pub use status_page::StatusPage;
