use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tuya_energy_bridge::{
    announce_on_connect, drive_event_loop, Bridge, BridgeConfig, DevicePoller, GatewayClient,
    MqttBus, Publisher, StateStore, StatusPage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Tuya energy bridge");
    let config = BridgeConfig::from_env()?;
    let map = Arc::new(config.register_map);
    let store = StateStore::new();

    let client = GatewayClient::new(&config.device)?;
    let poller = DevicePoller::new(client, &config.device.protocol_version);
    info!(
        device = %config.device.id,
        address = %config.device.address,
        gateway = %config.device.gateway_url,
        "device configured"
    );

    let (bus, eventloop) = MqttBus::connect(&config.mqtt, &map);
    let publisher = Publisher::new(bus.clone(), map.clone(), config.discovery_prefix);
    info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        prefix = map.topic_prefix(),
        "mqtt configured"
    );
    tokio::spawn(drive_event_loop(
        eventloop,
        bus.link(),
        announce_on_connect(publisher.clone(), store.clone()),
    ));

    if let Some(status) = config.status {
        let page = StatusPage::new(store.clone(), bus.link(), map.clone(), status.refresh);
        tokio::spawn(async move {
            if let Err(e) = page.serve(status.listen).await {
                error!(error = %e, "status page stopped");
            }
        });
    }

    Bridge::new(poller, map, store, publisher, config.poll_interval)
        .run()
        .await;
    Ok(())
}
