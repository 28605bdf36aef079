use anyhow::Result;
use mqtt_bridge::{Bridge, BrokerSession, Config, Side, Supervisor};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing; RUST_LOG overrides the configured LOG_LEVEL
    let default_filter = format!(
        "mqtt_bridge={},rumqttc=warn",
        config.log_level.to_string().to_lowercase()
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting MQTT bridge: source {}:{} <-> remote {}:{}",
        config.source.host,
        config.source.port,
        config.remote.host,
        config.remote.port
    );
    if config.topics.is_empty() {
        tracing::warn!("MQTT_TOPICS is empty; the bridge will connect but mirror nothing");
    }

    let topics: Arc<[String]> = config.topics.clone().into();
    let (event_tx, event_rx) = mpsc::channel(1024);

    let (source, source_handle) = BrokerSession::connect(
        Side::Source,
        &config.source,
        Arc::clone(&topics),
        event_tx.clone(),
    )?;
    let (remote, remote_handle) =
        BrokerSession::connect(Side::Remote, &config.remote, topics, event_tx)?;

    let bridge = Bridge::new(event_rx, source_handle, remote_handle);

    let mut supervisor = Supervisor::new();
    supervisor.spawn("source session", source.run_forever());
    supervisor.spawn("remote session", remote.run_forever());
    supervisor.spawn("bridge", bridge.run());

    // The bridge runs until killed; any task exit is a failure.
    Err(supervisor.watch().await)
}
