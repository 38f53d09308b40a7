//! # Engraver Stub Entry Point
//!
//! Runs a local stand-in for the processing service: uploads on `POST /img`
//! are published back on the receive topic as PNG.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin engraver_stub -- --config config/client.toml
//! ```

use anyhow::Context;
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use lasercraft::common::config::AppConfig;
use lasercraft::common::logging::init_logger;
use lasercraft::mqtt::{MqttOptions, NotificationChannel, ReconnectPolicy, ReconnectSupervisor};
use lasercraft::service::{self, StubState};

/// Command-line arguments for the stub service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding `api.stub_bind_address`
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    info!("🚀 Initializing engraver stub...");

    let shutdown = CancellationToken::new();
    let channel = NotificationChannel::new(MqttOptions::from_config(&config.mqtt)?);
    let supervisor = ReconnectSupervisor::spawn(
        channel.clone(),
        ReconnectPolicy::from(&config.mqtt.reconnect),
        &shutdown,
    );
    channel
        .connect()
        .await
        .with_context(|| format!("Could not reach the broker at {}", config.mqtt.broker_url))?;

    let state = Arc::new(StubState::new(channel.clone(), &config.mqtt.receive_topic));
    let bind = args.bind.unwrap_or(config.api.stub_bind_address);
    let listener = tokio::net::TcpListener::bind(&bind).await?;

    tokio::select! {
        result = service::serve(listener, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("🛑 Shutting down"),
    }

    shutdown.cancel();
    supervisor.stop();
    channel.disconnect().await;
    Ok(())
}
