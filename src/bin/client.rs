//! # Client Binary Entry Point
//!
//! Runs the full hand-off for one image file.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin client -- photo.jpg --config config/client.toml --output preview.png --engrave
//! ```
//!
//! The client will:
//! 1. Load configuration from the TOML file (or defaults) and the environment
//! 2. Connect to the broker and start the reconnect supervisor
//! 3. Subscribe to the receive topic for the processed preview
//! 4. Rescale, encode and upload the image
//! 5. Wait for the preview, save it, and trigger engraving if asked to

use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lasercraft::client::{EngraverPreviewState, ResultCorrelator, UploadCoordinator, UploadState};
use lasercraft::common::config::AppConfig;
use lasercraft::common::logging::init_logger;
use lasercraft::mqtt::{MqttOptions, NotificationChannel, ReconnectPolicy, ReconnectSupervisor};
use lasercraft::transport::{HttpTransport, ImageTransport};

/// Command-line arguments for the client binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Image to upload (any format the decoder understands)
    image: PathBuf,

    /// Path to the configuration file (TOML format)
    ///
    /// Example: config/client.toml
    #[arg(short, long)]
    config: Option<String>,

    /// Where to save the received preview
    #[arg(short, long, default_value = "preview.png")]
    output: PathBuf,

    /// Trigger engraving once the preview arrived
    #[arg(long)]
    engrave: bool,

    /// Seconds to wait for the preview after the upload succeeded
    #[arg(long, default_value_t = 60)]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())
        .with_context(|| format!("Could not load configuration {:?}", args.config))?;

    let shutdown = CancellationToken::new();

    let transport: Arc<dyn ImageTransport> = Arc::new(HttpTransport::from_config(&config.api)?);
    if let Err(e) = transport.healthcheck().await {
        warn!("⚠️  Processing service at {} is not healthy: {}", config.api.base_url, e);
    }

    let channel = NotificationChannel::new(MqttOptions::from_config(&config.mqtt)?);
    let supervisor = ReconnectSupervisor::spawn(
        channel.clone(),
        ReconnectPolicy::from(&config.mqtt.reconnect),
        &shutdown,
    );
    connect_broker(&channel, &config.mqtt.broker_url).await?;

    let correlator = ResultCorrelator::start_scoped(
        channel.clone(),
        transport.clone(),
        &config.mqtt.receive_topic,
        &shutdown,
    )
    .await;
    let coordinator =
        UploadCoordinator::from_config(transport, &config.image).with_parent(&shutdown);

    let outcome = tokio::select! {
        outcome = run(&args, &coordinator, &correlator) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Interrupted");
            Ok(())
        }
    };

    shutdown.cancel();
    correlator.shutdown().await;
    coordinator.shutdown();
    supervisor.stop();
    channel.disconnect().await;

    outcome
}

/// Without a first connection no preview can ever arrive, so there is no point uploading.
async fn connect_broker(channel: &NotificationChannel, broker_url: &str) -> anyhow::Result<()> {
    channel
        .connect()
        .await
        .with_context(|| format!("Could not reach the broker at {}", broker_url))?;
    info!("📡 Broker at {} reachable", broker_url);
    Ok(())
}

async fn run(
    args: &Args,
    coordinator: &UploadCoordinator,
    correlator: &ResultCorrelator,
) -> anyhow::Result<()> {
    info!("📤 Uploading {}", args.image.display());
    let upload = coordinator.process_file(args.image.clone())?.await?;
    if upload != UploadState::Success {
        bail!("Upload of {} failed", args.image.display());
    }

    info!("⏳ Waiting for the preview on '{}'", correlator.topic());
    let wait = Duration::from_secs(args.wait_secs);
    let preview = tokio::time::timeout(wait, correlator.wait_for_result())
        .await
        .with_context(|| format!("No preview within {}s", args.wait_secs))?;

    let image = match preview {
        EngraverPreviewState::Success(image) => image,
        _ => bail!("Preview could not be received"),
    };

    let output = args.output.clone();
    tokio::task::spawn_blocking(move || image.save(&output))
        .await?
        .with_context(|| format!("Could not save preview to {}", args.output.display()))?;
    info!("💾 Preview saved to {}", args.output.display());

    if args.engrave {
        correlator.engrave_image().await?;
    }

    Ok(())
}
