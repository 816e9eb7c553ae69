use akai_bridge::config::BridgeConfig;
use akai_bridge::controller::usb_link::{Detached, UsbLink};
use akai_bridge::mqtt::MqttSink;
use akai_bridge::pipeline::{Pipeline, PipelineError};
use clap::Parser;
use color_eyre::{
    eyre::{eyre, WrapErr},
    Result,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(version, about = "Forwards Akai pad controller events to an MQTT broker")]
struct Cli {
    /// The full url of the MQTT server to connect to ex: tcp://127.0.0.1:1883
    #[arg(long = "mqtt-server", alias = "mqtt_server", value_name = "URL")]
    mqtt_server: Option<String>,

    /// TOML settings file (defaults to <config dir>/akai-bridge/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config = BridgeConfig::load(cli.config.as_deref())
        .wrap_err("Failed to load configuration")?
        .with_server(cli.mqtt_server);
    config.validate().wrap_err("Invalid configuration")?;
    info!("Starting akai-bridge with {:?}", config);

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_cancel.cancel();
            }
            Err(e) => error!("Unable to listen for Ctrl-C: {}", e),
        }
    });

    // The controller is a hard prerequisite; nothing runs without it
    let link = UsbLink::<Detached>::open(config.device.clone())
        .and_then(|link| link.claim())
        .wrap_err("Could not open the controller")?;

    let sink = MqttSink::connect(&config.mqtt, &config.retry, &cancel)
        .await
        .wrap_err("Could not connect to the MQTT broker")?;

    let pipeline = Pipeline::new(
        link,
        sink,
        config.queue_capacity()?,
        config.publish_settings(),
        config.retry.clone(),
    )
    .with_cancel_token(cancel);

    match pipeline.run().await {
        Ok(report) => {
            info!(
                "Stopped after {} reports, {} messages published",
                report.reader.reports_read, report.publisher.messages_published
            );
            Ok(())
        }
        Err(PipelineError::DeviceLost { source, report }) => {
            error!("Controller lost after {} reports", report.reader.reports_read);
            Err(eyre!(source).wrap_err("Controller disconnected"))
        }
        Err(e) => Err(eyre!(e)),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
