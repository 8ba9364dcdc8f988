use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use rabbitmq_queue_sensor::config::{self, SensorConfig};
use rabbitmq_queue_sensor::{drive, LapinConnector, RabbitMqQueueSensor, StdoutDispatcher};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Events go to stdout; keep logs on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_configuration(explicit: Option<PathBuf>) -> Result<SensorConfig> {
    if let Some(path) = explicit {
        return config::load_config(&path);
    }

    match config::find_config_file() {
        Ok(path) => {
            info!("Loading configuration from {}", path.display());
            config::load_config(&path)
        }
        Err(e) => {
            warn!("{}; falling back to RABBITMQ_* environment variables", e);
            SensorConfig::from_env()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let mut args = std::env::args().skip(1);
    let explicit = match args.next().as_deref() {
        Some("--init-config") => {
            let path = args
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
            return config::create_default_config_file(&path);
        }
        Some(path) => Some(PathBuf::from(path)),
        None => None,
    };

    let settings = load_configuration(explicit)?
        .validate()
        .context("Invalid sensor configuration")?;

    let mut sensor = RabbitMqQueueSensor::new(
        settings,
        Arc::new(LapinConnector::default()),
        Arc::new(StdoutDispatcher::new()),
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            futures::future::pending::<()>().await;
        }
    }
    .boxed();

    drive(&mut sensor, shutdown).await?;
    info!("Sensor stopped");
    Ok(())
}
