//! # pwmon
//!
//! Power monitor node. Depending on `[node] role` the process runs the
//! battery-powered collector, the receiver base station with its operator
//! console, or both halves over simulated air.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::BufReader;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use pwmon::collector::link::CollectorLink;
use pwmon::collector::sampler::SyntheticSampler;
use pwmon::collector::Collector;
use pwmon::config::{Config, LoggingConfig, Role};
use pwmon::flash::RamFlash;
use pwmon::link::serial::{SerialRadio, DEFAULT_DEVICE_PATHS};
use pwmon::link::sim;
use pwmon::link::Radio;
use pwmon::receiver::link::ReceiverLink;
use pwmon::receiver::Receiver;
use pwmon::storage::layout::{DATA_PAGES, PAGE_SIZE};
use pwmon::telemetry::TelemetryLogger;

/// Configuration file used when no path is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Battery voltage the synthetic sampler starts from, 0.1 mV units
const SIM_BATTERY_START: u16 = 40_000;

/// Battery drop per synthetic measurement, 0.1 mV units
const SIM_BATTERY_DRAIN: f64 = 0.5;

/// Main entry point
///
/// # Usage
///
/// ```bash
/// pwmon [config.toml]
/// ```
///
/// In the receiver and sim roles, console commands are read from stdin
/// (send `?` for help). Ctrl+C stops the node.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    let _guard = init_logging(&config.logging)?;
    info!("pwmon v{} starting as {:?}", env!("CARGO_PKG_VERSION"), config.node.role);

    let result = tokio::select! {
        result = run(&config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };
    if let Err(e) = &result {
        error!("node stopped: {:#}", e);
    }
    result
}

/// Set up tracing: stderr always, plus a daily rolling file when configured
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid logging level")?;

    let (file_layer, guard) = if logging.file_dir.is_empty() {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(&logging.file_dir, "pwmon.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn run(config: &Config) -> Result<()> {
    match config.node.role {
        Role::Collector => {
            let radio = open_serial(config)?;
            collector_link(config, radio)?.run().await?;
        }
        Role::Receiver => {
            let radio = open_serial(config)?;
            run_receiver(config, radio).await?;
        }
        Role::Sim => {
            let (collector_air, receiver_air) = sim::pair(config.air());
            let mut collector = collector_link(config, collector_air)?;
            let collector_task = tokio::spawn(async move { collector.run().await });
            let receiver = run_receiver(config, receiver_air);
            tokio::select! {
                joined = collector_task => joined.context("collector task panicked")??,
                result = receiver => result?,
            }
        }
    }
    Ok(())
}

fn open_serial(config: &Config) -> Result<SerialRadio> {
    let configured = [config.radio.port.as_str()];
    let paths: &[&str] = if config.radio.port.is_empty() {
        DEFAULT_DEVICE_PATHS
    } else {
        &configured
    };
    let radio = SerialRadio::open_with_paths(paths, config.radio.baud_rate)?;
    info!("Radio modem opened at: {}", radio.device_path());
    Ok(radio)
}

fn collector_link<R: Radio>(
    config: &Config,
    radio: R,
) -> Result<CollectorLink<RamFlash, R, SyntheticSampler>> {
    let flash = RamFlash::new(DATA_PAGES, PAGE_SIZE);
    let collector = Collector::new(flash, config.collector_params())
        .context("failed to initialize the flash log")?;
    let sampler = SyntheticSampler::new(
        config.node.seed,
        config.collector.samples_per_day,
        SIM_BATTERY_START,
        SIM_BATTERY_DRAIN,
    );
    Ok(CollectorLink::new(collector, radio, sampler, config.link_timing()))
}

async fn run_receiver<R: Radio>(config: &Config, radio: R) -> Result<()> {
    let receiver = Receiver::new(config.sync_config());
    let mut link = ReceiverLink::new(receiver, radio, config.receiver_timing());
    if config.telemetry.enabled {
        let logger = TelemetryLogger::new(
            Path::new(&config.telemetry.log_dir),
            config.telemetry.max_records_per_file,
            config.telemetry.max_files_to_keep,
        )?;
        info!("Telemetry written to {}", config.telemetry.log_dir);
        link = link.with_telemetry(logger);
    } else {
        warn!("telemetry disabled, drained pages are discarded");
    }
    link.run(BufReader::new(tokio::io::stdin())).await?;
    Ok(())
}
