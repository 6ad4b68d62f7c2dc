//! # Sundial Cam Application Entry Point
//!
//! Loads the station configuration, opens the camera, picks the transport and
//! runs the capture loop on a current-thread tokio runtime. After the sunset
//! termination the host is powered down unless told otherwise.

// Test modules
#[cfg(test)]
mod tests;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use sundial_cam_lib::{
    camera::{Camera, LibcameraCamera},
    config::{Config, StationInfoFile, StationProfile},
    logging,
    params::ParameterStore,
    raster::{ImageRasterizer, RasterPaths},
    sensors::SensorBank,
    shutdown::{self, Shutdown},
    station::{CaptureLoop, Exit, RunOptions},
    transfer::{
        ftp::SessionTransport, rest::ExchangeTransport, ArtifactPaths, TransferCoordinator,
        Transport,
    },
};
use tracing::{error, info, warn};

const W1_DEVICES: &str = "/sys/bus/w1/devices";

#[derive(Parser, Debug)]
#[command(version, about = "Unattended sundial webcam")]
struct Cli {
    /// Station configuration file, created with defaults if missing
    #[arg(long, default_value = "station.toml")]
    config: PathBuf,

    /// Log filter when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Start capturing without the warmup delay
    #[arg(long)]
    skip_warmup: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Do not power the host down after sunset
    #[arg(long)]
    no_power_down: bool,
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging comes first so the store's clamp and fallback warnings are kept
    let log_dir = Config::peek(&cli.config).paths.log_dir;
    logging::init(&cli.log_level, Some(&log_dir))
        .map_err(|e| anyhow::anyhow!("cannot set up logging: {}", e))?;
    info!(
        "sundial-cam {} starting with {}",
        sundial_cam_lib::VERSION,
        cli.config.display()
    );
    let store = ParameterStore::open(&cli.config);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build the runtime")?;

    let exit = rt.block_on(run(store, &cli))?;
    info!("Stopped: {:?}", exit);

    if exit == Exit::PowerDown && !cli.no_power_down && !cli.once {
        power_down(&power_down_command(&cli.config));
    }
    Ok(())
}

async fn run(store: ParameterStore, cli: &Cli) -> anyhow::Result<Exit> {
    let config = store.config().clone();

    let camera = LibcameraCamera::open(&config.camera, &config.paths)
        .await
        .context("camera unavailable")?;

    let info_file = StationInfoFile::load_or_create(&config.paths.station_info, &config.header);
    let profile = StationProfile::from(&info_file);
    info!(
        "Station {} at {:.3}, {:.3}",
        profile.name, profile.latitude, profile.longitude
    );

    let rasterizer = ImageRasterizer::new(
        RasterPaths {
            offline: config.paths.offline_image.clone(),
            cloudy_night: config.paths.cloudy_night_image.clone(),
            total: config.paths.total_image.clone(),
            detail: config.paths.detail_image.clone(),
        },
        camera.resolution(),
        config.overlay.jpeg_quality,
    );
    let artifacts = ArtifactPaths {
        total: config.paths.total_image.clone(),
        detail: config.paths.detail_image.clone(),
    };
    let timeout = Duration::from_secs(config.transport.timeout_secs);
    let sensors = SensorBank::discover(W1_DEVICES);

    let (trigger, shutdown) = Shutdown::new();
    shutdown::listen_for_ctrl_c(trigger);
    let options = RunOptions {
        skip_warmup: cli.skip_warmup,
        once: cli.once,
    };

    if config.operational.ftp_upload {
        let transport = SessionTransport::new(config.transport.clone());
        let coordinator = TransferCoordinator::new(transport, info_file, artifacts, timeout);
        let station = CaptureLoop::new(store, camera, rasterizer, coordinator, sensors, profile);
        Ok(drive(station, shutdown, options).await)
    } else {
        let transport = ExchangeTransport::new(&config.transport)?;
        let coordinator = TransferCoordinator::new(transport, info_file, artifacts, timeout);
        let station = CaptureLoop::new(store, camera, rasterizer, coordinator, sensors, profile);
        Ok(drive(station, shutdown, options).await)
    }
}

async fn drive<T: Transport>(
    mut station: CaptureLoop<LibcameraCamera, ImageRasterizer, T>,
    shutdown: Shutdown,
    options: RunOptions,
) -> Exit {
    info!("Transport: {}", station.coordinator().transport().name());
    station.run(shutdown, options).await
}

/// Re-read so an operator edit during the day is honoured.
fn power_down_command(config: &std::path::Path) -> Vec<String> {
    ParameterStore::open(config)
        .config()
        .schedule
        .power_down_command
        .clone()
}

fn power_down(command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        warn!("No power-down command configured");
        return;
    };
    info!("Powering down: {}", command.join(" "));
    match std::process::Command::new(program).args(args).status() {
        Ok(status) if status.success() => {}
        Ok(status) => error!("Power-down command exited with {}", status),
        Err(e) => error!("Cannot run power-down command: {}", e),
    }
}
