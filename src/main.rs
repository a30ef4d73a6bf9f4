//! depthcast: stream depth frames from a sensor into a mirrored buffer

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use depthcast::capture::{DepthDriver, DeviceSession, SyntheticDriver};
use depthcast::memory::WgpuAccelerator;
use depthcast::source::{LiveDepthSource, LiveSourceOptions};
use depthcast::{Backend, Config, DepthSample, DepthSource, Error, SampleFormat};

#[derive(Debug, Parser)]
#[command(name = "depthcast", version, about = "Stream depth frames from a sensor")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to acquire; 0 runs until Ctrl-C
    #[arg(short = 'n', long, default_value_t = 30)]
    frames: u64,

    /// List attached devices and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("depthcast launching...");

    // Acquisition blocks on the device, so it runs off the async runtime.
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = stop.clone();
    let mut worker = tokio::task::spawn_blocking(move || run(&config, &cli, &worker_stop));

    let joined = tokio::select! {
        res = &mut worker => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, stopping");
            stop.store(true, Ordering::SeqCst);
            worker.await
        }
    };
    joined.map_err(|e| eyre!("acquisition thread failed: {}", e))??;

    info!("depthcast shutting down");
    Ok(())
}

fn run(config: &Config, cli: &Cli, stop: &AtomicBool) -> Result<()> {
    match config.device.backend {
        Backend::Synthetic => {
            let mut synthetic = config.device.synthetic.clone();
            // The virtual sensor emits whatever sample type the source consumes.
            synthetic.sample_format = config.source.sample_format;
            let driver = SyntheticDriver::new(synthetic, config.device.frame_pool_size);
            dispatch(driver, config, cli, stop)
        }
        Backend::V4l2 => run_v4l2(config, cli, stop),
    }
}

#[cfg(feature = "v4l2")]
fn run_v4l2(config: &Config, cli: &Cli, stop: &AtomicBool) -> Result<()> {
    if config.source.sample_format != SampleFormat::U16 {
        return Err(eyre!("V4L2 depth nodes deliver 16-bit samples; set source.sample_format = \"u16\""));
    }
    let driver = depthcast::capture::V4l2DepthDriver::new(
        config.device.v4l2.clone(),
        config.source.depth_width,
        config.source.depth_height,
        config.device.frame_pool_size,
    );
    dispatch(driver, config, cli, stop)
}

#[cfg(not(feature = "v4l2"))]
fn run_v4l2(_config: &Config, _cli: &Cli, _stop: &AtomicBool) -> Result<()> {
    Err(eyre!("built without the v4l2 feature"))
}

fn dispatch<D: DepthDriver>(driver: D, config: &Config, cli: &Cli, stop: &AtomicBool) -> Result<()> {
    if cli.list {
        return list_devices(driver);
    }

    match config.source.sample_format {
        SampleFormat::U16 => acquire::<u16, D>(driver, config, cli.frames, stop),
        SampleFormat::F32 => acquire::<f32, D>(driver, config, cli.frames, stop),
    }
}

fn list_devices<D: DepthDriver>(driver: D) -> Result<()> {
    let mut session = DeviceSession::new(driver);
    let backend = session.backend_name();
    let devices = session.discover()?;

    println!("found {} {} devices", devices.len(), backend);
    for dev in devices {
        println!(
            "device {} has serial number {} ({} at {})",
            dev.index, dev.serial, dev.name, dev.path
        );
    }
    Ok(())
}

fn acquire<T: DepthSample, D: DepthDriver>(
    driver: D,
    config: &Config,
    frames: u64,
    stop: &AtomicBool,
) -> Result<()> {
    let mut options = LiveSourceOptions::from_config(&config.source);
    if config.source.use_accelerator {
        match WgpuAccelerator::new() {
            Ok(acc) => options = options.with_accelerator(Arc::new(acc)),
            Err(e) => warn!(error = %e, "No GPU accelerator, mirroring in host memory"),
        }
    }

    let mut source = LiveDepthSource::<T, D>::new(driver, options);
    source.initialize(config.source_params())?;
    info!(
        serial = source.serial_number().unwrap_or("unknown"),
        firmware = source.firmware_version().unwrap_or("unknown"),
        principal_point = ?source.calibration().principal_point,
        "Streaming"
    );

    let scale = source.scale_to_meters();
    let mut acquired = 0u64;
    while !stop.load(Ordering::SeqCst) && (frames == 0 || acquired < frames) {
        match source.advance() {
            Ok(()) => {
                acquired += 1;
                let center_m = source
                    .depth()
                    .and_then(|d| d.get(d.len() / 2))
                    .map(|s| s.as_f32() * scale);
                info!(
                    frame = source.frame(),
                    timestamp = ?source.depth_time(),
                    center_m = ?center_m,
                    "depth frame"
                );
            }
            Err(Error::FrameTimeout(after)) => warn!(?after, "No frame from device, retrying"),
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(stats) = source.listener_stats() {
        info!(
            received = stats.frames_received,
            delivered = stats.bundles_delivered,
            dropped = stats.frames_dropped,
            released = stats.bundles_released,
            "Listener stats"
        );
    }

    // Explicit teardown surfaces device errors that drop would only log.
    source.stop()?;
    source.close()?;
    Ok(())
}
