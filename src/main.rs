//! Cam-snapshot binary for pulling single frames from a V4L2 camera.

use std::path::PathBuf;

use cam_snapshot::pixel::mean;
use cam_snapshot::traits::Result;
use cam_snapshot::{CaptureConfig, SnapshotController, V4L2Device};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Take snapshots from a continuously streaming camera.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// V4L2 device index, overriding the configuration.
    #[arg(short, long)]
    device: Option<u32>,
    /// Number of snapshots, overriding the configuration.
    #[arg(short = 'n', long)]
    count: Option<u32>,
    /// Per-snapshot wait limit in milliseconds, overriding the configuration.
    #[arg(short, long)]
    timeout_ms: Option<u64>,
    /// Probe that acquisition starts and stops before poising.
    #[arg(long)]
    prepare: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()) {
        tracing::error!(error = %err, "snapshot session failed");
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = CaptureConfig::load(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.device_index = device;
    }
    if let Some(count) = args.count {
        config.snapshot_count = count;
    }
    if args.timeout_ms.is_some() {
        config.timeout_ms = args.timeout_ms;
    }

    let device = V4L2Device::open(config.device_index, config.stream_buffers)?;
    println!("Device: {}", device.capabilities().card);
    println!("Driver: {}", device.capabilities().driver);

    let mut controller = SnapshotController::new(&device)?;
    if args.prepare {
        controller.prepare_camera()?;
        println!("Prepare: acquisition start/stop ok");
    }

    controller.poise()?;
    println!(
        "Poised: {} bytes/frame, encoding {}",
        controller.frame_size(),
        controller.pixel_encoding().unwrap_or("unknown")
    );

    let captured = capture(&mut controller, &config);
    let left = controller.leave_poise();
    captured?;
    left
}

fn capture(controller: &mut SnapshotController<V4L2Device>, config: &CaptureConfig) -> Result<()> {
    for index in 0..config.snapshot_count {
        let snapshot = controller.take_snapshot(config.wait_timeout())?;
        let pixels = snapshot.pixels();
        println!(
            "Snapshot {index}: {} bytes, mean {:.1}",
            snapshot.len(),
            mean(&pixels).unwrap_or(0.0)
        );
        snapshot.requeue()?;
    }
    Ok(())
}
