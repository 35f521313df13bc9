use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use neuromon_app::supervisor::AdapterFactory;
use neuromon_app::{Supervisor, SupervisorConfig};
use neuromon_device::{RealVendor, VendorApi};
use neuromon_foundation::{real_clock, ShutdownHandler};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;

const MAX_DEVICES: usize = 12;
const DEFAULT_LIBRARY_PATH: &str = r"C:\Program Files (x86)\Hantek4032L\HTLAHard.dll";
const OUTPUT_DIRECTORY: &str = "data";

#[derive(Parser)]
#[command(name = "neuromon", about = "Multi-device logic analyzer monitor")]
struct Args {
    /// Number of devices to scan (clamped to 1..=12)
    device_count: Option<usize>,

    /// Path to the vendor acquisition library
    library: Option<PathBuf>,
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all("logs")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, "logs", "neuromon.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking_file))
        .with_env_filter(log_level)
        .init();

    // Keep the writer guard alive for the entire program.
    std::mem::forget(guard);

    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let args = Args::parse();
    let device_count = args.device_count.unwrap_or(MAX_DEVICES).clamp(1, MAX_DEVICES);
    let library_path = args
        .library
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY_PATH));

    tracing::info!(
        "Starting neuromon: {} devices, vendor library {}",
        device_count,
        library_path.display()
    );

    // The library must at least load; individual devices may still be
    // absent.
    if let Err(e) = RealVendor::load(&library_path) {
        tracing::error!("Cannot start: {e}");
        return ExitCode::FAILURE;
    }

    let shutdown = ShutdownHandler::install();
    let clock = real_clock();

    let factory: AdapterFactory = {
        let path = library_path.clone();
        Box::new(move |_index| {
            RealVendor::load(&path).map(|vendor| Box::new(vendor) as Box<dyn VendorApi>)
        })
    };

    let mut supervisor = Supervisor::new(
        SupervisorConfig {
            device_count,
            output_dir: PathBuf::from(OUTPUT_DIRECTORY),
            config_dir: PathBuf::from("."),
            export_period: Duration::from_millis(500),
        },
        factory,
        shutdown,
        clock,
    );

    tracing::info!("Press 'q' then Enter (or Ctrl-C) to stop");
    match supervisor.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
