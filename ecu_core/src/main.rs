//! # ECU firmware entry point
//!
//! Loads and validates the TOML configuration, builds the system
//! context, and enters the control loop. Without real hardware attached
//! this binary runs against the simulation HAL and mock transports —
//! the full control core executes, driving simulated pins.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ecu_common::config::EcuConfig;
use ecu_common::consts::DEFAULT_CONFIG_PATH;
use tracing::{error, info};

use ecu_core::app::EcuApp;
use ecu_core::cycle::CycleRunner;
use ecu_core::external::transport::{MockCanTransport, MockSerialPort};
use ecu_core::hal::SimHal;
use ecu_core::storage::backend::EepromBackend;

#[derive(Parser, Debug)]
#[command(name = "ecu_core", about = "Engine/transmission control core")]
struct Args {
    /// Configuration file path.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the loop period [µs].
    #[arg(long)]
    cycle_time_us: Option<u32>,

    /// Bound the run time [s] (default: run forever).
    #[arg(long)]
    duration_s: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = match EcuConfig::load_validated(&config_path) {
        Ok(config) => config,
        Err(ecu_common::config::ConfigError::FileNotFound) => {
            info!(path = %config_path.display(), "no configuration file, using defaults");
            EcuConfig::default()
        }
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(cycle_time_us) = args.cycle_time_us {
        config.cycle.cycle_time_us = cycle_time_us;
    }

    info!(
        name = %config.identity.name,
        cycle_time_us = config.cycle.cycle_time_us,
        "starting control core"
    );

    let app = match EcuApp::new(
        config,
        SimHal::shared(),
        Box::new(EepromBackend::default()),
        Some(Box::new(MockCanTransport::new())),
        Some(Box::new(MockSerialPort::new())),
    ) {
        Ok(app) => app,
        Err(e) => {
            error!("init failed: {e}");
            std::process::exit(1);
        }
    };

    let mut runner = CycleRunner::new(app);
    let duration = args.duration_s.map(Duration::from_secs);
    if let Err(e) = runner.run(duration) {
        error!("{e}");
        std::process::exit(1);
    }

    info!(
        cycles = runner.stats.cycle_count,
        avg_ns = runner.stats.avg_cycle_ns(),
        max_ns = runner.stats.max_cycle_ns,
        overruns = runner.stats.overruns,
        "control loop exited"
    );
}
