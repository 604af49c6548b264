//! Superfan Daemon (superfand)
//!
//! Privileged service running the closed-loop fan controller for one
//! Supermicro board.
//!
//! # Modes
//! - **Control** (default): curve-driven control at the polling interval
//! - **Monitor**: same state machine at the faster monitor interval, with a
//!   status line per cycle
//! - **Manual**: every zone pinned to a fixed speed until shutdown
//! - **Learn**: find a zone's lowest stable speed, store it and exit
//! - **Simulate**: run against an in-memory controller, no root needed
//!
//! # Exit Guarantees
//! - Automatic fan control is restored on normal exit, on SIGINT/SIGTERM,
//!   and when startup fails after the controller was reached
//! - Startup failures are logged at error level and exit non-zero

mod cli;
mod control_loop;

use anyhow::{bail, Context};
use clap::Parser;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use cli::Cli;
use sf_core::constants::paths;
use sf_core::ipmi::sim::{SimHandle, SimulatedBmc, StaticDrives, StaticIdentity};
use sf_core::{
    load_config, load_or_create_config, BoardCommander, BoardGeneration, Config, ControlManager,
    DmiDecode, DriveProbe, FanZone, IpmitoolTransport, NvmeCli, SpeedLearner,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Startup
// ============================================================================

/// Journald when available, stdout otherwise. Returns whether journald is used.
fn init_logging(log_level: &str) -> bool {
    if Path::new(paths::JOURNALD_SOCKET).exists() {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
    false
}

fn verify_privileges() -> anyhow::Result<()> {
    // SAFETY: geteuid only returns the effective user id of the process.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("superfand must run as root (euid=0) to reach the management controller");
    }
    Ok(())
}

/// Simulated board with a plausible sensor table and fans that follow duty
fn simulated_controller(generation: BoardGeneration) -> (Arc<BoardCommander>, SimHandle) {
    let (bmc, sim) = SimulatedBmc::new(generation);
    sim.set_mc_info("Manufacturer Name : Supermicro\n");
    sim.set_temperature("CPU Temp", 52.0);
    sim.set_temperature("System Temp", 34.0);
    sim.set_temperature("Peripheral Temp", 38.0);
    sim.model_fans(FanZone::Chassis, &["FAN1", "FAN2", "FAN3"], 12, 16.0);
    sim.model_fans(FanZone::Cpu, &["FANA"], 15, 20.0);

    let identity = match generation {
        BoardGeneration::Unknown => StaticIdentity::none(),
        known => StaticIdentity::new(&format!("Product Name: {} (simulated)", known)),
    };
    (Arc::new(BoardCommander::new(Box::new(bmc), Box::new(identity))), sim)
}

fn hardware_controller(config: &Config) -> (Arc<BoardCommander>, Box<dyn DriveProbe>) {
    let timeout = Duration::from_millis(config.ipmi.command_timeout_ms);
    let commander = BoardCommander::new(
        Box::new(IpmitoolTransport::new(&config.ipmi)),
        Box::new(DmiDecode::new(timeout)),
    )
    .with_settings(&config.ipmi);
    (Arc::new(commander), Box::new(NvmeCli::new(timeout)))
}

fn read_config(options: &Cli) -> sf_error::Result<Config> {
    if options.simulate.is_some() {
        if options.config_path.exists() {
            return load_config(&options.config_path);
        }
        return Ok(Config::default());
    }
    load_or_create_config(&options.config_path)
}

/// Put the board back under automatic control before giving up
fn leave_automatic(commander: &BoardCommander) {
    commander.detect();
    if let Err(e) = commander.restore_auto() {
        error!("SHUTDOWN: Could not restore automatic fan control: {}", e);
    }
}

fn shutdown_manager(manager: &Mutex<ControlManager>) {
    if let Err(e) = manager.lock().shutdown() {
        error!("SHUTDOWN: Could not restore automatic fan control: {}", e);
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, panic_info);
    }));

    let options = Cli::parse();

    let log_level = std::env::var("SUPERFAN_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);

    info!("STARTUP: superfand {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    if options.simulate.is_none() {
        if let Err(e) = verify_privileges() {
            error!("STARTUP: {}", e);
            std::process::exit(1);
        }
    }

    // Installed before anything can take manual control of the fans
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        let wake = Arc::clone(&wake);
        if let Err(e) = ctrlc::set_handler(move || {
            info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
            shutdown.store(true, Ordering::SeqCst);
            wake.notify_one();
        }) {
            warn!("Failed to set signal handler: {}. Shutdown via signals may not restore automatic control.", e);
        }
    }

    let config_result = read_config(&options);
    let ipmi = config_result
        .as_ref()
        .map(|c| c.ipmi.clone())
        .unwrap_or_default();

    let (commander, drives): (Arc<BoardCommander>, Box<dyn DriveProbe>) = match options.simulate {
        Some(generation) => {
            warn!(board = %generation, "STARTUP: Simulated controller, no hardware is touched");
            let (commander, _sim) = simulated_controller(generation);
            (commander, Box::new(StaticDrives::new(&[("/dev/nvme0n1", 41.0)])))
        }
        None => {
            let mut bootstrap = Config::default();
            bootstrap.ipmi = ipmi;
            hardware_controller(&bootstrap)
        }
    };

    let config = match config_result {
        Ok(config) => config,
        Err(e) => {
            error!("STARTUP: Configuration {:?} unusable: {}", options.config_path, e);
            leave_automatic(&commander);
            std::process::exit(1);
        }
    };

    let manager = match ControlManager::new(config, Arc::clone(&commander), Some(drives)) {
        Ok(manager) => Arc::new(Mutex::new(manager)),
        Err(e) => {
            error!("STARTUP: Control manager could not start: {}", e);
            leave_automatic(&commander);
            std::process::exit(1);
        }
    };

    if let Some(zone) = options.learn {
        let save_path = options.simulate.is_none().then(|| options.config_path.clone());
        let learn_manager = Arc::clone(&manager);
        let cancel = Arc::clone(&shutdown);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = learn_manager.lock();
            let mut learner = SpeedLearner::new(&mut guard).with_cancel(cancel);
            if let Some(path) = save_path {
                learner = learner.with_save_path(path);
            }
            learner.learn(zone)
        })
        .await
        .context("learning task failed")?;

        shutdown_manager(&manager);
        let steps = result.with_context(|| format!("learning {} zone", zone))?;
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    if let Some(speed) = options.manual {
        if let Err(e) = manager.lock().request_manual_override(speed) {
            error!("STARTUP: Manual override refused: {}", e);
            shutdown_manager(&manager);
            std::process::exit(1);
        }
    }

    info!(
        config = %options.config_path.display(),
        monitor = options.monitor,
        "STARTUP: Entering control loop"
    );
    control_loop::run_control_loop(Arc::clone(&manager), shutdown, wake, options.monitor).await;

    shutdown_manager(&manager);
    info!("SHUTDOWN: superfand stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_controller_detects_generation() {
        let (commander, _sim) = simulated_controller(BoardGeneration::H12);
        assert_eq!(commander.detect().generation, BoardGeneration::H12);

        let (commander, _sim) = simulated_controller(BoardGeneration::Unknown);
        assert!(!commander.detect().is_supported());
    }

    #[test]
    fn test_simulated_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let options = Cli::try_parse_from(["superfand", "--simulate", "x11", "-c"].into_iter().chain(missing.to_str()))
            .unwrap();
        assert_eq!(read_config(&options).unwrap(), Config::default());
        assert!(!options.config_path.exists());
    }
}
