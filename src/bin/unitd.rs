//! unitd - unit orchestration daemon
//!
//! Loads unit files, starts the units wanted by `init` and then by the
//! requested state, and keeps them supervised until SIGTERM or SIGINT.
//!
//! Signals:
//! - SIGTERM/SIGINT: stop every unit and exit
//! - SIGHUP: reload units whose files changed
//! - SIGUSR1: dump unit state to the log
//!
//! User mode (--user):
//! - Units under ~/.config/unitd/units
//! - State under the XDG state directory

use clap::Parser;
use log::info;
use std::path::PathBuf;

use unitd::manager::{Manager, ManagerConfig};
use unitd::pid1::{self, DaemonSignal, SignalHandler};
use unitd::units::{self, WANTED_STATES};

#[derive(Parser)]
#[command(name = "unitd")]
#[command(about = "Unit orchestration daemon")]
struct Args {
    /// Run as a per-user manager
    #[arg(long)]
    user: bool,

    /// Unit directory, highest precedence first (repeatable)
    #[arg(long = "unit-dir")]
    unit_dirs: Vec<PathBuf>,

    /// Directory for timer and last-run state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Directory holding the <state>.wants link directories
    #[arg(long)]
    links_dir: Option<PathBuf>,

    /// State to bring up after init
    #[arg(long, default_value = "multi-user")]
    state: String,
}

fn config_from_args(args: &Args) -> ManagerConfig {
    let mut config = if args.user {
        ManagerConfig::user()
    } else {
        ManagerConfig::default()
    };
    if !args.unit_dirs.is_empty() {
        config.unit_dirs = args.unit_dirs.clone();
    }
    if let Some(dir) = &args.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(dir) = &args.links_dir {
        config.links_dir = dir.clone();
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !WANTED_STATES.contains(&args.state.as_str()) {
        log::error!("Unknown state '{}'", args.state);
        std::process::exit(2);
    }
    if args.user && pid1::is_pid1() {
        log::error!("Cannot run in --user mode as PID 1");
        std::process::exit(1);
    }

    pid1::init()?;
    let mut signals = SignalHandler::new()?;

    let config = config_from_args(&args);
    for dir in &config.unit_dirs {
        log::debug!("Unit directory: {}", dir.display());
    }
    let manager = Manager::new(config);

    let defs = units::load_dirs(&manager.config().unit_dirs).await;
    let loaded = manager.load_units(defs);
    info!("Loaded {} units", loaded.len());

    if let Err(e) = manager.watch_unit_dirs() {
        log::warn!("Unit file changes will not be detected: {}", e);
    }

    let boot = {
        let manager = manager.clone();
        let state = args.state.clone();
        tokio::spawn(async move {
            for state in ["init", state.as_str()] {
                let names = manager.units_wanted_by(state);
                info!("Starting {} units for {}", names.len(), state);
                let summary = manager.start_all(&names).await;
                if !summary.is_success() {
                    log::warn!("{}: failed units: {}", state, summary.failed.join(", "));
                }
                if manager.is_shutting_down() {
                    break;
                }
            }
        })
    };

    loop {
        match signals.wait().await {
            sig if sig.is_shutdown() => {
                info!("Received {:?}, shutting down", sig);
                let summary = manager.shutdown().await;
                boot.abort();
                if !summary.is_success() {
                    log::warn!("Units that did not stop cleanly: {}", summary.failed.join(", "));
                }
                std::process::exit(summary.code());
            }
            DaemonSignal::Hup => {
                info!("Received SIGHUP, reloading changed units");
                if !manager.take_files_changed() {
                    info!("No unit files changed");
                    continue;
                }
                let defs = units::load_dirs(&manager.config().unit_dirs).await;
                let reloaded = manager.reload_changed(defs).await;
                info!("Reloaded {} units", reloaded.len());
            }
            DaemonSignal::Usr1 => {
                info!("Received SIGUSR1, dumping state");
                for unit in manager.list() {
                    info!(
                        "  {}: {} ({}) restarts={} errors={}",
                        unit.name,
                        unit.data.state.as_str(),
                        unit.data.final_status.as_str(),
                        unit.restart_num,
                        unit.errors.len()
                    );
                }
            }
            _ => {}
        }
    }
}
