//! Unit manager
//!
//! Loads unit definitions, starts and stops them in dependency order and
//! keeps them supervised: restarts, timers and path triggers.
//!
//! `Manager` is a cheap handle (`Clone`) around the registry and the
//! shared [`Context`]; every worker task gets its own clone.

mod deps;
mod enable;
mod exit_handler;
mod orchestrator;
mod path_watcher;
mod process;
mod registry;
mod state;
mod supervisor;
mod timer_ops;
mod timer_scheduler;

pub use deps::{validate, CycleError, DepGraph};
pub use path_watcher::WatchError;
pub use process::{
    exec_process, exec_script, parse_command, send_signal, substitute_pid, SpawnError,
    SpawnOptions, DEFAULT_PATH,
};
pub use registry::{Registry, UnitHandle, Wakeup};
pub use state::{FinalStatus, ProcessData, ProcessState, UnitSnapshot, UnitState};
pub use timer_scheduler::{OsTimer, TimerError};

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::units::UnitDef;

/// Oneshot units are killed after this long
pub const TIMEOUT_MS: u64 = 15_000;
/// Oneshot units running longer than this get a warning
pub const MIN_TIMEOUT_MS: u64 = 3_500;
/// Grace period between the stop request and SIGKILL
pub const TIMEOUT_STOP_MS: u64 = 1_000;
/// Back-off before a restart
pub const RESTART_DELAY_MS: u64 = 1_500;
/// Runs kept in a unit's history
pub const HISTORY_MAX: usize = 10;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Unit directories, highest precedence first
    pub unit_dirs: Vec<PathBuf>,
    /// Persistent state (timer next-fire times, last-run records)
    pub state_dir: PathBuf,
    /// Holds `<state>.wants/` link directories
    pub links_dir: PathBuf,
    pub oneshot_timeout: Duration,
    pub oneshot_warn_after: Duration,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
    pub history_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            unit_dirs: vec![
                PathBuf::from("/etc/unitd/units"),
                PathBuf::from("/usr/lib/unitd/units"),
            ],
            state_dir: PathBuf::from("/var/lib/unitd"),
            links_dir: PathBuf::from("/etc/unitd"),
            oneshot_timeout: Duration::from_millis(TIMEOUT_MS),
            oneshot_warn_after: Duration::from_millis(MIN_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(TIMEOUT_STOP_MS),
            restart_delay: Duration::from_millis(RESTART_DELAY_MS),
            history_size: HISTORY_MAX,
        }
    }
}

impl ManagerConfig {
    /// Per-user configuration under the XDG config and state directories
    pub fn user() -> Self {
        let config = dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("unitd-config"))
            .join("unitd");
        let state = dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("unitd-state"))
            .join("unitd");
        Self {
            unit_dirs: vec![config.join("units")],
            state_dir: state,
            links_dir: config,
            ..Self::default()
        }
    }

    /// Everything below a single root directory
    pub fn with_root(root: &Path) -> Self {
        Self {
            unit_dirs: vec![root.join("units")],
            state_dir: root.join("state"),
            links_dir: root.join("links"),
            ..Self::default()
        }
    }
}

/// State shared by every worker
pub(crate) struct Context {
    pub config: ManagerConfig,
    shutdown: watch::Sender<bool>,
    /// Serializes command-layer start handling
    pub start_lock: tokio::sync::Mutex<()>,
    files_changed: Mutex<bool>,
}

impl Context {
    fn new(config: ManagerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            shutdown,
            start_lock: tokio::sync::Mutex::new(()),
            files_changed: Mutex::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn files_changed_lock(&self) -> std::sync::MutexGuard<'_, bool> {
        match self.files_changed.lock() {
            Ok(guard) => guard,
            Err(_) => fatal_sync_error("files-changed flag"),
        }
    }

    pub fn mark_files_changed(&self) {
        *self.files_changed_lock() = true;
    }

    pub fn take_files_changed(&self) -> bool {
        std::mem::take(&mut *self.files_changed_lock())
    }
}

/// Resolve once shutdown has been requested
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Log and terminate after a poisoned lock: shared state can no longer be trusted
pub(crate) fn fatal_sync_error(what: &str) -> ! {
    log::error!("Synchronization failure ({}), terminating", what);
    let _ = nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM);
    std::process::abort()
}

/// Aggregated result of a fan-out start or stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub failed: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 0 on success, 1 if any unit failed
    pub fn code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Result of a command-layer operation
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Outcome {
    pub code: i32,
    pub units: Vec<UnitSnapshot>,
}

impl Outcome {
    fn single(status: FinalStatus, snapshot: UnitSnapshot) -> Self {
        Self {
            code: if status == FinalStatus::Success { 0 } else { 1 },
            units: vec![snapshot],
        }
    }
}

/// Result of running a unit on behalf of a timer or path unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Failure,
    /// Shutdown began; the caller should exit rather than record a failure
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Stop live conflicting units first
    pub force: bool,
    /// Stop the unit first if it is live
    pub restart: bool,
    /// Clear restart count, history and runtime errors
    pub reset: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnableOptions {
    /// Replace existing links
    pub force: bool,
    /// Start the unit after enabling it
    pub run: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisableOptions {
    /// Stop the unit before removing it
    pub run: bool,
}

/// Unit manager handle
#[derive(Clone)]
pub struct Manager {
    registry: Arc<Registry>,
    ctx: Arc<Context>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            ctx: Arc::new(Context::new(config)),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.is_shutting_down()
    }

    fn spawn_options(def: &UnitDef) -> SpawnOptions {
        SpawnOptions {
            inherit_env: def.boot_env(),
        }
    }

    /// Validate and register unit definitions.
    ///
    /// Validation errors are attached to the affected units, which then
    /// never start. This includes units registered earlier that the new
    /// definitions pull into a cycle. Live units with the same name are
    /// left untouched. Returns the names registered.
    pub fn load_units(&self, defs: Vec<UnitDef>) -> Vec<String> {
        let existing = self.registry.all();
        let mut errors = {
            let new_names: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
            let mut all_defs: Vec<&UnitDef> = defs.iter().collect();
            all_defs.extend(
                existing
                    .iter()
                    .filter(|u| !new_names.contains(u.name()))
                    .map(|u| u.def()),
            );
            let known: HashSet<String> = all_defs.iter().map(|d| d.name.clone()).collect();
            validate(&all_defs, &known)
        };

        let mut loaded = Vec::new();
        for mut def in defs {
            if let Some(current) = self.registry.get(&def.name) {
                let live = current.lock().data.state.is_live();
                if live {
                    log::warn!("{}: active, keeping the running definition", def.name);
                    errors.remove(&def.name);
                    continue;
                }
            }

            if let Some(errs) = errors.remove(&def.name) {
                def.errors.extend(errs);
            }
            for e in &def.errors {
                log::warn!("{}: {}", def.name, e);
            }

            let enabled = self.is_linked(&def);
            let name = def.name.clone();
            let unit = Arc::new(UnitHandle::new(def, self.ctx.config.history_size));
            unit.lock().is_enabled = enabled;
            self.registry.insert(unit);
            log::debug!("{}: loaded", name);
            loaded.push(name);
        }

        // Errors left over belong to units that were already registered
        for (name, errs) in errors {
            let Some(unit) = self.registry.get(&name) else {
                continue;
            };
            let mut state = unit.lock();
            for e in errs {
                if !state.config_errors.contains(&e) {
                    log::warn!("{}: {}", name, e);
                    state.config_errors.push(e);
                }
            }
        }
        loaded
    }

    pub fn status(&self, name: &str) -> Option<UnitSnapshot> {
        self.registry.get(name).map(|u| u.snapshot())
    }

    pub fn list(&self) -> Vec<UnitSnapshot> {
        self.registry.all().iter().map(|u| u.snapshot()).collect()
    }

    /// Units currently `Running` or `Restarting`
    pub fn running_units(&self) -> Vec<String> {
        self.registry
            .all()
            .iter()
            .filter(|u| u.lock().data.state.is_live())
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Units whose policy allows automatic restarts
    pub fn restartable_units(&self) -> Vec<String> {
        self.registry
            .all()
            .iter()
            .filter(|u| u.def().restart || u.def().restart_max > 0)
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Enabled units wanted by `state`
    pub fn units_wanted_by(&self, state: &str) -> Vec<String> {
        self.registry
            .all()
            .iter()
            .filter(|u| u.def().wanted_by.iter().any(|s| s == state))
            .filter(|u| u.lock().is_enabled)
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Units whose backing file changed on disk
    pub fn changed_units(&self) -> Vec<String> {
        self.registry
            .all()
            .iter()
            .filter(|u| u.lock().is_changed)
            .map(|u| u.name().to_string())
            .collect()
    }

    /// Read and clear the global files-changed flag
    pub fn take_files_changed(&self) -> bool {
        self.ctx.take_files_changed()
    }

    /// Start a unit together with any requirement that is not satisfied yet
    pub async fn start_unit(&self, name: &str, opts: StartOptions) -> Result<Outcome, ManagerError> {
        let _guard = self.ctx.start_lock.lock().await;
        if self.ctx.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }
        let unit = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        if opts.reset {
            unit.lock().reset();
        }

        let live = unit.lock().data.state.is_live();
        if live {
            if !opts.restart {
                return Err(ManagerError::AlreadyActive(name.to_string()));
            }
            log::info!("{}: restarting", name);
            self.stop_worker(&unit).await;
        }

        if opts.force {
            for other in &unit.def().conflicts {
                let Some(other) = self.registry.get(other) else {
                    continue;
                };
                let other_live = other.lock().data.state.is_live();
                if other_live {
                    log::info!("{}: stopping conflicting unit {}", name, other.name());
                    self.stop_worker(&other).await;
                }
            }
        }

        let names = self.unsatisfied_closure(&unit);
        let summary = self.start_all(&names).await;
        if !summary.is_success() {
            log::warn!("{}: start failed ({})", name, summary.failed.join(", "));
        }

        let mut units = vec![unit.snapshot()];
        units.extend(
            names
                .iter()
                .filter(|n| n.as_str() != name)
                .filter_map(|n| self.status(n)),
        );
        let status = unit.lock().data.final_status;
        let failed = status != FinalStatus::Success || summary.failed.iter().any(|n| n == name);
        Ok(Outcome {
            code: if failed { 1 } else { 0 },
            units,
        })
    }

    /// The unit plus every transitive requirement that is not up
    fn unsatisfied_closure(&self, unit: &Arc<UnitHandle>) -> Vec<String> {
        let mut names = vec![unit.name().to_string()];
        let mut seen: HashSet<String> = names.iter().cloned().collect();
        let mut queue: VecDeque<Arc<UnitHandle>> = VecDeque::from([Arc::clone(unit)]);

        while let Some(current) = queue.pop_front() {
            for dep in &current.def().requires {
                if !seen.insert(dep.clone()) {
                    continue;
                }
                let Some(dep_unit) = self.registry.get(dep) else {
                    continue;
                };
                let satisfied = {
                    let state = dep_unit.lock();
                    state.data.final_status == FinalStatus::Success
                        && (state.data.state.is_live() || state.data.state == ProcessState::Exited)
                };
                if !satisfied {
                    names.push(dep.clone());
                    queue.push_back(dep_unit);
                }
            }
        }
        names
    }

    pub async fn stop_unit(&self, name: &str) -> Result<Outcome, ManagerError> {
        let unit = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        let live = unit.lock().data.state.is_live();
        if !live {
            return Err(ManagerError::NotActive(name.to_string()));
        }
        let status = self.stop_worker(&unit).await;
        Ok(Outcome::single(status, unit.snapshot()))
    }

    pub async fn restart_unit(&self, name: &str) -> Result<Outcome, ManagerError> {
        self.start_unit(
            name,
            StartOptions {
                restart: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Swap changed units for freshly loaded definitions.
    ///
    /// `defs` is a complete fresh load of the unit directories: unknown
    /// names are added, changed units are replaced, and changed units
    /// missing from `defs` (their file is gone) are removed. Units that
    /// were live are stopped first and started again afterwards.
    pub async fn reload_changed(&self, defs: Vec<UnitDef>) -> Vec<String> {
        let _guard = self.ctx.start_lock.lock().await;
        self.ctx.take_files_changed();

        let fresh: HashSet<String> = defs.iter().map(|d| d.name.clone()).collect();
        for unit in self.registry.all() {
            let changed = unit.lock().is_changed;
            if changed && !fresh.contains(unit.name()) {
                log::info!("{}: unit file removed", unit.name());
                self.stop_worker(&unit).await;
                self.registry.remove(unit.name());
            }
        }

        let mut replace = Vec::new();
        let mut restart = Vec::new();
        for def in defs {
            match self.registry.get(&def.name) {
                None => replace.push(def),
                Some(current) => {
                    let (changed, live) = {
                        let state = current.lock();
                        (state.is_changed, state.data.state.is_live())
                    };
                    if !changed {
                        continue;
                    }
                    if live {
                        self.stop_worker(&current).await;
                        restart.push(def.name.clone());
                    }
                    self.registry.remove(&def.name);
                    replace.push(def);
                }
            }
        }

        let loaded = self.load_units(replace);
        for name in &loaded {
            log::info!("{}: reloaded", name);
        }
        if !restart.is_empty() && !self.ctx.is_shutting_down() {
            self.start_all(&restart).await;
        }
        loaded
    }

    /// Begin shutdown and stop every live unit
    pub async fn shutdown(&self) -> RunSummary {
        log::info!("Shutting down");
        self.ctx.request_shutdown();
        let names = self.registry.names();
        self.stop_all(&names).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Unit not found: {0}")]
    NotFound(String),

    #[error("Unit already active: {0}")]
    AlreadyActive(String),

    #[error("Unit not active: {0}")]
    NotActive(String),

    #[error("Unit has configuration errors: {0}")]
    Invalid(String),

    #[error("Unit is not wanted by any state: {0}")]
    NoWantedBy(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Failed to spawn: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Watch failed: {0}")]
    Watch(#[from] WatchError),

    #[error("I/O error: {0}")]
    Io(String),
}
