//! In-memory unit registry
//!
//! Each unit is an `Arc<UnitHandle>`: the immutable definition, the
//! runtime state behind a mutex, a `watch` slot broadcasting the final
//! status to dependents and at most one wake-up channel for the engine
//! supervising it (restart supervisor, timer or path watcher).

use super::fatal_sync_error;
use super::state::{FinalStatus, UnitSnapshot, UnitState};
use crate::units::UnitDef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{mpsc, watch};

/// Wake-up delivered on a unit's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The unit's main process exited or was killed
    ChildExited,
    /// Stop requested; the receiving engine exits
    Stop,
}

struct Pipe {
    id: u64,
    tx: mpsc::UnboundedSender<Wakeup>,
}

pub struct UnitHandle {
    def: UnitDef,
    state: Mutex<UnitState>,
    done: watch::Sender<FinalStatus>,
    pipe: Mutex<Option<Pipe>>,
    next_pipe_id: AtomicU64,
}

impl UnitHandle {
    pub fn new(def: UnitDef, history_max: usize) -> Self {
        let (done, _) = watch::channel(FinalStatus::Ready);
        let mut state = UnitState::new(history_max);
        state.config_errors = def.errors.clone();
        Self {
            def,
            state: Mutex::new(state),
            done,
            pipe: Mutex::new(None),
            next_pipe_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &UnitDef {
        &self.def
    }

    /// Lock the runtime state. A poisoned lock is fatal.
    pub fn lock(&self) -> MutexGuard<'_, UnitState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => fatal_sync_error(&format!("{}: unit state", self.def.name)),
        }
    }

    /// Set the final status and broadcast it.
    ///
    /// Takes the locked state so the broadcast happens under the unit lock.
    pub fn publish(&self, state: &mut UnitState, status: FinalStatus) {
        state.data.final_status = status;
        self.done.send_replace(status);
    }

    /// Finish a start attempt: clear `pending` and broadcast
    pub fn complete(&self, state: &mut UnitState, status: FinalStatus) {
        state.pending = false;
        self.publish(state, status);
    }

    /// Subscribe to final status changes
    pub fn subscribe(&self) -> watch::Receiver<FinalStatus> {
        self.done.subscribe()
    }

    fn pipe_lock(&self) -> MutexGuard<'_, Option<Pipe>> {
        match self.pipe.lock() {
            Ok(guard) => guard,
            Err(_) => fatal_sync_error(&format!("{}: unit channel", self.def.name)),
        }
    }

    /// Create the wake-up channel if none is open.
    ///
    /// Returns the channel id and receiver, or `None` when an engine
    /// already owns the channel.
    pub fn open_pipe(&self) -> Option<(u64, mpsc::UnboundedReceiver<Wakeup>)> {
        let mut pipe = self.pipe_lock();
        if pipe.as_ref().is_some_and(|p| !p.tx.is_closed()) {
            return None;
        }
        let id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        *pipe = Some(Pipe { id, tx });
        Some((id, rx))
    }

    /// Post a wake-up; returns false if no engine is listening
    pub fn post(&self, wakeup: Wakeup) -> bool {
        match self.pipe_lock().as_ref() {
            Some(pipe) => pipe.tx.send(wakeup).is_ok(),
            None => false,
        }
    }

    /// Drop the channel opened with `id`, leaving newer channels alone
    pub fn close_pipe(&self, id: u64) {
        let mut pipe = self.pipe_lock();
        if pipe.as_ref().is_some_and(|p| p.id == id) {
            *pipe = None;
        }
    }

    /// Ask the current engine to stop and drop its channel
    pub fn stop_pipe(&self) {
        if let Some(pipe) = self.pipe_lock().take() {
            let _ = pipe.tx.send(Wakeup::Stop);
        }
    }

    pub fn has_pipe(&self) -> bool {
        self.pipe_lock().as_ref().is_some_and(|p| !p.tx.is_closed())
    }

    pub fn snapshot(&self) -> UnitSnapshot {
        let state = self.lock();
        let mut errors = state.config_errors.clone();
        errors.extend(state.errors.iter().cloned());
        UnitSnapshot {
            name: self.def.name.clone(),
            kind: self.def.kind,
            description: self.def.description.clone(),
            data: state.data.clone(),
            restart_num: state.restart_num,
            history: state.history().cloned().collect(),
            errors,
            messages: state.messages.clone(),
            is_changed: state.is_changed,
            is_enabled: state.is_enabled,
            next_time: state.timer.as_ref().and_then(|t| t.next_time),
            monitors: state
                .watch
                .as_ref()
                .map(|w| w.monitors.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Default)]
pub struct Registry {
    units: RwLock<HashMap<String, Arc<UnitHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<UnitHandle>>> {
        match self.units.read() {
            Ok(guard) => guard,
            Err(_) => fatal_sync_error("unit registry"),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<UnitHandle>>> {
        match self.units.write() {
            Ok(guard) => guard,
            Err(_) => fatal_sync_error("unit registry"),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<UnitHandle>> {
        self.read().get(name).cloned()
    }

    pub fn insert(&self, unit: Arc<UnitHandle>) -> Option<Arc<UnitHandle>> {
        self.write().insert(unit.name().to_string(), unit)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<UnitHandle>> {
        self.write().remove(name)
    }

    /// All units, sorted by name
    pub fn all(&self) -> Vec<Arc<UnitHandle>> {
        let mut units: Vec<_> = self.read().values().cloned().collect();
        units.sort_by(|a, b| a.name().cmp(b.name()));
        units
    }

    pub fn names(&self) -> Vec<String> {
        self.all().iter().map(|u| u.name().to_string()).collect()
    }
}
