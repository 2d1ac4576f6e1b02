//! Unit runtime state
//!
//! ```text
//!     ┌──────┐ start  ┌─────────┐  exit/kill  ┌────────────┐
//!     │ Dead │───────▶│ Running │────────────▶│ Dead/Killed│
//!     └──────┘        └────┬────┘             └─────┬──────┘
//!                          │ oneshot done           │ restart policy
//!                     ┌────▼────┐             ┌─────▼──────┐
//!                     │ Exited  │             │ Restarting │──▶ Running
//!                     └─────────┘             └────────────┘
//! ```
//!
//! Everything here is mutated only under the owning unit's lock.

use crate::pid1::ChildWatch;
use crate::units::UnitKind;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Dead,
    /// Oneshot finished on its own
    Exited,
    /// Terminated by a signal (timeout kill included)
    Killed,
    Running,
    /// Waiting for a restart, or a timer/path unit running its target
    Restarting,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dead => "dead",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Running => "running",
            Self::Restarting => "restarting",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

/// Outcome of the last start attempt, broadcast to dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    Ready,
    Success,
    Failure,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Process fields of one run of a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessData {
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub state: ProcessState,
    pub final_status: FinalStatus,
    pub started_at: Option<DateTime<Local>>,
    pub stopped_at: Option<DateTime<Local>>,
    pub duration: Option<Duration>,
}

impl Default for ProcessData {
    fn default() -> Self {
        Self {
            pid: None,
            exit_code: None,
            signal: None,
            state: ProcessState::Dead,
            final_status: FinalStatus::Ready,
            started_at: None,
            stopped_at: None,
            duration: None,
        }
    }
}

impl ProcessData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark started; `pid` is `None` for timer and path units
    pub fn set_running(&mut self, pid: Option<i32>) {
        self.pid = pid;
        self.exit_code = None;
        self.signal = None;
        self.state = ProcessState::Running;
        self.started_at = Some(Local::now());
        self.stopped_at = None;
        self.duration = None;
    }

    /// Record the end of a run
    pub fn finish(&mut self, state: ProcessState, exit_code: Option<i32>, signal: Option<i32>) {
        let now = Local::now();
        self.state = state;
        self.exit_code = exit_code;
        self.signal = signal;
        self.stopped_at = Some(now);
        self.duration = self
            .started_at
            .and_then(|started| (now - started).to_std().ok());
    }
}

/// Timer sub-record
#[derive(Debug, Clone, Default)]
pub struct TimerState {
    pub next_time: Option<DateTime<Local>>,
    /// Time left until `next_time` when the OS timer was armed
    pub left: Duration,
}

/// PathWatch sub-record
#[derive(Debug, Clone, Default)]
pub struct WatchState {
    pub monitors: Vec<PathBuf>,
}

/// Runtime state of a unit, protected by the unit's mutex
#[derive(Debug)]
pub struct UnitState {
    pub data: ProcessData,
    pub restart_num: u32,
    history: VecDeque<ProcessData>,
    history_max: usize,
    /// Load and validation errors; a unit with any never starts
    pub config_errors: Vec<String>,
    /// Runtime errors, in the order they happened
    pub errors: Vec<String>,
    pub messages: Vec<String>,
    pub is_changed: bool,
    pub is_stopping: bool,
    pub is_enabled: bool,
    /// A start worker is scheduled or running
    pub pending: bool,
    /// Tracked main process of a daemon or oneshot
    pub child: Option<ChildWatch>,
    pub timer: Option<TimerState>,
    pub watch: Option<WatchState>,
}

impl UnitState {
    pub fn new(history_max: usize) -> Self {
        Self {
            data: ProcessData::new(),
            restart_num: 0,
            history: VecDeque::new(),
            history_max,
            config_errors: Vec::new(),
            errors: Vec::new(),
            messages: Vec::new(),
            is_changed: false,
            is_stopping: false,
            is_enabled: false,
            pending: false,
            child: None,
            timer: None,
            watch: None,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &ProcessData> {
        self.history.iter()
    }

    /// Append to history, evicting the oldest entry when full
    pub fn push_history(&mut self, data: ProcessData) {
        if self.history_max == 0 {
            return;
        }
        while self.history.len() >= self.history_max {
            self.history.pop_front();
        }
        self.history.push_back(data);
    }

    /// Archive the current run and start a fresh `Restarting` snapshot
    pub fn archive_for_restart(&mut self) {
        let previous = std::mem::take(&mut self.data);
        self.push_history(previous);
        self.data.state = ProcessState::Restarting;
        self.restart_num += 1;
    }

    /// Clear restart count, history and runtime errors
    pub fn reset(&mut self) {
        self.restart_num = 0;
        self.history.clear();
        self.errors.clear();
        self.messages.clear();
    }

    pub fn has_config_errors(&self) -> bool {
        !self.config_errors.is_empty()
    }
}

/// Copy of a unit's state handed to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub name: String,
    pub kind: UnitKind,
    pub description: Option<String>,
    pub data: ProcessData,
    pub restart_num: u32,
    pub history: Vec<ProcessData>,
    pub errors: Vec<String>,
    pub messages: Vec<String>,
    pub is_changed: bool,
    pub is_enabled: bool,
    pub next_time: Option<DateTime<Local>>,
    pub monitors: Vec<PathBuf>,
}

impl UnitSnapshot {
    pub fn is_running(&self) -> bool {
        self.data.state.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = UnitState::new(4);
        assert_eq!(state.data.state, ProcessState::Dead);
        assert_eq!(state.data.final_status, FinalStatus::Ready);
        assert_eq!(state.restart_num, 0);
        assert_eq!(state.history().count(), 0);
    }

    #[test]
    fn test_running_then_finish() {
        let mut data = ProcessData::new();
        data.set_running(Some(4242));
        assert_eq!(data.state, ProcessState::Running);
        assert!(data.started_at.is_some());

        data.finish(ProcessState::Killed, None, Some(9));
        assert_eq!(data.state, ProcessState::Killed);
        assert_eq!(data.signal, Some(9));
        assert!(data.stopped_at.is_some());
        assert!(data.duration.is_some());
        assert_eq!(data.pid, Some(4242));
    }

    #[test]
    fn test_history_fifo_eviction() {
        let mut state = UnitState::new(3);
        for pid in 1..=5 {
            let mut data = ProcessData::new();
            data.pid = Some(pid);
            state.push_history(data);
        }
        let pids: Vec<_> = state.history().map(|d| d.pid.unwrap()).collect();
        assert_eq!(pids, vec![3, 4, 5]);
    }

    #[test]
    fn test_archive_for_restart() {
        let mut state = UnitState::new(2);
        state.data.set_running(Some(10));
        state.data.finish(ProcessState::Dead, Some(1), None);
        state.data.final_status = FinalStatus::Failure;

        state.archive_for_restart();
        assert_eq!(state.restart_num, 1);
        assert_eq!(state.data.state, ProcessState::Restarting);
        assert_eq!(state.data.pid, None);
        assert_eq!(state.data.final_status, FinalStatus::Ready);
        let archived: Vec<_> = state.history().collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].exit_code, Some(1));

        state.archive_for_restart();
        state.archive_for_restart();
        assert_eq!(state.restart_num, 3);
        assert_eq!(state.history().count(), 2);
    }

    #[test]
    fn test_reset_keeps_config_errors() {
        let mut state = UnitState::new(2);
        state.config_errors.push("Missing Run command".into());
        state.errors.push("Exited with code 1".into());
        state.archive_for_restart();
        state.reset();
        assert_eq!(state.restart_num, 0);
        assert_eq!(state.history().count(), 0);
        assert!(state.errors.is_empty());
        assert!(state.has_config_errors());
    }

    #[test]
    fn test_live_states() {
        assert!(ProcessState::Running.is_live());
        assert!(ProcessState::Restarting.is_live());
        assert!(!ProcessState::Exited.is_live());
        assert!(!ProcessState::Killed.is_live());
        assert_eq!(FinalStatus::Failure.as_str(), "failure");
    }
}
