//! Dependency-ordered start and parallel stop
//!
//! `start_all` spawns one worker per unit. A worker waits on the final
//! status broadcast of each requirement, runs its unit by kind and
//! publishes its own final status under the unit lock. Validation has
//! already rejected cycles, so the waits always resolve.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::process::{self, kill_and_reap, KILL_REAP_TIMEOUT};
use super::registry::{UnitHandle, Wakeup};
use super::state::{FinalStatus, ProcessState};
use super::{cancelled, ExecOutcome, Manager, RunSummary};
use crate::pid1::{ChildStatus, ChildWatch};
use crate::units::UnitKind;

/// How a oneshot wait ended
enum OneshotEnd {
    Exited(ChildStatus),
    TimedOut,
    Cancelled,
}

/// What `prepare_start` decided for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartPlan {
    /// The caller owns the start
    Run,
    /// Already running, nothing to do
    Active,
    /// Another worker owns the start; wait for its broadcast
    InProgress,
}

impl Manager {
    /// Start a set of units concurrently, respecting Requires=
    pub async fn start_all(&self, names: &[String]) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut scheduled = Vec::new();
        let mut joining = Vec::new();

        for name in names {
            match self.registry.get(name) {
                Some(unit) => match self.prepare_start(&unit) {
                    StartPlan::Run => scheduled.push(unit),
                    StartPlan::Active => {}
                    StartPlan::InProgress => joining.push(unit),
                },
                None => {
                    log::error!("{}: unit not found", name);
                    summary.failed.push(name.clone());
                }
            }
        }

        let mut workers = JoinSet::new();
        for unit in scheduled {
            let manager = self.clone();
            workers.spawn(async move {
                let status = manager.start_worker(&unit).await;
                (unit.name().to_string(), status)
            });
        }
        for unit in joining {
            let manager = self.clone();
            workers.spawn(async move {
                let status = manager.join_start(&unit).await;
                (unit.name().to_string(), status)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, FinalStatus::Success)) => {}
                Ok((name, _)) => summary.failed.push(name),
                Err(e) => {
                    log::error!("Start worker failed: {}", e);
                    summary.failed.push("<worker>".to_string());
                }
            }
        }

        summary.failed.sort();
        summary
    }

    /// Mark a unit as about to start, unless it is already live or another
    /// worker owns its start.
    pub(crate) fn prepare_start(&self, unit: &UnitHandle) -> StartPlan {
        let mut state = unit.lock();
        if state.data.state.is_live() {
            log::debug!("{}: already active, skipping", unit.name());
            return StartPlan::Active;
        }
        if state.pending {
            log::debug!("{}: start already in progress", unit.name());
            return StartPlan::InProgress;
        }
        state.pending = true;
        state.is_stopping = false;
        unit.publish(&mut state, FinalStatus::Ready);
        StartPlan::Run
    }

    /// Share the result of a start another worker owns
    async fn join_start(&self, unit: &UnitHandle) -> FinalStatus {
        let mut rx = unit.subscribe();
        self.wait_final_status(&mut rx)
            .await
            .unwrap_or(FinalStatus::Failure)
    }

    /// Boxed start path for callers that are themselves reached from it
    /// (timer and path engines, the restart supervisor).
    pub(crate) fn start_worker_boxed(
        &self,
        unit: Arc<UnitHandle>,
    ) -> Pin<Box<dyn Future<Output = FinalStatus> + Send + '_>> {
        Box::pin(async move { self.start_worker(&unit).await })
    }

    /// Single-unit start path
    pub(crate) async fn start_worker(&self, unit: &Arc<UnitHandle>) -> FinalStatus {
        let name = unit.name();

        {
            let mut state = unit.lock();
            if state.has_config_errors() {
                log::warn!("{}: not started, unit has configuration errors", name);
                unit.complete(&mut state, FinalStatus::Failure);
                return FinalStatus::Failure;
            }
        }

        if let Err(msg) = self.check_conflicts(unit) {
            return self.fail_start(unit, msg);
        }

        for dep in &unit.def().requires {
            if let Err(msg) = self.wait_for_dependency(dep).await {
                return self.fail_start(unit, msg);
            }
        }

        if self.ctx.is_shutting_down() {
            return self.fail_start(unit, "Shutdown in progress".to_string());
        }
        {
            // A stop raced a restart; the stop path already published
            let state = unit.lock();
            if state.is_stopping {
                log::info!("{}: stopped before it could start", name);
                return state.data.final_status;
            }
        }

        if unit.def().kind.runs_process() && unit.def().needs_supervisor() {
            self.ensure_supervisor(unit);
        }

        match unit.def().kind {
            UnitKind::Daemon => self.run_daemon(unit),
            UnitKind::Oneshot => self.run_oneshot(unit).await,
            UnitKind::Timer => self.start_timer(unit).await,
            UnitKind::PathWatch => self.start_path_watch(unit),
        }
    }

    /// Record a start error and publish failure
    pub(crate) fn fail_start(&self, unit: &UnitHandle, msg: String) -> FinalStatus {
        log::warn!("{}: {}", unit.name(), msg);
        let mut state = unit.lock();
        if state.data.state == ProcessState::Restarting {
            // A restart that never ran leaves nothing live behind
            state.data.finish(ProcessState::Dead, None, None);
        }
        state.errors.push(msg);
        unit.complete(&mut state, FinalStatus::Failure);
        FinalStatus::Failure
    }

    fn check_conflicts(&self, unit: &UnitHandle) -> Result<(), String> {
        for other in &unit.def().conflicts {
            let Some(other_unit) = self.registry.get(other) else {
                continue;
            };
            let live = other_unit.lock().data.state.is_live();
            if live {
                return Err(format!("Conflicts with active unit '{}'", other));
            }
        }
        Ok(())
    }

    /// Wait for a requirement to finish starting
    async fn wait_for_dependency(&self, dep: &str) -> Result<(), String> {
        let Some(dep_unit) = self.registry.get(dep) else {
            return Err(format!("Unsatisfied dependency: '{}' not found", dep));
        };

        let mut rx = dep_unit.subscribe();
        {
            let state = dep_unit.lock();
            if state.has_config_errors() {
                return Err(format!("Unsatisfied dependency: '{}' has errors", dep));
            }
            if *rx.borrow_and_update() == FinalStatus::Ready && !state.pending {
                return Err(format!("Unsatisfied dependency: '{}' is not started", dep));
            }
        }

        match self.wait_final_status(&mut rx).await {
            Some(FinalStatus::Success) => Ok(()),
            Some(_) => Err(format!("Unsatisfied dependency: '{}' failed", dep)),
            None => Err("Shutdown in progress".to_string()),
        }
    }

    /// Wait until a broadcast leaves `Ready`; `None` on shutdown
    async fn wait_final_status(&self, rx: &mut watch::Receiver<FinalStatus>) -> Option<FinalStatus> {
        let mut shutdown = self.ctx.shutdown_signal();
        loop {
            let status = *rx.borrow_and_update();
            if status != FinalStatus::Ready {
                return Some(status);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Some(*rx.borrow());
                    }
                }
                _ = cancelled(&mut shutdown) => return None,
            }
        }
    }

    fn run_daemon(&self, unit: &Arc<UnitHandle>) -> FinalStatus {
        let def = unit.def();
        let Some(cmd) = def.run.as_deref() else {
            return self.fail_start(unit, "Missing Run command".to_string());
        };

        let child = match process::exec_process(cmd, &Self::spawn_options(def)) {
            Ok(child) => child,
            Err(e) => {
                let mut state = unit.lock();
                state.data.finish(ProcessState::Dead, None, None);
                drop(state);
                return self.fail_start(unit, e.to_string());
            }
        };

        let pid = child.pid();
        let status = {
            let mut state = unit.lock();
            state.data.set_running(Some(pid));
            match child.status() {
                ChildStatus::Exited(code) => {
                    state.data.finish(ProcessState::Dead, Some(code), None);
                    state.errors.push(format!("Exited immediately with code {}", code));
                    unit.complete(&mut state, FinalStatus::Failure);
                    FinalStatus::Failure
                }
                ChildStatus::Signaled(sig) => {
                    state.data.finish(ProcessState::Killed, None, Some(sig));
                    state.errors.push(format!("Killed immediately by signal {}", sig));
                    unit.complete(&mut state, FinalStatus::Failure);
                    FinalStatus::Failure
                }
                _ => {
                    state.child = Some(child.clone());
                    unit.complete(&mut state, FinalStatus::Success);
                    FinalStatus::Success
                }
            }
        };

        if status == FinalStatus::Success {
            log::info!("{}: started (PID {})", unit.name(), pid);
            self.track_exit(Arc::clone(unit), child);
        } else {
            unit.post(Wakeup::ChildExited);
        }
        status
    }

    async fn run_oneshot(&self, unit: &Arc<UnitHandle>) -> FinalStatus {
        let def = unit.def();
        let Some(cmd) = def.run.as_deref() else {
            return self.fail_start(unit, "Missing Run command".to_string());
        };

        let mut child = match process::exec_process(cmd, &Self::spawn_options(def)) {
            Ok(child) => child,
            Err(e) => return self.fail_start(unit, e.to_string()),
        };
        let pid = child.pid();
        {
            let mut state = unit.lock();
            state.data.set_running(Some(pid));
            state.child = Some(child.clone());
        }
        log::debug!("{}: running (PID {})", unit.name(), pid);

        let end = self.wait_oneshot(unit.name(), &mut child).await;
        let end = match end {
            OneshotEnd::Exited(status) => OneshotEnd::Exited(status),
            other => {
                let status = kill_and_reap(&mut child).await;
                log::debug!("{}: killed oneshot ({:?})", unit.name(), status);
                other
            }
        };

        let status = {
            let mut state = unit.lock();
            state.child = None;
            let status = if state.is_stopping {
                state.messages.push("Stopped while running".to_string());
                FinalStatus::Failure
            } else {
                match end {
                    OneshotEnd::Exited(ChildStatus::Exited(code)) => {
                        state.data.finish(ProcessState::Exited, Some(code), None);
                        if code == 0 {
                            FinalStatus::Success
                        } else {
                            state.errors.push(format!("Exited with code {}", code));
                            FinalStatus::Failure
                        }
                    }
                    OneshotEnd::Exited(ChildStatus::Signaled(sig)) => {
                        state.data.finish(ProcessState::Killed, None, Some(sig));
                        state.errors.push(format!("Killed by signal {}", sig));
                        FinalStatus::Failure
                    }
                    OneshotEnd::Exited(other) => {
                        state.data.finish(ProcessState::Dead, None, None);
                        state.errors.push(format!("Lost track of process ({:?})", other));
                        FinalStatus::Failure
                    }
                    OneshotEnd::TimedOut => {
                        let ms = self.ctx.config.oneshot_timeout.as_millis();
                        state.data.finish(ProcessState::Killed, None, Some(Signal::SIGKILL as i32));
                        state.errors.push(format!("Timeout: killed after {} ms", ms));
                        FinalStatus::Failure
                    }
                    OneshotEnd::Cancelled => {
                        state.data.finish(ProcessState::Killed, None, Some(Signal::SIGKILL as i32));
                        state.errors.push("Interrupted by shutdown".to_string());
                        FinalStatus::Failure
                    }
                }
            };
            unit.complete(&mut state, status);
            status
        };

        match status {
            FinalStatus::Success => log::info!("{}: finished", unit.name()),
            _ => {
                log::warn!("{}: failed", unit.name());
                unit.post(Wakeup::ChildExited);
            }
        }
        status
    }

    /// Wait for a oneshot with a warning and a hard timeout
    async fn wait_oneshot(&self, name: &str, child: &mut ChildWatch) -> OneshotEnd {
        let started = Instant::now();
        let warn_at = started + self.ctx.config.oneshot_warn_after;
        let deadline = started + self.ctx.config.oneshot_timeout;
        let mut warned = warn_at >= deadline;
        let mut shutdown = self.ctx.shutdown_signal();

        loop {
            let wake = if warned { deadline } else { warn_at };
            tokio::select! {
                status = child.wait_exit() => return OneshotEnd::Exited(status),
                _ = tokio::time::sleep_until(wake) => {
                    if warned {
                        log::warn!("{}: timed out, killing PID {}", name, child.pid());
                        return OneshotEnd::TimedOut;
                    }
                    log::warn!("{}: taking longer than expected", name);
                    warned = true;
                }
                _ = cancelled(&mut shutdown) => return OneshotEnd::Cancelled,
            }
        }
    }

    /// Stop a set of live units in parallel
    pub async fn stop_all(&self, names: &[String]) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut workers = JoinSet::new();

        for name in names {
            let Some(unit) = self.registry.get(name) else {
                continue;
            };
            let selected = {
                let state = unit.lock();
                match state.data.state {
                    ProcessState::Running => true,
                    ProcessState::Restarting => {
                        matches!(unit.def().kind, UnitKind::Timer | UnitKind::PathWatch)
                    }
                    _ => false,
                }
            };
            if !selected {
                continue;
            }
            let manager = self.clone();
            workers.spawn(async move {
                let status = manager.stop_worker(&unit).await;
                (unit.name().to_string(), status)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, FinalStatus::Success)) => {}
                Ok((name, _)) => summary.failed.push(name),
                Err(e) => {
                    log::error!("Stop worker failed: {}", e);
                    summary.failed.push("<worker>".to_string());
                }
            }
        }

        summary.failed.sort();
        summary
    }

    /// Single-unit stop path
    pub(crate) async fn stop_worker(&self, unit: &Arc<UnitHandle>) -> FinalStatus {
        let (pid, child) = {
            let mut state = unit.lock();
            if !state.data.state.is_live() {
                return FinalStatus::Success;
            }
            state.is_stopping = true;
            (state.data.pid, state.child.clone())
        };
        unit.stop_pipe();

        let Some(mut child) = child else {
            // Timer/path engines, or a daemon waiting for its restart
            let mut state = unit.lock();
            state.data.finish(ProcessState::Dead, None, None);
            state.timer = None;
            state.watch = None;
            unit.complete(&mut state, FinalStatus::Success);
            log::info!("{}: stopped", unit.name());
            return FinalStatus::Success;
        };

        // One window from the stop request to SIGKILL, stop command included
        let stop_timeout = self.ctx.config.stop_timeout;
        let deadline = Instant::now() + stop_timeout;
        let pid = pid.unwrap_or_else(|| child.pid());

        match unit.def().stop.as_deref() {
            Some(stop_cmd) => {
                let cmd = process::substitute_pid(stop_cmd, Some(pid));
                let opts = Self::spawn_options(unit.def());
                let left = deadline.saturating_duration_since(Instant::now());
                match process::exec_script(&cmd, &opts, left).await {
                    Ok(ChildStatus::Exited(0)) => {}
                    Ok(status) => log::warn!("{}: stop command ended with {:?}", unit.name(), status),
                    Err(e) => {
                        log::warn!("{}: stop command failed: {}", unit.name(), e);
                        unit.lock().errors.push(format!("Stop command failed: {}", e));
                    }
                }
            }
            None => {
                if let Err(e) = process::send_signal(pid, Signal::SIGTERM) {
                    log::warn!("{}: {}", unit.name(), e);
                }
            }
        }

        let exited = match tokio::time::timeout_at(deadline, child.wait_exit()).await {
            Ok(status) => Some(status),
            Err(_) => {
                log::warn!(
                    "{}: did not stop within {} ms, sending SIGKILL",
                    unit.name(),
                    stop_timeout.as_millis()
                );
                let _ = process::send_signal(pid, Signal::SIGKILL);
                tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait_exit())
                    .await
                    .ok()
            }
        };

        let mut state = unit.lock();
        state.child = None;
        let status = match exited {
            Some(ChildStatus::Exited(code)) => {
                state.data.finish(ProcessState::Dead, Some(code), None);
                FinalStatus::Success
            }
            Some(ChildStatus::Signaled(sig)) => {
                state.data.finish(ProcessState::Dead, None, Some(sig));
                FinalStatus::Success
            }
            _ => {
                state.data.finish(ProcessState::Dead, None, Some(Signal::SIGKILL as i32));
                state.errors.push(format!("PID {} did not exit after SIGKILL", pid));
                FinalStatus::Failure
            }
        };
        unit.publish(&mut state, status);
        log::info!("{}: stopped", unit.name());
        status
    }

    /// Run a unit on behalf of a timer or path unit
    pub async fn execute_unit(&self, name: &str) -> ExecOutcome {
        if self.ctx.is_shutting_down() {
            return ExecOutcome::ShuttingDown;
        }
        let Some(unit) = self.registry.get(name) else {
            log::error!("{}: unit not found", name);
            return ExecOutcome::Failure;
        };

        let status = match self.prepare_start(&unit) {
            StartPlan::Run => self.start_worker_boxed(Arc::clone(&unit)).await,
            StartPlan::Active => {
                log::info!("{}: already active, not started again", name);
                FinalStatus::Success
            }
            StartPlan::InProgress => self.join_start(&unit).await,
        };

        self.record_last_run(name, status);

        if self.ctx.is_shutting_down() {
            ExecOutcome::ShuttingDown
        } else if status == FinalStatus::Success {
            ExecOutcome::Success
        } else {
            ExecOutcome::Failure
        }
    }
}
