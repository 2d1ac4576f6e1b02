//! Restart supervisor for daemons and oneshots
//!
//! A unit with `Restart=` or `RestartMax=` gets one supervisor task. The
//! task sleeps on the unit's wake-up channel; each `ChildExited` runs the
//! failure command when the run failed, then restarts the unit after the
//! restart delay while the policy allows it. `Stop`, a closed channel or
//! shutdown end the task.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::process;
use super::registry::{UnitHandle, Wakeup};
use super::state::{FinalStatus, ProcessState};
use super::{cancelled, Manager};

impl Manager {
    /// Spawn the supervisor unless one already owns the unit's channel
    pub(crate) fn ensure_supervisor(&self, unit: &Arc<UnitHandle>) {
        let Some((id, rx)) = unit.open_pipe() else {
            return;
        };
        log::debug!("{}: supervisor started", unit.name());
        let manager = self.clone();
        let unit = Arc::clone(unit);
        tokio::spawn(async move {
            manager.supervise(&unit, rx).await;
            unit.close_pipe(id);
            log::debug!("{}: supervisor exited", unit.name());
        });
    }

    async fn supervise(&self, unit: &Arc<UnitHandle>, mut rx: mpsc::UnboundedReceiver<Wakeup>) {
        let mut shutdown = self.ctx.shutdown_signal();
        loop {
            let wakeup = tokio::select! {
                w = rx.recv() => w,
                _ = cancelled(&mut shutdown) => return,
            };
            match wakeup {
                Some(Wakeup::ChildExited) => {}
                Some(Wakeup::Stop) | None => return,
            }

            let (failed, pid) = {
                let state = unit.lock();
                (state.data.final_status == FinalStatus::Failure, state.data.pid)
            };
            if failed {
                self.run_failure_command(unit, pid).await;
            }

            let restart_num = {
                let mut state = unit.lock();
                if state.is_stopping || self.ctx.is_shutting_down() {
                    return;
                }
                if !unit.def().restart_allowed(state.restart_num) {
                    log::info!(
                        "{}: not restarting after {} restarts",
                        unit.name(),
                        state.restart_num
                    );
                    return;
                }
                state.archive_for_restart();
                state.pending = true;
                unit.publish(&mut state, FinalStatus::Ready);
                state.restart_num
            };
            log::info!(
                "{}: restarting in {} ms (restart {})",
                unit.name(),
                self.ctx.config.restart_delay.as_millis(),
                restart_num
            );

            let interrupted = tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.restart_delay) => false,
                _ = cancelled(&mut shutdown) => true,
                w = rx.recv() => !matches!(w, Some(Wakeup::ChildExited)),
            };
            if interrupted {
                let mut state = unit.lock();
                if state.is_stopping {
                    // The stop path owns the final state
                    return;
                }
                state.data.finish(ProcessState::Dead, None, None);
                state.messages.push("Restart cancelled".to_string());
                unit.complete(&mut state, FinalStatus::Failure);
                return;
            }

            self.start_worker_boxed(Arc::clone(unit)).await;
        }
    }

    /// Run the unit's `Failure=` command with `$PID` of the failed run
    async fn run_failure_command(&self, unit: &UnitHandle, pid: Option<i32>) {
        let Some(failure) = unit.def().failure.as_deref() else {
            return;
        };
        let cmd = process::substitute_pid(failure, pid);
        log::info!("{}: running failure command", unit.name());
        let opts = Self::spawn_options(unit.def());
        match process::exec_script(&cmd, &opts, self.ctx.config.oneshot_timeout).await {
            Ok(status) => log::debug!("{}: failure command ended with {:?}", unit.name(), status),
            Err(e) => {
                log::warn!("{}: failure command failed: {}", unit.name(), e);
                unit.lock().errors.push(format!("Failure command failed: {}", e));
            }
        }
    }
}
