//! Timer unit operations
//!
//! A timer unit cycles `Running → Restarting → Running`: it is `Running`
//! while armed and `Restarting` while its target runs. The outcome of the
//! target never fails the timer itself.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;

use super::registry::{UnitHandle, Wakeup};
use super::state::{FinalStatus, ProcessState, TimerState};
use super::timer_scheduler::{self, OsTimer};
use super::{cancelled, ExecOutcome, Manager};
use crate::units::TimerSpec;

impl Manager {
    /// Start a timer unit: recover or compute the next fire time and arm
    pub(super) async fn start_timer(&self, unit: &Arc<UnitHandle>) -> FinalStatus {
        let name = unit.name();
        let Some(spec) = unit.def().timer.clone() else {
            return self.fail_start(unit, "Missing [Interval] section".to_string());
        };
        let timer = match OsTimer::new(spec.wake_system) {
            Ok(timer) => timer,
            Err(e) => return self.fail_start(unit, e.to_string()),
        };

        let state_dir = &self.ctx.config.state_dir;
        let next = match timer_scheduler::read_next_time(state_dir, name) {
            Some(at) if at > Local::now() => {
                log::info!("{}: resuming, next run at {}", name, at.format("%F %T"));
                at
            }
            _ => {
                log::info!("{}: running {} now", name, spec.unit);
                if self.execute_unit(&spec.unit).await == ExecOutcome::ShuttingDown {
                    return self.fail_start(unit, "Shutdown in progress".to_string());
                }
                match timer_scheduler::schedule(&spec, Local::now()) {
                    Ok((at, _)) => at,
                    Err(e) => return self.fail_start(unit, e.to_string()),
                }
            }
        };

        let left = match self.arm_timer(name, &timer, next) {
            Ok(left) => left,
            Err(msg) => return self.fail_start(unit, msg),
        };

        {
            let mut state = unit.lock();
            state.data.set_running(None);
            state.timer = Some(TimerState {
                next_time: Some(next),
                left,
            });
            unit.complete(&mut state, FinalStatus::Success);
        }
        log::info!("{}: armed for {} ms", name, left.as_millis());

        let Some((id, rx)) = unit.open_pipe() else {
            log::warn!("{}: timer engine already running", name);
            return FinalStatus::Success;
        };
        let manager = self.clone();
        let unit = Arc::clone(unit);
        tokio::spawn(async move {
            manager.timer_loop(&unit, &spec, &timer, rx).await;
            if let Err(e) = timer.disarm() {
                log::debug!("{}: {}", unit.name(), e);
            }
            unit.close_pipe(id);
            log::debug!("{}: timer engine exited", unit.name());
        });
        FinalStatus::Success
    }

    /// Persist `next` and arm the OS timer for the time left until it
    fn arm_timer(
        &self,
        name: &str,
        timer: &OsTimer,
        next: chrono::DateTime<Local>,
    ) -> Result<std::time::Duration, String> {
        if let Err(e) = timer_scheduler::write_next_time(&self.ctx.config.state_dir, name, next) {
            log::warn!("{}: could not persist next run: {}", name, e);
        }
        let left = timer_scheduler::time_left(next);
        timer.arm(left).map_err(|e| e.to_string())?;
        Ok(left)
    }

    async fn timer_loop(
        &self,
        unit: &UnitHandle,
        spec: &TimerSpec,
        timer: &OsTimer,
        mut rx: mpsc::UnboundedReceiver<Wakeup>,
    ) {
        let name = unit.name();
        let mut shutdown = self.ctx.shutdown_signal();

        loop {
            tokio::select! {
                fired = timer.wait() => {
                    if let Err(e) = fired {
                        log::error!("{}: {}", name, e);
                        unit.lock().errors.push(e.to_string());
                        return;
                    }
                }
                w = rx.recv() => match w {
                    Some(Wakeup::ChildExited) => continue,
                    Some(Wakeup::Stop) | None => return,
                },
                _ = cancelled(&mut shutdown) => return,
            }

            if let Err(e) = timer.disarm() {
                log::debug!("{}: {}", name, e);
            }
            {
                let mut state = unit.lock();
                if state.is_stopping {
                    return;
                }
                state.data.state = ProcessState::Restarting;
            }

            log::info!("{}: timer fired, running {}", name, spec.unit);
            match self.execute_unit(&spec.unit).await {
                ExecOutcome::ShuttingDown => return,
                ExecOutcome::Success => {}
                ExecOutcome::Failure => log::warn!("{}: {} failed", name, spec.unit),
            }

            let next = match timer_scheduler::schedule(spec, Local::now()) {
                Ok((next, _)) => next,
                Err(e) => {
                    log::error!("{}: {}", name, e);
                    unit.lock().errors.push(e.to_string());
                    return;
                }
            };
            let left = match self.arm_timer(name, timer, next) {
                Ok(left) => left,
                Err(msg) => {
                    log::error!("{}: {}", name, msg);
                    unit.lock().errors.push(msg);
                    return;
                }
            };

            let mut state = unit.lock();
            if state.is_stopping {
                return;
            }
            state.data.state = ProcessState::Running;
            state.timer = Some(TimerState {
                next_time: Some(next),
                left,
            });
            log::debug!("{}: next run at {}", name, next.format("%F %T"));
        }
    }

    /// Record the outcome of a triggered run under the state directory
    pub(crate) fn record_last_run(&self, name: &str, status: FinalStatus) {
        if let Err(e) =
            timer_scheduler::write_last_run(&self.ctx.config.state_dir, name, Local::now(), status)
        {
            log::warn!("{}: could not record last run: {}", name, e);
        }
    }
}
