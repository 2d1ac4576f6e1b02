//! Applies child exit events to daemon units
//!
//! One task per running daemon follows the status the exit watcher
//! publishes for its pid. Stops by external signals are undone with
//! SIGCONT; the final exit is recorded under the unit lock and the unit's
//! supervisor is woken.

use std::sync::Arc;

use nix::sys::signal::Signal;

use super::process::send_signal;
use super::registry::{UnitHandle, Wakeup};
use super::state::{FinalStatus, ProcessState};
use super::Manager;
use crate::pid1::{ChildStatus, ChildWatch};

impl Manager {
    /// Follow a daemon's main process until it exits
    pub(crate) fn track_exit(&self, unit: Arc<UnitHandle>, mut child: ChildWatch) {
        tokio::spawn(async move {
            let pid = child.pid();
            let mut status = child.status();
            loop {
                match status {
                    ChildStatus::Stopped(sig) => {
                        log::warn!(
                            "{}: PID {} stopped by signal {}, sending SIGCONT",
                            unit.name(),
                            pid,
                            sig
                        );
                        if let Err(e) = send_signal(pid, Signal::SIGCONT) {
                            log::warn!("{}: {}", unit.name(), e);
                        }
                    }
                    ChildStatus::Continued => log::debug!("{}: PID {} continued", unit.name(), pid),
                    ChildStatus::Running => {}
                    terminal => {
                        apply_exit(&unit, pid, terminal);
                        return;
                    }
                }
                match child.next().await {
                    Some(next) => status = next,
                    None => return,
                }
            }
        });
    }
}

/// Record a daemon exit unless a stop is in progress
pub(crate) fn apply_exit(unit: &UnitHandle, pid: i32, status: ChildStatus) {
    {
        let mut state = unit.lock();
        if state.is_stopping || state.data.pid != Some(pid) {
            return;
        }
        let final_status = match status {
            ChildStatus::Exited(0) => {
                log::info!("{}: PID {} exited", unit.name(), pid);
                state.data.finish(ProcessState::Dead, Some(0), None);
                FinalStatus::Success
            }
            ChildStatus::Exited(code) => {
                log::warn!("{}: PID {} exited with code {}", unit.name(), pid, code);
                state.data.finish(ProcessState::Dead, Some(code), None);
                state.errors.push(format!("Exited with code {}", code));
                FinalStatus::Failure
            }
            ChildStatus::Signaled(sig) => {
                log::warn!("{}: PID {} killed by signal {}", unit.name(), pid, sig);
                state.data.finish(ProcessState::Killed, None, Some(sig));
                state.errors.push(format!("Killed by signal {}", sig));
                FinalStatus::Failure
            }
            _ => return,
        };
        state.child = None;
        unit.publish(&mut state, final_status);
    }
    unit.post(Wakeup::ChildExited);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitDef;

    fn running_unit(pid: i32) -> UnitHandle {
        let unit = UnitHandle::new(UnitDef::daemon("web.unit", "/bin/true"), 4);
        unit.lock().data.set_running(Some(pid));
        unit
    }

    #[tokio::test]
    async fn test_exit_records_and_wakes_supervisor() {
        let unit = running_unit(100);
        let (_, mut rx) = unit.open_pipe().unwrap();

        apply_exit(&unit, 100, ChildStatus::Exited(2));

        let snapshot = unit.snapshot();
        assert_eq!(snapshot.data.state, ProcessState::Dead);
        assert_eq!(snapshot.data.exit_code, Some(2));
        assert_eq!(snapshot.data.final_status, FinalStatus::Failure);
        assert_eq!(rx.recv().await, Some(Wakeup::ChildExited));
    }

    #[test]
    fn test_signal_marks_killed() {
        let unit = running_unit(100);
        apply_exit(&unit, 100, ChildStatus::Signaled(9));
        let snapshot = unit.snapshot();
        assert_eq!(snapshot.data.state, ProcessState::Killed);
        assert_eq!(snapshot.data.signal, Some(9));
    }

    #[test]
    fn test_ignored_while_stopping_or_stale() {
        let unit = running_unit(100);
        apply_exit(&unit, 99, ChildStatus::Exited(1));
        assert_eq!(unit.snapshot().data.state, ProcessState::Running);

        unit.lock().is_stopping = true;
        apply_exit(&unit, 100, ChildStatus::Exited(1));
        assert_eq!(unit.snapshot().data.state, ProcessState::Running);
    }
}
