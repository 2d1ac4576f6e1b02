//! Child exit watcher
//!
//! A single ordinary thread blocks in `waitpid(-1)` and attributes every
//! state change to the process that spawned the child. Nothing runs in
//! signal context: tracked children get their status published on a
//! `watch` channel, everything else is reaped and dropped so no zombie
//! is left behind.

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, Once, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

/// How long the watcher sleeps when there are no children at all
const IDLE_POLL: Duration = Duration::from_millis(200);

static WATCHER: OnceLock<ExitWatcher> = OnceLock::new();
static STARTED: Once = Once::new();

/// Last observed state of a tracked child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    /// Stopped by the given signal (SIGSTOP, SIGTSTP, ...)
    Stopped(i32),
    Continued,
    /// Exited normally with code
    Exited(i32),
    /// Killed by signal
    Signaled(i32),
}

impl ChildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChildStatus::Exited(_) | ChildStatus::Signaled(_))
    }

    fn from_wait_status(status: WaitStatus) -> Option<(i32, Self)> {
        match status {
            WaitStatus::Exited(p, code) => Some((p.as_raw(), ChildStatus::Exited(code))),
            WaitStatus::Signaled(p, sig, _) => Some((p.as_raw(), ChildStatus::Signaled(sig as i32))),
            WaitStatus::Stopped(p, sig) => Some((p.as_raw(), ChildStatus::Stopped(sig as i32))),
            WaitStatus::Continued(p) => Some((p.as_raw(), ChildStatus::Continued)),
            _ => None,
        }
    }
}

/// Receiving side for one tracked child
#[derive(Debug, Clone)]
pub struct ChildWatch {
    pid: i32,
    rx: watch::Receiver<ChildStatus>,
}

impl ChildWatch {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Current status without waiting
    pub fn status(&self) -> ChildStatus {
        *self.rx.borrow()
    }

    /// Wait for the next state change.
    ///
    /// Returns `None` once the child has been fully reaped and no newer
    /// status is pending.
    pub async fn next(&mut self) -> Option<ChildStatus> {
        if self.rx.changed().await.is_err() {
            return None;
        }
        Some(*self.rx.borrow_and_update())
    }

    /// Wait until the child has exited or was killed
    pub async fn wait_exit(&mut self) -> ChildStatus {
        loop {
            let status = *self.rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

/// Process-wide table of tracked children
pub struct ExitWatcher {
    children: Mutex<HashMap<i32, watch::Sender<ChildStatus>>>,
    wakeup: Condvar,
}

impl ExitWatcher {
    fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            wakeup: Condvar::new(),
        }
    }

    /// Get the global watcher, starting its thread on first use
    pub fn global() -> &'static ExitWatcher {
        let watcher = WATCHER.get_or_init(ExitWatcher::new);
        STARTED.call_once(|| {
            let spawned = std::thread::Builder::new()
                .name("exit-watcher".into())
                .spawn(move || watcher.run());
            if let Err(e) = spawned {
                log::error!("Failed to start exit watcher thread: {}", e);
                crate::manager::fatal_sync_error("exit watcher thread");
            }
        });
        watcher
    }

    /// Spawn a child and start tracking it.
    ///
    /// The table stays locked while `spawn` runs, so the watcher thread
    /// cannot publish an exit before the pid is registered.
    pub fn spawn_tracked<F, E>(&self, spawn: F) -> Result<ChildWatch, E>
    where
        F: FnOnce() -> Result<i32, E>,
    {
        let mut children = self.lock();
        let pid = spawn()?;
        let (tx, rx) = watch::channel(ChildStatus::Running);
        children.insert(pid, tx);
        self.wakeup.notify_all();
        Ok(ChildWatch { pid, rx })
    }

    /// Number of children currently tracked
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, watch::Sender<ChildStatus>>> {
        match self.children.lock() {
            Ok(guard) => guard,
            Err(_) => crate::manager::fatal_sync_error("child table"),
        }
    }

    fn run(&self) {
        log::debug!("Exit watcher started");
        loop {
            match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED),
            ) {
                Ok(status) => self.dispatch(status),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    // No children; sleep until something gets spawned
                    let guard = self.lock();
                    let _ = self.wakeup.wait_timeout(guard, IDLE_POLL);
                }
                Err(e) => {
                    log::error!("waitpid error: {}", e);
                    std::thread::sleep(IDLE_POLL);
                }
            }
        }
    }

    fn dispatch(&self, status: WaitStatus) {
        let Some((pid, status)) = ChildStatus::from_wait_status(status) else {
            return;
        };

        let mut children = self.lock();
        if status.is_terminal() {
            match children.remove(&pid) {
                Some(tx) => {
                    tx.send_replace(status);
                }
                None => log::debug!("Reaped PID {} ({:?})", pid, status),
            }
        } else if let Some(tx) = children.get(&pid) {
            tx.send_replace(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(ChildStatus::Exited(0).is_terminal());
        assert!(ChildStatus::Signaled(9).is_terminal());
        assert!(!ChildStatus::Running.is_terminal());
        assert!(!ChildStatus::Stopped(19).is_terminal());
        assert!(!ChildStatus::Continued.is_terminal());
    }

    #[test]
    fn test_from_wait_status() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ChildStatus::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some((42, ChildStatus::Exited(3)))
        );
        assert_eq!(
            ChildStatus::from_wait_status(WaitStatus::Signaled(
                pid,
                nix::sys::signal::Signal::SIGKILL,
                false
            )),
            Some((42, ChildStatus::Signaled(9)))
        );
        assert_eq!(ChildStatus::from_wait_status(WaitStatus::StillAlive), None);
    }

    #[tokio::test]
    async fn test_wait_exit_sees_final_status_after_sender_dropped() {
        let (tx, rx) = watch::channel(ChildStatus::Running);
        let mut child = ChildWatch { pid: 1234, rx };
        tx.send_replace(ChildStatus::Exited(7));
        drop(tx);
        assert_eq!(child.wait_exit().await, ChildStatus::Exited(7));
        assert_eq!(child.next().await, None);
    }
}
