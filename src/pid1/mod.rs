//! Init-process plumbing
//!
//! - Child exit watching and zombie reaping
//! - Signal handling
//! - Subreaper setup when not running as PID 1

mod reaper;
mod signals;

pub use reaper::{ChildStatus, ChildWatch, ExitWatcher};
pub use signals::{DaemonSignal, SignalHandler};

use std::process;

/// Check if we are running as PID 1
pub fn is_pid1() -> bool {
    process::id() == 1
}

/// Prepare the process for supervising children.
///
/// As PID 1 orphans are reparented to us anyway. Otherwise we mark the
/// process as a child subreaper so orphaned grandchildren of units are
/// reaped by the exit watcher instead of leaking to the real init.
pub fn init() -> Result<(), Pid1Error> {
    if is_pid1() {
        log::info!("Running as PID 1");
    } else {
        // SAFETY: prctl with PR_SET_CHILD_SUBREAPER takes a plain integer argument
        let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
        if ret != 0 {
            return Err(Pid1Error::Subreaper(std::io::Error::last_os_error()));
        }
        log::debug!("Registered as child subreaper (pid={})", process::id());
    }

    ExitWatcher::global();
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Pid1Error {
    #[error("Failed to become child subreaper: {0}")]
    Subreaper(std::io::Error),
}
