//! OS timer and persisted schedule for timer units
//!
//! Each active timer unit owns one `timerfd`, polled through tokio's
//! `AsyncFd`. `WakeSystem=` timers use the boot-time alarm clock so the
//! expiry resumes a suspended machine; if the process lacks the
//! capability for that clock the plain boot-time clock is used.
//!
//! Next-fire times survive restarts of the daemon in
//! `<state_dir>/timers/<unit>.next` as unix seconds.

use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tokio::io::unix::AsyncFd;

use super::state::FinalStatus;

/// Shortest interval the OS timer is armed with
const MIN_ARM: Duration = Duration::from_millis(1);

struct RawTimer(TimerFd);

impl AsRawFd for RawTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

/// One-shot OS timer
pub struct OsTimer {
    fd: AsyncFd<RawTimer>,
}

impl OsTimer {
    pub fn new(wake_system: bool) -> Result<Self, TimerError> {
        let flags = TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC;
        let timer = if wake_system {
            match TimerFd::new(ClockId::CLOCK_BOOTTIME_ALARM, flags) {
                Ok(timer) => timer,
                Err(e) => {
                    log::warn!("Alarm clock unavailable ({}), timer will not wake the system", e);
                    TimerFd::new(ClockId::CLOCK_BOOTTIME, flags)?
                }
            }
        } else {
            TimerFd::new(ClockId::CLOCK_MONOTONIC, flags)?
        };
        Ok(Self {
            fd: AsyncFd::new(RawTimer(timer))?,
        })
    }

    /// Arm to expire once after `after`
    pub fn arm(&self, after: Duration) -> Result<(), TimerError> {
        let after = after.max(MIN_ARM);
        self.fd.get_ref().0.set(
            Expiration::OneShot(TimeSpec::from_duration(after)),
            TimerSetTimeFlags::empty(),
        )?;
        Ok(())
    }

    pub fn disarm(&self) -> Result<(), TimerError> {
        self.fd.get_ref().0.unset()?;
        Ok(())
    }

    /// Wait for the next expiry
    pub async fn wait(&self) -> Result<(), TimerError> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().0.wait().map_err(io::Error::from)) {
                Ok(result) => return result.map_err(TimerError::from),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Next fire time, and the time left until it, for an interval from `from`
pub fn schedule(
    spec: &crate::units::TimerSpec,
    from: DateTime<Local>,
) -> Result<(DateTime<Local>, Duration), TimerError> {
    if !spec.has_interval() {
        return Err(TimerError::NoInterval);
    }
    let next = spec.next_fire(from).ok_or(TimerError::OutOfRange)?;
    Ok((next, time_left(next)))
}

/// Time from now until `at`, zero if it already passed
pub fn time_left(at: DateTime<Local>) -> Duration {
    (at - Local::now()).to_std().unwrap_or(Duration::ZERO)
}

fn next_time_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("timers").join(format!("{}.next", name))
}

/// Read a persisted next-fire time
pub fn read_next_time(state_dir: &Path, name: &str) -> Option<DateTime<Local>> {
    let content = std::fs::read_to_string(next_time_path(state_dir, name)).ok()?;
    let secs: i64 = content.trim().parse().ok()?;
    Local.timestamp_opt(secs, 0).single()
}

/// Persist the next-fire time; the last write wins
pub fn write_next_time(state_dir: &Path, name: &str, at: DateTime<Local>) -> io::Result<()> {
    let path = next_time_path(state_dir, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", at.timestamp()))
}

/// Record when a unit last ran on behalf of a timer or path unit
pub fn write_last_run(
    state_dir: &Path,
    name: &str,
    at: DateTime<Local>,
    status: FinalStatus,
) -> io::Result<()> {
    let dir = state_dir.join("last-run");
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(name), format!("{} {}\n", at.timestamp(), status.as_str()))
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("Timer syscall failed: {0}")]
    Os(#[from] Errno),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timer interval has no positive component")]
    NoInterval,

    #[error("Next fire time out of range")]
    OutOfRange,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::TimerSpec;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("unitd-timer-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_os_timer_fires() {
        let timer = OsTimer::new(false).unwrap();
        timer.arm(Duration::from_millis(20)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), timer.wait())
            .await
            .expect("timer did not fire")
            .unwrap();
    }

    #[tokio::test]
    async fn test_disarmed_timer_stays_quiet() {
        let timer = OsTimer::new(false).unwrap();
        timer.arm(Duration::from_millis(50)).unwrap();
        timer.disarm().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(200), timer.wait()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_schedule_requires_interval() {
        let spec = TimerSpec::new("backup.unit");
        assert!(matches!(schedule(&spec, Local::now()), Err(TimerError::NoInterval)));

        let mut spec = spec;
        spec.minutes = 2;
        let (next, left) = schedule(&spec, Local::now()).unwrap();
        assert!(next > Local::now());
        assert!(left <= Duration::from_secs(120));
        assert!(left > Duration::from_secs(110));
    }

    #[test]
    fn test_next_time_persistence() {
        let dir = temp_dir("next");
        assert!(read_next_time(&dir, "backup.timer").is_none());

        let at = Local.timestamp_opt(1_900_000_000, 0).unwrap();
        write_next_time(&dir, "backup.timer", at).unwrap();
        assert_eq!(read_next_time(&dir, "backup.timer"), Some(at));

        let later = Local.timestamp_opt(1_900_000_060, 0).unwrap();
        write_next_time(&dir, "backup.timer", later).unwrap();
        assert_eq!(read_next_time(&dir, "backup.timer"), Some(later));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_last_run_record() {
        let dir = temp_dir("last");
        let at = Local.timestamp_opt(1_900_000_000, 0).unwrap();
        write_last_run(&dir, "backup.unit", at, FinalStatus::Failure).unwrap();
        let content = std::fs::read_to_string(dir.join("last-run/backup.unit")).unwrap();
        assert_eq!(content, "1900000000 failure\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
