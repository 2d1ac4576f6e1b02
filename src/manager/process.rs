//! Process spawning and signalling
//!
//! Children are forked directly and registered with the exit watcher
//! while its table is locked, so no exit can be missed. Everything the
//! child needs (argv, envp, program path) is prepared before the fork.

use crate::pid1::{ChildStatus, ChildWatch, ExitWatcher};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PATH given to units that do not inherit the daemon environment
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Upper bound on waiting for a SIGKILLed process to be reaped
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code of a child whose exec failed
const EXEC_FAILED: i32 = 127;

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Forward the daemon's environment instead of a bare PATH
    pub inherit_env: bool,
}

struct ExecPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
}

/// Parse a command line into program and arguments
pub fn parse_command(cmd: &str) -> Result<(String, Vec<String>), SpawnError> {
    let parts = shlex::split(cmd).ok_or_else(|| SpawnError::InvalidCommand(cmd.to_string()))?;

    let Some((program, args)) = parts.split_first() else {
        return Err(SpawnError::InvalidCommand(cmd.to_string()));
    };

    Ok((program.clone(), args.to_vec()))
}

/// Replace `$PID` with the unit's main pid
pub fn substitute_pid(cmd: &str, pid: Option<i32>) -> String {
    match pid {
        Some(pid) => cmd.replace("$PID", &pid.to_string()),
        None => cmd.to_string(),
    }
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Look a program up the way execvp would
pub fn resolve_program(program: &str, search_path: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
}

fn plan(cmd: &str, options: &SpawnOptions) -> Result<ExecPlan, SpawnError> {
    let (program, args) = parse_command(cmd)?;

    let search_path = if options.inherit_env {
        std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string())
    } else {
        DEFAULT_PATH.to_string()
    };
    let resolved = resolve_program(&program, &search_path)
        .ok_or_else(|| SpawnError::NotFound(program.clone()))?;

    let c_string =
        |bytes: &[u8]| CString::new(bytes).map_err(|_| SpawnError::InvalidCommand(cmd.to_string()));

    let mut argv = vec![c_string(program.as_bytes())?];
    for arg in &args {
        argv.push(c_string(arg.as_bytes())?);
    }

    let envp = if options.inherit_env {
        None
    } else {
        Some(vec![c_string(format!("PATH={}", DEFAULT_PATH).as_bytes())?])
    };

    Ok(ExecPlan {
        program: c_string(resolved.as_os_str().as_bytes())?,
        argv,
        envp,
    })
}

/// Fork and exec `cmd`, returning a handle that reports its exit
pub fn exec_process(cmd: &str, options: &SpawnOptions) -> Result<ChildWatch, SpawnError> {
    let plan = plan(cmd, options)?;
    let devnull = std::fs::File::open("/dev/null")?;
    let devnull_fd = devnull.as_raw_fd();

    let mut argv: Vec<*const libc::c_char> = plan.argv.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let envp: Option<Vec<*const libc::c_char>> = plan.envp.as_ref().map(|vars| {
        let mut ptrs: Vec<_> = vars.iter().map(|v| v.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        ptrs
    });

    ExitWatcher::global().spawn_tracked(|| {
        // SAFETY: between fork and exec the child only makes
        // async-signal-safe libc calls on memory prepared above.
        match unsafe { fork() }? {
            ForkResult::Child => unsafe {
                libc::setsid();
                libc::dup2(devnull_fd, 0);
                libc::signal(libc::SIGPIPE, libc::SIG_DFL);
                match &envp {
                    Some(envp) => libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
                    None => libc::execv(plan.program.as_ptr(), argv.as_ptr()),
                };
                libc::_exit(EXEC_FAILED)
            },
            ForkResult::Parent { child } => Ok(child.as_raw()),
        }
    })
}

/// Run `cmd` to completion, killing it after `timeout`
pub async fn exec_script(
    cmd: &str,
    options: &SpawnOptions,
    timeout: Duration,
) -> Result<ChildStatus, SpawnError> {
    let mut child = exec_process(cmd, options)?;
    match tokio::time::timeout(timeout, child.wait_exit()).await {
        Ok(status) => Ok(status),
        Err(_) => {
            kill_and_reap(&mut child).await;
            Err(SpawnError::Timeout {
                cmd: cmd.to_string(),
                after: timeout,
            })
        }
    }
}

/// Send a signal; a process that is already gone is not an error
pub fn send_signal(pid: i32, signal: Signal) -> Result<(), SpawnError> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SpawnError::Signal { pid, source }),
    }
}

/// SIGKILL the child and wait for the watcher to reap it
pub async fn kill_and_reap(child: &mut ChildWatch) -> ChildStatus {
    let pid = child.pid();
    if let Err(e) = send_signal(pid, Signal::SIGKILL) {
        log::error!("{}", e);
    }
    match tokio::time::timeout(KILL_REAP_TIMEOUT, child.wait_exit()).await {
        Ok(status) => status,
        Err(_) => {
            log::error!("PID {} still not reaped after SIGKILL", pid);
            ChildStatus::Signaled(Signal::SIGKILL as i32)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Failed to fork: {0}")]
    Fork(#[from] Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to signal PID {pid}: {source}")]
    Signal { pid: i32, source: Errno },

    #[error("'{cmd}' timed out after {} ms", .after.as_millis())]
    Timeout { cmd: String, after: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_command_quoting() {
        let (program, args) = parse_command(r#"/bin/sh -c "echo 'a b' > /tmp/x""#).unwrap();
        assert_eq!(program, "/bin/sh");
        assert_eq!(args, vec!["-c", "echo 'a b' > /tmp/x"]);
    }

    #[test]
    fn test_parse_command_invalid() {
        assert!(matches!(parse_command(""), Err(SpawnError::InvalidCommand(_))));
        assert!(matches!(
            parse_command("/bin/echo \"unterminated"),
            Err(SpawnError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_substitute_pid() {
        assert_eq!(substitute_pid("/bin/kill -HUP $PID", Some(42)), "/bin/kill -HUP 42");
        assert_eq!(substitute_pid("/bin/kill -HUP $PID", None), "/bin/kill -HUP $PID");
    }

    #[test]
    fn test_resolve_program() {
        assert!(resolve_program("sh", DEFAULT_PATH).is_some());
        assert!(resolve_program("/bin/sh", "").is_some());
        assert!(resolve_program("definitely-not-a-program-xyz", DEFAULT_PATH).is_none());
        // Directories are not executables
        assert!(resolve_program("/tmp", DEFAULT_PATH).is_none());
    }

    #[tokio::test]
    async fn test_exec_script_exit_codes() {
        let opts = SpawnOptions::default();
        let status = assert_ok!(exec_script("sh -c 'exit 0'", &opts, Duration::from_secs(5)).await);
        assert_eq!(status, ChildStatus::Exited(0));
        let status = assert_ok!(exec_script("sh -c 'exit 3'", &opts, Duration::from_secs(5)).await);
        assert_eq!(status, ChildStatus::Exited(3));
    }

    #[tokio::test]
    async fn test_exec_script_timeout_kills() {
        let opts = SpawnOptions::default();
        let err = assert_err!(exec_script("sleep 30", &opts, Duration::from_millis(200)).await);
        assert!(matches!(err, SpawnError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        let opts = SpawnOptions::default();
        let status = assert_ok!(
            exec_script(
                r#"sh -c 'test -z "$HOME" && test -n "$PATH"'"#,
                &opts,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(status, ChildStatus::Exited(0));
    }

    #[test]
    fn test_exec_process_not_found() {
        let result = exec_process("no-such-binary-unitd --flag", &SpawnOptions::default());
        assert!(matches!(result, Err(SpawnError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_signal_and_reap() {
        let mut child = assert_ok!(exec_process("sleep 30", &SpawnOptions::default()));
        assert_ok!(send_signal(child.pid(), Signal::SIGTERM));
        assert_eq!(child.wait_exit().await, ChildStatus::Signaled(libc::SIGTERM));
        // Already gone
        assert_ok!(send_signal(child.pid(), Signal::SIGTERM));
    }
}
