//! Signal handling for the daemon
//!
//! - SIGTERM/SIGINT: Initiate shutdown
//! - SIGHUP: Reload changed unit files
//! - SIGUSR1: Dump unit state to the log
//!
//! SIGCHLD is not handled here; child exits are picked up by the exit
//! watcher thread.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signals that unitd handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Shutdown request (SIGTERM)
    Term,
    /// Interrupt (SIGINT, Ctrl+C)
    Int,
    /// Hangup (SIGHUP) - reload changed units
    Hup,
    /// User signal 1 (SIGUSR1) - state dump
    Usr1,
}

impl DaemonSignal {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, DaemonSignal::Term | DaemonSignal::Int)
    }
}

pub struct SignalHandler {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    sigusr1: Signal,
}

impl SignalHandler {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            sigusr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> DaemonSignal {
        tokio::select! {
            _ = self.sigterm.recv() => DaemonSignal::Term,
            _ = self.sigint.recv() => DaemonSignal::Int,
            _ = self.sighup.recv() => DaemonSignal::Hup,
            _ = self.sigusr1.recv() => DaemonSignal::Usr1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_signals() {
        assert!(DaemonSignal::Term.is_shutdown());
        assert!(DaemonSignal::Int.is_shutdown());
        assert!(!DaemonSignal::Hup.is_shutdown());
        assert!(!DaemonSignal::Usr1.is_shutdown());
    }
}
