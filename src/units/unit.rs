//! Unit definition record shared by every unit kind

use super::{PathSpec, TimerSpec};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// States a unit may be wanted by
pub const WANTED_STATES: &[&str] = &[
    "init",
    "single-user",
    "multi-user",
    "multi-user-net",
    "custom",
    "graphical",
    "poweroff",
    "reboot",
    "final",
];

/// States whose units run during boot or final teardown and keep the
/// daemon's environment
const BOOT_STATES: &[&str] = &["init", "final"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    /// Long-running process, started and left running
    Daemon,
    /// Runs to completion within the oneshot timeout
    Oneshot,
    /// Periodically runs another unit
    Timer,
    /// Runs another unit when a filesystem condition fires
    PathWatch,
}

impl UnitKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "daemon" => Some(UnitKind::Daemon),
            "oneshot" => Some(UnitKind::Oneshot),
            "timer" => Some(UnitKind::Timer),
            "path" => Some(UnitKind::PathWatch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Daemon => "daemon",
            UnitKind::Oneshot => "oneshot",
            UnitKind::Timer => "timer",
            UnitKind::PathWatch => "path",
        }
    }

    /// Whether units of this kind own a process
    pub fn runs_process(&self) -> bool {
        matches!(self, UnitKind::Daemon | UnitKind::Oneshot)
    }
}

/// Immutable unit definition as produced by the loader
#[derive(Debug, Clone)]
pub struct UnitDef {
    pub name: String,
    /// Backing unit file, if loaded from disk
    pub path: Option<PathBuf>,
    pub kind: UnitKind,
    pub description: Option<String>,
    pub run: Option<String>,
    pub stop: Option<String>,
    /// Command run after the process fails
    pub failure: Option<String>,
    pub requires: Vec<String>,
    pub conflicts: Vec<String>,
    pub wanted_by: Vec<String>,
    pub restart: bool,
    /// -1 restarts as long as `restart` is set, 0 disables, N bounds the count
    pub restart_max: i32,
    pub timer: Option<TimerSpec>,
    pub path_watch: Option<PathSpec>,
    /// Errors collected while loading
    pub errors: Vec<String>,
}

impl UnitDef {
    pub fn new(name: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            name: name.into(),
            path: None,
            kind,
            description: None,
            run: None,
            stop: None,
            failure: None,
            requires: Vec::new(),
            conflicts: Vec::new(),
            wanted_by: Vec::new(),
            restart: false,
            restart_max: -1,
            timer: None,
            path_watch: None,
            errors: Vec::new(),
        }
    }

    /// Daemon unit running `cmd`
    pub fn daemon(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        let mut def = Self::new(name, UnitKind::Daemon);
        def.run = Some(cmd.into());
        def
    }

    /// Oneshot unit running `cmd`
    pub fn oneshot(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        let mut def = Self::new(name, UnitKind::Oneshot);
        def.run = Some(cmd.into());
        def
    }

    /// Record for a file that could not be loaded at all
    pub fn failed(name: impl Into<String>, path: Option<PathBuf>, error: String) -> Self {
        let mut def = Self::new(name, UnitKind::Oneshot);
        def.path = path;
        def.errors.push(error);
        def
    }

    /// Boot-time initialization/finalization units inherit the environment
    pub fn boot_env(&self) -> bool {
        self.wanted_by
            .iter()
            .any(|state| BOOT_STATES.contains(&state.as_str()))
    }

    /// Whether a restart supervisor watches this unit
    pub fn needs_supervisor(&self) -> bool {
        self.restart || self.restart_max > 0 || self.failure.is_some()
    }

    /// Whether the restart policy permits another attempt after `restart_num`
    pub fn restart_allowed(&self, restart_num: u32) -> bool {
        match self.restart_max {
            n if n > 0 => restart_num < n as u32,
            -1 => self.restart,
            _ => false,
        }
    }

    /// Unit started by a timer or path unit
    pub fn target(&self) -> Option<&str> {
        match self.kind {
            UnitKind::Timer => self.timer.as_ref().map(|t| t.unit.as_str()),
            UnitKind::PathWatch => self.path_watch.as_ref().map(|p| p.unit.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy() {
        let mut def = UnitDef::daemon("web", "/bin/true");
        assert!(!def.restart_allowed(0));

        def.restart = true;
        assert!(def.restart_allowed(0));
        assert!(def.restart_allowed(1000));

        def.restart_max = 3;
        assert!(def.restart_allowed(2));
        assert!(!def.restart_allowed(3));

        def.restart_max = 0;
        assert!(!def.restart_allowed(0));
    }

    #[test]
    fn test_needs_supervisor() {
        let mut def = UnitDef::daemon("web", "/bin/true");
        assert!(!def.needs_supervisor());
        def.failure = Some("/bin/logger failed".into());
        assert!(def.needs_supervisor());

        let mut def = UnitDef::daemon("web", "/bin/true");
        def.restart_max = 2;
        assert!(def.needs_supervisor());
    }

    #[test]
    fn test_boot_env() {
        let mut def = UnitDef::oneshot("mount-all", "/bin/mount -a");
        def.wanted_by = vec!["multi-user".into()];
        assert!(!def.boot_env());
        def.wanted_by.push("init".into());
        assert!(def.boot_env());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!(UnitKind::parse("Daemon"), Some(UnitKind::Daemon));
        assert_eq!(UnitKind::parse("oneshot"), Some(UnitKind::Oneshot));
        assert_eq!(UnitKind::parse("forking"), None);
        assert_eq!(UnitKind::PathWatch.as_str(), "path");
    }
}
