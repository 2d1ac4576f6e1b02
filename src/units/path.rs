//! Path unit criteria
//!
//! Each criterion names a filesystem condition. The watcher subscribes to
//! the directory returned by [`PathCriterion::monitor_dir`] and re-checks
//! the criterion on every event there.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathCriterion {
    /// Fires when the path appears (PathExists=)
    Exists(PathBuf),
    /// Fires when anything matching the glob appears (PathExistsGlob=)
    ExistsGlob(String),
    /// Fires when the file is written, created or its metadata changes
    /// (PathResourceChanged=)
    ResourceChanged(PathBuf),
    /// Fires when the directory contains at least one entry
    /// (DirectoryNotEmpty=)
    DirectoryNotEmpty(PathBuf),
}

impl PathCriterion {
    pub fn key(&self) -> &'static str {
        match self {
            PathCriterion::Exists(_) => "PathExists",
            PathCriterion::ExistsGlob(_) => "PathExistsGlob",
            PathCriterion::ResourceChanged(_) => "PathResourceChanged",
            PathCriterion::DirectoryNotEmpty(_) => "DirectoryNotEmpty",
        }
    }

    /// Directory the inotify watch is placed on
    pub fn monitor_dir(&self) -> PathBuf {
        match self {
            PathCriterion::Exists(p) | PathCriterion::ResourceChanged(p) => parent_or_root(p),
            PathCriterion::DirectoryNotEmpty(p) => p.clone(),
            PathCriterion::ExistsGlob(pattern) => glob_base(pattern),
        }
    }

    /// A glob with metacharacters before its last component. The watch sits
    /// on one directory only, so such a pattern could never fire.
    pub fn has_wildcard_dir(&self) -> bool {
        let PathCriterion::ExistsGlob(pattern) = self else {
            return false;
        };
        Path::new(pattern)
            .parent()
            .is_some_and(|dir| has_glob_meta(&dir.to_string_lossy()))
    }

    /// Check the condition against the filesystem right now.
    ///
    /// `ResourceChanged` is edge-triggered and never counts as satisfied.
    pub fn is_satisfied(&self) -> bool {
        match self {
            PathCriterion::Exists(p) => p.exists(),
            PathCriterion::ExistsGlob(pattern) => glob::glob(pattern)
                .map(|mut paths| paths.any(|p| p.is_ok()))
                .unwrap_or(false),
            PathCriterion::ResourceChanged(_) => false,
            PathCriterion::DirectoryNotEmpty(dir) => std::fs::read_dir(dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false),
        }
    }
}

fn parent_or_root(p: &Path) -> PathBuf {
    match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("/"),
    }
}

fn has_glob_meta(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

/// Longest leading directory of a glob pattern without metacharacters
fn glob_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if has_glob_meta(&text) {
            return base;
        }
        base.push(component);
    }
    // No metacharacters at all: behaves like a plain path
    parent_or_root(&base)
}

/// PathWatch definition: criteria plus the unit to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSpec {
    pub criteria: Vec<PathCriterion>,
    /// Unit to run when a criterion fires (Unit=)
    pub unit: String,
}

impl PathSpec {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            criteria: Vec::new(),
            unit: unit.into(),
        }
    }

    /// Distinct monitor directories in criterion order
    pub fn monitor_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for criterion in &self.criteria {
            let dir = criterion.monitor_dir();
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_dir() {
        assert_eq!(
            PathCriterion::Exists("/run/flag".into()).monitor_dir(),
            PathBuf::from("/run")
        );
        assert_eq!(
            PathCriterion::DirectoryNotEmpty("/var/spool/in".into()).monitor_dir(),
            PathBuf::from("/var/spool/in")
        );
        assert_eq!(
            PathCriterion::ExistsGlob("/var/spool/in/*.job".into()).monitor_dir(),
            PathBuf::from("/var/spool/in")
        );
        assert_eq!(
            PathCriterion::Exists("flag".into()).monitor_dir(),
            PathBuf::from("/")
        );
    }

    #[test]
    fn test_monitor_dirs_dedup() {
        let mut spec = PathSpec::new("import.unit");
        spec.criteria.push(PathCriterion::Exists("/run/a".into()));
        spec.criteria.push(PathCriterion::ResourceChanged("/run/b".into()));
        spec.criteria.push(PathCriterion::DirectoryNotEmpty("/tmp".into()));
        assert_eq!(
            spec.monitor_dirs(),
            vec![PathBuf::from("/run"), PathBuf::from("/tmp")]
        );
    }

    #[test]
    fn test_wildcard_dir() {
        let spool = |p: &str| PathCriterion::ExistsGlob(p.into());
        assert!(spool("/var/spool/*/in.job").has_wildcard_dir());
        assert!(spool("/var/sp?ol/in/*.job").has_wildcard_dir());
        assert!(!spool("/var/spool/in/*.job").has_wildcard_dir());
        assert!(!spool("*.job").has_wildcard_dir());
        assert!(!PathCriterion::Exists("/var/spool/*/x".into()).has_wildcard_dir());
    }

    #[test]
    fn test_is_satisfied() {
        let dir = std::env::temp_dir().join(format!("unitd-path-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let file = dir.join("ready.flag");
        let exists = PathCriterion::Exists(file.clone());
        let not_empty = PathCriterion::DirectoryNotEmpty(dir.clone());
        let glob = PathCriterion::ExistsGlob(format!("{}/*.flag", dir.display()));
        assert!(!exists.is_satisfied());
        assert!(!not_empty.is_satisfied());
        assert!(!glob.is_satisfied());

        std::fs::write(&file, "1").unwrap();
        assert!(exists.is_satisfied());
        assert!(not_empty.is_satisfied());
        assert!(glob.is_satisfied());
        assert!(!PathCriterion::ResourceChanged(file).is_satisfied());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
