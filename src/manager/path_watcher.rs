//! inotify-driven path units and unit-file change detection
//!
//! A path unit places one watch on the monitor directory of each of its
//! criteria and runs its target whenever an event there satisfies one.
//! While the target runs the path unit is `Restarting`; it goes back to
//! `Running` afterwards regardless of the target's outcome.
//!
//! Independently, the unit directories are watched so that edited, new
//! or deleted unit files mark their units as changed for the next reload.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_lite::StreamExt;
use inotify::{EventMask, EventStream, Inotify, WatchDescriptor, WatchMask};
use tokio::sync::mpsc;

use super::registry::{UnitHandle, Wakeup};
use super::state::{FinalStatus, ProcessState, WatchState};
use super::{cancelled, ExecOutcome, Manager};
use crate::units::{PathCriterion, PathSpec, UNIT_EXTENSIONS};

const EVENT_BUFFER: usize = 4096;

type Events = EventStream<[u8; EVENT_BUFFER]>;

fn path_unit_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::MOVED_TO
        | WatchMask::CLOSE_WRITE
        | WatchMask::MODIFY
        | WatchMask::ATTRIB
}

fn unit_dir_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::CLOSE_WRITE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

/// Open an inotify stream watching every directory in `dirs`
fn watch_dirs(
    dirs: &[PathBuf],
    mask: WatchMask,
) -> Result<(Events, HashMap<WatchDescriptor, PathBuf>), WatchError> {
    let inotify = Inotify::init().map_err(WatchError::Init)?;
    let mut by_wd = HashMap::new();
    for dir in dirs {
        let wd = inotify
            .watches()
            .add(dir, mask)
            .map_err(|source| WatchError::Add {
                path: dir.clone(),
                source,
            })?;
        by_wd.insert(wd, dir.clone());
    }
    let stream = inotify
        .into_event_stream([0u8; EVENT_BUFFER])
        .map_err(WatchError::Init)?;
    Ok((stream, by_wd))
}

/// Whether an event on `name` inside `dir` fires `criterion`
pub(crate) fn criterion_fires(
    criterion: &PathCriterion,
    dir: &Path,
    name: Option<&OsStr>,
    mask: EventMask,
) -> bool {
    if criterion.monitor_dir() != dir {
        return false;
    }
    let appeared = mask.intersects(EventMask::CREATE | EventMask::MOVED_TO);
    let path = name.map(|n| dir.join(n));

    match criterion {
        PathCriterion::Exists(p) => appeared && path.as_deref() == Some(p.as_path()),
        PathCriterion::ExistsGlob(pattern) => {
            let Some(path) = path else {
                return false;
            };
            appeared
                && glob::Pattern::new(pattern)
                    .map(|p| p.matches_path(&path))
                    .unwrap_or(false)
        }
        PathCriterion::ResourceChanged(p) => {
            let changed = mask.intersects(
                EventMask::CREATE
                    | EventMask::MOVED_TO
                    | EventMask::CLOSE_WRITE
                    | EventMask::ATTRIB,
            );
            changed && path.as_deref() == Some(p.as_path())
        }
        PathCriterion::DirectoryNotEmpty(_) => appeared && criterion.is_satisfied(),
    }
}

impl Manager {
    /// Start a path unit: watch its monitor directories
    pub(super) fn start_path_watch(&self, unit: &Arc<UnitHandle>) -> FinalStatus {
        let name = unit.name();
        let Some(spec) = unit.def().path_watch.clone() else {
            return self.fail_start(unit, "Missing [Path] section".to_string());
        };
        let monitors = spec.monitor_dirs();
        let (events, by_wd) = match watch_dirs(&monitors, path_unit_mask()) {
            Ok(watch) => watch,
            Err(e) => return self.fail_start(unit, e.to_string()),
        };

        {
            let mut state = unit.lock();
            state.data.set_running(None);
            state.watch = Some(WatchState {
                monitors: monitors.clone(),
            });
            unit.complete(&mut state, FinalStatus::Success);
        }
        for dir in &monitors {
            log::info!("{}: watching {}", name, dir.display());
        }

        let Some((id, rx)) = unit.open_pipe() else {
            log::warn!("{}: path engine already running", name);
            return FinalStatus::Success;
        };
        let manager = self.clone();
        let unit = Arc::clone(unit);
        tokio::spawn(async move {
            manager.path_loop(&unit, &spec, events, &by_wd, rx).await;
            unit.close_pipe(id);
            log::debug!("{}: path engine exited", unit.name());
        });
        FinalStatus::Success
    }

    async fn path_loop(
        &self,
        unit: &UnitHandle,
        spec: &PathSpec,
        mut events: Events,
        by_wd: &HashMap<WatchDescriptor, PathBuf>,
        mut rx: mpsc::UnboundedReceiver<Wakeup>,
    ) {
        let name = unit.name();
        let mut shutdown = self.ctx.shutdown_signal();

        if let Some(c) = spec.criteria.iter().find(|c| c.is_satisfied()) {
            log::info!("{}: {} already satisfied", name, c.key());
            if !self.trigger_path_target(unit, spec).await {
                return;
            }
        }

        loop {
            let event = tokio::select! {
                ev = events.next() => ev,
                w = rx.recv() => match w {
                    Some(Wakeup::ChildExited) => continue,
                    Some(Wakeup::Stop) | None => return,
                },
                _ = cancelled(&mut shutdown) => return,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    log::error!("{}: inotify read failed: {}", name, e);
                    unit.lock().errors.push(format!("Watch failed: {}", e));
                    return;
                }
                None => return,
            };
            if event.mask.contains(EventMask::Q_OVERFLOW) {
                log::warn!("{}: inotify queue overflow", name);
                continue;
            }
            let Some(dir) = by_wd.get(&event.wd) else {
                continue;
            };

            let fired = spec
                .criteria
                .iter()
                .find(|c| criterion_fires(c, dir, event.name.as_deref(), event.mask));
            if let Some(c) = fired {
                log::info!("{}: {} triggered in {}", name, c.key(), dir.display());
                if !self.trigger_path_target(unit, spec).await {
                    return;
                }
            }
        }
    }

    /// Run the target; returns false when the engine should exit
    async fn trigger_path_target(&self, unit: &UnitHandle, spec: &PathSpec) -> bool {
        {
            let mut state = unit.lock();
            if state.is_stopping {
                return false;
            }
            state.data.state = ProcessState::Restarting;
        }

        match self.execute_unit(&spec.unit).await {
            ExecOutcome::ShuttingDown => return false,
            ExecOutcome::Success => {}
            ExecOutcome::Failure => log::warn!("{}: {} failed", unit.name(), spec.unit),
        }

        let mut state = unit.lock();
        if state.is_stopping {
            return false;
        }
        state.data.state = ProcessState::Running;
        true
    }

    /// Watch the unit directories and flag units whose files change.
    ///
    /// Directories that do not exist are skipped.
    pub fn watch_unit_dirs(&self) -> Result<(), WatchError> {
        let dirs: Vec<PathBuf> = self
            .ctx
            .config
            .unit_dirs
            .iter()
            .filter(|d| d.is_dir())
            .cloned()
            .collect();
        if dirs.is_empty() {
            log::debug!("No unit directories to watch");
            return Ok(());
        }
        let (mut events, by_wd) = watch_dirs(&dirs, unit_dir_mask())?;

        let manager = self.clone();
        tokio::spawn(async move {
            let mut shutdown = manager.ctx.shutdown_signal();
            loop {
                let event = tokio::select! {
                    ev = events.next() => ev,
                    _ = cancelled(&mut shutdown) => return,
                };
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        log::error!("Unit directory watch failed: {}", e);
                        return;
                    }
                    None => return,
                };
                let Some(name) = event.name.as_deref().and_then(|n| n.to_str()) else {
                    continue;
                };
                let is_unit = Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| UNIT_EXTENSIONS.contains(&e));
                if !is_unit || !by_wd.contains_key(&event.wd) {
                    continue;
                }
                manager.mark_changed(name);
            }
        });
        Ok(())
    }

    fn mark_changed(&self, name: &str) {
        if let Some(unit) = self.registry.get(name) {
            unit.lock().is_changed = true;
        }
        log::info!("{}: unit file changed", name);
        self.ctx.mark_files_changed();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("inotify init failed: {0}")]
    Init(io::Error),

    #[error("Cannot watch {}: {source}", path.display())]
    Add { path: PathBuf, source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exists_fires_on_create_only() {
        let c = PathCriterion::Exists("/run/app/ready".into());
        let dir = Path::new("/run/app");
        let name = Some(OsStr::new("ready"));
        assert!(criterion_fires(&c, dir, name, EventMask::CREATE));
        assert!(criterion_fires(&c, dir, name, EventMask::MOVED_TO));
        assert!(!criterion_fires(&c, dir, name, EventMask::CLOSE_WRITE));
        assert!(!criterion_fires(&c, dir, Some(OsStr::new("other")), EventMask::CREATE));
        assert!(!criterion_fires(&c, Path::new("/run"), name, EventMask::CREATE));
    }

    #[test]
    fn test_glob_and_resource_changed() {
        let glob = PathCriterion::ExistsGlob("/var/spool/in/*.job".into());
        let dir = Path::new("/var/spool/in");
        assert!(criterion_fires(&glob, dir, Some(OsStr::new("a.job")), EventMask::CREATE));
        assert!(!criterion_fires(&glob, dir, Some(OsStr::new("a.tmp")), EventMask::CREATE));

        let changed = PathCriterion::ResourceChanged("/etc/app.conf".into());
        let etc = Path::new("/etc");
        let conf = Some(OsStr::new("app.conf"));
        assert!(criterion_fires(&changed, etc, conf, EventMask::CLOSE_WRITE));
        assert!(criterion_fires(&changed, etc, conf, EventMask::ATTRIB));
        assert!(!criterion_fires(&changed, etc, conf, EventMask::DELETE));
    }

    #[tokio::test]
    async fn test_missing_monitor_dir_is_an_error() {
        let err = watch_dirs(&[PathBuf::from("/nonexistent/unitd")], path_unit_mask());
        assert!(matches!(err, Err(WatchError::Add { .. })));
    }
}
