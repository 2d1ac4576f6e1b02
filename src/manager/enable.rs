//! Unit enable/disable operations
//!
//! A unit is enabled for a state when `<links_dir>/<state>.wants/<unit>`
//! exists. The link points at the unit file; only its presence matters.

use std::path::{Path, PathBuf};

use super::{DisableOptions, EnableOptions, Manager, ManagerError, Outcome, StartOptions};
use crate::units::UnitDef;

impl Manager {
    fn link_path(&self, state: &str, name: &str) -> PathBuf {
        self.ctx
            .config
            .links_dir
            .join(format!("{}.wants", state))
            .join(name)
    }

    /// True if a link exists for any state the unit is wanted by
    pub(crate) fn is_linked(&self, def: &UnitDef) -> bool {
        def.wanted_by
            .iter()
            .any(|state| self.link_path(state, &def.name).is_symlink())
    }

    /// Link a unit into the `.wants` directory of each state it is wanted by
    pub async fn enable_unit(&self, name: &str, opts: EnableOptions) -> Result<Outcome, ManagerError> {
        let unit = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        let def = unit.def();

        if def.wanted_by.is_empty() {
            return Err(ManagerError::NoWantedBy(name.to_string()));
        }
        if unit.lock().has_config_errors() {
            log::warn!("{}: not enabled, unit has configuration errors", name);
            return Ok(Outcome {
                code: 1,
                units: vec![unit.snapshot()],
            });
        }
        let Some(unit_path) = def.path.as_deref() else {
            return Err(ManagerError::Io(format!("{}: no unit file to link", name)));
        };

        for state in &def.wanted_by {
            let link = self.link_path(state, name);
            create_link(&link, unit_path, opts.force)?;
            log::info!("{}: linked {}", name, link.display());
        }
        unit.lock().is_enabled = true;

        if opts.run {
            match self.start_unit(name, StartOptions::default()).await {
                Ok(outcome) => return Ok(outcome),
                Err(ManagerError::AlreadyActive(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(Outcome {
            code: 0,
            units: vec![unit.snapshot()],
        })
    }

    /// Remove a unit's links and drop it from the registry
    pub async fn disable_unit(&self, name: &str, opts: DisableOptions) -> Result<Outcome, ManagerError> {
        let unit = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        let live = unit.lock().data.state.is_live();
        if opts.run || live {
            self.stop_worker(&unit).await;
        }

        for state in &unit.def().wanted_by {
            let link = self.link_path(state, name);
            if link.is_symlink() {
                std::fs::remove_file(&link).map_err(|e| ManagerError::Io(e.to_string()))?;
                log::info!("{}: removed {}", name, link.display());
            }
        }

        unit.lock().is_enabled = false;
        let snapshot = unit.snapshot();
        self.registry.remove(name);
        Ok(Outcome {
            code: 0,
            units: vec![snapshot],
        })
    }
}

/// Create `link -> target`. An existing link is kept when it already
/// points at `target`, and replaced only with `force`.
fn create_link(link: &Path, target: &Path, force: bool) -> Result<(), ManagerError> {
    if let Some(dir) = link.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ManagerError::Io(e.to_string()))?;
    }

    if link.is_symlink() || link.exists() {
        let current = std::fs::read_link(link).ok();
        if current.as_deref() == Some(target) {
            return Ok(());
        }
        if !force {
            return Err(ManagerError::Io(format!(
                "{} already exists",
                link.display()
            )));
        }
        std::fs::remove_file(link).map_err(|e| ManagerError::Io(e.to_string()))?;
    }

    std::os::unix::fs::symlink(target, link).map_err(|e| ManagerError::Io(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_link_force() {
        let dir = std::env::temp_dir().join(format!("unitd-links-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let link = dir.join("multi-user.wants/web.unit");

        create_link(&link, Path::new("/etc/unitd/units/web.unit"), false).unwrap();
        // Same target again is fine
        create_link(&link, Path::new("/etc/unitd/units/web.unit"), false).unwrap();
        assert!(create_link(&link, Path::new("/usr/lib/unitd/units/web.unit"), false).is_err());

        create_link(&link, Path::new("/usr/lib/unitd/units/web.unit"), true).unwrap();
        assert_eq!(
            std::fs::read_link(&link).unwrap(),
            PathBuf::from("/usr/lib/unitd/units/web.unit")
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
