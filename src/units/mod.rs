//! Unit definitions and the unit file loader
//!
//! `.unit` files describe daemons and oneshots; `.timer` and `.path` files
//! describe triggers for other units. A file that fails to load still
//! produces a record carrying its errors so it shows up in status output.

mod parser;
mod path;
mod timer;
mod unit;

pub use parser::{parse_file, parse_unit_file, ParseError, ParsedFile};
pub use path::{PathCriterion, PathSpec};
pub use timer::TimerSpec;
pub use unit::{UnitDef, UnitKind, WANTED_STATES};

use parser::{string_to_bool, ParsedSection};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// File extensions the loader picks up
pub const UNIT_EXTENSIONS: &[&str] = &["unit", "timer", "path"];

const UNIT_KEYS: &[&str] = &["DESCRIPTION", "REQUIRES", "CONFLICTS", "WANTEDBY"];
const COMMAND_KEYS: &[&str] = &["TYPE", "RUN", "STOP", "FAILURE", "RESTART", "RESTARTMAX"];
const INTERVAL_KEYS: &[&str] = &[
    "SECONDS", "MINUTES", "HOURS", "DAYS", "WEEKS", "MONTHS", "WAKESYSTEM", "UNIT",
];
const PATH_KEYS: &[&str] = &[
    "PATHEXISTS",
    "PATHEXISTSGLOB",
    "PATHRESOURCECHANGED",
    "DIRECTORYNOTEMPTY",
    "UNIT",
];

fn first<'a>(section: &'a ParsedSection, key: &str) -> Option<&'a str> {
    section
        .get(key)
        .and_then(|vals| vals.iter().min_by_key(|(order, _)| *order))
        .map(|(_, v)| v.as_str())
}

fn all(section: &ParsedSection, key: &str) -> Vec<String> {
    let mut vals = section.get(key).cloned().unwrap_or_default();
    vals.sort_by_key(|(order, _)| *order);
    vals.into_iter().map(|(_, v)| v).collect()
}

fn check_keys(section_name: &str, section: &ParsedSection, allowed: &[&str], errors: &mut Vec<String>) {
    let mut unknown: Vec<&String> = section
        .keys()
        .filter(|k| !allowed.contains(&k.as_str()))
        .collect();
    unknown.sort();
    for key in unknown {
        errors.push(format!("Unknown setting '{}' in section {}", key, section_name));
    }
}

fn parse_number<T: std::str::FromStr>(
    section: &ParsedSection,
    key: &str,
    errors: &mut Vec<String>,
) -> Option<T> {
    let raw = first(section, key)?;
    match raw.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            errors.push(format!("Invalid value '{}' for {}", raw, key));
            None
        }
    }
}

/// Unit kind implied by a file name's extension
pub fn kind_for_name(name: &str) -> Option<UnitKind> {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("unit") => Some(UnitKind::Daemon),
        Some("timer") => Some(UnitKind::Timer),
        Some("path") => Some(UnitKind::PathWatch),
        _ => None,
    }
}

/// Default trigger target: same stem with `.unit`
fn default_target(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    format!("{}.unit", stem)
}

/// Convert parsed INI data into a typed UnitDef.
///
/// Bad values are recorded in `def.errors`; only an unknown file type is
/// a hard error.
pub fn parse_unit(name: &str, parsed: &ParsedFile) -> Result<UnitDef, ParseError> {
    let kind = kind_for_name(name).ok_or_else(|| ParseError::UnknownType(name.to_string()))?;
    let mut def = UnitDef::new(name, kind);
    let mut errors = Vec::new();

    let mut sections: Vec<&String> = parsed.keys().collect();
    sections.sort();
    for section in sections {
        let expected = match (section.as_str(), kind) {
            ("[Unit]", _) => true,
            ("[Command]", UnitKind::Daemon | UnitKind::Oneshot) => true,
            ("[Interval]", UnitKind::Timer) => true,
            ("[Path]", UnitKind::PathWatch) => true,
            _ => false,
        };
        if !expected {
            errors.push(format!("Unexpected section {} in {} unit", section, kind.as_str()));
        }
    }

    // [Unit] section
    if let Some(unit) = parsed.get("[Unit]") {
        check_keys("[Unit]", unit, UNIT_KEYS, &mut errors);
        def.description = first(unit, "DESCRIPTION").map(|s| s.to_string());
        def.requires = all(unit, "REQUIRES");
        def.conflicts = all(unit, "CONFLICTS");
        def.wanted_by = all(unit, "WANTEDBY");
    }

    // [Command] section
    if kind == UnitKind::Daemon {
        if let Some(command) = parsed.get("[Command]") {
            check_keys("[Command]", command, COMMAND_KEYS, &mut errors);
            if let Some(t) = first(command, "TYPE") {
                match UnitKind::parse(t) {
                    Some(k @ (UnitKind::Daemon | UnitKind::Oneshot)) => def.kind = k,
                    _ => errors.push(format!("Invalid Type '{}'", t)),
                }
            }
            def.run = first(command, "RUN").map(|s| s.to_string());
            def.stop = first(command, "STOP").map(|s| s.to_string());
            def.failure = first(command, "FAILURE").map(|s| s.to_string());
            def.restart = first(command, "RESTART").is_some_and(string_to_bool);
            if let Some(max) = parse_number::<i32>(command, "RESTARTMAX", &mut errors) {
                def.restart_max = max;
            }
        }
    }

    // [Interval] section
    if kind == UnitKind::Timer {
        let mut spec = TimerSpec::new(default_target(name));
        if let Some(interval) = parsed.get("[Interval]") {
            check_keys("[Interval]", interval, INTERVAL_KEYS, &mut errors);
            spec.seconds = parse_number(interval, "SECONDS", &mut errors).unwrap_or(0);
            spec.minutes = parse_number(interval, "MINUTES", &mut errors).unwrap_or(0);
            spec.hours = parse_number(interval, "HOURS", &mut errors).unwrap_or(0);
            spec.days = parse_number(interval, "DAYS", &mut errors).unwrap_or(0);
            spec.weeks = parse_number(interval, "WEEKS", &mut errors).unwrap_or(0);
            spec.months = parse_number(interval, "MONTHS", &mut errors).unwrap_or(0);
            spec.wake_system = first(interval, "WAKESYSTEM").is_some_and(string_to_bool);
            if let Some(target) = first(interval, "UNIT") {
                spec.unit = target.to_string();
            }
        }
        def.timer = Some(spec);
    }

    // [Path] section
    if kind == UnitKind::PathWatch {
        let mut spec = PathSpec::new(default_target(name));
        if let Some(path) = parsed.get("[Path]") {
            check_keys("[Path]", path, PATH_KEYS, &mut errors);
            let mut criteria: Vec<(u32, PathCriterion)> = Vec::new();
            let plain: [(&str, fn(PathBuf) -> PathCriterion); 3] = [
                ("PATHEXISTS", PathCriterion::Exists),
                ("PATHRESOURCECHANGED", PathCriterion::ResourceChanged),
                ("DIRECTORYNOTEMPTY", PathCriterion::DirectoryNotEmpty),
            ];
            for (key, make) in plain {
                for (order, v) in path.get(key).into_iter().flatten() {
                    criteria.push((*order, make(PathBuf::from(v))));
                }
            }
            for (order, v) in path.get("PATHEXISTSGLOB").into_iter().flatten() {
                criteria.push((*order, PathCriterion::ExistsGlob(v.clone())));
            }
            criteria.sort_by_key(|(order, _)| *order);
            spec.criteria = criteria.into_iter().map(|(_, c)| c).collect();
            if let Some(target) = first(path, "UNIT") {
                spec.unit = target.to_string();
            }
        }
        def.path_watch = Some(spec);
    }

    def.errors = errors;
    Ok(def)
}

/// Load one unit file from disk. Never fails: problems end up in `errors`.
pub async fn load_unit(path: &Path) -> UnitDef {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let result = match parse_unit_file(path).await {
        Ok(parsed) => parse_unit(&name, &parsed),
        Err(e) => Err(e),
    };

    match result {
        Ok(mut def) => {
            def.path = Some(path.to_path_buf());
            def
        }
        Err(e) => {
            log::warn!("{}: failed to load: {}", name, e);
            UnitDef::failed(name, Some(path.to_path_buf()), e.to_string())
        }
    }
}

/// Load every unit file found in `dirs`.
///
/// Earlier directories take precedence when a name appears twice.
pub async fn load_dirs(dirs: &[PathBuf]) -> Vec<UnitDef> {
    let mut seen = HashSet::new();
    let mut defs = Vec::new();

    for dir in dirs {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping unit directory {}: {}", dir.display(), e);
                continue;
            }
        };

        let mut paths = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let wanted = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| UNIT_EXTENSIONS.contains(&e));
            if wanted {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let def = load_unit(&path).await;
            if seen.insert(def.name.clone()) {
                defs.push(def);
            } else {
                log::debug!("{}: shadowed by an earlier unit directory", def.name);
            }
        }
    }

    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daemon_unit() {
        let content = r#"
[Unit]
Description=Web server
Requires=network.unit logger.unit
Conflicts=maintenance.unit
WantedBy=multi-user graphical

[Command]
Run=/usr/bin/httpd -f /etc/httpd.conf
Stop=/bin/kill -TERM $PID
Failure=/usr/bin/logger httpd failed
Restart=yes
RestartMax=5
"#;
        let parsed = parse_file(content).unwrap();
        let def = parse_unit("httpd.unit", &parsed).unwrap();

        assert_eq!(def.kind, UnitKind::Daemon);
        assert_eq!(def.description.as_deref(), Some("Web server"));
        assert_eq!(def.requires, vec!["network.unit", "logger.unit"]);
        assert_eq!(def.conflicts, vec!["maintenance.unit"]);
        assert_eq!(def.wanted_by, vec!["multi-user", "graphical"]);
        assert_eq!(def.run.as_deref(), Some("/usr/bin/httpd -f /etc/httpd.conf"));
        assert_eq!(def.stop.as_deref(), Some("/bin/kill -TERM $PID"));
        assert!(def.restart);
        assert_eq!(def.restart_max, 5);
        assert!(def.errors.is_empty());
    }

    #[test]
    fn test_parse_oneshot_type() {
        let content = "[Command]\nType=oneshot\nRun=/bin/true\n";
        let def = parse_unit("setup.unit", &parse_file(content).unwrap()).unwrap();
        assert_eq!(def.kind, UnitKind::Oneshot);
        assert_eq!(def.restart_max, -1);
        assert!(!def.restart);
    }

    #[test]
    fn test_parse_timer_unit() {
        let content = r#"
[Interval]
Minutes=30
Hours=1
WakeSystem=true
"#;
        let def = parse_unit("backup.timer", &parse_file(content).unwrap()).unwrap();
        assert_eq!(def.kind, UnitKind::Timer);
        let spec = def.timer.unwrap();
        assert_eq!(spec.minutes, 30);
        assert_eq!(spec.hours, 1);
        assert!(spec.wake_system);
        assert_eq!(spec.unit, "backup.unit");
    }

    #[test]
    fn test_parse_path_unit_keeps_criterion_order() {
        let content = r#"
[Path]
DirectoryNotEmpty=/var/spool/in
PathExists=/run/go
PathExistsGlob=/tmp/*.job
Unit=import.unit
"#;
        let def = parse_unit("spool.path", &parse_file(content).unwrap()).unwrap();
        let spec = def.path_watch.unwrap();
        assert_eq!(spec.unit, "import.unit");
        assert_eq!(
            spec.criteria,
            vec![
                PathCriterion::DirectoryNotEmpty("/var/spool/in".into()),
                PathCriterion::Exists("/run/go".into()),
                PathCriterion::ExistsGlob("/tmp/*.job".into()),
            ]
        );
    }

    #[test]
    fn test_errors_accumulate() {
        let content = r#"
[Unit]
Bogus=1

[Command]
Type=forking
RestartMax=many

[Interval]
Seconds=5
"#;
        let def = parse_unit("bad.unit", &parse_file(content).unwrap()).unwrap();
        assert_eq!(def.errors.len(), 4, "{:?}", def.errors);
        assert!(def.errors.iter().any(|e| e.contains("BOGUS")));
        assert!(def.errors.iter().any(|e| e.contains("forking")));
        assert!(def.errors.iter().any(|e| e.contains("many")));
        assert!(def.errors.iter().any(|e| e.contains("[Interval]")));
    }

    #[test]
    fn test_unknown_extension() {
        let parsed = parse_file("[Unit]\n").unwrap();
        assert!(matches!(
            parse_unit("sshd.service", &parsed),
            Err(ParseError::UnknownType(_))
        ));
    }

    #[tokio::test]
    async fn test_load_dirs_first_wins() {
        let base = std::env::temp_dir().join(format!("unitd-load-{}", std::process::id()));
        let etc = base.join("etc");
        let lib = base.join("lib");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::create_dir_all(&lib).unwrap();

        std::fs::write(etc.join("a.unit"), "[Command]\nRun=/bin/etc\n").unwrap();
        std::fs::write(lib.join("a.unit"), "[Command]\nRun=/bin/lib\n").unwrap();
        std::fs::write(lib.join("b.unit"), "[Unit]\n[Unit]\n").unwrap();
        std::fs::write(lib.join("notes.txt"), "ignored").unwrap();

        let defs = load_dirs(&[etc.clone(), lib.clone()]).await;
        assert_eq!(defs.len(), 2);
        let a = defs.iter().find(|d| d.name == "a.unit").unwrap();
        assert_eq!(a.run.as_deref(), Some("/bin/etc"));
        assert_eq!(a.path.as_deref(), Some(etc.join("a.unit").as_path()));
        let b = defs.iter().find(|d| d.name == "b.unit").unwrap();
        assert_eq!(b.errors.len(), 1);

        std::fs::remove_dir_all(&base).unwrap();
    }
}
