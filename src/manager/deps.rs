//! Dependency graph and unit validation
//!
//! Validation runs whenever units are registered. Any error found here is
//! attached to the unit and keeps it from ever starting, so the start
//! workers can wait on dependencies without risking a deadlock.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::units::{PathCriterion, UnitDef, UnitKind, WANTED_STATES};

/// Requires= graph between known units
#[derive(Debug, Default)]
pub struct DepGraph {
    /// Edges: node -> nodes it requires
    edges: HashMap<String, HashSet<String>>,
    nodes: HashSet<String>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a set of definitions
    pub fn from_defs<'a>(defs: impl IntoIterator<Item = &'a UnitDef>) -> Self {
        let defs: Vec<&UnitDef> = defs.into_iter().collect();
        let mut graph = Self::new();
        for def in &defs {
            graph.nodes.insert(def.name.clone());
        }
        for def in &defs {
            // Self-dependencies are reported on their own, not as cycles
            for dep in def.requires.iter().filter(|d| **d != def.name) {
                graph.add_edge(&def.name, dep);
            }
        }
        graph
    }

    /// Add an edge `from` requires `to`; edges to unknown units are ignored
    fn add_edge(&mut self, from: &str, to: &str) {
        if !self.nodes.contains(to) {
            return;
        }
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Direct requirements of a node
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &String> {
        self.edges.get(name).into_iter().flat_map(|s| s.iter())
    }

    /// Topological sort using Kahn's algorithm.
    /// Returns nodes in start order, or the nodes left over when a cycle exists.
    pub fn toposort(&self) -> Result<Vec<String>, CycleError> {
        let mut in_degree: HashMap<&String, usize> = self.nodes.iter().map(|n| (n, 0)).collect();
        for (from, deps) in &self.edges {
            if let Some(deg) = in_degree.get_mut(from) {
                *deg = deps.len();
            }
        }

        let mut queue: VecDeque<&String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut result = Vec::new();

        while let Some(node) = queue.pop_front() {
            result.push(node.clone());
            for (dependent, deps) in &self.edges {
                if deps.contains(node) {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            let mut remaining: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| !result.contains(n))
                .cloned()
                .collect();
            remaining.sort();
            return Err(CycleError { nodes: remaining });
        }

        Ok(result)
    }

    /// Nodes that lie on a cycle.
    ///
    /// Kahn's leftovers also include units that merely depend on a cycle;
    /// only those that can reach themselves are returned.
    pub fn cycle_members(&self) -> Vec<String> {
        let Err(CycleError { nodes }) = self.toposort() else {
            return Vec::new();
        };
        nodes
            .into_iter()
            .filter(|n| self.reaches(n, n))
            .collect()
    }

    /// True if `to` is reachable from `from` through at least one edge
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self.dependencies(from).map(|s| s.as_str()).collect();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if seen.insert(node) {
                stack.extend(self.dependencies(node).map(|s| s.as_str()));
            }
        }
        false
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Dependency cycle detected involving: {nodes:?}")]
pub struct CycleError {
    pub nodes: Vec<String>,
}

/// Validate `defs` against each other and the set of `known` unit names.
///
/// Returns the errors found per unit name. Units without errors are absent.
pub fn validate(defs: &[&UnitDef], known: &HashSet<String>) -> HashMap<String, Vec<String>> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let by_name: HashMap<&str, &UnitDef> = defs.iter().map(|d| (d.name.as_str(), *d)).collect();
    let mut bidirectional: HashSet<&str> = HashSet::new();

    for def in defs {
        let mut errs = Vec::new();
        let name = def.name.as_str();

        if def.requires.iter().any(|d| d == name) {
            errs.push("Unit cannot depend on itself".to_string());
        }
        if def.conflicts.iter().any(|c| c == name) {
            errs.push("Unit cannot conflict with itself".to_string());
        }
        for dep in &def.requires {
            if dep != name && def.conflicts.contains(dep) {
                errs.push(format!("'{}' is both required and conflicting", dep));
            }
            let back = by_name.get(dep.as_str());
            if dep != name && back.is_some_and(|other| other.requires.iter().any(|d| d == name)) {
                errs.push(format!("Bidirectional dependency between '{}' and '{}'", name, dep));
                bidirectional.insert(name);
            }
        }
        for state in &def.wanted_by {
            if !WANTED_STATES.contains(&state.as_str()) {
                errs.push(format!("Invalid wanted state '{}'", state));
            }
        }
        if def.restart_max < -1 {
            errs.push(format!("Invalid RestartMax {}", def.restart_max));
        }

        match def.kind {
            UnitKind::Daemon | UnitKind::Oneshot => {
                if def.run.as_deref().map_or(true, |r| r.trim().is_empty()) {
                    errs.push("Missing Run command".to_string());
                }
            }
            UnitKind::Timer => match &def.timer {
                None => errs.push("Missing [Interval] section".to_string()),
                Some(spec) => {
                    if !spec.has_interval() {
                        errs.push("Timer interval has no positive component".to_string());
                    }
                }
            },
            UnitKind::PathWatch => match &def.path_watch {
                None => errs.push("Missing [Path] section".to_string()),
                Some(spec) => {
                    if spec.criteria.is_empty() {
                        errs.push("Path unit has no watch criteria".to_string());
                    }
                    for criterion in &spec.criteria {
                        if let PathCriterion::ExistsGlob(pattern) = criterion {
                            if !criterion.has_wildcard_dir() {
                                continue;
                            }
                            errs.push(format!(
                                "PathExistsGlob '{}' has a wildcard in a directory component",
                                pattern
                            ));
                        }
                    }
                }
            },
        }

        if let Some(target) = def.target() {
            if target == name {
                errs.push("Unit cannot trigger itself".to_string());
            } else if !known.contains(target) {
                errs.push(format!("Target unit '{}' not found", target));
            }
        }

        if !errs.is_empty() {
            errors.entry(def.name.clone()).or_default().extend(errs);
        }
    }

    let graph = DepGraph::from_defs(defs.iter().copied());
    let members = graph.cycle_members();
    if !members.is_empty() {
        let list = members.join(", ");
        for member in &members {
            if bidirectional.contains(member.as_str()) {
                continue;
            }
            errors
                .entry(member.clone())
                .or_default()
                .push(format!("Dependency cycle detected: {}", list));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_unit(name: &str, requires: &[&str]) -> UnitDef {
        let mut def = UnitDef::oneshot(name, "/bin/true");
        def.requires = requires.iter().map(|s| s.to_string()).collect();
        def
    }

    fn run(defs: &[UnitDef]) -> HashMap<String, Vec<String>> {
        let refs: Vec<&UnitDef> = defs.iter().collect();
        let known = defs.iter().map(|d| d.name.clone()).collect();
        validate(&refs, &known)
    }

    #[test]
    fn test_toposort_simple() {
        let defs = vec![
            make_unit("c.unit", &["b.unit"]),
            make_unit("b.unit", &["a.unit"]),
            make_unit("a.unit", &[]),
        ];
        let graph = DepGraph::from_defs(&defs);
        let order = graph.toposort().unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a.unit") < pos("b.unit"));
        assert!(pos("b.unit") < pos("c.unit"));
    }

    #[test]
    fn test_missing_dependency_is_not_an_edge() {
        let defs = vec![make_unit("a.unit", &["ghost.unit"])];
        let graph = DepGraph::from_defs(&defs);
        assert_eq!(graph.dependencies("a.unit").count(), 0);
        assert!(run(&defs).is_empty());
    }

    #[test]
    fn test_self_dependency_and_conflict() {
        let mut def = make_unit("a.unit", &["a.unit"]);
        def.conflicts = vec!["a.unit".into()];
        let errors = run(&[def]);
        assert_eq!(
            errors["a.unit"],
            vec!["Unit cannot depend on itself", "Unit cannot conflict with itself"]
        );
        let looped = [make_unit("b.unit", &["b.unit"])];
        assert!(DepGraph::from_defs(&looped).cycle_members().is_empty());
    }

    #[test]
    fn test_bidirectional_dependency() {
        let defs = vec![make_unit("a.unit", &["b.unit"]), make_unit("b.unit", &["a.unit"])];
        let errors = run(&defs);
        for name in ["a.unit", "b.unit"] {
            let errs = &errors[name];
            assert_eq!(errs.len(), 1, "{:?}", errs);
            assert!(errs[0].starts_with("Bidirectional dependency"));
        }
    }

    #[test]
    fn test_longer_cycle_detected() {
        let defs = vec![
            make_unit("a.unit", &["b.unit"]),
            make_unit("b.unit", &["c.unit"]),
            make_unit("c.unit", &["a.unit"]),
            make_unit("d.unit", &["a.unit"]),
        ];
        let errors = run(&defs);
        for name in ["a.unit", "b.unit", "c.unit"] {
            assert!(errors[name][0].contains("Dependency cycle detected"));
        }
        // d depends on the cycle but is not part of it
        assert!(!errors.contains_key("d.unit"));
    }

    #[test]
    fn test_invalid_wanted_state() {
        let mut def = make_unit("a.unit", &[]);
        def.wanted_by = vec!["multi-user".into(), "rescue".into()];
        let errors = run(&[def]);
        assert_eq!(errors["a.unit"], vec!["Invalid wanted state 'rescue'"]);
    }

    #[test]
    fn test_timer_and_path_checks() {
        let mut timer = UnitDef::new("t.timer", UnitKind::Timer);
        timer.timer = Some(crate::units::TimerSpec::new("missing.unit"));
        let mut path = UnitDef::new("p.path", UnitKind::PathWatch);
        path.path_watch = Some(crate::units::PathSpec::new("a.unit"));
        let defs = vec![timer, path, make_unit("a.unit", &[])];

        let errors = run(&defs);
        let timer_errs = &errors["t.timer"];
        assert!(timer_errs.iter().any(|e| e.contains("no positive component")));
        assert!(timer_errs.iter().any(|e| e.contains("'missing.unit' not found")));
        assert_eq!(errors["p.path"], vec!["Path unit has no watch criteria"]);
    }

    #[test]
    fn test_glob_with_wildcard_directory() {
        let mut path = UnitDef::new("p.path", UnitKind::PathWatch);
        let mut spec = crate::units::PathSpec::new("a.unit");
        spec.criteria.push(PathCriterion::ExistsGlob("/var/spool/*/in.job".into()));
        spec.criteria.push(PathCriterion::ExistsGlob("/var/spool/in/*.job".into()));
        path.path_watch = Some(spec);

        let errors = run(&[path, make_unit("a.unit", &[])]);
        assert_eq!(
            errors["p.path"],
            vec!["PathExistsGlob '/var/spool/*/in.job' has a wildcard in a directory component"]
        );
    }

    #[test]
    fn test_missing_run_command() {
        let def = UnitDef::new("a.unit", UnitKind::Daemon);
        let errors = run(&[def]);
        assert_eq!(errors["a.unit"], vec!["Missing Run command"]);
    }
}
