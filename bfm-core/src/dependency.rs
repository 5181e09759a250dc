//! Migration dependency graph with topological sort.
//!
//! Orders the scripts selected for one request by their `bfm:depends` and
//! `bfm:requires` declarations using Kahn's algorithm; ties break by
//! ascending version so independent scripts apply in chronological order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::error::{BfmError, Result};
use crate::script::{DependencyTargetType, MigrationScript};

/// A directed acyclic graph over the selected scripts, keyed by migration-id.
pub struct DependencyGraph {
    /// id -> ids it depends on
    edges: HashMap<String, HashSet<String>>,
    /// id -> ids that depend on it
    reverse_edges: HashMap<String, HashSet<String>>,
    /// Scripts by id, for returning the sorted selection.
    scripts: HashMap<String, MigrationScript>,
    /// Sort key per id: (version, id).
    sort_keys: HashMap<String, (String, String)>,
}

impl DependencyGraph {
    /// Build a graph from the selected scripts.
    ///
    /// Dependencies pointing outside the selection do not constrain the
    /// order (they are either already applied or filtered out) and are
    /// logged at debug level.
    pub fn build(selection: &[MigrationScript]) -> Self {
        let mut edges: HashMap<String, HashSet<String>> = HashMap::new();
        let mut reverse_edges: HashMap<String, HashSet<String>> = HashMap::new();
        let mut scripts: HashMap<String, MigrationScript> = HashMap::new();
        let mut sort_keys: HashMap<String, (String, String)> = HashMap::new();

        for script in selection {
            let id = script.migration_id();
            edges.entry(id.clone()).or_default();
            reverse_edges.entry(id.clone()).or_default();
            sort_keys.insert(id.clone(), (script.version.clone(), id.clone()));
            scripts.insert(id, script.clone());
        }

        let resolve_name = |connection: &str, name: &str| -> Option<String> {
            selection
                .iter()
                .find(|s| s.connection == connection && s.name == name)
                .map(|s| s.migration_id())
        };
        let resolve_version = |connection: &str, version: &str| -> Option<String> {
            selection
                .iter()
                .find(|s| s.connection == connection && s.version == version)
                .map(|s| s.migration_id())
        };

        for script in selection {
            let id = script.migration_id();

            for dep_name in &script.dependencies {
                match resolve_name(&script.connection, dep_name) {
                    Some(dep_id) if dep_id != id => {
                        edges.get_mut(&id).unwrap().insert(dep_id.clone());
                        reverse_edges.get_mut(&dep_id).unwrap().insert(id.clone());
                    }
                    _ => {
                        log::debug!(
                            "Dependency outside selection; migration_id={}, target={}",
                            id,
                            dep_name
                        );
                    }
                }
            }

            for dep in &script.structured_dependencies {
                let resolved = match dep.target_type {
                    DependencyTargetType::Name => resolve_name(&dep.connection, &dep.target),
                    DependencyTargetType::Version => {
                        resolve_version(&dep.connection, &dep.target)
                    }
                };
                match resolved {
                    Some(dep_id) if dep_id != id => {
                        edges.get_mut(&id).unwrap().insert(dep_id.clone());
                        reverse_edges.get_mut(&dep_id).unwrap().insert(id.clone());
                    }
                    _ => {
                        log::debug!(
                            "Structured dependency outside selection; migration_id={}, connection={}, target={}",
                            id,
                            dep.connection,
                            dep.target
                        );
                    }
                }
            }
        }

        DependencyGraph {
            edges,
            reverse_edges,
            scripts,
            sort_keys,
        }
    }

    /// Kahn's algorithm with a min-heap on (version, id), so every script
    /// whose dependencies are satisfied pops in ascending version order.
    /// A cycle yields a single error naming the entangled ids.
    pub fn topological_sort(mut self) -> Result<Vec<MigrationScript>> {
        let mut in_degree: HashMap<String, usize> = self
            .edges
            .iter()
            .map(|(id, deps)| (id.clone(), deps.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<(String, String)>> = BinaryHeap::new();
        for (id, degree) in &in_degree {
            if *degree == 0 {
                ready.push(Reverse(self.sort_keys[id].clone()));
            }
        }

        let mut sorted = Vec::with_capacity(self.scripts.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            if let Some(dependents) = self.reverse_edges.get(&id) {
                for dependent in dependents {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(self.sort_keys[dependent].clone()));
                    }
                }
            }
            sorted.push(self.scripts.remove(&id).unwrap());
        }

        if sorted.len() != in_degree.len() {
            let mut in_cycle: Vec<String> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| id.clone())
                .collect();
            in_cycle.sort();
            return Err(BfmError::DependencyCycle {
                path: in_cycle.join(" -> "),
            });
        }

        Ok(sorted)
    }
}

/// Convenience: build and sort in one call.
pub fn order_scripts(selection: &[MigrationScript]) -> Result<Vec<MigrationScript>> {
    DependencyGraph::build(selection).topological_sort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Backend, StructuredDependency};

    fn script(version: &str, name: &str, depends: Vec<&str>) -> MigrationScript {
        MigrationScript {
            version: version.to_string(),
            name: name.to_string(),
            backend: Backend::Postgresql,
            connection: "main".to_string(),
            schema: String::new(),
            up_payload: String::new(),
            down_payload: String::new(),
            up_filename: String::new(),
            down_filename: String::new(),
            dependencies: depends.into_iter().map(String::from).collect(),
            structured_dependencies: vec![],
            checksum: 0,
        }
    }

    #[test]
    fn test_version_order_without_dependencies() {
        let selection = vec![
            script("20250103000000", "c", vec![]),
            script("20250101000000", "a", vec![]),
            script("20250102000000", "b", vec![]),
        ];
        let sorted = order_scripts(&selection).unwrap();
        let names: Vec<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dependency_beats_version_order() {
        // a (older) depends on b (newer): b must still run first.
        let selection = vec![
            script("20250101000000", "a", vec!["b"]),
            script("20250102000000", "b", vec![]),
        ];
        let sorted = order_scripts(&selection).unwrap();
        let names: Vec<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_order_independent_of_registration_order() {
        let a = script("20250102000000", "a", vec!["b"]);
        let b = script("20250101000000", "b", vec![]);
        for selection in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
            let sorted = order_scripts(&selection).unwrap();
            let names: Vec<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["b", "a"]);
        }
    }

    #[test]
    fn test_cycle_detection() {
        let selection = vec![
            script("20250101000000", "a", vec!["b"]),
            script("20250102000000", "b", vec!["a"]),
        ];
        let err = order_scripts(&selection).unwrap_err();
        match err {
            BfmError::DependencyCycle { path } => {
                assert!(path.contains("_a_"));
                assert!(path.contains("_b_"));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_dependency_outside_selection_is_ignored() {
        let selection = vec![script("20250102000000", "a", vec!["already_applied"])];
        let sorted = order_scripts(&selection).unwrap();
        assert_eq!(sorted.len(), 1);
    }

    #[test]
    fn test_structured_dependency_by_version() {
        let mut a = script("20250101000000", "a", vec![]);
        a.structured_dependencies.push(StructuredDependency {
            connection: "main".to_string(),
            schema: vec![],
            target: "20250102000000".to_string(),
            target_type: crate::script::DependencyTargetType::Version,
            requires_table: None,
            requires_schema: None,
        });
        let b = script("20250102000000", "b", vec![]);
        let sorted = order_scripts(&[a, b]).unwrap();
        let names: Vec<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_self_dependency_is_ignored() {
        let selection = vec![script("20250101000000", "a", vec!["a"])];
        let sorted = order_scripts(&selection).unwrap();
        assert_eq!(sorted.len(), 1);
    }
}
