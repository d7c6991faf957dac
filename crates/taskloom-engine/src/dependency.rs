//! Dependency graph validation for workflow tasks.
//!
//! Builds the task id → dependency set adjacency map, rejecting references to
//! unknown tasks and cycles of any length before the scheduler runs anything.

use std::collections::{BTreeSet, HashMap, HashSet};

use taskloom_core::error::{LoomError, Result};
use taskloom_core::workflow::Task;

/// Validated adjacency map: task id → ids it depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// Dependencies of a task (empty for unknown ids).
    pub fn dependencies(&self, task_id: &str) -> Option<&HashSet<String>> {
        self.edges.get(task_id)
    }

    /// Whether every dependency of `task_id` is in `completed`.
    pub fn is_ready(&self, task_id: &str, completed: &HashSet<String>) -> bool {
        self.edges
            .get(task_id)
            .map(|deps| deps.is_subset(completed))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Visited,
}

/// Validates task dependencies and detects cycles.
pub struct DependencyGraphBuilder;

impl DependencyGraphBuilder {
    /// Build the adjacency map for `tasks`.
    pub fn build(tasks: &[Task]) -> Result<DependencyGraph> {
        let mut edges: HashMap<String, HashSet<String>> = HashMap::with_capacity(tasks.len());
        for task in tasks {
            if edges.contains_key(&task.id) {
                return Err(LoomError::InvalidWorkflow(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
            edges.insert(task.id.clone(), task.depends_on.iter().cloned().collect());
        }

        let missing: BTreeSet<String> = tasks
            .iter()
            .flat_map(|t| t.depends_on.iter())
            .filter(|dep| !edges.contains_key(*dep))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(LoomError::InvalidDependency {
                missing: missing.into_iter().collect(),
            });
        }

        // Declared order of each task's dependencies, so the reported cycle
        // is deterministic.
        let declared: HashMap<&str, &[String]> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
            .collect();
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(tasks.len());
        let mut path: Vec<&str> = Vec::new();
        for task in tasks {
            if !marks.contains_key(task.id.as_str()) {
                visit(task.id.as_str(), &declared, &mut marks, &mut path)?;
            }
        }

        Ok(DependencyGraph { edges })
    }
}

/// Depth-first walk over declared dependencies.
fn visit<'a>(
    id: &'a str,
    declared: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    marks.insert(id, Mark::InProgress);
    path.push(id);

    let deps: &'a [String] = declared.get(id).copied().unwrap_or(&[]);

    for dep in deps {
        match marks.get(dep.as_str()) {
            Some(Mark::InProgress) => {
                let start = path.iter().position(|p| *p == dep.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.clone());
                return Err(LoomError::CircularDependency { cycle });
            }
            Some(Mark::Visited) => {}
            None => visit(dep.as_str(), declared, marks, path)?,
        }
    }

    path.pop();
    marks.insert(id, Mark::Visited);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id, "noop").with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_valid_diamond() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ];
        let graph = DependencyGraphBuilder::build(&tasks).unwrap();
        assert_eq!(graph.len(), 4);
        assert!(graph.dependencies("a").unwrap().is_empty());
        assert_eq!(graph.dependencies("d").unwrap().len(), 2);

        let mut done = HashSet::new();
        assert!(graph.is_ready("a", &done));
        assert!(!graph.is_ready("b", &done));
        done.insert("a".to_string());
        assert!(graph.is_ready("b", &done));
        assert!(!graph.is_ready("d", &done));
    }

    #[test]
    fn test_missing_dependencies_listed() {
        let tasks = vec![task("a", &["zeta"]), task("b", &["alpha", "zeta"])];
        let err = DependencyGraphBuilder::build(&tasks).unwrap_err();
        match err {
            LoomError::InvalidDependency { missing } => {
                assert_eq!(missing, vec!["alpha", "zeta"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let err = DependencyGraphBuilder::build(&[task("a", &["a"])]).unwrap_err();
        assert!(matches!(err, LoomError::CircularDependency { cycle } if cycle == vec!["a", "a"]));
    }

    #[test]
    fn test_two_cycle() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let err = DependencyGraphBuilder::build(&tasks).unwrap_err();
        assert!(matches!(err, LoomError::CircularDependency { .. }));
    }

    #[test]
    fn test_long_cycle_reports_path() {
        let tasks = vec![
            task("root", &[]),
            task("a", &["root", "c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ];
        let err = DependencyGraphBuilder::build(&tasks).unwrap_err();
        match err {
            LoomError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "c", "b", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_long_chain() {
        let tasks: Vec<Task> = (0..2000)
            .map(|i| {
                let id = format!("t{}", i);
                if i == 0 {
                    Task::new(id.clone(), id, "noop")
                } else {
                    Task::new(id.clone(), id, "noop").with_dependencies([format!("t{}", i - 1)])
                }
            })
            .collect();
        let graph = DependencyGraphBuilder::build(&tasks).unwrap();
        assert_eq!(graph.len(), 2000);

        let mut looped = tasks;
        looped[0].depends_on = vec!["t1999".to_string()];
        match DependencyGraphBuilder::build(&looped).unwrap_err() {
            LoomError::CircularDependency { cycle } => assert_eq!(cycle.len(), 2001),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let err = DependencyGraphBuilder::build(&[task("a", &[]), task("a", &[])]).unwrap_err();
        assert!(matches!(err, LoomError::InvalidWorkflow(_)));
    }

    #[test]
    fn test_empty_workflow() {
        let graph = DependencyGraphBuilder::build(&[]).unwrap();
        assert!(graph.is_empty());
    }
}
