//! Service dependency graph
//!
//! Edges point from a dependency to its dependents. The builder only
//! validates and exposes adjacency; the launcher walks the graph level by
//! level from in-degrees so siblings can start concurrently.

use super::spec::ServiceSpec;
use crate::error::ValidationError;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Validated, acyclic dependency graph keyed by service name
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node names in descriptor order
    nodes: Vec<String>,
    /// Direct dependencies of each node
    dependencies: HashMap<String, Vec<String>>,
    /// Direct dependents of each node
    dependents: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

impl DependencyGraph {
    /// Build and validate the graph for a set of services
    pub fn build(services: &IndexMap<String, ServiceSpec>) -> Result<Self, ValidationError> {
        let nodes: Vec<String> = services.keys().cloned().collect();
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> =
            nodes.iter().map(|n| (n.clone(), Vec::new())).collect();

        for (name, service) in services {
            for dep in &service.depends_on {
                if !services.contains_key(dep) {
                    return Err(ValidationError::UnknownDependency {
                        service: name.clone(),
                        missing: dep.clone(),
                    });
                }
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(name.clone());
                }
            }
            dependencies.insert(name.clone(), service.depends_on.iter().cloned().collect());
        }

        let graph = Self {
            nodes,
            dependencies,
            dependents,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Depth-first search keeping the recursion stack; a back edge to a node
    /// still on the stack is a cycle.
    fn check_acyclic(&self) -> Result<(), ValidationError> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for node in &self.nodes {
            if !marks.contains_key(node.as_str()) {
                self.visit(node, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), ValidationError> {
        marks.insert(node, Mark::OnStack);
        stack.push(node);

        for dep in self.dependencies(node) {
            match marks.get(dep.as_str()) {
                Some(Mark::OnStack) => {
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.clone());
                    return Err(ValidationError::CyclicDependency { cycle });
                }
                Some(Mark::Done) => {}
                None => self.visit(dep, marks, stack)?,
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    /// Node names in descriptor order
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents of a node
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Count of unresolved dependencies per node
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .map(|n| (n.clone(), self.dependencies(n).len()))
            .collect()
    }

    /// Every node reachable from `name` along dependent edges, breadth first
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        let mut result = Vec::new();

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent) {
                    result.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }

        result
    }

    /// Nodes grouped into levels: every node's dependencies sit in earlier
    /// levels. Within a level, descriptor order is kept.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut in_degree = self.in_degrees();
        let mut current: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.as_str()] == 0)
            .cloned()
            .collect();
        let mut levels = Vec::new();

        while !current.is_empty() {
            let mut next = Vec::new();
            for node in &current {
                for dependent in self.dependents(node) {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent.clone());
                        }
                    }
                }
            }
            next.sort_by_key(|n| self.position(n));
            levels.push(std::mem::replace(&mut current, next));
        }

        levels
    }

    /// A full topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<String> {
        self.levels().into_iter().flatten().collect()
    }

    fn position(&self, name: &str) -> usize {
        self.nodes.iter().position(|n| n == name).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::spec::{ImageRef, ImageSource, ProbeOverrides, Readiness, RestartPolicy};
    use std::collections::BTreeSet;

    fn service(name: &str, deps: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            source: ImageSource::Image(ImageRef::parse("busybox")),
            command: None,
            ports: Vec::new(),
            env: IndexMap::new(),
            exposed_ports: BTreeSet::new(),
            volumes: Vec::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            restart: RestartPolicy::Never,
            healthcheck: None,
            readiness: Readiness::Running,
            probe: ProbeOverrides::default(),
        }
    }

    fn services(defs: &[(&str, &[&str])]) -> IndexMap<String, ServiceSpec> {
        defs.iter()
            .map(|(name, deps)| (name.to_string(), service(name, deps)))
            .collect()
    }

    #[test]
    fn test_chain_adjacency() {
        let graph = DependencyGraph::build(&services(&[
            ("frontend", &["backend"]),
            ("backend", &["postgres"]),
            ("postgres", &[]),
        ]))
        .unwrap();

        assert_eq!(graph.dependents("postgres"), ["backend".to_string()]);
        assert_eq!(graph.dependencies("frontend"), ["backend".to_string()]);
        assert_eq!(graph.in_degrees()["postgres"], 0);
        assert_eq!(graph.in_degrees()["frontend"], 1);
        assert_eq!(
            graph.topological_order(),
            vec!["postgres", "backend", "frontend"]
        );
        assert_eq!(graph.descendants("postgres"), vec!["backend", "frontend"]);
    }

    #[test]
    fn test_levels_group_siblings() {
        let graph = DependencyGraph::build(&services(&[
            ("web", &["api", "auth"]),
            ("api", &["db"]),
            ("auth", &["db"]),
            ("db", &[]),
            ("cache", &[]),
        ]))
        .unwrap();

        assert_eq!(
            graph.levels(),
            vec![
                vec!["db".to_string(), "cache".to_string()],
                vec!["api".to_string(), "auth".to_string()],
                vec!["web".to_string()],
            ]
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let err = DependencyGraph::build(&services(&[("api", &["db"])])).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                service: "api".to_string(),
                missing: "db".to_string(),
            }
        );
    }

    #[test]
    fn test_two_node_cycle_lists_both() {
        let err = DependencyGraph::build(&services(&[
            ("postgres", &[]),
            ("backend", &["postgres"]),
            ("frontend", &["backend", "fourth"]),
            ("fourth", &["frontend"]),
        ]))
        .unwrap_err();

        match err {
            ValidationError::CyclicDependency { cycle } => {
                assert_eq!(cycle, vec!["frontend", "fourth", "frontend"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = DependencyGraph::build(&services(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, ValidationError::CyclicDependency { ref cycle } if cycle == &["a", "a"]));
    }

    #[test]
    fn test_long_cycle_path() {
        let err = DependencyGraph::build(&services(&[
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a"]),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::CyclicDependency { ref cycle } if cycle == &["a", "b", "c", "a"]
        ));
    }
}
