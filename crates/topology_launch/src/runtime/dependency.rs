//! Dependency graph construction and topological sorting

use crate::topology::Topology;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Dependency DAG over the services of a topology.
///
/// Services are stored in launch order; edges are indices into that order.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Service names in launch order
    names: Vec<String>,
    /// Direct dependencies of each service (indices into `names`)
    dependencies: Vec<Vec<usize>>,
    /// Map from service name to launch-order index
    index_map: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph over every service of the topology
    pub fn build(topology: &Topology) -> Result<Self, DependencyError> {
        let all: HashSet<&str> = topology.service_names().collect();
        Self::build_subset(topology, &all)
    }

    /// Build the graph over the selected services and everything they depend on
    pub fn for_services(topology: &Topology, selection: &[String]) -> Result<Self, DependencyError> {
        let mut included: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for name in selection {
            match topology.services.get_key_value(name.as_str()) {
                Some((key, _)) => stack.push(key.as_str()),
                None => return Err(DependencyError::UnknownService(name.clone())),
            }
        }

        while let Some(name) = stack.pop() {
            if !included.insert(name) {
                continue;
            }
            if let Some(spec) = topology.service(name) {
                stack.extend(spec.depends_on.iter().map(String::as_str));
            }
        }

        Self::build_subset(topology, &included)
    }

    fn build_subset(topology: &Topology, included: &HashSet<&str>) -> Result<Self, DependencyError> {
        // Work in declaration indices so ties resolve by declaration order
        let declared: Vec<&str> = topology
            .service_names()
            .filter(|name| included.contains(name))
            .collect();
        let position: HashMap<&str, usize> =
            declared.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        let mut in_degree = vec![0usize; declared.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); declared.len()];
        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); declared.len()];

        for (i, name) in declared.iter().enumerate() {
            let Some(spec) = topology.service(name) else {
                continue;
            };
            for dep in &spec.depends_on {
                let Some(&j) = position.get(dep.as_str()) else {
                    return Err(DependencyError::UnknownDependency {
                        service: name.to_string(),
                        dependency: dep.clone(),
                    });
                };
                in_degree[i] += 1;
                dependents[j].push(i);
                dependencies[i].push(j);
            }
        }

        // Kahn's algorithm with a min-heap of declaration indices
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut sorted: Vec<usize> = Vec::with_capacity(declared.len());

        while let Some(Reverse(i)) = ready.pop() {
            sorted.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if sorted.len() != declared.len() {
            let cycle_nodes: Vec<String> = declared
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, name)| name.to_string())
                .collect();
            return Err(DependencyError::CyclicDependency(cycle_nodes));
        }

        // Re-index from declaration order to launch order
        let mut launch_index = vec![0usize; declared.len()];
        for (order, &decl) in sorted.iter().enumerate() {
            launch_index[decl] = order;
        }

        let names: Vec<String> = sorted.iter().map(|&i| declared[i].to_string()).collect();
        let dependencies = sorted
            .iter()
            .map(|&i| dependencies[i].iter().map(|&j| launch_index[j]).collect())
            .collect();
        let index_map = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        Ok(Self {
            names,
            dependencies,
            index_map,
        })
    }

    /// Number of services in the graph
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the graph has no services
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether a service is part of the graph
    pub fn contains(&self, name: &str) -> bool {
        self.index_map.contains_key(name)
    }

    /// Launch-order index of a service
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_map.get(name).copied()
    }

    /// Service names in launch order
    pub fn launch_order(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Service names in shutdown order (reverse of launch order)
    pub fn shutdown_order(&self) -> impl Iterator<Item = &str> {
        self.launch_order().rev()
    }

    /// Direct dependencies of a service
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index_of(name)
            .map(|i| {
                self.dependencies[i]
                    .iter()
                    .map(|&j| self.names[j].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Services that directly depend on a given service
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(target) = self.index_of(name) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&target))
            .map(|(i, _)| self.names[i].as_str())
            .collect()
    }
}

/// Errors that can occur when building the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpolationContext;
    use crate::topology::{ServiceSpec, Topology};

    fn topology(yaml: &str) -> Topology {
        Topology::load_with(yaml, &InterpolationContext::isolated()).unwrap()
    }

    #[test]
    fn test_simple_dependency_order() {
        let t = topology(
            r#"
services:
  c:
    image: x
    depends_on: [b]
  b:
    image: x
    depends_on: [a]
  a:
    image: x
"#,
        );
        let graph = DependencyGraph::build(&t).unwrap();
        let order: Vec<_> = graph.launch_order().collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        let shutdown: Vec<_> = graph.shutdown_order().collect();
        assert_eq!(shutdown, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let t = topology(
            r#"
services:
  zeta:
    image: x
  alpha:
    image: x
  mid:
    image: x
    depends_on: [zeta]
  beta:
    image: x
"#,
        );
        let graph = DependencyGraph::build(&t).unwrap();
        let order: Vec<_> = graph.launch_order().collect();
        assert_eq!(order, vec!["zeta", "alpha", "mid", "beta"]);
    }

    #[test]
    fn test_diamond_dependency() {
        let t = topology(
            r#"
services:
  d:
    image: x
    depends_on: [b, c]
  b:
    image: x
    depends_on: [a]
  c:
    image: x
    depends_on: [a]
  a:
    image: x
"#,
        );
        let graph = DependencyGraph::build(&t).unwrap();
        let order: Vec<_> = graph.launch_order().collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert_eq!(graph.dependencies_of("d"), vec!["b", "c"]);
        assert_eq!(graph.dependents("a"), vec!["b", "c"]);
    }

    #[test]
    fn test_cycle_detection_in_constructed_topology() {
        // Bypass loading to exercise the graph on its own
        let mut t = topology(
            r#"
services:
  a:
    image: x
  b:
    image: x
  c:
    image: x
"#,
        );
        let edges = [("a", "c"), ("b", "a"), ("c", "b")];
        for (from, to) in edges {
            let spec: &mut ServiceSpec = t.services.get_mut(from).unwrap();
            spec.depends_on.push(to.to_string());
        }

        let result = DependencyGraph::build(&t);
        assert!(matches!(
            result,
            Err(DependencyError::CyclicDependency(ref names)) if names.len() == 3
        ));
    }

    #[test]
    fn test_selection_includes_transitive_dependencies() {
        let t = topology(
            r#"
services:
  db:
    image: x
  catalog:
    image: x
    depends_on: [db]
  api:
    image: x
    depends_on: [catalog]
  analyzer:
    image: x
    depends_on: [catalog]
"#,
        );
        let graph = DependencyGraph::for_services(&t, &["api".to_string()]).unwrap();
        let order: Vec<_> = graph.launch_order().collect();
        assert_eq!(order, vec!["db", "catalog", "api"]);
        assert!(!graph.contains("analyzer"));

        let result = DependencyGraph::for_services(&t, &["nope".to_string()]);
        assert!(matches!(result, Err(DependencyError::UnknownService(_))));
    }
}
