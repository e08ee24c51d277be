//! Dependency graph edge bookkeeping (§4.5).
//!
//! Edges point from a dependant to the dependency it relies on. The graph
//! only ever stores `ServiceId` copies in both directions — never an owning
//! handle to the service itself — so tearing down a service never requires
//! walking the graph to find dangling owners (§9).

use std::collections::{HashMap, HashSet};

use crate::types::ServiceId;

/// Tracks which services depend on which. Cycles are allowed transiently
/// while services are still `Starting` (two services may each declare the
/// other as an optional dependency before either is `Active`); the invariant
/// that must hold is narrower: the edge set restricted to `Active` services
/// is always a strict DAG (§4.5, §8).
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// dependant -> set of dependencies it currently relies on.
    dependencies: HashMap<ServiceId, HashSet<ServiceId>>,
    /// dependency -> set of dependants relying on it.
    dependants: HashMap<ServiceId, HashSet<ServiceId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, dependant: ServiceId, dependency: ServiceId) {
        self.dependencies.entry(dependant).or_default().insert(dependency);
        self.dependants.entry(dependency).or_default().insert(dependant);
    }

    pub fn remove_edge(&mut self, dependant: ServiceId, dependency: ServiceId) {
        if let Some(set) = self.dependencies.get_mut(&dependant) {
            set.remove(&dependency);
        }
        if let Some(set) = self.dependants.get_mut(&dependency) {
            set.remove(&dependant);
        }
    }

    /// Remove every edge touching `service`, in either direction. Called
    /// when a service is removed from the registry.
    pub fn remove_service(&mut self, service: ServiceId) {
        if let Some(dependencies) = self.dependencies.remove(&service) {
            for dependency in dependencies {
                if let Some(set) = self.dependants.get_mut(&dependency) {
                    set.remove(&service);
                }
            }
        }
        if let Some(dependants) = self.dependants.remove(&service) {
            for dependant in dependants {
                if let Some(set) = self.dependencies.get_mut(&dependant) {
                    set.remove(&service);
                }
            }
        }
    }

    pub fn dependencies_of(&self, service: ServiceId) -> impl Iterator<Item = ServiceId> + '_ {
        self.dependencies
            .get(&service)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub fn dependants_of(&self, service: ServiceId) -> impl Iterator<Item = ServiceId> + '_ {
        self.dependants
            .get(&service)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Would adding an edge `from -> to` create a cycle, considering only
    /// edges between services in `active`? Used before starting a service:
    /// the graph restricted to `Active` services must stay a DAG even though
    /// the full graph (including `Starting` services) may be cyclic.
    pub fn would_cycle_among(&self, from: ServiceId, to: ServiceId, active: &HashSet<ServiceId>) -> bool {
        if from == to {
            return true;
        }
        let mut stack = vec![to];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            for next in self.dependencies_of(current) {
                if active.contains(&next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Debug-only invariant check: the subgraph induced by `active` contains
    /// no cycle. Intended for tests, not the hot path.
    #[cfg(debug_assertions)]
    pub fn assert_dag_among(&self, active: &HashSet<ServiceId>) {
        for &service in active {
            let mut stack: Vec<(ServiceId, HashSet<ServiceId>)> = vec![(service, HashSet::new())];
            while let Some((current, mut path)) = stack.pop() {
                if !path.insert(current) {
                    panic!("dependency graph cycle detected among active services at {current}");
                }
                for next in self.dependencies_of(current) {
                    if active.contains(&next) {
                        stack.push((next, path.clone()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ServiceId {
        ServiceId::from_raw(n)
    }

    #[test]
    fn add_and_remove_edge_round_trips() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(id(1), id(2));
        assert_eq!(graph.dependencies_of(id(1)).collect::<Vec<_>>(), vec![id(2)]);
        assert_eq!(graph.dependants_of(id(2)).collect::<Vec<_>>(), vec![id(1)]);
        graph.remove_edge(id(1), id(2));
        assert!(graph.dependencies_of(id(1)).next().is_none());
    }

    #[test]
    fn remove_service_clears_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(3), id(1));
        graph.remove_service(id(1));
        assert!(graph.dependants_of(id(2)).next().is_none());
        assert!(graph.dependencies_of(id(3)).next().is_none());
    }

    #[test]
    fn would_cycle_detects_indirect_cycle_among_active() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(id(2), id(3)); // 2 depends on 3
        let active: HashSet<ServiceId> = [id(2), id(3)].into_iter().collect();
        // 3 -> 2 would close a cycle given 2 -> 3 already exists.
        assert!(graph.would_cycle_among(id(3), id(2), &active));
    }

    #[test]
    fn would_cycle_ignores_edges_through_inactive_services() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(id(2), id(3)); // 2 -> 3, but 3 is not active yet
        let active: HashSet<ServiceId> = [id(2)].into_iter().collect();
        assert!(!graph.would_cycle_among(id(3), id(2), &active));
    }

    #[test]
    fn assert_dag_among_passes_on_acyclic_subgraph() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(id(1), id(2));
        graph.add_edge(id(2), id(3));
        let active: HashSet<ServiceId> = [id(1), id(2), id(3)].into_iter().collect();
        graph.assert_dag_among(&active);
    }
}
