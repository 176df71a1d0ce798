//! Dependency resolution for agent startup ordering.
//!
//! Start order is a topological sort over the dependency edges declared in
//! agent descriptors. Cycles and references to unregistered agents are
//! rejected before any agent is constructed.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use mycel_types::{AgentDescriptor, AgentId};

use crate::OrchestratorError;

/// Resolver over the declared dependency graph.
pub struct DependencyResolver {
    graph: HashMap<AgentId, HashSet<AgentId>>,
    registration_order: Vec<AgentId>,
}

impl DependencyResolver {
    /// Build a resolver from registered descriptors.
    ///
    /// Fails when a descriptor depends on an agent that was never registered.
    pub fn new(descriptors: &[AgentDescriptor]) -> Result<Self, OrchestratorError> {
        let mut graph = HashMap::new();
        let mut registration_order = Vec::new();
        for descriptor in descriptors {
            registration_order.push(descriptor.id.clone());
            graph.insert(
                descriptor.id.clone(),
                descriptor.dependencies.iter().cloned().collect::<HashSet<_>>(),
            );
        }
        for (agent, deps) in &graph {
            for dep in deps {
                if !graph.contains_key(dep) {
                    return Err(OrchestratorError::UnknownDependency {
                        agent: agent.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(Self { graph, registration_order })
    }

    /// Topologically ordered start sequence: every agent appears after all of
    /// its dependencies. Registration order breaks ties deterministically.
    pub fn start_order(&self) -> Result<Vec<AgentId>, OrchestratorError> {
        let mut result = Vec::with_capacity(self.registration_order.len());
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        fn visit(
            agent: &AgentId,
            graph: &HashMap<AgentId, HashSet<AgentId>>,
            visited: &mut HashSet<AgentId>,
            visiting: &mut HashSet<AgentId>,
            result: &mut Vec<AgentId>,
        ) -> Result<(), OrchestratorError> {
            if visited.contains(agent) {
                return Ok(());
            }
            if !visiting.insert(agent.clone()) {
                return Err(OrchestratorError::DependencyCycle { agent: agent.clone() });
            }
            if let Some(deps) = graph.get(agent) {
                let mut sorted: Vec<&AgentId> = deps.iter().collect();
                sorted.sort();
                for dep in sorted {
                    visit(dep, graph, visited, visiting, result)?;
                }
            }
            visiting.remove(agent);
            visited.insert(agent.clone());
            result.push(agent.clone());
            Ok(())
        }

        for agent in &self.registration_order {
            visit(agent, &self.graph, &mut visited, &mut visiting, &mut result)?;
        }
        debug!(?result, "resolved start order");
        Ok(result)
    }

    /// Group the start order into waves: every agent lands one wave after its
    /// deepest dependency, so all members of a wave can start concurrently.
    pub fn start_waves(&self) -> Result<Vec<Vec<AgentId>>, OrchestratorError> {
        let order = self.start_order()?;
        let mut waves: Vec<Vec<AgentId>> = Vec::new();
        let mut placed: HashMap<AgentId, usize> = HashMap::new();
        for agent in order {
            let wave_index = self
                .graph
                .get(&agent)
                .map(|deps| {
                    deps.iter()
                        .filter_map(|dep| placed.get(dep))
                        .map(|wave| wave + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            if waves.len() <= wave_index {
                waves.push(Vec::new());
            }
            waves[wave_index].push(agent.clone());
            placed.insert(agent, wave_index);
        }
        debug!(waves = waves.len(), "resolved start waves");
        Ok(waves)
    }

    /// Declared dependency edges, `(agent, dependency)` pairs in registration
    /// order, for the topology graph.
    pub fn edges(&self) -> Vec<(AgentId, AgentId)> {
        let mut edges = Vec::new();
        for agent in &self.registration_order {
            if let Some(deps) = self.graph.get(agent) {
                let mut sorted: Vec<&AgentId> = deps.iter().collect();
                sorted.sort();
                for dep in sorted {
                    edges.push((agent.clone(), dep.clone()));
                }
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycel_types::AgentKind;

    fn descriptor(id: &str, deps: Vec<&str>) -> AgentDescriptor {
        AgentDescriptor {
            id: AgentId::from(id),
            name: id.to_string(),
            kind: AgentKind::Custom("test".to_string()),
            config: serde_json::Value::Null,
            dependencies: deps.into_iter().map(AgentId::from).collect(),
        }
    }

    #[test]
    fn linear_chain_resolves_in_order() {
        let resolver = DependencyResolver::new(&[
            descriptor("c", vec!["b"]),
            descriptor("b", vec!["a"]),
            descriptor("a", vec![]),
        ])
        .unwrap();
        let order = resolver.start_order().unwrap();
        assert_eq!(order, vec![AgentId::from("a"), AgentId::from("b"), AgentId::from("c")]);
    }

    #[test]
    fn diamond_keeps_dependencies_first() {
        let resolver = DependencyResolver::new(&[
            descriptor("a", vec![]),
            descriptor("b", vec!["a"]),
            descriptor("c", vec!["a"]),
            descriptor("d", vec!["b", "c"]),
        ])
        .unwrap();
        let order = resolver.start_order().unwrap();
        let position = |id: &str| order.iter().position(|a| a.as_str() == id).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[test]
    fn chain_yields_singleton_waves() {
        let resolver = DependencyResolver::new(&[
            descriptor("a", vec![]),
            descriptor("b", vec!["a"]),
            descriptor("c", vec!["b"]),
        ])
        .unwrap();
        let waves = resolver.start_waves().unwrap();
        assert_eq!(
            waves,
            vec![
                vec![AgentId::from("a")],
                vec![AgentId::from("b")],
                vec![AgentId::from("c")],
            ]
        );
    }

    #[test]
    fn diamond_collapses_independent_agents_into_one_wave() {
        let resolver = DependencyResolver::new(&[
            descriptor("a", vec![]),
            descriptor("b", vec!["a"]),
            descriptor("c", vec!["a"]),
            descriptor("d", vec!["b", "c"]),
        ])
        .unwrap();
        let waves = resolver.start_waves().unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![AgentId::from("a")]);
        let mut middle = waves[1].clone();
        middle.sort();
        assert_eq!(middle, vec![AgentId::from("b"), AgentId::from("c")]);
        assert_eq!(waves[2], vec![AgentId::from("d")]);
    }

    #[test]
    fn cycles_are_rejected() {
        let resolver = DependencyResolver::new(&[
            descriptor("a", vec!["b"]),
            descriptor("b", vec!["a"]),
        ])
        .unwrap();
        assert!(matches!(
            resolver.start_order(),
            Err(OrchestratorError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected_at_build() {
        let result = DependencyResolver::new(&[descriptor("a", vec!["ghost"])]);
        assert!(matches!(result, Err(OrchestratorError::UnknownDependency { .. })));
    }

    #[test]
    fn edges_surface_declared_links() {
        let resolver = DependencyResolver::new(&[
            descriptor("a", vec![]),
            descriptor("b", vec!["a"]),
        ])
        .unwrap();
        assert_eq!(resolver.edges(), vec![(AgentId::from("b"), AgentId::from("a"))]);
    }
}
