//! Plugin dependency graph construction via Kahn's algorithm.
//!
//! Edges run provider -> consumer, so a valid topological order always
//! activates a service provider before any plugin that injects it.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{HostError, Result};

/// One plugin's declared service relationships.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub provides: Vec<String>,
    pub injects: Vec<String>,
}

impl GraphNode {
    pub fn new(
        name: impl Into<String>,
        provides: impl IntoIterator<Item = impl Into<String>>,
        injects: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            provides: provides.into_iter().map(Into::into).collect(),
            injects: injects.into_iter().map(Into::into).collect(),
        }
    }
}

/// An injection request with no provider anywhere in the node set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingService {
    pub plugin: String,
    pub service: String,
}

/// Output of [`build_plugin_graph`].
#[derive(Debug, Clone, Default)]
pub struct GraphResult {
    /// Valid topological load order over all non-cyclic nodes.
    pub order: Vec<String>,
    /// Advisory: injections with no provider. These do not constrain `order`.
    pub missing_services: Vec<MissingService>,
    /// Each entry is one set of mutually blocking plugins.
    pub cycles: Vec<Vec<String>>,
}

/// Build a load order for the given nodes.
///
/// Two nodes providing the same service is a configuration conflict and
/// fails immediately. A missing provider is recorded but adds no edge, so
/// the consumer still appears in `order`. Ties are broken by input order.
pub fn build_plugin_graph(nodes: &[GraphNode]) -> Result<GraphResult> {
    let mut provides: HashMap<&str, &str> = HashMap::new();
    for node in nodes {
        for service in &node.provides {
            if let Some(first) = provides.get(service.as_str()) {
                return Err(HostError::ServiceConflict {
                    service: service.clone(),
                    first: (*first).to_string(),
                    second: node.name.clone(),
                });
            }
            provides.insert(service, &node.name);
        }
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut edges: HashSet<(&str, &str)> = HashSet::new();
    let mut missing_services = Vec::new();

    for node in nodes {
        indegree.entry(&node.name).or_insert(0);
        adjacency.entry(&node.name).or_default();
    }

    for node in nodes {
        for service in &node.injects {
            let Some(&provider) = provides.get(service.as_str()) else {
                missing_services.push(MissingService {
                    plugin: node.name.clone(),
                    service: service.clone(),
                });
                continue;
            };
            if edges.insert((provider, &node.name)) {
                adjacency.entry(provider).or_default().push(&node.name);
                *indegree.entry(&node.name).or_insert(0) += 1;
            }
        }
    }

    // Seed with indegree-0 nodes in input order so ties stay deterministic.
    let mut queue: VecDeque<&str> = nodes
        .iter()
        .filter(|n| indegree.get(n.name.as_str()) == Some(&0))
        .map(|n| n.name.as_str())
        .collect();

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());
        if let Some(consumers) = adjacency.get(current) {
            for &consumer in consumers {
                let degree = indegree.entry(consumer).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(consumer);
                }
            }
        }
    }

    // Anything left out of the order is stuck in a cycle.
    let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
    let unresolved: Vec<String> = nodes
        .iter()
        .filter(|n| !ordered.contains(n.name.as_str()))
        .map(|n| n.name.clone())
        .collect();

    let mut cycles = Vec::new();
    if !unresolved.is_empty() {
        cycles.push(unresolved);
    }

    Ok(GraphResult {
        order,
        missing_services,
        cycles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, provides: &[&str], injects: &[&str]) -> GraphNode {
        GraphNode::new(name, provides.iter().copied(), injects.iter().copied())
    }

    #[test]
    fn orders_providers_before_consumers() {
        let nodes = vec![
            node("a", &["x"], &[]),
            node("b", &[], &["x"]),
            node("c", &["y"], &["z"]),
        ];
        let result = build_plugin_graph(&nodes).unwrap();

        assert_eq!(result.order, vec!["a", "c", "b"]);
        assert_eq!(
            result.missing_services,
            vec![MissingService {
                plugin: "c".into(),
                service: "z".into()
            }]
        );
        assert!(result.cycles.is_empty());
    }

    #[test]
    fn edge_always_precedes_consumer() {
        let nodes = vec![
            node("ui", &[], &["store", "api"]),
            node("api", &["api"], &["store"]),
            node("store", &["store"], &[]),
        ];
        let result = build_plugin_graph(&nodes).unwrap();

        let pos = |name: &str| result.order.iter().position(|n| n == name).unwrap();
        assert!(pos("store") < pos("api"));
        assert!(pos("store") < pos("ui"));
        assert!(pos("api") < pos("ui"));
    }

    #[test]
    fn detects_two_node_cycle() {
        let nodes = vec![node("a", &["x"], &["y"]), node("b", &["y"], &["x"])];
        let result = build_plugin_graph(&nodes).unwrap();

        assert!(result.order.is_empty());
        assert_eq!(result.cycles.len(), 1);
        let mut members = result.cycles[0].clone();
        members.sort();
        assert_eq!(members, vec!["a", "b"]);
    }

    #[test]
    fn cycle_does_not_block_independent_nodes() {
        let nodes = vec![
            node("a", &["x"], &["y"]),
            node("b", &["y"], &["x"]),
            node("c", &[], &[]),
        ];
        let result = build_plugin_graph(&nodes).unwrap();

        assert_eq!(result.order, vec!["c"]);
        assert_eq!(result.cycles, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn duplicate_provider_is_a_hard_failure() {
        let nodes = vec![node("a", &["x"], &[]), node("b", &["x"], &[])];
        let err = build_plugin_graph(&nodes).unwrap_err();
        assert!(matches!(err, HostError::ServiceConflict { ref service, .. } if service == "x"));
    }

    #[test]
    fn missing_service_does_not_exclude_consumer() {
        let nodes = vec![node("c", &[], &["z"])];
        let result = build_plugin_graph(&nodes).unwrap();

        assert_eq!(result.order, vec!["c"]);
        assert_eq!(
            result.missing_services,
            vec![MissingService {
                plugin: "c".into(),
                service: "z".into()
            }]
        );
    }

    #[test]
    fn duplicate_inject_adds_single_edge() {
        let nodes = vec![node("a", &["x"], &[]), node("b", &[], &["x", "x"])];
        let result = build_plugin_graph(&nodes).unwrap();
        assert_eq!(result.order, vec!["a", "b"]);
    }
}
