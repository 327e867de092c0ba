#![deny(clippy::all)]
//! Utilities layered on top of `petgraph`: transitive closures, cycle
//! validation with a readable report, and a dependency-ordered concurrent
//! walker.

mod walker;

use std::{collections::HashSet, fmt::Display, hash::Hash};

use itertools::Itertools;
use petgraph::{
    prelude::*,
    visit::{depth_first_search, Reversed},
};
use thiserror::Error;
pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n{cycle_lines}")]
    CyclicDependencies { cycle_lines: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

/// Collects the set of node weights reachable from `indices` in the given
/// direction, including the starting nodes themselves.
pub fn transitive_closure<N: Hash + Eq, I: IntoIterator<Item = NodeIndex>>(
    graph: &Graph<N, ()>,
    indices: I,
    direction: petgraph::Direction,
) -> HashSet<&N> {
    let mut visited = HashSet::new();

    let visitor = |event| {
        if let petgraph::visit::DfsEvent::Discover(n, _) = event {
            visited.insert(
                graph
                    .node_weight(n)
                    .expect("node index found during dfs doesn't exist"),
            );
        }
    };

    match direction {
        petgraph::Direction::Outgoing => depth_first_search(&graph, indices, visitor),
        petgraph::Direction::Incoming => depth_first_search(Reversed(&graph), indices, visitor),
    };

    visited
}

/// Checks that the graph is a DAG with no self-edges.
///
/// Every strongly connected component with more than one member is reported
/// at once, each as a sorted list of its node names, so that the user sees
/// the full picture instead of one cycle per invocation.
pub fn validate_graph<N: Display + Hash + Eq>(graph: &Graph<N, ()>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge references existing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    let cycle_lines = petgraph::algo::tarjan_scc(graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .map(|component| {
            let members = component
                .into_iter()
                .map(|index| {
                    graph
                        .node_weight(index)
                        .expect("scc members exist in graph")
                        .to_string()
                })
                .sorted()
                .format(", ");
            format!("\t{members}")
        })
        .join("\n");

    if !cycle_lines.is_empty() {
        return Err(Error::CyclicDependencies { cycle_lines });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_acyclic() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(a, c, ());

        assert!(validate_graph(&g).is_ok());
    }

    #[test]
    fn test_validate_reports_cycle_members() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());
        g.add_edge(c, a, ());
        g.add_edge(c, d, ());

        let err = validate_graph(&g).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cyclic dependency detected:\n\ta, b, c"
        );
    }

    #[test]
    fn test_validate_self_dependency() {
        let mut g = Graph::new();
        let a = g.add_node("app#build");
        g.add_edge(a, a, ());

        let err = validate_graph(&g).unwrap_err();
        assert_eq!(err.to_string(), "app#build depends on itself");
    }

    #[test]
    fn test_transitive_closure_directions() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let downstream = transitive_closure(&g, Some(b), petgraph::Direction::Outgoing);
        assert_eq!(downstream, ["b", "c"].iter().collect());

        let upstream = transitive_closure(&g, Some(b), petgraph::Direction::Incoming);
        assert_eq!(upstream, ["a", "b"].iter().collect());
    }
}
