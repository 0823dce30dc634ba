//! Deterministic topological ordering.
//!
//! The orderer is the one source of task ordering in petrel: topological
//! indices assigned at build time come from it, and the net translator walks
//! children in that order. Ties among simultaneously-ready nodes are broken
//! by ascending name so that rebuilding the same document always produces a
//! structurally identical plan.

use std::collections::{BTreeMap, BTreeSet};

/// The edge set contains a cycle; no ordering exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError;

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dependency graph contains a cycle")
    }
}

impl std::error::Error for CycleError {}

/// Order `nodes` so that every node appears after all its predecessors.
///
/// The sequence begins with `start` (conventionally "input connector").
/// Ties among ready nodes are broken by ascending lexicographic name order.
/// Duplicate edges are tolerated and counted once.
pub fn topological_order(
    nodes: &[String],
    edges: &[(String, String)],
    start: &str,
) -> Result<Vec<String>, CycleError> {
    let node_set: BTreeSet<&str> = nodes.iter().map(String::as_str).collect();

    let mut successors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for name in &node_set {
        successors.insert(name, BTreeSet::new());
    }
    for (source, destination) in edges {
        if let Some(succ) = successors.get_mut(source.as_str()) {
            succ.insert(destination.as_str());
        }
    }

    let mut indegree: BTreeMap<&str, usize> = node_set.iter().map(|n| (*n, 0)).collect();
    for succ in successors.values() {
        for destination in succ {
            if let Some(count) = indegree.get_mut(destination) {
                *count += 1;
            }
        }
    }

    // Sorted frontier of zero-remaining-indegree nodes; the start node is
    // pulled out first so the sequence always begins with it.
    let mut frontier: BTreeSet<&str> = indegree
        .iter()
        .filter(|(name, count)| **count == 0 && **name != start)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(node_set.len());

    fn release<'a>(
        successors: &BTreeMap<&'a str, BTreeSet<&'a str>>,
        node: &str,
        frontier: &mut BTreeSet<&'a str>,
        indegree: &mut BTreeMap<&'a str, usize>,
    ) {
        if let Some(succ) = successors.get(node) {
            for destination in succ {
                if let Some(count) = indegree.get_mut(destination) {
                    *count -= 1;
                    if *count == 0 {
                        frontier.insert(*destination);
                    }
                }
            }
        }
    }

    if node_set.contains(start) {
        order.push(start.to_string());
        release(&successors, start, &mut frontier, &mut indegree);
    }

    while let Some(&next) = frontier.iter().next() {
        frontier.remove(next);
        order.push(next.to_string());
        release(&successors, next, &mut frontier, &mut indegree);
    }

    if order.len() != node_set.len() {
        return Err(CycleError);
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn edges(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn test_start_node_comes_first() {
        let order = topological_order(
            &names(&["b", "input connector", "a"]),
            &edges(&[("input connector", "a"), ("a", "b")]),
            "input connector",
        )
        .unwrap();
        assert_eq!(order, vec!["input connector", "a", "b"]);
    }

    #[test]
    fn test_ties_broken_lexicographically() {
        let order = topological_order(
            &names(&["zeta", "alpha", "mid", "input connector"]),
            &edges(&[
                ("input connector", "zeta"),
                ("input connector", "alpha"),
                ("alpha", "mid"),
                ("zeta", "mid"),
            ]),
            "input connector",
        )
        .unwrap();
        assert_eq!(order, vec!["input connector", "alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_order_is_invariant_under_input_permutation() {
        let node_names = names(&["c", "a", "b", "input connector", "d"]);
        let edge_list = edges(&[
            ("input connector", "a"),
            ("input connector", "b"),
            ("a", "c"),
            ("b", "c"),
            ("c", "d"),
        ]);

        let reference = topological_order(&node_names, &edge_list, "input connector").unwrap();

        let mut reversed_nodes = node_names.clone();
        reversed_nodes.reverse();
        let mut reversed_edges = edge_list.clone();
        reversed_edges.reverse();

        let permuted =
            topological_order(&reversed_nodes, &reversed_edges, "input connector").unwrap();
        assert_eq!(reference, permuted);
    }

    #[test]
    fn test_cycle_fails_without_partial_order() {
        let result = topological_order(
            &names(&["input connector", "a", "b"]),
            &edges(&[("input connector", "a"), ("a", "b"), ("b", "a")]),
            "input connector",
        );
        assert_eq!(result, Err(CycleError));
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let result = topological_order(
            &names(&["input connector", "a"]),
            &edges(&[("a", "a")]),
            "input connector",
        );
        assert_eq!(result, Err(CycleError));
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let order = topological_order(
            &names(&["input connector", "a"]),
            &edges(&[("input connector", "a"), ("input connector", "a")]),
            "input connector",
        )
        .unwrap();
        assert_eq!(order, vec!["input connector", "a"]);
    }
}
