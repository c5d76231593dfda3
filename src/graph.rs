//! Dependency graphs over named entities.
//!
//! This module provides the directed graph shared by modules and tasks. An edge
//! `from -> to` means "`from` depends on `to`", so `to` has to be brought up first.
//! The graph is used to:
//! - compute a deterministic activation order (dependencies first)
//! - find the dependents that block the removal of an entity
//! - detect cycles and keep their members out of the runnable set
//!
//! # Example
//!
//! ```rust
//! use daq_orchestrator::graph::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//!
//! // "scanner_logic" uses "nicard", the GUI uses the logic
//! graph.add_edge("scanner_logic", "nicard");
//! graph.add_edge("scanner_gui", "scanner_logic");
//!
//! assert_eq!(
//!     graph.topological_order().unwrap(),
//!     vec!["nicard", "scanner_logic", "scanner_gui"]
//! );
//!
//! match graph.can_remove("nicard") {
//!     Ok(()) => println!("Can safely remove nicard"),
//!     Err(dependents) => println!("nicard used by: {:?}", dependents),
//! }
//! ```

pub mod resolver;
pub mod tasks;

pub use resolver::{ModuleResolver, OrderDelta};
pub use tasks::TaskGraph;

use crate::error::OrchestratorError;
use std::collections::{btree_set, BTreeMap, BTreeSet, HashMap};

static NO_EDGES: BTreeSet<String> = BTreeSet::new();

/// Directed dependency graph keyed by entity name.
///
/// Traversals visit names in lexicographic order, so every order and every reported
/// cycle is reproducible for a given graph.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    // Maps node -> names it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Creates a new empty dependency graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node without edges. Adding an existing node is a no-op.
    pub fn add_node(&mut self, name: &str) {
        self.edges.entry(name.to_string()).or_default();
    }

    /// Records that `from` depends on `to`, adding both nodes if needed.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(to);
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, name: &str) {
        self.edges.remove(name);
        for deps in self.edges.values_mut() {
            deps.remove(name);
        }
    }

    /// Whether `name` is a node of the graph
    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Node names in lexicographic order
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Direct dependencies of `name`
    pub fn dependencies(&self, name: &str) -> btree_set::Iter<'_, String> {
        self.edges.get(name).unwrap_or(&NO_EDGES).iter()
    }

    /// Direct dependents of `name`, sorted
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Everything that depends on `name`, directly or not. Does not include `name`.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for (node, deps) in &self.edges {
            for dep in deps {
                reverse.entry(dep.as_str()).or_default().push(node.as_str());
            }
        }

        let mut seen = BTreeSet::new();
        let mut pending = vec![name];
        while let Some(current) = pending.pop() {
            for dependent in reverse.get(current).into_iter().flatten() {
                if *dependent != name && seen.insert(dependent.to_string()) {
                    pending.push(*dependent);
                }
            }
        }
        seen
    }

    /// Everything `name` depends on, directly or not. Does not include `name`.
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut pending = vec![name];
        while let Some(current) = pending.pop() {
            for dep in self.dependencies(current) {
                if dep.as_str() != name && seen.insert(dep.clone()) {
                    pending.push(dep.as_str());
                }
            }
        }
        seen
    }

    /// Checks if a node can be removed without leaving dangling dependents.
    ///
    /// Returns the sorted dependents when it cannot.
    pub fn can_remove(&self, name: &str) -> Result<(), Vec<String>> {
        let dependents = self.dependents(name);
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(dependents)
        }
    }

    /// Linear order in which every node appears after all of its dependencies.
    ///
    /// Uses an iterative depth-first traversal with an explicit stack. On failure returns
    /// the first cycle found, rotated so that its lexicographically smallest member comes
    /// first and following the dependency direction.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.edges.len());
        let mut order = Vec::with_capacity(self.edges.len());

        for root in self.edges.keys() {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            marks.insert(root.as_str(), Mark::InProgress);
            let mut stack: Vec<(&str, btree_set::Iter<'_, String>)> =
                vec![(root.as_str(), self.dependencies(root))];

            while let Some((node, deps)) = stack.last_mut() {
                let node: &str = *node;
                match deps.next() {
                    Some(dep) => match marks.get(dep.as_str()) {
                        None => {
                            marks.insert(dep.as_str(), Mark::InProgress);
                            stack.push((dep.as_str(), self.dependencies(dep)));
                        }
                        Some(Mark::InProgress) => {
                            let start = stack
                                .iter()
                                .position(|(n, _)| *n == dep.as_str())
                                .unwrap_or(0);
                            let cycle = stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                            return Err(normalize_cycle(cycle));
                        }
                        Some(Mark::Done) => {}
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        order.push(node.to_string());
                        stack.pop();
                    }
                }
            }
        }

        Ok(order)
    }

    /// Removes `name` and everything depending on it, returning the removed names sorted.
    pub fn remove_with_dependents(&mut self, name: &str) -> Vec<String> {
        if !self.contains(name) {
            return Vec::new();
        }
        let mut removed = self.transitive_dependents(name);
        removed.insert(name.to_string());
        for node in &removed {
            self.edges.remove(node);
        }
        for deps in self.edges.values_mut() {
            deps.retain(|dep| !removed.contains(dep));
        }
        removed.into_iter().collect()
    }

    /// Removes every cycle member and every node depending on one.
    ///
    /// Each removed node is mapped to the `CyclicDependency` error of the cycle that
    /// took it out. What remains is acyclic.
    pub fn prune_cycles(&mut self) -> BTreeMap<String, OrchestratorError> {
        let mut errors = BTreeMap::new();
        while let Err(cycle) = self.topological_order() {
            tracing::debug!(cycle = ?cycle, "Pruning dependency cycle");
            let error = OrchestratorError::CyclicDependency(cycle.clone());
            for member in &cycle {
                for removed in self.remove_with_dependents(member) {
                    errors.entry(removed).or_insert_with(|| error.clone());
                }
            }
        }
        errors
    }
}

/// Rotates a cycle so that its smallest member comes first.
fn normalize_cycle(mut cycle: Vec<String>) -> Vec<String> {
    if let Some(min_index) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(index, _)| index)
    {
        cycle.rotate_left(min_index);
    }
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        graph
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn dependencies_come_first() {
        let g = graph(&[("b", "a"), ("c", "b"), ("c", "a"), ("d", "a")]);
        let order = g.topological_order().unwrap();
        assert_eq!(order.len(), 4);
        for (from, to) in [("b", "a"), ("c", "b"), ("c", "a"), ("d", "a")] {
            assert!(position(&order, to) < position(&order, from));
        }
    }

    #[test]
    fn order_is_deterministic() {
        let g1 = graph(&[("z", "y"), ("m", "a"), ("b", "a")]);
        let g2 = graph(&[("b", "a"), ("m", "a"), ("z", "y")]);
        assert_eq!(g1.topological_order(), g2.topological_order());
        assert_eq!(
            g1.topological_order().unwrap(),
            vec!["a", "b", "m", "y", "z"]
        );
    }

    #[test]
    fn two_node_cycle_names_both_members() {
        let g = graph(&[("b", "a"), ("a", "b")]);
        assert_eq!(g.topological_order().unwrap_err(), vec!["a", "b"]);
    }

    #[test]
    fn cycle_is_rotated_to_smallest_member() {
        let g = graph(&[("x", "c"), ("c", "b"), ("b", "x")]);
        assert_eq!(g.topological_order().unwrap_err(), vec!["b", "x", "c"]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&[("a", "a")]);
        assert_eq!(g.topological_order().unwrap_err(), vec!["a"]);
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let mut g = DependencyGraph::new();
        for i in 1..20_000 {
            g.add_edge(&format!("n{:05}", i - 1), &format!("n{i:05}"));
        }
        let order = g.topological_order().unwrap();
        assert_eq!(order.first().map(String::as_str), Some("n19999"));
        assert_eq!(order.last().map(String::as_str), Some("n00000"));
    }

    #[test]
    fn dependents_and_removal_checks() {
        let g = graph(&[("b", "a"), ("c", "b")]);
        assert_eq!(g.dependents("a"), vec!["b"]);
        assert_eq!(
            g.transitive_dependents("a").into_iter().collect::<Vec<_>>(),
            vec!["b", "c"]
        );
        assert_eq!(
            g.transitive_dependencies("c").into_iter().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(g.can_remove("a"), Err(vec!["b".to_string()]));
        assert_eq!(g.can_remove("c"), Ok(()));
    }

    #[test]
    fn prune_cycles_keeps_unrelated_nodes() {
        let mut g = graph(&[("a", "b"), ("b", "a"), ("c", "a"), ("d", "e")]);
        let errors = g.prune_cycles();

        assert_eq!(errors.keys().cloned().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(
            errors["c"],
            OrchestratorError::CyclicDependency(vec!["a".into(), "b".into()])
        );
        assert_eq!(g.topological_order().unwrap(), vec!["e", "d"]);
    }
}
