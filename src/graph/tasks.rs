//! Task relation validation.
//!
//! Tasks form a second dependency graph, independent of the module graph: a task
//! depends on every task it lists in `preposttasks` and `pausetasks`. Both relations
//! must point at declared tasks and together must be acyclic. Every `needsmodules`
//! entry must name a declared module; whether that module is currently active does not
//! matter here.

use super::DependencyGraph;
use crate::config::store::WiringSnapshot;
use crate::error::OrchestratorError;
use std::collections::BTreeMap;

/// Validated task relations.
#[derive(Clone, Debug, Default)]
pub struct TaskGraph {
    graph: DependencyGraph,
    order: Vec<String>,
    invalid: BTreeMap<String, OrchestratorError>,
}

impl TaskGraph {
    /// Validates every task of `snapshot`, isolating invalid ones.
    pub fn build(snapshot: &WiringSnapshot) -> Self {
        let mut graph = DependencyGraph::new();
        let mut rejected: BTreeMap<String, OrchestratorError> = BTreeMap::new();

        for task in snapshot.tasks.values() {
            graph.add_node(&task.name);

            for (role, module) in &task.needsmodules {
                if snapshot.module(module).is_none() {
                    rejected
                        .entry(task.name.clone())
                        .or_insert_with(|| OrchestratorError::UnresolvedDependency {
                            module: task.name.clone(),
                            role: role.clone(),
                            target: module.clone(),
                        });
                }
            }

            let related = task
                .preposttasks
                .iter()
                .map(|t| ("preposttasks", t))
                .chain(task.pausetasks.iter().map(|t| ("pausetasks", t)));
            for (relation, target) in related {
                if snapshot.task(target).is_some() {
                    graph.add_edge(&task.name, target);
                } else {
                    rejected
                        .entry(task.name.clone())
                        .or_insert_with(|| OrchestratorError::UnresolvedDependency {
                            module: task.name.clone(),
                            role: relation.to_string(),
                            target: target.clone(),
                        });
                }
            }
        }

        for (name, error) in rejected.clone() {
            for removed in graph.remove_with_dependents(&name) {
                rejected.entry(removed).or_insert_with(|| error.clone());
            }
        }
        rejected.extend(graph.prune_cycles());

        for (task, error) in &rejected {
            tracing::warn!(task = %task, error = %error, "Task rejected by dependency validation");
        }

        let order = graph.topological_order().unwrap_or_default();
        Self {
            graph,
            order,
            invalid: rejected,
        }
    }

    /// Valid tasks, each after the tasks it relates to
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Tasks kept out of the graph, with the reason
    pub fn invalid(&self) -> &BTreeMap<String, OrchestratorError> {
        &self.invalid
    }

    /// Validation error recorded for `name`
    pub fn error_for(&self, name: &str) -> Option<&OrchestratorError> {
        self.invalid.get(name)
    }

    /// Whether `name` passed validation
    pub fn is_valid(&self, name: &str) -> bool {
        self.graph.contains(name)
    }
}
