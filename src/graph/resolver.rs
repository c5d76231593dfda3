//! Module dependency resolution.
//!
//! The resolver turns the declared module descriptors into a validated dependency graph
//! and a deterministic activation order. Validation happens in two phases:
//!
//! 1. A pure data pass checks every `connect` entry: the target has to be declared and,
//!    in strict mode, compatible with the role (category rule and required interface).
//! 2. The surviving modules are linked into a [`DependencyGraph`]; cycles are pruned.
//!
//! A module that fails validation, and everything depending on it, stays out of the
//! graph with its error recorded. The rest of the graph still resolves.
//!
//! Adding, replacing or removing a single descriptor only revalidates that module and
//! its dependents; the relative order of every other module is left untouched, so the
//! lifecycle manager never has to restart unrelated modules.

use super::DependencyGraph;
use crate::config::descriptor::ModuleDescriptor;
use crate::error::{AppResult, OrchestratorError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Outcome of an incremental resolver update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderDelta {
    /// Previously valid modules whose validation was redone, in deactivation order
    pub affected: Vec<String>,
    /// Modules that are valid after the update, in activation order
    pub admitted: Vec<String>,
    /// Modules rejected by the update
    pub rejected: BTreeMap<String, OrchestratorError>,
}

/// Validated view of the module descriptors.
#[derive(Clone, Debug, Default)]
pub struct ModuleResolver {
    strict: bool,
    descriptors: BTreeMap<String, ModuleDescriptor>,
    graph: DependencyGraph,
    order: Vec<String>,
    invalid: BTreeMap<String, OrchestratorError>,
}

impl ModuleResolver {
    /// Creates an empty resolver.
    ///
    /// With `strict` set, connection targets are also checked for category and
    /// interface compatibility.
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Default::default()
        }
    }

    /// Resolves a full descriptor set, isolating invalid modules.
    pub fn build(descriptors: impl IntoIterator<Item = ModuleDescriptor>, strict: bool) -> Self {
        let mut resolver = Self::new(strict);
        resolver.descriptors = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let all: BTreeSet<String> = resolver.descriptors.keys().cloned().collect();
        resolver.revalidate(all);
        resolver
    }

    /// Resolves a full descriptor set, failing on the first invalid module.
    ///
    /// "First" is by module name, which keeps the reported error stable.
    pub fn resolve_order(
        descriptors: impl IntoIterator<Item = ModuleDescriptor>,
        strict: bool,
    ) -> AppResult<Vec<String>> {
        let resolver = Self::build(descriptors, strict);
        match resolver.invalid.values().next() {
            Some(error) => Err(error.clone()),
            None => Ok(resolver.order),
        }
    }

    /// Whether strict connection checks are enabled
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Activation order of every valid module
    pub fn activation_order(&self) -> &[String] {
        &self.order
    }

    /// Reverse of the activation order
    pub fn shutdown_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Modules kept out of the graph, with the reason
    pub fn invalid(&self) -> &BTreeMap<String, OrchestratorError> {
        &self.invalid
    }

    /// Declared descriptor for `name`, valid or not
    pub fn descriptor(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.descriptors.get(name)
    }

    /// All declared descriptors
    pub fn descriptors(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.descriptors.values()
    }

    /// Whether `name` passed validation
    pub fn is_valid(&self, name: &str) -> bool {
        self.graph.contains(name)
    }

    /// Validation error recorded for `name`
    pub fn error_for(&self, name: &str) -> Option<&OrchestratorError> {
        self.invalid.get(name)
    }

    /// Direct dependents of `name` in the valid graph
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.graph.dependents(name)
    }

    /// Transitive dependents of `name` in the valid graph
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        self.graph.transitive_dependents(name)
    }

    /// Checks that `name` can be activated and returns its validation error otherwise.
    pub fn ensure_valid(&self, name: &str) -> AppResult<()> {
        if self.graph.contains(name) {
            return Ok(());
        }
        match self.invalid.get(name) {
            Some(error) => Err(error.clone()),
            None => Err(OrchestratorError::UnknownModule(name.to_string())),
        }
    }

    /// `name` and everything it depends on, in activation order (`name` last).
    pub fn activation_chain(&self, name: &str) -> AppResult<Vec<String>> {
        self.ensure_valid(name)?;
        let mut members = self.graph.transitive_dependencies(name);
        members.insert(name.to_string());
        Ok(self
            .order
            .iter()
            .filter(|n| members.contains(*n))
            .cloned()
            .collect())
    }

    /// `name` and everything depending on it, dependents first (`name` last).
    ///
    /// This is the exact reverse of the activation order restricted to that subgraph.
    pub fn deactivation_order(&self, name: &str) -> AppResult<Vec<String>> {
        self.ensure_valid(name)?;
        let mut members = self.graph.transitive_dependents(name);
        members.insert(name.to_string());
        Ok(self
            .order
            .iter()
            .rev()
            .filter(|n| members.contains(*n))
            .cloned()
            .collect())
    }

    /// Adds or replaces one descriptor and revalidates only what it can affect.
    pub fn upsert(&mut self, descriptor: ModuleDescriptor) -> OrderDelta {
        let name = descriptor.name.clone();
        self.descriptors.insert(name.clone(), descriptor);
        let mut affected = self.declared_dependents(&name);
        affected.insert(name);
        self.revalidate(affected)
    }

    /// Removes one descriptor. Its dependents are revalidated and end up rejected.
    ///
    /// The removed module is listed in `affected` when it was valid.
    pub fn remove(&mut self, name: &str) -> OrderDelta {
        if self.descriptors.remove(name).is_none() {
            return OrderDelta::default();
        }
        let mut affected = self.declared_dependents(name);
        affected.insert(name.to_string());
        self.revalidate(affected)
    }

    /// Everything whose declared connections reach `name`, valid or not.
    fn declared_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut declared = DependencyGraph::new();
        for descriptor in self.descriptors.values() {
            declared.add_node(&descriptor.name);
            for target in descriptor.dependencies() {
                declared.add_edge(&descriptor.name, target);
            }
        }
        declared.transitive_dependents(name)
    }

    /// Redoes validation for `affected`, treating every other module as fixed.
    fn revalidate(&mut self, affected: BTreeSet<String>) -> OrderDelta {
        let mut delta = OrderDelta {
            affected: self
                .order
                .iter()
                .rev()
                .filter(|n| affected.contains(*n))
                .cloned()
                .collect(),
            ..Default::default()
        };

        for name in &affected {
            self.graph.remove_node(name);
            self.invalid.remove(name);
        }
        self.order.retain(|n| !affected.contains(n));

        // Phase 1: per-connection checks
        let mut local = DependencyGraph::new();
        let mut rejected: BTreeMap<String, OrchestratorError> = BTreeMap::new();
        for name in &affected {
            let Some(descriptor) = self.descriptors.get(name) else {
                continue;
            };
            local.add_node(name);
            for (role, target) in &descriptor.connect {
                if let Some(error) = self.check_connection(descriptor, role, target, &affected) {
                    rejected.entry(name.clone()).or_insert(error);
                }
                if affected.contains(target) && self.descriptors.contains_key(target) {
                    local.add_edge(name, target);
                }
            }
        }

        // Phase 2: link, isolate failures and cycles
        for (name, error) in rejected.clone() {
            for removed in local.remove_with_dependents(&name) {
                rejected.entry(removed).or_insert_with(|| error.clone());
            }
        }
        rejected.extend(local.prune_cycles());

        let sub_order = match local.topological_order() {
            Ok(order) => order,
            Err(cycle) => {
                // prune_cycles leaves an acyclic graph
                debug!(cycle = ?cycle, "Unexpected cycle after pruning");
                Vec::new()
            }
        };

        for name in &sub_order {
            self.graph.add_node(name);
            if let Some(descriptor) = self.descriptors.get(name) {
                for target in descriptor.dependencies() {
                    self.graph.add_edge(name, target);
                }
            }
        }
        self.order.extend(sub_order.iter().cloned());

        for (name, error) in &rejected {
            tracing::warn!(module = %name, error = %error, "Module rejected by dependency validation");
        }
        self.invalid.extend(rejected.clone());

        debug!(
            affected = ?delta.affected,
            admitted = ?sub_order,
            order = ?self.order,
            "Recomputed activation order"
        );

        delta.admitted = sub_order;
        delta.rejected = rejected;
        delta
    }

    fn check_connection(
        &self,
        descriptor: &ModuleDescriptor,
        role: &str,
        target: &str,
        affected: &BTreeSet<String>,
    ) -> Option<OrchestratorError> {
        let Some(target_descriptor) = self.descriptors.get(target) else {
            return Some(OrchestratorError::UnresolvedDependency {
                module: descriptor.name.clone(),
                role: role.to_string(),
                target: target.to_string(),
            });
        };

        if !affected.contains(target) && !self.graph.contains(target) {
            // Fixed module that is itself invalid
            if let Some(error) = self.invalid.get(target) {
                return Some(error.clone());
            }
        }

        if !self.strict {
            return None;
        }

        if !descriptor
            .category
            .can_connect_to(target_descriptor.category)
        {
            return Some(OrchestratorError::IncompatibleConnection {
                module: descriptor.name.clone(),
                role: role.to_string(),
                target: target.to_string(),
                reason: format!(
                    "a {} module cannot depend on a {} module",
                    descriptor.category, target_descriptor.category
                ),
            });
        }

        if let Some(interface) = descriptor.required_interfaces.get(role) {
            if !target_descriptor.interfaces.contains(interface) {
                return Some(OrchestratorError::IncompatibleConnection {
                    module: descriptor.name.clone(),
                    role: role.to_string(),
                    target: target.to_string(),
                    reason: format!("'{target}' does not provide interface '{interface}'"),
                });
            }
        }

        None
    }
}
