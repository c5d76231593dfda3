//! Descriptor store with atomic snapshot swaps.
//!
//! Readers take an `Arc<WiringSnapshot>` and keep working on it while writers build a
//! new snapshot and swap it in. No reader ever observes a half-updated descriptor set.

use super::descriptor::{ModuleDescriptor, TaskDescriptor};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Immutable view of every module and task descriptor at one point in time.
#[derive(Clone, Debug, Default)]
pub struct WiringSnapshot {
    /// Module descriptors keyed by name
    pub modules: BTreeMap<String, ModuleDescriptor>,
    /// Task descriptors keyed by name
    pub tasks: BTreeMap<String, TaskDescriptor>,
    /// Monotonic version, bumped on every swap
    pub version: u64,
}

impl WiringSnapshot {
    /// Builds a snapshot, keying descriptors by their `name`.
    pub fn new(
        modules: impl IntoIterator<Item = ModuleDescriptor>,
        tasks: impl IntoIterator<Item = TaskDescriptor>,
    ) -> Self {
        Self {
            modules: modules.into_iter().map(|m| (m.name.clone(), m)).collect(),
            tasks: tasks.into_iter().map(|t| (t.name.clone(), t)).collect(),
            version: 0,
        }
    }

    /// Looks up a module descriptor
    pub fn module(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    /// Looks up a task descriptor
    pub fn task(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(name)
    }
}

/// Shared holder of the current [`WiringSnapshot`].
#[derive(Debug, Default)]
pub struct DescriptorStore {
    current: RwLock<Arc<WiringSnapshot>>,
}

impl DescriptorStore {
    /// Creates a store holding `snapshot`.
    pub fn new(snapshot: WiringSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<WiringSnapshot> {
        self.current.read().clone()
    }

    /// Applies `mutate` to a copy of the current snapshot and swaps it in.
    ///
    /// Concurrent updates are serialized; each sees the result of the previous one.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut WiringSnapshot) -> R) -> (Arc<WiringSnapshot>, R) {
        let mut guard = self.current.write();
        let mut next = WiringSnapshot::clone(&guard);
        let result = mutate(&mut next);
        next.version = guard.version.saturating_add(1);
        let next = Arc::new(next);
        *guard = next.clone();
        (next, result)
    }

    /// Inserts or replaces a module descriptor.
    pub fn upsert_module(&self, descriptor: ModuleDescriptor) -> Arc<WiringSnapshot> {
        self.update(|s| {
            s.modules.insert(descriptor.name.clone(), descriptor);
        })
        .0
    }

    /// Removes a module descriptor, returning it if it existed.
    pub fn remove_module(&self, name: &str) -> (Arc<WiringSnapshot>, Option<ModuleDescriptor>) {
        self.update(|s| s.modules.remove(name))
    }

    /// Inserts or replaces a task descriptor.
    pub fn upsert_task(&self, descriptor: TaskDescriptor) -> Arc<WiringSnapshot> {
        self.update(|s| {
            s.tasks.insert(descriptor.name.clone(), descriptor);
        })
        .0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::descriptor::ModuleCategory;

    #[test]
    fn readers_keep_their_snapshot_across_swaps() {
        let store = DescriptorStore::new(WiringSnapshot::new(
            [ModuleDescriptor::new("a", ModuleCategory::Hardware, "dummy")],
            [],
        ));

        let before = store.snapshot();
        store.upsert_module(ModuleDescriptor::new("b", ModuleCategory::Logic, "dummy"));
        let after = store.snapshot();

        assert_eq!(before.modules.len(), 1);
        assert_eq!(after.modules.len(), 2);
        assert_eq!(after.version, before.version + 1);
    }

    #[test]
    fn remove_reports_previous_descriptor() {
        let store = DescriptorStore::new(WiringSnapshot::new(
            [ModuleDescriptor::new("a", ModuleCategory::Hardware, "dummy")],
            [],
        ));
        let (snapshot, removed) = store.remove_module("a");
        assert!(removed.is_some());
        assert!(snapshot.module("a").is_none());
        let (_, removed) = store.remove_module("a");
        assert!(removed.is_none());
    }
}
