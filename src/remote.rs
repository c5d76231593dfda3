//! Directory of modules exposed for remote access.
//!
//! The orchestrator does not ship a transport. Its only obligation is a stable lookup
//! from a published name to the live handle, which a network server can sit on top of.
//! Modules declared with `remote_access = true` are published by the lifecycle manager
//! while they are active; others can be published explicitly.

use crate::lifecycle::ModuleHandle;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Published module handles keyed by name.
#[derive(Default)]
pub struct RemoteDirectory {
    entries: RwLock<BTreeMap<String, Arc<dyn ModuleHandle>>>,
}

impl RemoteDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `handle` under `name`. Returns `true` if an earlier entry was replaced.
    pub fn publish(&self, name: &str, handle: Arc<dyn ModuleHandle>) -> bool {
        let replaced = self
            .entries
            .write()
            .insert(name.to_string(), handle)
            .is_some();
        debug!(module = %name, replaced, "Published for remote access");
        replaced
    }

    /// Withdraws `name`. Returns `true` if it was published.
    pub fn unpublish(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            debug!(module = %name, "Withdrawn from remote access");
        }
        removed
    }

    /// Handle published under `name`
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ModuleHandle>> {
        self.entries.read().get(name).cloned()
    }

    /// Whether `name` is published
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Published names in order
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of published modules
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is published
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::mock::{MockFactory, MockModule};
    use crate::config::descriptor::OptionBag;
    use crate::lifecycle::ModuleFactory;

    #[tokio::test]
    async fn lookup_returns_the_published_handle() {
        let factory = MockFactory::new();
        let handle = factory.construct("nicard", &OptionBag::new()).await.unwrap();

        let directory = RemoteDirectory::new();
        assert!(!directory.publish("nicard", handle.clone()));
        assert!(directory.publish("nicard", handle));
        assert_eq!(directory.names(), vec!["nicard"]);

        let found = directory.lookup("nicard").unwrap();
        let module = found.as_any().downcast_ref::<MockModule>().unwrap();
        assert_eq!(module.label(), "nicard");

        assert!(directory.unpublish("nicard"));
        assert!(!directory.unpublish("nicard"));
        assert!(directory.lookup("nicard").is_none());
    }
}
